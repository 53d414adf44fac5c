pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::campaign::handlers;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // Campaign API
        .route("/api/v1/campaigns", post(handlers::handle_create_campaign))
        .route(
            "/api/v1/campaigns/:id/check-in",
            post(handlers::handle_check_in),
        )
        .route(
            "/api/v1/campaigns/:id/escalate",
            post(handlers::handle_escalate),
        )
        .route(
            "/api/v1/campaigns/:id/metrics",
            get(handlers::handle_get_metrics),
        )
        .route(
            "/api/v1/campaigns/:id/responses",
            post(handlers::handle_record_response),
        )
        .route("/api/v1/campaigns/:id/cancel", post(handlers::handle_cancel))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{header, Method, Request, StatusCode},
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use uuid::Uuid;

    use super::*;
    use crate::campaign::acquisition::{OutreachQueue, OutreachReceiver};
    use crate::campaign::ledger::InMemoryLedger;
    use crate::campaign::orchestrator::CampaignOrchestrator;
    use crate::config::EngineConfig;

    fn test_app() -> (Router, OutreachReceiver) {
        let (queue, receiver) = OutreachQueue::new(64);
        let orchestrator = Arc::new(CampaignOrchestrator::new(
            Arc::new(InMemoryLedger::new()),
            queue,
            EngineConfig::default(),
        ));
        (build_router(AppState { orchestrator }), receiver)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _rx) = test_app();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["service"], "outreach-api");
    }

    #[tokio::test]
    async fn test_campaign_lifecycle() {
        let (app, _rx) = test_app();

        let created = app
            .clone()
            .oneshot(post_json(
                "/api/v1/campaigns",
                json!({
                    "bid_card_id": "bc-555",
                    "project_type": "roof repair",
                    "timeline_hours": 24,
                    "bids_needed": 4,
                    "tier1_available": 5,
                    "tier2_available": 20,
                    "tier3_available": 100
                }),
            ))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);
        let created = json_body(created).await;
        assert_eq!(created["strategy_summary"]["urgency_level"], "urgent");
        let id = created["campaign_id"].as_str().unwrap().to_string();

        let response = app
            .clone()
            .oneshot(post_json(
                &format!("/api/v1/campaigns/{id}/responses"),
                json!({ "tier_id": 1, "channel": "email" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["responses_received"], 1);

        let check_in = app
            .clone()
            .oneshot(post_json(&format!("/api/v1/campaigns/{id}/check-in"), json!({})))
            .await
            .unwrap();
        assert_eq!(check_in.status(), StatusCode::OK);
        assert_eq!(json_body(check_in).await["checkpoint_evaluated"], false);

        let metrics = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/api/v1/campaigns/{id}/metrics"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(metrics.status(), StatusCode::OK);
        assert_eq!(json_body(metrics).await["response_progress"]["responses_received"], 1);

        let cancel = app
            .clone()
            .oneshot(post_json(&format!("/api/v1/campaigns/{id}/cancel"), json!({})))
            .await
            .unwrap();
        assert_eq!(json_body(cancel).await["status"], "cancelled");

        let escalate = app
            .oneshot(post_json(
                &format!("/api/v1/campaigns/{id}/escalate"),
                json!({ "additional_contractors": 5, "reason": "slow" }),
            ))
            .await
            .unwrap();
        assert_eq!(escalate.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_errors_use_json_envelope() {
        let (app, _rx) = test_app();

        let missing = app
            .clone()
            .oneshot(post_json(
                &format!("/api/v1/campaigns/{}/check-in", Uuid::new_v4()),
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
        assert_eq!(json_body(missing).await["error"]["code"], "NOT_FOUND");

        let invalid = app
            .oneshot(post_json(
                "/api/v1/campaigns",
                json!({ "bid_card_id": "bc-1", "timeline_hours": 24, "bids_needed": 0 }),
            ))
            .await
            .unwrap();
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(invalid).await["error"]["code"], "VALIDATION_ERROR");
    }
}
