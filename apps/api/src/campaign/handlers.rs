use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::campaign::acquisition::ChannelKind;
use crate::campaign::check_in::CheckInResult;
use crate::campaign::metrics::CampaignMetrics;
use crate::campaign::models::{CampaignStatus, ResponseEvent};
use crate::campaign::orchestrator::{
    CreateCampaignRequest, CreateCampaignResponse, ManualEscalationResult, RecordResponseResult,
};
use crate::errors::AppError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct EscalateRequest {
    pub additional_contractors: i64,
    #[serde(default)]
    pub reason: String,
}

#[derive(Deserialize)]
pub struct ResponseRequest {
    /// Defaults to the time the request is received.
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tier_id: Option<u8>,
    #[serde(default)]
    pub channel: Option<ChannelKind>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub campaign_id: Uuid,
    pub status: CampaignStatus,
}

/// POST /api/v1/campaigns
pub async fn handle_create_campaign(
    State(state): State<AppState>,
    Json(req): Json<CreateCampaignRequest>,
) -> Result<(StatusCode, Json<CreateCampaignResponse>), AppError> {
    let created = state.orchestrator.create_campaign(req).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// POST /api/v1/campaigns/:id/check-in
pub async fn handle_check_in(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CheckInResult>, AppError> {
    Ok(Json(state.orchestrator.perform_check_in(id).await?))
}

/// POST /api/v1/campaigns/:id/escalate
pub async fn handle_escalate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<EscalateRequest>,
) -> Result<Json<ManualEscalationResult>, AppError> {
    let result = state
        .orchestrator
        .escalate_campaign(id, req.additional_contractors, &req.reason)
        .await?;
    Ok(Json(result))
}

/// GET /api/v1/campaigns/:id/metrics
pub async fn handle_get_metrics(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CampaignMetrics>, AppError> {
    Ok(Json(state.orchestrator.get_campaign_metrics(id).await?))
}

/// POST /api/v1/campaigns/:id/responses
pub async fn handle_record_response(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ResponseRequest>,
) -> Result<Json<RecordResponseResult>, AppError> {
    let event = ResponseEvent {
        received_at: req.received_at.unwrap_or_else(Utc::now),
        tier_id: req.tier_id,
        channel: req.channel,
    };
    Ok(Json(state.orchestrator.record_response(id, event).await?))
}

/// POST /api/v1/campaigns/:id/cancel
pub async fn handle_cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<StatusResponse>, AppError> {
    state.orchestrator.cancel_campaign(id).await?;
    Ok(Json(StatusResponse {
        campaign_id: id,
        status: CampaignStatus::Cancelled,
    }))
}
