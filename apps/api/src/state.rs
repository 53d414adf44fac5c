use std::sync::Arc;

use crate::campaign::orchestrator::CampaignOrchestrator;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<CampaignOrchestrator>,
}
