use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use crate::campaign::estimator::CampaignStrategy;
use crate::campaign::models::EscalationRecord;

#[derive(Debug, Clone, FromRow)]
pub struct CampaignRow {
    pub id: Uuid,
    pub bid_card_id: String,
    pub strategy: Json<CampaignStrategy>,
    pub status: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct CampaignResponseRow {
    pub received_at: DateTime<Utc>,
    pub tier_id: Option<i16>,
    pub channel: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct CampaignEscalationRow {
    pub record: Json<EscalationRecord>,
}
