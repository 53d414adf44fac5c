//! PostgreSQL ledger backend.
//!
//! Responses are append-only rows; the count is always derived.
//! Escalations are keyed `(campaign_id, checkpoint_id)`; the primary key is
//! what turns a repeated check-in into a no-op.

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::campaign::ledger::{CampaignLedger, EscalationWrite, LedgerError};
use crate::campaign::models::{
    Campaign, CampaignStatus, EscalationRecord, NewCampaign, ResponseEvent,
};
use crate::campaign::estimator::CampaignStrategy;
use crate::models::campaign::{CampaignEscalationRow, CampaignResponseRow, CampaignRow};

#[derive(Clone)]
pub struct PgCampaignLedger {
    pool: PgPool,
}

impl PgCampaignLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_status(campaign_id: Uuid, raw: &str) -> Result<CampaignStatus, LedgerError> {
    CampaignStatus::parse(raw).ok_or_else(|| {
        LedgerError::Corrupt(format!("campaign {campaign_id} has unknown status '{raw}'"))
    })
}

#[async_trait]
impl CampaignLedger for PgCampaignLedger {
    async fn create(&self, campaign: NewCampaign) -> Result<Uuid, LedgerError> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO outreach_campaigns (id, bid_card_id, strategy, status, started_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(id)
        .bind(&campaign.bid_card_id)
        .bind(Json(&campaign.strategy))
        .bind(CampaignStatus::Active.as_str())
        .bind(campaign.started_at)
        .execute(&self.pool)
        .await?;

        info!(campaign_id = %id, bid_card_id = %campaign.bid_card_id, "campaign persisted");
        Ok(id)
    }

    async fn record_response(
        &self,
        campaign_id: Uuid,
        event: ResponseEvent,
    ) -> Result<u32, LedgerError> {
        let mut tx = self.pool.begin().await?;

        let exists: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM outreach_campaigns WHERE id = $1 FOR SHARE")
                .bind(campaign_id)
                .fetch_optional(&mut *tx)
                .await?;
        if exists.is_none() {
            return Err(LedgerError::NotFound(campaign_id));
        }

        sqlx::query(
            r#"
            INSERT INTO campaign_responses (campaign_id, received_at, tier_id, channel)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(campaign_id)
        .bind(event.received_at)
        .bind(event.tier_id.map(i16::from))
        .bind(event.channel.map(|c| c.as_str()))
        .execute(&mut *tx)
        .await?;

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM campaign_responses WHERE campaign_id = $1")
                .bind(campaign_id)
                .fetch_one(&mut *tx)
                .await?;

        tx.commit().await?;
        Ok(count.max(0) as u32)
    }

    async fn get(&self, campaign_id: Uuid) -> Result<Campaign, LedgerError> {
        let row: CampaignRow = sqlx::query_as(
            "SELECT id, bid_card_id, strategy, status, started_at FROM outreach_campaigns WHERE id = $1",
        )
        .bind(campaign_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(LedgerError::NotFound(campaign_id))?;

        let responses: Vec<CampaignResponseRow> = sqlx::query_as(
            "SELECT received_at, tier_id, channel FROM campaign_responses \
             WHERE campaign_id = $1 ORDER BY received_at, id",
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;

        let escalations: Vec<CampaignEscalationRow> = sqlx::query_as(
            "SELECT record FROM campaign_escalations WHERE campaign_id = $1 ORDER BY created_at",
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;

        let status = parse_status(campaign_id, &row.status)?;

        let responses: Vec<ResponseEvent> = responses
            .into_iter()
            .map(|r| ResponseEvent {
                received_at: r.received_at,
                tier_id: r.tier_id.and_then(|t| u8::try_from(t).ok()),
                channel: r.channel.and_then(|c| c.parse().ok()),
            })
            .collect();

        Ok(Campaign {
            id: row.id,
            bid_card_id: row.bid_card_id,
            strategy: row.strategy.0,
            status,
            started_at: row.started_at,
            responses_received: responses.len() as u32,
            responses,
            escalation_history: escalations.into_iter().map(|e| e.record.0).collect(),
        })
    }

    async fn record_escalation(
        &self,
        campaign_id: Uuid,
        mut record: EscalationRecord,
    ) -> Result<EscalationWrite, LedgerError> {
        let mut tx = self.pool.begin().await?;

        // Row lock serializes concurrent writers for this campaign.
        let strategy: Option<Json<CampaignStrategy>> =
            sqlx::query_scalar("SELECT strategy FROM outreach_campaigns WHERE id = $1 FOR UPDATE")
                .bind(campaign_id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(Json(mut strategy)) = strategy else {
            return Err(LedgerError::NotFound(campaign_id));
        };

        record.tier_additions = strategy.apply_tier_additions(&record.tier_additions);
        record.additional_contractors_added = record.tier_additions.iter().map(|a| a.count).sum();

        let inserted = sqlx::query(
            r#"
            INSERT INTO campaign_escalations (campaign_id, checkpoint_id, record, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (campaign_id, checkpoint_id) DO NOTHING
            "#,
        )
        .bind(campaign_id)
        .bind(&record.checkpoint_id)
        .bind(Json(&record))
        .bind(record.created_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(EscalationWrite::AlreadyRecorded);
        }

        sqlx::query(
            "UPDATE outreach_campaigns SET strategy = $1, updated_at = now() WHERE id = $2",
        )
        .bind(Json(&strategy))
        .bind(campaign_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(EscalationWrite::Recorded(record))
    }

    async fn set_status(
        &self,
        campaign_id: Uuid,
        status: CampaignStatus,
    ) -> Result<(), LedgerError> {
        let updated = sqlx::query(
            "UPDATE outreach_campaigns SET status = $1, updated_at = now() WHERE id = $2",
        )
        .bind(status.as_str())
        .bind(campaign_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(LedgerError::NotFound(campaign_id));
        }
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<Uuid>, LedgerError> {
        Ok(sqlx::query_scalar(
            "SELECT id FROM outreach_campaigns WHERE status = 'active' ORDER BY started_at",
        )
        .fetch_all(&self.pool)
        .await?)
    }
}
