//! Campaign Ledger — the persistence boundary for campaign state.
//!
//! Every piece of campaign state lives behind `CampaignLedger`, addressed by
//! campaign id. The orchestrator and check-in manager hold nothing else.
//!
//! Carried as `Arc<dyn CampaignLedger>`. Backends:
//! - `InMemoryLedger`: process-local, used in tests and when no database is configured
//! - `PgCampaignLedger`: PostgreSQL via sqlx (see `pg_ledger.rs`)
//!
//! CRITICAL: `record_escalation` is the idempotence boundary. A second record
//! for the same `checkpoint_id` is dropped and reported as `AlreadyRecorded`,
//! never as an error.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::campaign::models::{
    Campaign, CampaignStatus, EscalationRecord, NewCampaign, ResponseEvent,
};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("campaign {0} not found")]
    NotFound(Uuid),

    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    /// Stored data the service cannot interpret. Retrying will not help.
    #[error("corrupt ledger data: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    /// Worth retrying: the same call may succeed a moment later.
    pub fn is_transient(&self) -> bool {
        match self {
            LedgerError::Unavailable(_) => true,
            LedgerError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            LedgerError::NotFound(_) | LedgerError::Corrupt(_) | LedgerError::Serialization(_) => {
                false
            }
        }
    }
}

/// Outcome of `record_escalation`.
#[derive(Debug, Clone, PartialEq)]
pub enum EscalationWrite {
    /// The record as stored, with `tier_additions` capped at the supply the
    /// ledger held at write time. Dispatch from this, not from the input.
    Recorded(EscalationRecord),
    /// A record with the same checkpoint id already existed; nothing changed.
    AlreadyRecorded,
}

#[async_trait]
pub trait CampaignLedger: Send + Sync {
    /// Persists a new ACTIVE campaign and returns its id.
    async fn create(&self, campaign: NewCampaign) -> Result<Uuid, LedgerError>;

    /// Appends one response atomically. Returns the new response count.
    async fn record_response(
        &self,
        campaign_id: Uuid,
        event: ResponseEvent,
    ) -> Result<u32, LedgerError>;

    async fn get(&self, campaign_id: Uuid) -> Result<Campaign, LedgerError>;

    /// Stores `record` and applies its `tier_additions` to the strategy in
    /// one step. Duplicate checkpoint ids are a no-op.
    async fn record_escalation(
        &self,
        campaign_id: Uuid,
        record: EscalationRecord,
    ) -> Result<EscalationWrite, LedgerError>;

    async fn set_status(&self, campaign_id: Uuid, status: CampaignStatus)
        -> Result<(), LedgerError>;

    /// Ids of every ACTIVE campaign, for the check-in sweeper.
    async fn list_active(&self) -> Result<Vec<Uuid>, LedgerError>;
}

// ────────────────────────────────────────────────────────────────────────────
// InMemoryLedger
// ────────────────────────────────────────────────────────────────────────────

/// Process-local ledger. Each call takes the map lock once, so every
/// operation is atomic with respect to the others.
#[derive(Default)]
pub struct InMemoryLedger {
    campaigns: RwLock<HashMap<Uuid, Campaign>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CampaignLedger for InMemoryLedger {
    async fn create(&self, campaign: NewCampaign) -> Result<Uuid, LedgerError> {
        let id = Uuid::new_v4();
        let record = Campaign {
            id,
            bid_card_id: campaign.bid_card_id,
            strategy: campaign.strategy,
            status: CampaignStatus::Active,
            started_at: campaign.started_at,
            responses_received: 0,
            responses: Vec::new(),
            escalation_history: Vec::new(),
        };
        self.campaigns.write().await.insert(id, record);
        Ok(id)
    }

    async fn record_response(
        &self,
        campaign_id: Uuid,
        event: ResponseEvent,
    ) -> Result<u32, LedgerError> {
        let mut campaigns = self.campaigns.write().await;
        let campaign = campaigns
            .get_mut(&campaign_id)
            .ok_or(LedgerError::NotFound(campaign_id))?;
        campaign.responses.push(event);
        campaign.responses_received = campaign.responses.len() as u32;
        Ok(campaign.responses_received)
    }

    async fn get(&self, campaign_id: Uuid) -> Result<Campaign, LedgerError> {
        self.campaigns
            .read()
            .await
            .get(&campaign_id)
            .cloned()
            .ok_or(LedgerError::NotFound(campaign_id))
    }

    async fn record_escalation(
        &self,
        campaign_id: Uuid,
        mut record: EscalationRecord,
    ) -> Result<EscalationWrite, LedgerError> {
        let mut campaigns = self.campaigns.write().await;
        let campaign = campaigns
            .get_mut(&campaign_id)
            .ok_or(LedgerError::NotFound(campaign_id))?;

        if campaign.escalation_for(&record.checkpoint_id).is_some() {
            return Ok(EscalationWrite::AlreadyRecorded);
        }

        record.tier_additions = campaign.strategy.apply_tier_additions(&record.tier_additions);
        record.additional_contractors_added = record.tier_additions.iter().map(|a| a.count).sum();
        campaign.escalation_history.push(record.clone());
        Ok(EscalationWrite::Recorded(record))
    }

    async fn set_status(
        &self,
        campaign_id: Uuid,
        status: CampaignStatus,
    ) -> Result<(), LedgerError> {
        let mut campaigns = self.campaigns.write().await;
        let campaign = campaigns
            .get_mut(&campaign_id)
            .ok_or(LedgerError::NotFound(campaign_id))?;
        campaign.status = status;
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<Uuid>, LedgerError> {
        let campaigns = self.campaigns.read().await;
        let mut active: Vec<(chrono::DateTime<Utc>, Uuid)> = campaigns
            .values()
            .filter(|c| c.status == CampaignStatus::Active)
            .map(|c| (c.started_at, c.id))
            .collect();
        active.sort();
        Ok(active.into_iter().map(|(_, id)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::campaign::escalation::EscalationLevel;
    use crate::campaign::estimator::{calculate_outreach_strategy, EstimateParams, TierAddition};
    use crate::config::EngineConfig;

    fn new_campaign() -> NewCampaign {
        let strategy = calculate_outreach_strategy(
            &EstimateParams {
                bids_needed: 4,
                timeline_hours: 24.0,
                tier1_available: 5,
                tier2_available: 20,
                tier3_available: 100,
                ..Default::default()
            },
            &EngineConfig::default(),
        )
        .unwrap();
        NewCampaign {
            bid_card_id: "bc-42".to_string(),
            strategy,
            started_at: Utc::now(),
        }
    }

    fn record(checkpoint_id: &str, additions: Vec<TierAddition>) -> EscalationRecord {
        EscalationRecord {
            checkpoint_id: checkpoint_id.to_string(),
            performance_percentage: 40.0,
            escalation_level: EscalationLevel::Severe,
            action_taken: "auto-escalated".to_string(),
            additional_contractors_added: additions.iter().map(|a| a.count).sum(),
            tier_additions: additions,
            recommended_additional: 0,
            reason: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_get_unknown_campaign_is_not_found() {
        let ledger = InMemoryLedger::new();
        let id = Uuid::new_v4();
        assert!(matches!(ledger.get(id).await, Err(LedgerError::NotFound(got)) if got == id));
        assert!(matches!(
            ledger.record_response(id, ResponseEvent::at(Utc::now())).await,
            Err(LedgerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_starts_active() {
        let ledger = InMemoryLedger::new();
        let id = ledger.create(new_campaign()).await.unwrap();
        let campaign = ledger.get(id).await.unwrap();
        assert_eq!(campaign.status, CampaignStatus::Active);
        assert_eq!(campaign.bid_card_id, "bc-42");
        assert_eq!(campaign.responses_received, 0);
        assert_eq!(ledger.list_active().await.unwrap(), vec![id]);
    }

    #[tokio::test]
    async fn test_concurrent_responses_are_all_counted() {
        let ledger = Arc::new(InMemoryLedger::new());
        let id = ledger.create(new_campaign()).await.unwrap();

        let handles: Vec<_> = (0..25)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                tokio::spawn(async move {
                    ledger
                        .record_response(id, ResponseEvent::at(Utc::now()))
                        .await
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(ledger.get(id).await.unwrap().responses_received, 25);
    }

    #[tokio::test]
    async fn test_duplicate_checkpoint_is_a_no_op() {
        let ledger = InMemoryLedger::new();
        let id = ledger.create(new_campaign()).await.unwrap();
        let additions = vec![TierAddition { tier_id: 3, count: 10 }];

        let first = ledger
            .record_escalation(id, record("checkpoint-1", additions.clone()))
            .await
            .unwrap();
        let second = ledger
            .record_escalation(id, record("checkpoint-1", additions))
            .await
            .unwrap();

        assert!(matches!(first, EscalationWrite::Recorded(ref r) if r.additional_contractors_added == 10));
        assert_eq!(second, EscalationWrite::AlreadyRecorded);
        let campaign = ledger.get(id).await.unwrap();
        assert_eq!(campaign.escalation_history.len(), 1);
        assert_eq!(campaign.strategy.tier(3).unwrap().to_contact, 10);
    }

    #[tokio::test]
    async fn test_escalation_additions_are_capped_at_supply() {
        let ledger = InMemoryLedger::new();
        let id = ledger.create(new_campaign()).await.unwrap();

        let write = ledger
            .record_escalation(
                id,
                record("checkpoint-2", vec![TierAddition { tier_id: 2, count: 500 }]),
            )
            .await
            .unwrap();

        let campaign = ledger.get(id).await.unwrap();
        let stored = campaign.escalation_for("checkpoint-2").unwrap();
        assert_eq!(stored.additional_contractors_added, 16);
        assert_eq!(write, EscalationWrite::Recorded(stored.clone()));
        assert_eq!(campaign.strategy.tier(2).unwrap().remaining(), 0);
        assert_eq!(
            campaign.strategy.total_to_contact,
            campaign.strategy.tiers.iter().map(|t| t.to_contact).sum::<u32>()
        );
    }

    #[tokio::test]
    async fn test_cancelled_campaigns_leave_active_list() {
        let ledger = InMemoryLedger::new();
        let id = ledger.create(new_campaign()).await.unwrap();
        ledger.set_status(id, CampaignStatus::Cancelled).await.unwrap();
        assert!(ledger.list_active().await.unwrap().is_empty());
        assert!(matches!(
            ledger.set_status(Uuid::new_v4(), CampaignStatus::Cancelled).await,
            Err(LedgerError::NotFound(_))
        ));
    }

    #[test]
    fn test_transient_classification() {
        assert!(LedgerError::Unavailable("down".to_string()).is_transient());
        assert!(LedgerError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(!LedgerError::NotFound(Uuid::new_v4()).is_transient());
        assert!(!LedgerError::Corrupt("status 'paused?'".to_string()).is_transient());
        assert!(!LedgerError::Database(sqlx::Error::RowNotFound).is_transient());
    }
}
