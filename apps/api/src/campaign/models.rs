use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::campaign::acquisition::ChannelKind;
use crate::campaign::escalation::EscalationLevel;
use crate::campaign::estimator::{CampaignStrategy, CheckInPoint, TierAddition};

/// Prefix for escalation records created outside the check-in schedule.
pub const MANUAL_CHECKPOINT_PREFIX: &str = "manual-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Active,
    Completed,
    Cancelled,
}

impl CampaignStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Active => "active",
            CampaignStatus::Completed => "completed",
            CampaignStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(CampaignStatus::Active),
            "completed" => Some(CampaignStatus::Completed),
            "cancelled" => Some(CampaignStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, CampaignStatus::Active)
    }
}

/// One contractor response, as reported by an acquisition channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEvent {
    pub received_at: DateTime<Utc>,
    pub tier_id: Option<u8>,
    pub channel: Option<ChannelKind>,
}

impl ResponseEvent {
    pub fn at(received_at: DateTime<Utc>) -> Self {
        Self {
            received_at,
            tier_id: None,
            channel: None,
        }
    }
}

/// The persisted outcome of evaluating one checkpoint (or one manual escalation).
///
/// A campaign holds at most one record per `checkpoint_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub checkpoint_id: String,
    pub performance_percentage: f64,
    pub escalation_level: EscalationLevel,
    pub action_taken: String,
    pub additional_contractors_added: u32,
    /// Per-tier breakdown of `additional_contractors_added`.
    pub tier_additions: Vec<TierAddition>,
    /// Contractors suggested but not executed (MODERATE awaits confirmation).
    pub recommended_additional: u32,
    /// Operator-supplied reason, manual escalations only.
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl EscalationRecord {
    pub fn is_manual(&self) -> bool {
        self.checkpoint_id.starts_with(MANUAL_CHECKPOINT_PREFIX)
    }
}

/// Input to `CampaignLedger::create`.
#[derive(Debug, Clone)]
pub struct NewCampaign {
    pub bid_card_id: String,
    pub strategy: CampaignStrategy,
    pub started_at: DateTime<Utc>,
}

/// A campaign as read back from the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub bid_card_id: String,
    pub strategy: CampaignStrategy,
    pub status: CampaignStatus,
    pub started_at: DateTime<Utc>,
    pub responses_received: u32,
    /// Append-only; `responses_received` is derived from it.
    pub responses: Vec<ResponseEvent>,
    pub escalation_history: Vec<EscalationRecord>,
}

impl Campaign {
    pub fn elapsed_hours(&self, now: DateTime<Utc>) -> f64 {
        ((now - self.started_at).num_milliseconds() as f64 / 3_600_000.0).max(0.0)
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.started_at + chrono::Duration::milliseconds(hours_to_millis(self.strategy.timeline_hours))
    }

    pub fn checkpoint_time(&self, point: &CheckInPoint) -> DateTime<Utc> {
        self.started_at + chrono::Duration::milliseconds(hours_to_millis(point.scheduled_at))
    }

    pub fn escalation_for(&self, checkpoint_id: &str) -> Option<&EscalationRecord> {
        self.escalation_history
            .iter()
            .find(|r| r.checkpoint_id == checkpoint_id)
    }

    pub fn target_reached(&self) -> bool {
        self.responses_received >= self.strategy.bids_needed
    }
}

fn hours_to_millis(hours: f64) -> i64 {
    (hours * 3_600_000.0).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::estimator::{calculate_outreach_strategy, EstimateParams};
    use crate::config::EngineConfig;
    use chrono::TimeZone;

    fn campaign() -> Campaign {
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
        Campaign {
            id: Uuid::new_v4(),
            bid_card_id: "bc-1".to_string(),
            strategy,
            status: CampaignStatus::Active,
            started_at: Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap(),
            responses_received: 0,
            responses: vec![],
            escalation_history: vec![],
        }
    }

    #[test]
    fn test_elapsed_and_deadline() {
        let c = campaign();
        let now = c.started_at + chrono::Duration::minutes(90);
        assert!((c.elapsed_hours(now) - 1.5).abs() < 1e-9);
        assert_eq!(c.deadline(), c.started_at + chrono::Duration::hours(24));
        // Clock skew never yields negative elapsed time
        assert_eq!(c.elapsed_hours(c.started_at - chrono::Duration::hours(1)), 0.0);
    }

    #[test]
    fn test_checkpoint_time_uses_offset() {
        let c = campaign();
        let first = &c.strategy.check_in_schedule[0];
        assert_eq!(c.checkpoint_time(first), c.started_at + chrono::Duration::hours(6));
    }

    #[test]
    fn test_status_round_trip_and_terminality() {
        for status in [
            CampaignStatus::Active,
            CampaignStatus::Completed,
            CampaignStatus::Cancelled,
        ] {
            assert_eq!(CampaignStatus::parse(status.as_str()), Some(status));
        }
        assert!(!CampaignStatus::Active.is_terminal());
        assert!(CampaignStatus::Cancelled.is_terminal());
        assert_eq!(CampaignStatus::parse("paused"), None);
    }
}
