//! Check-In & Escalation Manager — evaluates campaign progress at checkpoints.
//!
//! Per `(campaign_id, checkpoint_id)`:
//! `Pending → Evaluated → Escalated | ConfirmedOnTrack` (terminal).
//!
//! On each check-in:
//! 1. Load the campaign. Not ACTIVE → no-op.
//! 2. Bid target already met → mark COMPLETED.
//! 3. Pick the most recent past-due checkpoint. Earlier checkpoints that were
//!    never evaluated are superseded by it.
//! 4. Already recorded → replay the stored decision (no new outreach).
//! 5. Otherwise decide, and persist exactly one `EscalationRecord`.
//!
//! Callers must hold the campaign's lock from `CampaignLocks` for the whole
//! call; the orchestrator does this and also owns the retry loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::campaign::acquisition::{OutreachReason, OutreachRequest};
use crate::campaign::escalation::{
    CheckpointState, EscalationDecision, EscalationLevel, EscalationPolicy,
};
use crate::campaign::estimator::{CheckInPoint, TierAddition};
use crate::campaign::ledger::{CampaignLedger, EscalationWrite, LedgerError};
use crate::campaign::models::{Campaign, CampaignStatus, EscalationRecord};

pub const ACTION_NOT_ACTIVE: &str = "none — campaign not active";
pub const ACTION_TARGET_REACHED: &str = "none — bid target reached, campaign completed";
pub const ACTION_NO_CHECKPOINT_DUE: &str = "none — no checkpoint due";

/// Result of one `perform_check_in` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckInResult {
    pub campaign_id: Uuid,
    pub checkpoint_evaluated: bool,
    pub checkpoint_id: Option<String>,
    pub checkpoint_state: Option<CheckpointState>,
    pub on_track: bool,
    pub performance_percentage: Option<f64>,
    pub escalation_level: Option<EscalationLevel>,
    pub action_taken: String,
    pub additional_contractors_added: u32,
    pub recommended_additional: u32,
    pub tier_additions: Vec<TierAddition>,
    /// True when the checkpoint had already been decided and this call only
    /// returned the stored decision.
    pub replayed: bool,
    pub next_check_in_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Outreach authorized by this call. Empty on replays and no-ops.
    #[serde(skip)]
    pub outreach: Vec<OutreachRequest>,
}

impl CheckInResult {
    fn no_op(campaign_id: Uuid, action: &str, next_check_in_at: Option<DateTime<Utc>>) -> Self {
        Self {
            campaign_id,
            checkpoint_evaluated: false,
            checkpoint_id: None,
            checkpoint_state: None,
            on_track: true,
            performance_percentage: None,
            escalation_level: None,
            action_taken: action.to_string(),
            additional_contractors_added: 0,
            recommended_additional: 0,
            tier_additions: Vec::new(),
            replayed: false,
            next_check_in_at,
            error: None,
            outreach: Vec::new(),
        }
    }

    fn from_record(
        campaign_id: Uuid,
        record: &EscalationRecord,
        replayed: bool,
        next_check_in_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            campaign_id,
            checkpoint_evaluated: true,
            checkpoint_id: Some(record.checkpoint_id.clone()),
            checkpoint_state: Some(CheckpointState::resolved(record.escalation_level)),
            on_track: record.escalation_level <= EscalationLevel::Mild,
            performance_percentage: Some(record.performance_percentage),
            escalation_level: Some(record.escalation_level),
            action_taken: record.action_taken.clone(),
            additional_contractors_added: record.additional_contractors_added,
            recommended_additional: record.recommended_additional,
            tier_additions: record.tier_additions.clone(),
            replayed,
            next_check_in_at,
            error: None,
            outreach: Vec::new(),
        }
    }

    /// Ledger retries ran out. Nothing was written; the next trigger retries.
    pub fn failed(campaign_id: Uuid, error: &LedgerError) -> Self {
        Self {
            on_track: false,
            error: Some(error.to_string()),
            ..Self::no_op(campaign_id, "check-in failed — ledger unavailable", None)
        }
    }

    /// Outreach requests this call authorized that still need to be enqueued.
    pub fn pending_dispatch(&self) -> &[OutreachRequest] {
        &self.outreach
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Per-campaign serialization
// ────────────────────────────────────────────────────────────────────────────

/// One async mutex per campaign id. Different campaigns never contend.
///
/// Entries live only while someone holds or waits on them, so ids that never
/// resolve to a campaign leave nothing behind.
#[derive(Default)]
pub struct CampaignLocks {
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

/// Held for the duration of one serialized campaign operation.
pub struct CampaignLockGuard<'a> {
    locks: &'a CampaignLocks,
    campaign_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl CampaignLocks {
    pub async fn acquire(&self, campaign_id: Uuid) -> CampaignLockGuard<'_> {
        // Built before waiting so a cancelled wait still releases the entry.
        let mut held = CampaignLockGuard {
            locks: self,
            campaign_id,
            guard: None,
        };
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            Arc::clone(locks.entry(campaign_id).or_default())
        };
        held.guard = Some(lock.lock_owned().await);
        held
    }

    fn release(&self, campaign_id: Uuid) {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(lock) = locks.get(&campaign_id) {
            // Only the map holds it: nobody is waiting.
            if Arc::strong_count(lock) == 1 {
                locks.remove(&campaign_id);
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl Drop for CampaignLockGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.release(self.campaign_id);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Manager
// ────────────────────────────────────────────────────────────────────────────

pub struct CheckInManager {
    policy: EscalationPolicy,
    locks: CampaignLocks,
}

impl CheckInManager {
    pub fn new(policy: EscalationPolicy) -> Self {
        Self {
            policy,
            locks: CampaignLocks::default(),
        }
    }

    pub fn locks(&self) -> &CampaignLocks {
        &self.locks
    }

    /// Evaluates the current checkpoint of one campaign. Single attempt; the
    /// caller retries transient ledger errors and holds the campaign lock.
    pub async fn perform_check_in(
        &self,
        ledger: &dyn CampaignLedger,
        campaign_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<CheckInResult, LedgerError> {
        let campaign = ledger.get(campaign_id).await?;

        if campaign.status != CampaignStatus::Active {
            debug!(%campaign_id, status = campaign.status.as_str(), "check-in skipped: campaign not active");
            return Ok(CheckInResult::no_op(campaign_id, ACTION_NOT_ACTIVE, None));
        }

        if campaign.target_reached() {
            ledger
                .set_status(campaign_id, CampaignStatus::Completed)
                .await?;
            info!(
                %campaign_id,
                responses = campaign.responses_received,
                bids_needed = campaign.strategy.bids_needed,
                "bid target reached; campaign completed"
            );
            return Ok(CheckInResult::no_op(campaign_id, ACTION_TARGET_REACHED, None));
        }

        let elapsed = campaign.elapsed_hours(now);
        let next_check_in_at = next_check_in_at(&campaign, elapsed);

        let Some(checkpoint) = due_checkpoint(&campaign, elapsed) else {
            return Ok(CheckInResult::no_op(
                campaign_id,
                ACTION_NO_CHECKPOINT_DUE,
                next_check_in_at,
            ));
        };

        if let Some(existing) = campaign.escalation_for(&checkpoint.checkpoint_id) {
            debug!(%campaign_id, checkpoint_id = %checkpoint.checkpoint_id, "checkpoint already evaluated; replaying");
            return Ok(CheckInResult::from_record(
                campaign_id,
                existing,
                true,
                next_check_in_at,
            ));
        }

        let decision = self.policy.decide(
            &campaign.strategy,
            campaign.responses_received,
            checkpoint.expected_cumulative_responses,
        );

        let record = build_record(checkpoint, &decision, now);
        match ledger.record_escalation(campaign_id, record.clone()).await? {
            EscalationWrite::Recorded(stored) => {
                // The ledger may have capped the additions against newer supply.
                log_decision(campaign_id, checkpoint, &campaign, &stored);
                let mut result =
                    CheckInResult::from_record(campaign_id, &stored, false, next_check_in_at);
                result.outreach = OutreachRequest::for_additions(
                    campaign_id,
                    &campaign.bid_card_id,
                    campaign.strategy.urgency_level,
                    &stored.tier_additions,
                    OutreachReason::Escalation,
                    now,
                );
                Ok(result)
            }
            EscalationWrite::AlreadyRecorded => {
                // Someone else recorded this checkpoint between our read and write.
                let campaign = ledger.get(campaign_id).await?;
                let existing = campaign
                    .escalation_for(&checkpoint.checkpoint_id)
                    .cloned()
                    .unwrap_or(record);
                Ok(CheckInResult::from_record(
                    campaign_id,
                    &existing,
                    true,
                    next_check_in_at,
                ))
            }
        }
    }
}

/// Latest checkpoint whose time has come.
pub fn due_checkpoint(campaign: &Campaign, elapsed_hours: f64) -> Option<&CheckInPoint> {
    campaign
        .strategy
        .check_in_schedule
        .iter()
        .rev()
        .find(|p| p.scheduled_at <= elapsed_hours)
}

pub fn next_check_in_at(campaign: &Campaign, elapsed_hours: f64) -> Option<DateTime<Utc>> {
    campaign
        .strategy
        .check_in_schedule
        .iter()
        .find(|p| p.scheduled_at > elapsed_hours)
        .map(|p| campaign.checkpoint_time(p))
}

/// State of every scheduled checkpoint, for reporting.
pub fn checkpoint_states(campaign: &Campaign) -> Vec<(String, CheckpointState)> {
    campaign
        .strategy
        .check_in_schedule
        .iter()
        .map(|p| {
            let state = campaign
                .escalation_for(&p.checkpoint_id)
                .map(|r| CheckpointState::resolved(r.escalation_level))
                .unwrap_or(CheckpointState::Pending);
            (p.checkpoint_id.clone(), state)
        })
        .collect()
}

fn build_record(
    checkpoint: &CheckInPoint,
    decision: &EscalationDecision,
    now: DateTime<Utc>,
) -> EscalationRecord {
    EscalationRecord {
        checkpoint_id: checkpoint.checkpoint_id.clone(),
        performance_percentage: decision.performance_percentage,
        escalation_level: decision.level,
        action_taken: decision.action_taken.clone(),
        additional_contractors_added: decision.additional_contractors(),
        tier_additions: decision.tier_additions.clone(),
        recommended_additional: decision.recommended_additional,
        reason: None,
        created_at: now,
    }
}

/// Logs the `Evaluated → Escalated | ConfirmedOnTrack` step for a stored record.
fn log_decision(
    campaign_id: Uuid,
    checkpoint: &CheckInPoint,
    campaign: &Campaign,
    record: &EscalationRecord,
) {
    let state = CheckpointState::resolved(record.escalation_level);
    match record.escalation_level {
        EscalationLevel::None | EscalationLevel::Mild => info!(
            %campaign_id,
            checkpoint_id = %checkpoint.checkpoint_id,
            ?state,
            performance = record.performance_percentage,
            level = %record.escalation_level,
            responses = campaign.responses_received,
            "check-in evaluated"
        ),
        _ => warn!(
            %campaign_id,
            checkpoint_id = %checkpoint.checkpoint_id,
            ?state,
            performance = record.performance_percentage,
            level = %record.escalation_level,
            responses = campaign.responses_received,
            expected = checkpoint.expected_cumulative_responses,
            added = record.additional_contractors_added,
            recommended = record.recommended_additional,
            "campaign behind schedule"
        ),
    }
}
