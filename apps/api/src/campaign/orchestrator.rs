//! Campaign Orchestrator — the service the HTTP handlers and the sweeper call.
//!
//! Holds no campaign state of its own: everything is read from and written to
//! the injected `CampaignLedger`. Outreach goes out through the bounded
//! `OutreachQueue` and is never awaited.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::campaign::acquisition::{OutreachQueue, OutreachReason, OutreachRequest};
use crate::campaign::check_in::{CheckInManager, CheckInResult, ACTION_TARGET_REACHED};
use crate::campaign::escalation::{all_remaining, cap_additions, performance_percentage};
use crate::campaign::estimator::{
    calculate_outreach_strategy, expected_responses_at, CampaignStrategy, CheckInPoint,
    EstimateParams, Location, RiskLevel, TierAddition, TierStrategy,
};
use crate::campaign::ledger::{CampaignLedger, EscalationWrite, LedgerError};
use crate::campaign::metrics::{compute_metrics, CampaignMetrics};
use crate::campaign::models::{
    CampaignStatus, EscalationRecord, NewCampaign, ResponseEvent, MANUAL_CHECKPOINT_PREFIX,
};
use crate::campaign::retry::retry_transient;
use crate::campaign::urgency::UrgencyLevel;
use crate::config::EngineConfig;
use crate::errors::AppError;

// ────────────────────────────────────────────────────────────────────────────
// Request / response types
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct CreateCampaignRequest {
    pub bid_card_id: String,
    #[serde(default)]
    pub project_type: Option<String>,
    #[serde(default)]
    pub location: Option<Location>,
    pub timeline_hours: f64,
    pub bids_needed: i64,
    #[serde(default)]
    pub urgency_override: Option<UrgencyLevel>,
    #[serde(default)]
    pub tier1_available: u32,
    #[serde(default)]
    pub tier2_available: u32,
    #[serde(default)]
    pub tier3_available: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateCampaignResponse {
    pub campaign_id: Uuid,
    pub strategy_summary: StrategySummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct StrategySummary {
    pub urgency_level: UrgencyLevel,
    pub bids_needed: u32,
    pub total_to_contact: u32,
    pub expected_total_responses: f64,
    pub confidence_score: f64,
    pub risk_level: RiskLevel,
    pub tiers: Vec<TierStrategy>,
    pub check_in_schedule: Vec<CheckInPoint>,
    pub deadline: DateTime<Utc>,
    pub reasoning: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManualEscalationResult {
    pub record: EscalationRecord,
    pub contractors_added: u32,
    pub new_tier_breakdown: Vec<TierStrategy>,
    pub estimated_impact: EstimatedImpact,
}

#[derive(Debug, Clone, Serialize)]
pub struct EstimatedImpact {
    pub additional_expected_responses: f64,
    pub new_expected_total_responses: f64,
    pub previous_confidence_score: f64,
    pub new_confidence_score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordResponseResult {
    pub campaign_id: Uuid,
    pub responses_received: u32,
    pub bids_needed: u32,
    pub status: CampaignStatus,
}

// ────────────────────────────────────────────────────────────────────────────
// Service
// ────────────────────────────────────────────────────────────────────────────

pub struct CampaignOrchestrator {
    ledger: Arc<dyn CampaignLedger>,
    queue: OutreachQueue,
    check_ins: CheckInManager,
    config: EngineConfig,
}

impl CampaignOrchestrator {
    pub fn new(ledger: Arc<dyn CampaignLedger>, queue: OutreachQueue, config: EngineConfig) -> Self {
        Self {
            check_ins: CheckInManager::new(config.escalation_policy()),
            ledger,
            queue,
            config,
        }
    }

    pub async fn active_campaigns(&self) -> Result<Vec<Uuid>, AppError> {
        Ok(self.ledger.list_active().await?)
    }

    pub async fn create_campaign(
        &self,
        request: CreateCampaignRequest,
    ) -> Result<CreateCampaignResponse, AppError> {
        self.create_campaign_at(request, Utc::now()).await
    }

    pub async fn create_campaign_at(
        &self,
        request: CreateCampaignRequest,
        now: DateTime<Utc>,
    ) -> Result<CreateCampaignResponse, AppError> {
        let bid_card_id = request.bid_card_id.trim();
        if bid_card_id.is_empty() {
            return Err(AppError::Validation("bid_card_id must not be empty".to_string()));
        }

        let strategy = calculate_outreach_strategy(
            &EstimateParams {
                bids_needed: request.bids_needed,
                timeline_hours: request.timeline_hours,
                tier1_available: request.tier1_available,
                tier2_available: request.tier2_available,
                tier3_available: request.tier3_available,
                project_type: request.project_type.as_deref(),
                location: request.location.as_ref(),
                urgency_override: request.urgency_override,
            },
            &self.config,
        )?;

        let campaign_id = self
            .ledger
            .create(NewCampaign {
                bid_card_id: bid_card_id.to_string(),
                strategy: strategy.clone(),
                started_at: now,
            })
            .await?;

        info!(
            %campaign_id,
            bid_card_id,
            urgency = %strategy.urgency_level,
            total_to_contact = strategy.total_to_contact,
            confidence = strategy.confidence_score,
            risk = strategy.risk_level.as_str(),
            "campaign created"
        );

        let initial: Vec<TierAddition> = strategy
            .tiers
            .iter()
            .map(|t| TierAddition {
                tier_id: t.tier_id,
                count: t.to_contact,
            })
            .collect();
        self.dispatch(OutreachRequest::for_additions(
            campaign_id,
            bid_card_id,
            strategy.urgency_level,
            &initial,
            OutreachReason::Initial,
            now,
        ));

        let deadline = now
            + chrono::Duration::milliseconds((strategy.timeline_hours * 3_600_000.0).round() as i64);
        Ok(CreateCampaignResponse {
            campaign_id,
            strategy_summary: summarize(strategy, deadline),
        })
    }

    pub async fn perform_check_in(&self, campaign_id: Uuid) -> Result<CheckInResult, AppError> {
        self.perform_check_in_at(campaign_id, Utc::now()).await
    }

    /// Unknown campaigns are an error. Every other ledger failure is reported
    /// in the result and leaves the campaign untouched for the next trigger.
    pub async fn perform_check_in_at(
        &self,
        campaign_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<CheckInResult, AppError> {
        let _guard = self.check_ins.locks().acquire(campaign_id).await;

        let attempt = retry_transient(
            self.config.ledger_retry,
            "perform_check_in",
            LedgerError::is_transient,
            || self.check_ins.perform_check_in(self.ledger.as_ref(), campaign_id, now),
        )
        .await;

        let result = match attempt {
            Ok(result) => result,
            Err(e @ LedgerError::NotFound(_)) => return Err(e.into()),
            Err(e) => {
                warn!(%campaign_id, error = %e, "check-in abandoned; campaign left active");
                return Ok(CheckInResult::failed(campaign_id, &e));
            }
        };

        self.dispatch(result.pending_dispatch().to_vec());
        if result.action_taken == ACTION_TARGET_REACHED {
            self.queue.forget_campaign(campaign_id);
        }
        Ok(result)
    }

    pub async fn escalate_campaign(
        &self,
        campaign_id: Uuid,
        additional_contractors: i64,
        reason: &str,
    ) -> Result<ManualEscalationResult, AppError> {
        self.escalate_campaign_at(campaign_id, additional_contractors, reason, Utc::now())
            .await
    }

    /// Operator override. Always writes a fresh `manual-<uuid>` record, adds at
    /// most what the tiers still have, best response rate first.
    pub async fn escalate_campaign_at(
        &self,
        campaign_id: Uuid,
        additional_contractors: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<ManualEscalationResult, AppError> {
        if additional_contractors <= 0 {
            return Err(AppError::Validation(format!(
                "additional_contractors must be positive, got {additional_contractors}"
            )));
        }
        let requested = u32::try_from(additional_contractors).unwrap_or(u32::MAX);

        let _guard = self.check_ins.locks().acquire(campaign_id).await;

        let campaign = retry_transient(
            self.config.ledger_retry,
            "escalate_campaign.get",
            LedgerError::is_transient,
            || self.ledger.get(campaign_id),
        )
        .await?;
        if campaign.status != CampaignStatus::Active {
            return Err(AppError::Conflict(format!(
                "campaign {campaign_id} is {}",
                campaign.status.as_str()
            )));
        }

        let additions = manual_additions(&campaign.strategy, requested);
        let requested_total: u32 = additions.iter().map(|a| a.count).sum();

        let expected_now = expected_responses_at(&campaign.strategy, campaign.elapsed_hours(now));
        let performance = performance_percentage(campaign.responses_received, expected_now);
        let reason = reason.trim();

        let record = EscalationRecord {
            checkpoint_id: format!("{MANUAL_CHECKPOINT_PREFIX}{}", Uuid::new_v4()),
            performance_percentage: performance,
            escalation_level: self.config.escalation.classify(performance),
            action_taken: manual_action(requested_total),
            additional_contractors_added: requested_total,
            tier_additions: additions,
            recommended_additional: 0,
            reason: (!reason.is_empty()).then(|| reason.to_string()),
            created_at: now,
        };

        // Same checkpoint id on every attempt: a write that landed before a
        // timeout comes back as AlreadyRecorded instead of a second escalation.
        let write = retry_transient(
            self.config.ledger_retry,
            "escalate_campaign.record",
            LedgerError::is_transient,
            || self.ledger.record_escalation(campaign_id, record.clone()),
        )
        .await?;

        // What the ledger kept is authoritative; it re-caps against current supply.
        let updated = retry_transient(
            self.config.ledger_retry,
            "escalate_campaign.reload",
            LedgerError::is_transient,
            || self.ledger.get(campaign_id),
        )
        .await?;
        let stored = match write {
            EscalationWrite::Recorded(stored) => stored,
            EscalationWrite::AlreadyRecorded => updated
                .escalation_for(&record.checkpoint_id)
                .cloned()
                .ok_or_else(|| {
                    AppError::Internal(anyhow::anyhow!(
                        "escalation {} vanished after being recorded",
                        record.checkpoint_id
                    ))
                })?,
        };
        let added = stored.additional_contractors_added;

        info!(
            %campaign_id,
            checkpoint_id = %stored.checkpoint_id,
            requested,
            added,
            reason = stored.reason.as_deref().unwrap_or(""),
            "manual escalation recorded"
        );

        self.dispatch(OutreachRequest::for_additions(
            campaign_id,
            &campaign.bid_card_id,
            campaign.strategy.urgency_level,
            &stored.tier_additions,
            OutreachReason::Escalation,
            now,
        ));

        let strategy = updated.strategy;
        let additional_expected: f64 = stored
            .tier_additions
            .iter()
            .filter_map(|a| strategy.tier(a.tier_id).map(|t| a.count as f64 * t.expected_response_rate))
            .sum();

        Ok(ManualEscalationResult {
            contractors_added: added,
            estimated_impact: EstimatedImpact {
                additional_expected_responses: round1(additional_expected),
                new_expected_total_responses: round1(strategy.expected_total_responses),
                previous_confidence_score: campaign.strategy.confidence_score,
                new_confidence_score: strategy.confidence_score,
            },
            new_tier_breakdown: strategy.tiers,
            record: stored,
        })
    }

    pub async fn get_campaign_metrics(&self, campaign_id: Uuid) -> Result<CampaignMetrics, AppError> {
        self.get_campaign_metrics_at(campaign_id, Utc::now()).await
    }

    pub async fn get_campaign_metrics_at(
        &self,
        campaign_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<CampaignMetrics, AppError> {
        let campaign = retry_transient(
            self.config.ledger_retry,
            "get_campaign_metrics",
            LedgerError::is_transient,
            || self.ledger.get(campaign_id),
        )
        .await?;
        Ok(compute_metrics(
            &campaign,
            &self.queue.channel_stats(campaign_id),
            now,
        ))
    }

    /// Appends a response. Not retried: a lost acknowledgement would double count.
    /// Reaching the bid target completes the campaign.
    pub async fn record_response(
        &self,
        campaign_id: Uuid,
        event: ResponseEvent,
    ) -> Result<RecordResponseResult, AppError> {
        let responses_received = self.ledger.record_response(campaign_id, event).await?;
        let campaign = self.ledger.get(campaign_id).await?;

        let mut status = campaign.status;
        if status == CampaignStatus::Active && responses_received >= campaign.strategy.bids_needed {
            let _guard = self.check_ins.locks().acquire(campaign_id).await;
            // Re-read under the lock: a concurrent cancel wins.
            let current = self.ledger.get(campaign_id).await?;
            if current.status == CampaignStatus::Active {
                self.ledger
                    .set_status(campaign_id, CampaignStatus::Completed)
                    .await?;
                status = CampaignStatus::Completed;
                self.queue.forget_campaign(campaign_id);
                info!(
                    %campaign_id,
                    responses_received,
                    bids_needed = campaign.strategy.bids_needed,
                    "bid target reached; campaign completed"
                );
            } else {
                status = current.status;
            }
        }

        Ok(RecordResponseResult {
            campaign_id,
            responses_received,
            bids_needed: campaign.strategy.bids_needed,
            status,
        })
    }

    /// Operator status change. Terminal campaigns can't move to a different status.
    pub async fn set_status(&self, campaign_id: Uuid, status: CampaignStatus) -> Result<(), AppError> {
        let _guard = self.check_ins.locks().acquire(campaign_id).await;

        let campaign = self.ledger.get(campaign_id).await?;
        if campaign.status == status {
            return Ok(());
        }
        if campaign.status.is_terminal() {
            return Err(AppError::Conflict(format!(
                "campaign {campaign_id} is already {}",
                campaign.status.as_str()
            )));
        }

        self.ledger.set_status(campaign_id, status).await?;
        info!(%campaign_id, status = status.as_str(), "campaign status changed");
        if status.is_terminal() {
            self.queue.forget_campaign(campaign_id);
        }
        Ok(())
    }

    pub async fn cancel_campaign(&self, campaign_id: Uuid) -> Result<(), AppError> {
        self.set_status(campaign_id, CampaignStatus::Cancelled).await
    }

    fn dispatch(&self, requests: Vec<OutreachRequest>) {
        for request in requests {
            self.queue.enqueue(request);
        }
    }
}

fn manual_action(added: u32) -> String {
    if added == 0 {
        "manual escalation — no remaining supply to add".to_string()
    } else {
        format!("manual escalation — {added} additional contractors authorized")
    }
}

/// Remaining supply ordered by response rate, trimmed to `requested` contacts.
fn manual_additions(strategy: &CampaignStrategy, requested: u32) -> Vec<TierAddition> {
    let mut remaining = all_remaining(strategy);
    remaining.sort_by(|a, b| {
        let rate = |id| strategy.tier(id).map_or(0.0, |t| t.expected_response_rate);
        rate(b.tier_id).total_cmp(&rate(a.tier_id))
    });
    cap_additions(remaining, requested)
}

fn summarize(strategy: CampaignStrategy, deadline: DateTime<Utc>) -> StrategySummary {
    StrategySummary {
        urgency_level: strategy.urgency_level,
        bids_needed: strategy.bids_needed,
        total_to_contact: strategy.total_to_contact,
        expected_total_responses: round1(strategy.expected_total_responses),
        confidence_score: strategy.confidence_score,
        risk_level: strategy.risk_level,
        tiers: strategy.tiers,
        check_in_schedule: strategy.check_in_schedule,
        deadline,
        reasoning: strategy.reasoning,
    }
}

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}
