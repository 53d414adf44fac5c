//! Campaign progress report. Pure over a ledger snapshot plus the dispatch
//! queue's per-channel counters.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::campaign::acquisition::{ChannelCounters, ChannelKind, ChannelStats};
use crate::campaign::check_in::checkpoint_states;
use crate::campaign::escalation::{performance_percentage, CheckpointState};
use crate::campaign::estimator::expected_responses_at;
use crate::campaign::models::{Campaign, CampaignStatus, EscalationRecord};

#[derive(Debug, Clone, Serialize)]
pub struct CampaignMetrics {
    pub campaign_id: Uuid,
    pub bid_card_id: String,
    pub status: CampaignStatus,
    pub timeline_progress: TimelineProgress,
    pub response_progress: ResponseProgress,
    pub tier_performance: Vec<TierPerformance>,
    pub channel_performance: Vec<ChannelPerformance>,
    pub escalation_history: Vec<EscalationRecord>,
    pub checkpoints: Vec<CheckpointStatus>,
    pub projected_outcome: ProjectedOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimelineProgress {
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub elapsed_hours: f64,
    pub timeline_hours: f64,
    /// 0.0 – 1.0
    pub fraction: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResponseProgress {
    pub responses_received: u32,
    pub bids_needed: u32,
    /// `responses_received / bids_needed`, capped at 1.0
    pub fraction: f64,
    pub expected_by_now: f64,
    pub performance_percentage: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TierPerformance {
    pub tier_id: u8,
    pub available: u32,
    pub contacted: u32,
    pub responded: u32,
    pub expected_response_rate: f64,
    /// `None` until someone in the tier has been contacted.
    pub actual_response_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelPerformance {
    pub channel: ChannelKind,
    #[serde(flatten)]
    pub counters: ChannelCounters,
    pub responses: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckpointStatus {
    pub checkpoint_id: String,
    pub scheduled_for: DateTime<Utc>,
    pub expected_cumulative_responses: f64,
    pub state: CheckpointState,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProjectedOutcome {
    pub projected_responses: f64,
    pub bids_needed: u32,
    pub will_meet_target: bool,
    pub projected_shortfall: f64,
}

pub fn compute_metrics(
    campaign: &Campaign,
    channel_stats: &[ChannelStats],
    now: DateTime<Utc>,
) -> CampaignMetrics {
    let strategy = &campaign.strategy;
    let elapsed = campaign.elapsed_hours(now);
    let timeline = strategy.timeline_hours;
    let expected_by_now = expected_responses_at(strategy, elapsed);

    let timeline_progress = TimelineProgress {
        started_at: campaign.started_at,
        deadline: campaign.deadline(),
        elapsed_hours: round1(elapsed),
        timeline_hours: timeline,
        fraction: if timeline > 0.0 {
            (elapsed / timeline).clamp(0.0, 1.0)
        } else {
            1.0
        },
    };

    let response_progress = ResponseProgress {
        responses_received: campaign.responses_received,
        bids_needed: strategy.bids_needed,
        fraction: if strategy.bids_needed > 0 {
            (campaign.responses_received as f64 / strategy.bids_needed as f64).min(1.0)
        } else {
            1.0
        },
        expected_by_now: round1(expected_by_now),
        performance_percentage: performance_percentage(campaign.responses_received, expected_by_now),
    };

    let tier_performance = strategy
        .tiers
        .iter()
        .map(|t| {
            let responded = campaign
                .responses
                .iter()
                .filter(|r| r.tier_id == Some(t.tier_id))
                .count() as u32;
            TierPerformance {
                tier_id: t.tier_id,
                available: t.available,
                contacted: t.to_contact,
                responded,
                expected_response_rate: t.expected_response_rate,
                actual_response_rate: (t.to_contact > 0)
                    .then(|| responded as f64 / t.to_contact as f64),
            }
        })
        .collect();

    let checkpoints = checkpoint_states(campaign)
        .into_iter()
        .zip(&strategy.check_in_schedule)
        .map(|((checkpoint_id, state), point)| CheckpointStatus {
            checkpoint_id,
            scheduled_for: campaign.checkpoint_time(point),
            expected_cumulative_responses: point.expected_cumulative_responses,
            state,
        })
        .collect();

    CampaignMetrics {
        campaign_id: campaign.id,
        bid_card_id: campaign.bid_card_id.clone(),
        status: campaign.status,
        timeline_progress,
        response_progress,
        tier_performance,
        channel_performance: channel_performance(campaign, channel_stats),
        escalation_history: campaign.escalation_history.clone(),
        checkpoints,
        projected_outcome: project_outcome(campaign.responses_received, strategy.bids_needed, elapsed, timeline),
    }
}

/// Every channel that either carried outreach or produced a response.
fn channel_performance(campaign: &Campaign, stats: &[ChannelStats]) -> Vec<ChannelPerformance> {
    ChannelKind::ALL
        .into_iter()
        .filter_map(|kind| {
            let counters = stats
                .iter()
                .find(|s| s.channel == kind)
                .map(|s| s.counters.clone());
            let responses = campaign
                .responses
                .iter()
                .filter(|r| r.channel == Some(kind))
                .count() as u32;
            if counters.is_none() && responses == 0 {
                return None;
            }
            Some(ChannelPerformance {
                channel: kind,
                counters: counters.unwrap_or_default(),
                responses,
            })
        })
        .collect()
}

/// Extrapolates the response rate so far to the deadline. Past the deadline
/// the projection is just the count received.
pub fn project_outcome(
    responses_received: u32,
    bids_needed: u32,
    elapsed_hours: f64,
    timeline_hours: f64,
) -> ProjectedOutcome {
    let received = responses_received as f64;
    let effective = elapsed_hours.min(timeline_hours);
    let projected = if effective > 0.0 {
        received * timeline_hours / effective
    } else {
        received
    };
    let projected = round1(projected);

    ProjectedOutcome {
        projected_responses: projected,
        bids_needed,
        will_meet_target: projected >= bids_needed as f64,
        projected_shortfall: round1((bids_needed as f64 - projected).max(0.0)),
    }
}

fn round1(x: f64) -> f64 {
    (x * 10.0).round() / 10.0
}
