//! Capacity Estimator — decides how many contractors to contact per tier.
//!
//! Pure and synchronous: no I/O, no shared state. Safe to call from any task.
//!
//! Algorithm:
//! 1. timeline_hours → `UrgencyLevel` (threshold table, or the caller's override)
//! 2. (tier, urgency) → base response rate, adjusted by project type
//! 3. Greedy allocation, best tier first, against `bids_needed × safety_margin`
//! 4. expected_total_responses = Σ(to_contact × rate)
//! 5. confidence_score = P(Σ Bernoulli ≥ bids_needed) × 100
//! 6. risk_level from confidence bands and supply exhaustion
//! 7. check-in schedule at fixed fractions of the timeline
//! 8. deterministic reasoning string

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::campaign::urgency::{UrgencyLevel, UrgencyThresholds};
use crate::config::EngineConfig;

pub const TIER_IDS: [u8; 3] = [1, 2, 3];

const MIN_RESPONSE_RATE: f64 = 0.01;
const MAX_RESPONSE_RATE: f64 = 0.95;
/// Float slack for "remaining target is satisfied" comparisons.
const EPSILON: f64 = 1e-9;
/// Above this many `bids_needed × contacts` steps confidence switches from the
/// exact distribution to the Normal approximation.
pub const EXACT_CONFIDENCE_MAX_WORK: u64 = 1_000_000;

#[derive(Debug, Error, PartialEq)]
pub enum EstimatorError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

// ────────────────────────────────────────────────────────────────────────────
// Data models
// ────────────────────────────────────────────────────────────────────────────

/// Allocation for one contractor tier. Invariant: `to_contact <= available`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierStrategy {
    pub tier_id: u8,
    pub available: u32,
    pub to_contact: u32,
    pub expected_response_rate: f64,
    pub expected_responses: f64,
}

impl TierStrategy {
    pub fn remaining(&self) -> u32 {
        self.available.saturating_sub(self.to_contact)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    InsufficientSupply,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::InsufficientSupply => "insufficient_supply",
        }
    }

    fn bumped(self) -> Self {
        match self {
            RiskLevel::Low => RiskLevel::Medium,
            RiskLevel::Medium | RiskLevel::High => RiskLevel::High,
            RiskLevel::InsufficientSupply => RiskLevel::InsufficientSupply,
        }
    }
}

/// A scheduled progress check. `scheduled_at` is an offset in hours from campaign start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckInPoint {
    pub checkpoint_id: String,
    pub scheduled_at: f64,
    pub expected_cumulative_responses: f64,
}

/// Where the work is. Only echoed into the reasoning text today.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip_code: Option<String>,
}

impl Location {
    fn label(&self) -> Option<String> {
        let parts: Vec<&str> = [&self.city, &self.state, &self.zip_code]
            .into_iter()
            .filter_map(|p| p.as_deref())
            .filter(|p| !p.trim().is_empty())
            .collect();
        (!parts.is_empty()).then(|| parts.join(", "))
    }
}

/// Full outreach plan for a campaign.
/// Invariant: `total_to_contact == Σ tiers[i].to_contact`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignStrategy {
    pub urgency_level: UrgencyLevel,
    pub bids_needed: u32,
    pub timeline_hours: f64,
    pub tiers: Vec<TierStrategy>,
    pub total_to_contact: u32,
    pub expected_total_responses: f64,
    /// Standard deviation of the total response count under the Bernoulli model.
    pub response_std_dev: f64,
    pub confidence_score: f64, // 0 – 100
    pub risk_level: RiskLevel,
    pub reasoning: String,
    pub check_in_schedule: Vec<CheckInPoint>,
}

/// Contacts authorized for one tier by an escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierAddition {
    pub tier_id: u8,
    pub count: u32,
}

impl CampaignStrategy {
    pub fn tier(&self, tier_id: u8) -> Option<&TierStrategy> {
        self.tiers.iter().find(|t| t.tier_id == tier_id)
    }

    pub fn remaining_supply(&self) -> u32 {
        self.tiers.iter().map(TierStrategy::remaining).sum()
    }

    /// Applies escalation additions (capped at availability) and refreshes the
    /// derived totals. Returns the additions actually applied.
    pub fn apply_tier_additions(&mut self, additions: &[TierAddition]) -> Vec<TierAddition> {
        let mut applied = Vec::new();
        for addition in additions {
            let Some(tier) = self.tiers.iter_mut().find(|t| t.tier_id == addition.tier_id) else {
                continue;
            };
            let count = addition.count.min(tier.remaining());
            if count == 0 {
                continue;
            }
            tier.to_contact += count;
            tier.expected_responses = tier.to_contact as f64 * tier.expected_response_rate;
            applied.push(TierAddition {
                tier_id: tier.tier_id,
                count,
            });
        }
        self.refresh_totals();
        applied
    }

    /// Contacts are only ever added, so confidence never moves down even when
    /// the recount crosses from the exact method to the approximation.
    fn refresh_totals(&mut self) {
        self.total_to_contact = self.tiers.iter().map(|t| t.to_contact).sum();
        self.expected_total_responses = self.tiers.iter().map(|t| t.expected_responses).sum();
        self.response_std_dev = response_std_dev(&self.tiers);
        self.confidence_score = confidence_score(&self.tiers, self.bids_needed).max(self.confidence_score);
    }
}

/// Inputs to `calculate_outreach_strategy`.
#[derive(Debug, Clone, Default)]
pub struct EstimateParams<'a> {
    pub bids_needed: i64,
    pub timeline_hours: f64,
    pub tier1_available: u32,
    pub tier2_available: u32,
    pub tier3_available: u32,
    pub project_type: Option<&'a str>,
    pub location: Option<&'a Location>,
    pub urgency_override: Option<UrgencyLevel>,
}

// ────────────────────────────────────────────────────────────────────────────
// Response rates
// ────────────────────────────────────────────────────────────────────────────

/// Base response rate for a tier at an urgency level.
/// Tier 1 = existing relationships, tier 2 = previously engaged, tier 3 = cold.
pub fn base_response_rate(tier_id: u8, urgency: UrgencyLevel) -> f64 {
    use UrgencyLevel::*;
    match (tier_id, urgency) {
        (1, Emergency) => 0.60,
        (1, Urgent) => 0.70,
        (1, Standard) => 0.75,
        (1, Flexible) => 0.80,
        (2, Emergency) => 0.30,
        (2, Urgent) => 0.40,
        (2, Standard) => 0.45,
        (2, Flexible) => 0.50,
        (_, Emergency) => 0.10,
        (_, Urgent) => 0.15,
        (_, Standard) => 0.20,
        (_, Flexible) => 0.25,
    }
}

/// Multiplier applied to every tier's rate for the kind of job.
/// Busy trades answer less often; small jobs are easy yeses.
pub fn project_type_multiplier(project_type: Option<&str>) -> f64 {
    let Some(project_type) = project_type else {
        return 1.0;
    };
    let normalized = project_type.trim().to_lowercase();
    if normalized.contains("emergency") {
        0.85
    } else if ["roof", "hvac", "plumb", "electric"]
        .iter()
        .any(|trade| normalized.contains(trade))
    {
        0.9
    } else if ["handyman", "repair", "paint", "lawn"]
        .iter()
        .any(|trade| normalized.contains(trade))
    {
        1.1
    } else {
        1.0
    }
}

pub fn response_rate(tier_id: u8, urgency: UrgencyLevel, project_type: Option<&str>) -> f64 {
    (base_response_rate(tier_id, urgency) * project_type_multiplier(project_type))
        .clamp(MIN_RESPONSE_RATE, MAX_RESPONSE_RATE)
}

// ────────────────────────────────────────────────────────────────────────────
// Core algorithm
// ────────────────────────────────────────────────────────────────────────────

pub fn calculate_outreach_strategy(
    params: &EstimateParams<'_>,
    config: &EngineConfig,
) -> Result<CampaignStrategy, EstimatorError> {
    if params.bids_needed <= 0 {
        return Err(EstimatorError::InvalidArgument(format!(
            "bids_needed must be positive, got {}",
            params.bids_needed
        )));
    }
    if !params.timeline_hours.is_finite() || params.timeline_hours <= 0.0 {
        return Err(EstimatorError::InvalidArgument(format!(
            "timeline_hours must be positive, got {}",
            params.timeline_hours
        )));
    }
    let bids_needed = u32::try_from(params.bids_needed).map_err(|_| {
        EstimatorError::InvalidArgument(format!("bids_needed too large: {}", params.bids_needed))
    })?;

    // Step 1: urgency
    let urgency_level = params
        .urgency_override
        .unwrap_or_else(|| classify_urgency(&config.urgency, params.timeline_hours));

    // Step 2: rates per tier
    let availability = [
        params.tier1_available,
        params.tier2_available,
        params.tier3_available,
    ];
    let capacities: Vec<TierCapacity> = TIER_IDS
        .iter()
        .zip(availability)
        .map(|(&tier_id, available)| TierCapacity {
            tier_id,
            capacity: available,
            rate: response_rate(tier_id, urgency_level, params.project_type),
        })
        .collect();

    // Step 3: greedy allocation against the margin-inflated target
    let target = bids_needed as f64 * config.safety_margin;
    let allocation = allocate_greedy(target, &capacities);

    let tiers: Vec<TierStrategy> = capacities
        .iter()
        .zip(&allocation.counts)
        .map(|(cap, &to_contact)| TierStrategy {
            tier_id: cap.tier_id,
            available: cap.capacity,
            to_contact,
            expected_response_rate: cap.rate,
            expected_responses: to_contact as f64 * cap.rate,
        })
        .collect();

    // Steps 4-5: expectation and confidence
    let total_to_contact: u32 = tiers.iter().map(|t| t.to_contact).sum();
    let expected_total_responses: f64 = tiers.iter().map(|t| t.expected_responses).sum();
    let confidence = confidence_score(&tiers, bids_needed);

    // Step 6: risk
    let max_expected: f64 = capacities.iter().map(|c| c.capacity as f64 * c.rate).sum();
    let supply_constrained = allocation.unmet_target > EPSILON;
    let risk_level = if max_expected + EPSILON < bids_needed as f64 {
        RiskLevel::InsufficientSupply
    } else {
        let band = risk_band(confidence);
        if supply_constrained {
            band.bumped()
        } else {
            band
        }
    };

    // Step 7: schedule
    let check_in_schedule = build_check_in_schedule(
        params.timeline_hours,
        expected_total_responses,
        &config.check_in_fractions,
    );

    let mut strategy = CampaignStrategy {
        urgency_level,
        bids_needed,
        timeline_hours: params.timeline_hours,
        response_std_dev: response_std_dev(&tiers),
        tiers,
        total_to_contact,
        expected_total_responses,
        confidence_score: confidence,
        risk_level,
        reasoning: String::new(),
        check_in_schedule,
    };

    // Step 8: reasoning
    strategy.reasoning = build_reasoning(&strategy, params.project_type, params.location);

    Ok(strategy)
}

pub fn classify_urgency(thresholds: &UrgencyThresholds, timeline_hours: f64) -> UrgencyLevel {
    thresholds.classify(timeline_hours)
}

/// One tier's spare capacity and yield, input to `allocate_greedy`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TierCapacity {
    pub tier_id: u8,
    pub capacity: u32,
    pub rate: f64,
}

#[derive(Debug, Clone)]
pub(crate) struct Allocation {
    /// Contacts per tier, same order as the input capacities.
    pub counts: Vec<u32>,
    /// Expected responses still missing after every tier was drawn from.
    pub unmet_target: f64,
}

/// Fills `target_responses` from the first tier onward, spilling into later
/// tiers only when an earlier tier runs out.
pub(crate) fn allocate_greedy(target_responses: f64, capacities: &[TierCapacity]) -> Allocation {
    let mut remaining = target_responses.max(0.0);
    let mut counts = Vec::with_capacity(capacities.len());

    for cap in capacities {
        if remaining <= EPSILON || cap.capacity == 0 || cap.rate <= 0.0 {
            counts.push(0);
            continue;
        }
        let wanted = (remaining / cap.rate - EPSILON).ceil().max(0.0);
        let take = if wanted >= cap.capacity as f64 {
            cap.capacity
        } else {
            wanted as u32
        };
        remaining -= take as f64 * cap.rate;
        counts.push(take);
    }

    Allocation {
        counts,
        unmet_target: remaining.max(0.0),
    }
}

/// P(total responses ≥ bids_needed) × 100, where each contact responds
/// independently with its tier's rate.
///
/// Small campaigns are evaluated exactly by convolving one trial at a time
/// into a distribution truncated at `bids_needed` (the last bucket absorbs
/// "≥ bids_needed"). Once `bids_needed × contacts` passes
/// `EXACT_CONFIDENCE_MAX_WORK` the sum is approximated by a Normal with a
/// continuity correction, which keeps the cost constant for any input size.
pub fn confidence_score(tiers: &[TierStrategy], bids_needed: u32) -> f64 {
    if bids_needed == 0 {
        return 100.0;
    }
    let contacts: u64 = tiers.iter().map(|t| u64::from(t.to_contact)).sum();
    let probability = if u64::from(bids_needed).saturating_mul(contacts) <= EXACT_CONFIDENCE_MAX_WORK {
        exact_tail(tiers, bids_needed)
    } else {
        normal_tail(tiers, bids_needed)
    };
    round_tenth((probability * 100.0).clamp(0.0, 100.0))
}

fn exact_tail(tiers: &[TierStrategy], bids_needed: u32) -> f64 {
    let k = bids_needed as usize;
    let mut dist = vec![0.0_f64; k + 1];
    dist[0] = 1.0;

    'tiers: for tier in tiers {
        let p = tier.expected_response_rate.clamp(0.0, 1.0);
        let q = 1.0 - p;
        for _ in 0..tier.to_contact {
            dist[k] += dist[k - 1] * p;
            for j in (1..k).rev() {
                dist[j] = dist[j] * q + dist[j - 1] * p;
            }
            dist[0] *= q;
            if dist[k] >= 1.0 - 1e-12 {
                break 'tiers;
            }
        }
    }
    dist[k]
}

/// P(X ≥ k) ≈ P(N(μ, σ²) ≥ k − ½).
fn normal_tail(tiers: &[TierStrategy], bids_needed: u32) -> f64 {
    let mean: f64 = tiers.iter().map(|t| t.expected_responses).sum();
    let std_dev = response_std_dev(tiers);
    let threshold = bids_needed as f64 - 0.5;
    if std_dev <= EPSILON {
        return if mean >= threshold { 1.0 } else { 0.0 };
    }
    let z = (threshold - mean) / std_dev;
    0.5 * erfc(z / std::f64::consts::SQRT_2)
}

/// Complementary error function, Chebyshev fit with fractional error < 1.2e-7.
fn erfc(x: f64) -> f64 {
    let z = x.abs();
    let t = 1.0 / (1.0 + 0.5 * z);
    let poly = -z * z - 1.265_512_23
        + t * (1.000_023_68
            + t * (0.374_091_96
                + t * (0.096_784_18
                    + t * (-0.186_288_06
                        + t * (0.278_868_07
                            + t * (-1.135_203_98
                                + t * (1.488_515_87 + t * (-0.822_152_23 + t * 0.170_872_77))))))));
    let ans = t * poly.exp();
    if x >= 0.0 {
        ans
    } else {
        2.0 - ans
    }
}

/// √Σ n·p·(1−p) — spread of the total response count.
pub fn response_std_dev(tiers: &[TierStrategy]) -> f64 {
    tiers
        .iter()
        .map(|t| {
            let p = t.expected_response_rate;
            t.to_contact as f64 * p * (1.0 - p)
        })
        .sum::<f64>()
        .sqrt()
}

fn risk_band(confidence: f64) -> RiskLevel {
    if confidence >= 80.0 {
        RiskLevel::Low
    } else if confidence >= 50.0 {
        RiskLevel::Medium
    } else {
        RiskLevel::High
    }
}

/// Checkpoints at each fraction of the timeline, expected responses
/// interpolated linearly. Fractions outside (0, 1] are dropped.
pub fn build_check_in_schedule(
    timeline_hours: f64,
    expected_total_responses: f64,
    fractions: &[f64],
) -> Vec<CheckInPoint> {
    let mut fractions: Vec<f64> = fractions
        .iter()
        .copied()
        .filter(|f| f.is_finite() && *f > 0.0 && *f <= 1.0)
        .collect();
    fractions.sort_by(|a, b| a.total_cmp(b));
    fractions.dedup_by(|a, b| (*a - *b).abs() < EPSILON);

    fractions
        .into_iter()
        .enumerate()
        .map(|(idx, fraction)| CheckInPoint {
            checkpoint_id: format!("checkpoint-{}", idx + 1),
            scheduled_at: timeline_hours * fraction,
            expected_cumulative_responses: expected_total_responses * fraction,
        })
        .collect()
}

/// Expected cumulative responses at `elapsed_hours` on the same linear curve
/// the schedule uses.
pub fn expected_responses_at(strategy: &CampaignStrategy, elapsed_hours: f64) -> f64 {
    if strategy.timeline_hours <= 0.0 {
        return strategy.expected_total_responses;
    }
    let fraction = (elapsed_hours / strategy.timeline_hours).clamp(0.0, 1.0);
    strategy.expected_total_responses * fraction
}

fn build_reasoning(
    strategy: &CampaignStrategy,
    project_type: Option<&str>,
    location: Option<&Location>,
) -> String {
    let tier_parts: Vec<String> = strategy
        .tiers
        .iter()
        .filter(|t| t.to_contact > 0)
        .map(|t| {
            format!(
                "{} of {} tier-{} contractors ({:.0}% response rate)",
                t.to_contact,
                t.available,
                t.tier_id,
                t.expected_response_rate * 100.0
            )
        })
        .collect();

    let mut reasoning = format!(
        "{} timeline ({:.0}h)",
        capitalize(strategy.urgency_level.as_str()),
        strategy.timeline_hours
    );
    if let Some(project_type) = project_type.filter(|p| !p.trim().is_empty()) {
        reasoning.push_str(&format!(" for {}", project_type.trim()));
    }
    if let Some(label) = location.and_then(Location::label) {
        reasoning.push_str(&format!(" in {label}"));
    }

    if tier_parts.is_empty() {
        reasoning.push_str(": no contractors available to contact.");
    } else {
        reasoning.push_str(&format!(": contacting {}.", tier_parts.join(", ")));
    }

    reasoning.push_str(&format!(
        " Expecting {:.1} responses for {} bids needed; confidence {:.1}%.",
        strategy.expected_total_responses, strategy.bids_needed, strategy.confidence_score
    ));

    if strategy.risk_level == RiskLevel::InsufficientSupply {
        reasoning.push_str(
            " Available supply cannot realistically reach the bid target even at full allocation.",
        );
    }
    reasoning
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        None => String::new(),
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
    }
}

fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn params(bids: i64, hours: f64, t1: u32, t2: u32, t3: u32) -> EstimateParams<'static> {
        EstimateParams {
            bids_needed: bids,
            timeline_hours: hours,
            tier1_available: t1,
            tier2_available: t2,
            tier3_available: t3,
            ..Default::default()
        }
    }

    fn estimate(p: &EstimateParams<'_>) -> CampaignStrategy {
        calculate_outreach_strategy(p, &EngineConfig::default()).unwrap()
    }

    fn tier(tier_id: u8, to_contact: u32, rate: f64) -> TierStrategy {
        TierStrategy {
            tier_id,
            available: 1000,
            to_contact,
            expected_response_rate: rate,
            expected_responses: to_contact as f64 * rate,
        }
    }

    #[test]
    fn test_standard_campaign_aims_near_target() {
        let s = estimate(&params(4, 24.0, 5, 20, 100));
        assert!(s.total_to_contact > 0);
        assert!(
            s.expected_total_responses >= 4.0 * 0.9,
            "expected {} responses",
            s.expected_total_responses
        );
        assert!((0.0..=100.0).contains(&s.confidence_score));
        assert_eq!(s.urgency_level, UrgencyLevel::Urgent);
    }

    #[test]
    fn test_tier_one_is_used_before_spilling() {
        let s = estimate(&params(4, 24.0, 5, 20, 100));
        assert_eq!(s.tiers[0].to_contact, 5);
        assert!(s.tiers[1].to_contact > 0);
        assert_eq!(s.tiers[2].to_contact, 0, "tier 3 should not be needed");
    }

    #[test]
    fn test_insufficient_supply_is_best_effort() {
        let s = estimate(&params(10, 24.0, 0, 0, 2));
        assert_eq!(s.total_to_contact, 2);
        assert_eq!(s.risk_level, RiskLevel::InsufficientSupply);
        assert_eq!(s.risk_level.as_str(), "insufficient_supply");
        assert!(s.reasoning.contains("cannot realistically reach"));
    }

    #[test]
    fn test_no_supply_at_all() {
        let s = estimate(&params(3, 48.0, 0, 0, 0));
        assert_eq!(s.total_to_contact, 0);
        assert_eq!(s.confidence_score, 0.0);
        assert_eq!(s.risk_level, RiskLevel::InsufficientSupply);
    }

    #[test]
    fn test_rejects_non_positive_inputs() {
        let cfg = EngineConfig::default();
        assert!(matches!(
            calculate_outreach_strategy(&params(0, 24.0, 1, 1, 1), &cfg),
            Err(EstimatorError::InvalidArgument(_))
        ));
        assert!(matches!(
            calculate_outreach_strategy(&params(-3, 24.0, 1, 1, 1), &cfg),
            Err(EstimatorError::InvalidArgument(_))
        ));
        assert!(matches!(
            calculate_outreach_strategy(&params(3, 0.0, 1, 1, 1), &cfg),
            Err(EstimatorError::InvalidArgument(_))
        ));
        assert!(matches!(
            calculate_outreach_strategy(&params(3, f64::NAN, 1, 1, 1), &cfg),
            Err(EstimatorError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_allocation_never_exceeds_availability() {
        for bids in 1..30 {
            for &(t1, t2, t3) in &[(0, 0, 0), (1, 2, 3), (5, 20, 100), (50, 0, 7), (0, 9, 0)] {
                for &hours in &[3.0, 12.0, 48.0, 200.0] {
                    let s = estimate(&params(bids, hours, t1, t2, t3));
                    assert!(s.total_to_contact <= t1 + t2 + t3);
                    for t in &s.tiers {
                        assert!(t.to_contact <= t.available, "tier {} over-allocated", t.tier_id);
                    }
                    assert_eq!(
                        s.total_to_contact,
                        s.tiers.iter().map(|t| t.to_contact).sum::<u32>()
                    );
                }
            }
        }
    }

    #[test]
    fn test_confidence_monotonic_in_contacts() {
        for bids in [1, 3, 5, 12] {
            for tier_idx in 0..3 {
                let mut previous = -1.0;
                for n in 0..60 {
                    let mut tiers = vec![tier(1, 3, 0.7), tier(2, 4, 0.4), tier(3, 10, 0.15)];
                    tiers[tier_idx].to_contact = n;
                    let score = confidence_score(&tiers, bids);
                    assert!(
                        score >= previous,
                        "confidence dropped from {previous} to {score} (bids={bids}, tier={tier_idx}, n={n})"
                    );
                    previous = score;
                }
            }
        }
    }

    #[test]
    fn test_confidence_exact_small_case() {
        // Two contacts at p=0.5, need 1: P(X ≥ 1) = 0.75
        let tiers = vec![tier(1, 2, 0.5)];
        assert!((confidence_score(&tiers, 1) - 75.0).abs() < 1e-9);
        // Need 2: P(X = 2) = 0.25
        assert!((confidence_score(&tiers, 2) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_confidence_bounds() {
        assert_eq!(confidence_score(&[], 3), 0.0);
        let many = vec![tier(1, 500, 0.9)];
        assert_eq!(confidence_score(&many, 3), 100.0);
    }

    #[test]
    fn test_schedule_is_monotonic() {
        let s = estimate(&params(6, 72.0, 3, 10, 40));
        assert_eq!(s.check_in_schedule.len(), 3);
        for pair in s.check_in_schedule.windows(2) {
            assert!(pair[1].scheduled_at > pair[0].scheduled_at);
            assert!(pair[1].expected_cumulative_responses >= pair[0].expected_cumulative_responses);
        }
        for point in &s.check_in_schedule {
            assert!(point.scheduled_at > 0.0 && point.scheduled_at <= 72.0);
        }
        assert_eq!(s.check_in_schedule[0].checkpoint_id, "checkpoint-1");
        assert!((s.check_in_schedule[1].scheduled_at - 36.0).abs() < 1e-9);
    }

    #[test]
    fn test_schedule_drops_invalid_fractions() {
        let schedule = build_check_in_schedule(10.0, 4.0, &[0.5, 0.0, 1.5, 0.25, 0.5, 1.0]);
        let offsets: Vec<f64> = schedule.iter().map(|p| p.scheduled_at).collect();
        assert_eq!(offsets, vec![2.5, 5.0, 10.0]);
    }

    #[test]
    fn test_urgency_override_wins() {
        let mut p = params(4, 200.0, 5, 20, 100);
        p.urgency_override = Some(UrgencyLevel::Emergency);
        let s = estimate(&p);
        assert_eq!(s.urgency_level, UrgencyLevel::Emergency);
        assert!((s.tiers[0].expected_response_rate - 0.60).abs() < 1e-9);
    }

    #[test]
    fn test_project_type_adjusts_rates() {
        assert_eq!(project_type_multiplier(None), 1.0);
        assert_eq!(project_type_multiplier(Some("Roofing")), 0.9);
        assert_eq!(project_type_multiplier(Some("emergency plumbing")), 0.85);
        assert_eq!(project_type_multiplier(Some("handyman")), 1.1);
        let rate = response_rate(1, UrgencyLevel::Flexible, Some("handyman"));
        assert!(rate <= MAX_RESPONSE_RATE);
    }

    #[test]
    fn test_risk_bands() {
        let easy = estimate(&params(1, 100.0, 20, 20, 20));
        assert_eq!(easy.risk_level, RiskLevel::Low);

        // Target reachable on paper but only by draining every tier.
        let tight = estimate(&params(5, 24.0, 2, 3, 20));
        assert_ne!(tight.risk_level, RiskLevel::InsufficientSupply);
        assert_ne!(tight.risk_level, RiskLevel::Low);
    }

    #[test]
    fn test_reasoning_mentions_tiers_and_context() {
        let location = Location {
            city: Some("Austin".to_string()),
            state: Some("TX".to_string()),
            zip_code: None,
        };
        let mut p = params(4, 24.0, 5, 20, 100);
        p.project_type = Some("kitchen remodel");
        p.location = Some(&location);
        let s = estimate(&p);
        assert!(s.reasoning.starts_with("Urgent timeline (24h) for kitchen remodel in Austin, TX"));
        assert!(s.reasoning.contains("tier-1"));
        assert!(s.reasoning.contains("4 bids needed"));
    }

    #[test]
    fn test_apply_tier_additions_caps_and_refreshes() {
        let mut s = estimate(&params(4, 24.0, 5, 20, 100));
        let before_total = s.total_to_contact;
        let before_conf = s.confidence_score;
        let applied = s.apply_tier_additions(&[
            TierAddition { tier_id: 1, count: 3 },
            TierAddition { tier_id: 3, count: 10 },
        ]);
        // tier 1 was already fully contacted
        assert_eq!(applied, vec![TierAddition { tier_id: 3, count: 10 }]);
        assert_eq!(s.total_to_contact, before_total + 10);
        assert!(s.confidence_score >= before_conf);
        assert_eq!(s.tier(3).unwrap().to_contact, 10);
    }

    #[test]
    fn test_large_campaign_estimates_quickly() {
        let started = std::time::Instant::now();
        let s = estimate(&params(20_000, 200.0, 0, 0, 1_000_000));
        assert_eq!(s.total_to_contact, 100_000);
        assert_eq!(s.confidence_score, 100.0);
        assert!(
            started.elapsed() < std::time::Duration::from_secs(1),
            "estimate took {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn test_normal_tail_tracks_exact_near_the_bound() {
        let tiers = vec![tier(1, 40, 0.7), tier(2, 60, 0.4), tier(3, 200, 0.15)];
        let exact = exact_tail(&tiers, 80) * 100.0;
        let approx = normal_tail(&tiers, 80) * 100.0;
        assert!((exact - approx).abs() < 3.0, "exact {exact} vs normal {approx}");
    }

    #[test]
    fn test_normal_tail_monotonic_above_target() {
        let mut previous = -1.0;
        for n in 0..2_000 {
            let tiers = vec![tier(1, 2_000, 0.7), tier(3, n, 0.15)];
            let score = round_tenth(normal_tail(&tiers, 1_400) * 100.0);
            assert!(score >= previous, "dropped to {score} at n={n}");
            previous = score;
        }
    }

    #[test]
    fn test_additions_never_lower_confidence_across_methods() {
        let mut s = estimate(&params(900, 200.0, 0, 0, 100_000));
        let mut previous = s.confidence_score;
        for _ in 0..5 {
            s.apply_tier_additions(&[TierAddition { tier_id: 3, count: 50 }]);
            assert!(s.confidence_score >= previous);
            previous = s.confidence_score;
        }
    }

    #[test]
    fn test_greedy_leaves_unmet_target_when_exhausted() {
        let caps = [
            TierCapacity { tier_id: 1, capacity: 1, rate: 0.5 },
            TierCapacity { tier_id: 2, capacity: 2, rate: 0.25 },
        ];
        let alloc = allocate_greedy(2.0, &caps);
        assert_eq!(alloc.counts, vec![1, 2]);
        assert!((alloc.unmet_target - 1.0).abs() < 1e-9);
    }
}
