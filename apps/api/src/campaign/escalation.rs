//! Escalation policy — turns checkpoint performance into a severity level and an action.
//!
//! Levels are ordered `None < Mild < Moderate < Severe < Critical`, and
//! `EscalationThresholds::classify` is the only place that maps a performance
//! percentage to a level, so higher performance can never yield a more severe
//! level than lower performance.
//!
//! | performance     | level    | action                                   |
//! |-----------------|----------|------------------------------------------|
//! | `>= 90%`        | None     | log only                                 |
//! | `70 – 89%`      | Mild     | log only                                 |
//! | `50 – 69%`      | Moderate | recommend, wait for operator confirmation |
//! | `25 – 49%`      | Severe   | auto-escalate, bounded                   |
//! | `< 25%`         | Critical | contact every remaining contractor       |

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::campaign::estimator::{allocate_greedy, CampaignStrategy, TierAddition, TierCapacity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationLevel {
    None,
    Mild,
    Moderate,
    Severe,
    Critical,
}

impl EscalationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationLevel::None => "none",
            EscalationLevel::Mild => "mild",
            EscalationLevel::Moderate => "moderate",
            EscalationLevel::Severe => "severe",
            EscalationLevel::Critical => "critical",
        }
    }

    /// Moderate and above leave the checkpoint in the Escalated state.
    pub fn is_escalation(&self) -> bool {
        *self >= EscalationLevel::Moderate
    }
}

impl fmt::Display for EscalationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lower bounds (inclusive, in percent) for each level above Critical.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EscalationThresholds {
    pub none_from: f64,
    pub mild_from: f64,
    pub moderate_from: f64,
    pub severe_from: f64,
}

impl Default for EscalationThresholds {
    fn default() -> Self {
        Self {
            none_from: 90.0,
            mild_from: 70.0,
            moderate_from: 50.0,
            severe_from: 25.0,
        }
    }
}

impl EscalationThresholds {
    /// Parses four descending lower bounds, e.g. `"90,70,50,25"`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let bounds: Vec<f64> = raw
            .split(',')
            .map(|part| {
                part.trim()
                    .parse::<f64>()
                    .map_err(|e| format!("invalid escalation threshold '{}': {e}", part.trim()))
            })
            .collect::<Result<_, _>>()?;

        let [none_from, mild_from, moderate_from, severe_from] = bounds[..] else {
            return Err(format!(
                "expected 4 escalation thresholds, got {}",
                bounds.len()
            ));
        };

        if !(none_from >= mild_from && mild_from >= moderate_from && moderate_from >= severe_from)
        {
            return Err("escalation thresholds must be descending".to_string());
        }

        Ok(Self {
            none_from,
            mild_from,
            moderate_from,
            severe_from,
        })
    }

    pub fn classify(&self, performance_percentage: f64) -> EscalationLevel {
        if performance_percentage >= self.none_from {
            EscalationLevel::None
        } else if performance_percentage >= self.mild_from {
            EscalationLevel::Mild
        } else if performance_percentage >= self.moderate_from {
            EscalationLevel::Moderate
        } else if performance_percentage >= self.severe_from {
            EscalationLevel::Severe
        } else {
            // Also catches NaN, which cannot arise from performance_percentage().
            EscalationLevel::Critical
        }
    }
}

/// Actual vs expected, in percent. Nothing expected yet counts as fully on track.
pub fn performance_percentage(actual_responses: u32, expected_responses: f64) -> f64 {
    if expected_responses <= 0.0 {
        return 100.0;
    }
    ((actual_responses as f64 / expected_responses) * 100.0 * 10.0).round() / 10.0
}

// ────────────────────────────────────────────────────────────────────────────
// Per-checkpoint state
// ────────────────────────────────────────────────────────────────────────────

/// Lifecycle of a single checkpoint: `Pending → Evaluated → Escalated | ConfirmedOnTrack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointState {
    Pending,
    Evaluated,
    Escalated,
    ConfirmedOnTrack,
}

impl CheckpointState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CheckpointState::Escalated | CheckpointState::ConfirmedOnTrack
        )
    }

    /// Terminal state reached once the evaluated decision is persisted.
    pub fn resolved(level: EscalationLevel) -> Self {
        if level.is_escalation() {
            CheckpointState::Escalated
        } else {
            CheckpointState::ConfirmedOnTrack
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Decision
// ────────────────────────────────────────────────────────────────────────────

/// What the policy wants done at a checkpoint. Nothing here has been persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct EscalationDecision {
    pub level: EscalationLevel,
    pub performance_percentage: f64,
    pub action_taken: String,
    /// Contacts to dispatch now (SEVERE and CRITICAL only).
    pub tier_additions: Vec<TierAddition>,
    /// Contacts suggested for operator confirmation (MODERATE only).
    pub recommended_additional: u32,
}

impl EscalationDecision {
    pub fn additional_contractors(&self) -> u32 {
        self.tier_additions.iter().map(|a| a.count).sum()
    }
}

/// Knobs that shape how much an escalation authorizes.
#[derive(Debug, Clone, Copy)]
pub struct EscalationPolicy {
    pub thresholds: EscalationThresholds,
    pub safety_margin: f64,
    pub max_auto_escalation_contacts: u32,
}

impl EscalationPolicy {
    pub fn decide(
        &self,
        strategy: &CampaignStrategy,
        actual_responses: u32,
        expected_responses: f64,
    ) -> EscalationDecision {
        let performance = performance_percentage(actual_responses, expected_responses);
        let level = self.thresholds.classify(performance);
        let shortfall = (expected_responses - actual_responses as f64).max(0.0);

        let (action_taken, tier_additions, recommended_additional) = match level {
            EscalationLevel::None => ("none — on track".to_string(), vec![], 0),
            EscalationLevel::Mild => (
                format!("logged — slightly behind schedule ({performance:.1}% of expected)"),
                vec![],
                0,
            ),
            EscalationLevel::Moderate => {
                let recommended: u32 = self
                    .shortfall_additions(strategy, shortfall)
                    .iter()
                    .map(|a| a.count)
                    .sum();
                if recommended == 0 {
                    (
                        "escalation recommended — no remaining supply to add".to_string(),
                        vec![],
                        0,
                    )
                } else {
                    (
                        format!(
                            "escalation recommended — awaiting confirmation to add {recommended} contractors"
                        ),
                        vec![],
                        recommended,
                    )
                }
            }
            EscalationLevel::Severe => {
                let additions = self.shortfall_additions(strategy, shortfall);
                let added: u32 = additions.iter().map(|a| a.count).sum();
                let action = if added == 0 {
                    "auto-escalation needed — no remaining supply to add".to_string()
                } else {
                    format!("auto-escalated — {added} additional contractors authorized")
                };
                (action, additions, 0)
            }
            EscalationLevel::Critical => {
                let additions = all_remaining(strategy);
                let added: u32 = additions.iter().map(|a| a.count).sum();
                let action = if added == 0 {
                    "maximum escalation needed — no remaining supply to add".to_string()
                } else {
                    format!("maximum escalation — all {added} remaining contractors authorized")
                };
                (action, additions, 0)
            }
        };

        EscalationDecision {
            level,
            performance_percentage: performance,
            action_taken,
            tier_additions,
            recommended_additional,
        }
    }

    /// Contacts needed to close `shortfall` at the safety margin, best tier
    /// first, capped at `max_auto_escalation_contacts`.
    fn shortfall_additions(&self, strategy: &CampaignStrategy, shortfall: f64) -> Vec<TierAddition> {
        if shortfall <= 0.0 {
            return vec![];
        }
        let capacities = remaining_capacities(strategy);
        let allocation = allocate_greedy(shortfall * self.safety_margin, &capacities);
        let additions = capacities
            .iter()
            .zip(allocation.counts)
            .map(|(cap, count)| TierAddition {
                tier_id: cap.tier_id,
                count,
            })
            .collect::<Vec<_>>();
        cap_additions(additions, self.max_auto_escalation_contacts)
    }
}

/// Every contractor not yet contacted, per tier.
pub fn all_remaining(strategy: &CampaignStrategy) -> Vec<TierAddition> {
    strategy
        .tiers
        .iter()
        .filter(|t| t.remaining() > 0)
        .map(|t| TierAddition {
            tier_id: t.tier_id,
            count: t.remaining(),
        })
        .collect()
}

pub(crate) fn remaining_capacities(strategy: &CampaignStrategy) -> Vec<TierCapacity> {
    strategy
        .tiers
        .iter()
        .map(|t| TierCapacity {
            tier_id: t.tier_id,
            capacity: t.remaining(),
            rate: t.expected_response_rate,
        })
        .collect()
}

/// Trims additions so their sum stays within `max`, keeping the better tiers.
pub(crate) fn cap_additions(additions: Vec<TierAddition>, max: u32) -> Vec<TierAddition> {
    let mut budget = max;
    additions
        .into_iter()
        .filter_map(|a| {
            let count = a.count.min(budget);
            budget -= count;
            (count > 0).then_some(TierAddition {
                tier_id: a.tier_id,
                count,
            })
        })
        .collect()
}
