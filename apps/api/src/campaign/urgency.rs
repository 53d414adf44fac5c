//! Urgency classification — maps a campaign deadline to an ordered urgency level.
//!
//! Cutoffs live in `UrgencyThresholds` so deployments can retune them without a
//! code change. Default boundaries (inclusive upper bounds):
//!
//! | timeline_hours      | level     |
//! |---------------------|-----------|
//! | `< 6`               | Emergency |
//! | `6 ..= 24`          | Urgent    |
//! | `24 < t <= 72`      | Standard  |
//! | `> 72`              | Flexible  |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Ordered from most to least urgent: `Emergency < Urgent < Standard < Flexible`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrgencyLevel {
    Emergency,
    Urgent,
    Standard,
    Flexible,
}

impl UrgencyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrgencyLevel::Emergency => "emergency",
            UrgencyLevel::Urgent => "urgent",
            UrgencyLevel::Standard => "standard",
            UrgencyLevel::Flexible => "flexible",
        }
    }
}

impl fmt::Display for UrgencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UrgencyLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "emergency" => Ok(UrgencyLevel::Emergency),
            "urgent" => Ok(UrgencyLevel::Urgent),
            "standard" => Ok(UrgencyLevel::Standard),
            "flexible" => Ok(UrgencyLevel::Flexible),
            other => Err(format!("unknown urgency level '{other}'")),
        }
    }
}

/// Threshold table for `classify`. Each field is the cutoff in hours.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UrgencyThresholds {
    /// Strictly below this is Emergency.
    pub emergency_below_hours: f64,
    /// At or below this (and not Emergency) is Urgent.
    pub urgent_up_to_hours: f64,
    /// At or below this (and not Urgent) is Standard; above is Flexible.
    pub standard_up_to_hours: f64,
}

impl Default for UrgencyThresholds {
    fn default() -> Self {
        Self {
            emergency_below_hours: 6.0,
            urgent_up_to_hours: 24.0,
            standard_up_to_hours: 72.0,
        }
    }
}

impl UrgencyThresholds {
    /// Builds a table from three ascending cutoffs, e.g. `"6,24,72"`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let cutoffs: Vec<f64> = raw
            .split(',')
            .map(|part| {
                part.trim()
                    .parse::<f64>()
                    .map_err(|e| format!("invalid urgency cutoff '{}': {e}", part.trim()))
            })
            .collect::<Result<_, _>>()?;

        let [emergency, urgent, standard] = cutoffs[..] else {
            return Err(format!(
                "expected 3 urgency cutoffs, got {}",
                cutoffs.len()
            ));
        };

        if !(emergency > 0.0 && emergency <= urgent && urgent <= standard) {
            return Err(format!(
                "urgency cutoffs must be positive and ascending, got {emergency},{urgent},{standard}"
            ));
        }

        Ok(Self {
            emergency_below_hours: emergency,
            urgent_up_to_hours: urgent,
            standard_up_to_hours: standard,
        })
    }

    /// Maps a deadline to its urgency level. Shorter deadlines never map to a
    /// less urgent level than longer ones.
    pub fn classify(&self, timeline_hours: f64) -> UrgencyLevel {
        if timeline_hours < self.emergency_below_hours {
            UrgencyLevel::Emergency
        } else if timeline_hours <= self.urgent_up_to_hours {
            UrgencyLevel::Urgent
        } else if timeline_hours <= self.standard_up_to_hours {
            UrgencyLevel::Standard
        } else {
            UrgencyLevel::Flexible
        }
    }
}
