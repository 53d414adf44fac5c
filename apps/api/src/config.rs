use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::campaign::escalation::{EscalationPolicy, EscalationThresholds};
use crate::campaign::retry::RetryPolicy;
use crate::campaign::urgency::UrgencyThresholds;

/// Application configuration loaded from environment variables.
/// Every variable is optional; malformed values fail startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Without a database URL campaigns live in the in-process ledger.
    pub database_url: Option<String>,
    /// Base URL of the contractor acquisition service. Unset → dispatches are only logged.
    pub acquisition_endpoint: Option<String>,
    pub port: u16,
    pub rust_log: String,
    pub outreach_queue_capacity: usize,
    /// 0 disables the background check-in sweeper.
    pub check_in_sweep_interval_secs: u64,
    pub engine: EngineConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let lookup = |key: &str| std::env::var(key).ok();
        Ok(Config {
            database_url: optional_env("DATABASE_URL"),
            acquisition_endpoint: optional_env("ACQUISITION_ENDPOINT"),
            port: parse_or(&lookup, "PORT", 8080)?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            outreach_queue_capacity: parse_or(&lookup, "OUTREACH_QUEUE_CAPACITY", 1024)?,
            check_in_sweep_interval_secs: parse_or(&lookup, "CHECK_IN_SWEEP_INTERVAL_SECS", 60)?,
            engine: EngineConfig::from_lookup(lookup)?,
        })
    }
}

/// Tunables of the timing/allocation/escalation engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub urgency: UrgencyThresholds,
    /// Multiplier on `bids_needed` for the response target (and on escalation shortfalls).
    pub safety_margin: f64,
    /// Fractions of the timeline at which checkpoints fire.
    pub check_in_fractions: Vec<f64>,
    pub escalation: EscalationThresholds,
    /// Upper bound on contacts a SEVERE escalation may add on its own.
    pub max_auto_escalation_contacts: u32,
    pub ledger_retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            urgency: UrgencyThresholds::default(),
            safety_margin: 1.25,
            check_in_fractions: vec![0.25, 0.5, 0.75],
            escalation: EscalationThresholds::default(),
            max_auto_escalation_contacts: 50,
            ledger_retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Builds the engine config from a key lookup, falling back to defaults
    /// for anything unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let urgency = match lookup("URGENCY_CUTOFF_HOURS") {
            Some(raw) => UrgencyThresholds::parse(&raw)
                .map_err(|e| anyhow!(e))
                .context("URGENCY_CUTOFF_HOURS must be three increasing hour values")?,
            None => defaults.urgency,
        };

        let escalation = match lookup("ESCALATION_THRESHOLDS") {
            Some(raw) => EscalationThresholds::parse(&raw)
                .map_err(|e| anyhow!(e))
                .context("ESCALATION_THRESHOLDS must be four decreasing percentages")?,
            None => defaults.escalation,
        };

        let check_in_fractions = match lookup("CHECK_IN_FRACTIONS") {
            Some(raw) => parse_fractions(&raw).context("CHECK_IN_FRACTIONS is invalid")?,
            None => defaults.check_in_fractions,
        };

        let safety_margin: f64 = parse_or(&lookup, "SAFETY_MARGIN", defaults.safety_margin)?;
        if !safety_margin.is_finite() || safety_margin < 1.0 {
            return Err(anyhow!("SAFETY_MARGIN must be at least 1.0, got {safety_margin}"));
        }

        let ledger_retry = RetryPolicy {
            max_attempts: parse_or(
                &lookup,
                "LEDGER_RETRY_ATTEMPTS",
                defaults.ledger_retry.max_attempts,
            )?,
            base_delay: Duration::from_millis(parse_or(
                &lookup,
                "LEDGER_RETRY_BASE_MS",
                defaults.ledger_retry.base_delay.as_millis() as u64,
            )?),
        };

        Ok(Self {
            urgency,
            safety_margin,
            check_in_fractions,
            escalation,
            max_auto_escalation_contacts: parse_or(
                &lookup,
                "MAX_AUTO_ESCALATION_CONTACTS",
                defaults.max_auto_escalation_contacts,
            )?,
            ledger_retry,
        })
    }

    pub fn escalation_policy(&self) -> EscalationPolicy {
        EscalationPolicy {
            thresholds: self.escalation,
            safety_margin: self.safety_margin,
            max_auto_escalation_contacts: self.max_auto_escalation_contacts,
        }
    }
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{key} has an invalid value '{raw}'")),
        None => Ok(default),
    }
}

fn parse_fractions(raw: &str) -> Result<Vec<f64>> {
    let fractions = raw
        .split(',')
        .map(|part| {
            let value: f64 = part
                .trim()
                .parse()
                .with_context(|| format!("'{}' is not a number", part.trim()))?;
            if value > 0.0 && value <= 1.0 {
                Ok(value)
            } else {
                Err(anyhow!("fraction {value} is outside (0, 1]"))
            }
        })
        .collect::<Result<Vec<_>>>()?;
    if fractions.is_empty() {
        return Err(anyhow!("at least one fraction is required"));
    }
    Ok(fractions)
}
