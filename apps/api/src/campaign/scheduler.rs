//! Background check-in sweeper: on every tick, triggers a check-in for each
//! ACTIVE campaign. Triggers are at-least-once; repeated ticks on the same
//! checkpoint replay the stored decision.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::campaign::orchestrator::CampaignOrchestrator;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepSummary {
    pub campaigns: usize,
    pub evaluated: usize,
    pub escalated: usize,
    pub failed: usize,
}

/// One pass over the active campaigns. Campaigns are checked concurrently.
pub async fn sweep_once(orchestrator: &Arc<CampaignOrchestrator>) -> SweepSummary {
    let ids = match orchestrator.active_campaigns().await {
        Ok(ids) => ids,
        Err(err) => {
            warn!(error = %err, "could not list active campaigns");
            return SweepSummary::default();
        }
    };

    let handles: Vec<_> = ids
        .iter()
        .map(|&id| {
            let orchestrator = Arc::clone(orchestrator);
            tokio::spawn(async move { (id, orchestrator.perform_check_in(id).await) })
        })
        .collect();

    let mut summary = SweepSummary {
        campaigns: ids.len(),
        ..Default::default()
    };
    for handle in handles {
        match handle.await {
            Ok((_, Ok(result))) if result.error.is_some() => summary.failed += 1,
            Ok((_, Ok(result))) => {
                if result.checkpoint_evaluated && !result.replayed {
                    summary.evaluated += 1;
                    if result.additional_contractors_added > 0 {
                        summary.escalated += 1;
                    }
                }
            }
            Ok((id, Err(err))) => {
                warn!(campaign_id = %id, error = %err, "check-in failed");
                summary.failed += 1;
            }
            Err(err) => {
                warn!(error = %err, "check-in task panicked");
                summary.failed += 1;
            }
        }
    }
    summary
}

pub fn spawn_sweeper(orchestrator: Arc<CampaignOrchestrator>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = every.as_secs(), "starting check-in sweeper");
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let summary = sweep_once(&orchestrator).await;
            if summary.evaluated > 0 || summary.failed > 0 {
                info!(
                    campaigns = summary.campaigns,
                    evaluated = summary.evaluated,
                    escalated = summary.escalated,
                    failed = summary.failed,
                    "check-in sweep finished"
                );
            } else {
                debug!(campaigns = summary.campaigns, "check-in sweep: nothing due");
            }
        }
    })
}
