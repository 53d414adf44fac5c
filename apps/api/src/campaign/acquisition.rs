//! Acquisition dispatch — hands contact requests to the outreach channels.
//!
//! The scheduling core never waits on a channel. Requests go through
//! `OutreachQueue` (a bounded mpsc queue, `try_send` only) and a worker task
//! routes each one to the `OutreachChannel` registered for its `ChannelKind`,
//! retrying transient failures on its own. Results come back later only as
//! recorded responses.
//!
//! Carried in the orchestrator as an `OutreachQueue`; the channel set is an
//! `Arc<dyn AcquisitionClient>` chosen at startup.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::campaign::estimator::TierAddition;
use crate::campaign::retry::{retry_transient, RetryPolicy};
use crate::campaign::urgency::UrgencyLevel;

// ────────────────────────────────────────────────────────────────────────────
// Channels
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Email,
    Form,
    Sms,
}

impl ChannelKind {
    pub const ALL: [ChannelKind; 3] = [ChannelKind::Email, ChannelKind::Form, ChannelKind::Sms];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Email => "email",
            ChannelKind::Form => "form",
            ChannelKind::Sms => "sms",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "email" => Ok(ChannelKind::Email),
            "form" => Ok(ChannelKind::Form),
            "sms" => Ok(ChannelKind::Sms),
            other => Err(format!("unknown channel '{other}'")),
        }
    }
}

/// Channel used when a request carries no hint.
/// Known relationships get a text in an emergency; cold prospects go through
/// their website contact forms.
pub fn default_channel(tier_id: u8, urgency: UrgencyLevel) -> ChannelKind {
    match (tier_id, urgency) {
        (1, UrgencyLevel::Emergency) => ChannelKind::Sms,
        (3, _) => ChannelKind::Form,
        _ => ChannelKind::Email,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutreachReason {
    Initial,
    Escalation,
}

/// "Contact `count` more tier-N contractors for this campaign."
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutreachRequest {
    pub campaign_id: Uuid,
    pub bid_card_id: String,
    pub tier_id: u8,
    pub count: u32,
    pub channel_hint: Option<ChannelKind>,
    pub reason: OutreachReason,
    pub requested_at: DateTime<Utc>,
}

impl OutreachRequest {
    pub fn channel(&self) -> ChannelKind {
        self.channel_hint.unwrap_or(ChannelKind::Email)
    }

    /// One request per tier with a non-zero count, routed by `default_channel`.
    pub fn for_additions(
        campaign_id: Uuid,
        bid_card_id: &str,
        urgency: UrgencyLevel,
        additions: &[TierAddition],
        reason: OutreachReason,
        requested_at: DateTime<Utc>,
    ) -> Vec<Self> {
        additions
            .iter()
            .filter(|a| a.count > 0)
            .map(|a| Self {
                campaign_id,
                bid_card_id: bid_card_id.to_string(),
                tier_id: a.tier_id,
                count: a.count,
                channel_hint: Some(default_channel(a.tier_id, urgency)),
                reason,
                requested_at,
            })
            .collect()
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no channel registered for {0}")]
    NoChannel(ChannelKind),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("channel rejected request (status {status}): {message}")]
    Rejected { status: u16, message: String },
}

impl DispatchError {
    pub fn is_transient(&self) -> bool {
        match self {
            DispatchError::NoChannel(_) => false,
            DispatchError::Http(_) => true,
            DispatchError::Rejected { status, .. } => *status == 429 || *status >= 500,
        }
    }
}

/// One delivery mechanism. Returns the channel's dispatch id.
#[async_trait]
pub trait OutreachChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;

    async fn dispatch(&self, request: &OutreachRequest) -> Result<String, DispatchError>;
}

/// The acquisition collaborator as seen from this service.
#[async_trait]
pub trait AcquisitionClient: Send + Sync {
    async fn dispatch_outreach(&self, request: &OutreachRequest) -> Result<String, DispatchError>;
}

/// Routes each request to the channel registered for its kind.
#[derive(Default, Clone)]
pub struct ChannelRouter {
    channels: HashMap<ChannelKind, Arc<dyn OutreachChannel>>,
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(mut self, channel: Arc<dyn OutreachChannel>) -> Self {
        self.channels.insert(channel.kind(), channel);
        self
    }

    /// Webhook channels when an endpoint is configured, log-only otherwise.
    pub fn from_endpoint(endpoint: Option<&str>) -> Self {
        ChannelKind::ALL
            .into_iter()
            .fold(Self::new(), |router, kind| match endpoint {
                Some(base) => router.with_channel(Arc::new(WebhookChannel::new(kind, base))),
                None => router.with_channel(Arc::new(LogOnlyChannel { kind })),
            })
    }
}

#[async_trait]
impl AcquisitionClient for ChannelRouter {
    async fn dispatch_outreach(&self, request: &OutreachRequest) -> Result<String, DispatchError> {
        let kind = request.channel();
        let channel = self
            .channels
            .get(&kind)
            .ok_or(DispatchError::NoChannel(kind))?;
        channel.dispatch(request).await
    }
}

/// POSTs the request to `{base}/{channel}` on the acquisition service.
pub struct WebhookChannel {
    kind: ChannelKind,
    client: Client,
    url: String,
}

#[derive(Debug, Deserialize)]
struct WebhookResponse {
    dispatch_id: String,
}

impl WebhookChannel {
    pub fn new(kind: ChannelKind, base_url: &str) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            kind,
            client,
            url: format!("{}/{}", base_url.trim_end_matches('/'), kind.as_str()),
        }
    }
}

#[async_trait]
impl OutreachChannel for WebhookChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn dispatch(&self, request: &OutreachRequest) -> Result<String, DispatchError> {
        let response = self.client.post(&self.url).json(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(DispatchError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        let body: WebhookResponse = response.json().await?;
        Ok(body.dispatch_id)
    }
}

/// Logs the request and hands back a fresh id. Used when no acquisition
/// endpoint is configured.
pub struct LogOnlyChannel {
    pub kind: ChannelKind,
}

#[async_trait]
impl OutreachChannel for LogOnlyChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    async fn dispatch(&self, request: &OutreachRequest) -> Result<String, DispatchError> {
        let dispatch_id = Uuid::new_v4().to_string();
        info!(
            campaign_id = %request.campaign_id,
            tier_id = request.tier_id,
            count = request.count,
            channel = %self.kind,
            %dispatch_id,
            "outreach dispatch (log only)"
        );
        Ok(dispatch_id)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Per-channel counters
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelCounters {
    pub requests_queued: u32,
    pub contractors_requested: u32,
    pub requests_dispatched: u32,
    pub requests_failed: u32,
    pub requests_dropped: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub channel: ChannelKind,
    #[serde(flatten)]
    pub counters: ChannelCounters,
}

#[derive(Default)]
struct ChannelStatsRegistry {
    counters: Mutex<HashMap<(Uuid, ChannelKind), ChannelCounters>>,
}

impl ChannelStatsRegistry {
    fn update(&self, campaign_id: Uuid, kind: ChannelKind, f: impl FnOnce(&mut ChannelCounters)) {
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(counters.entry((campaign_id, kind)).or_default());
    }

    /// Like `update`, but never recreates counters for a forgotten campaign.
    fn update_existing(&self, campaign_id: Uuid, kind: ChannelKind, f: impl FnOnce(&mut ChannelCounters)) {
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(c) = counters.get_mut(&(campaign_id, kind)) {
            f(c);
        }
    }

    fn remove_campaign(&self, campaign_id: Uuid) {
        let mut counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        counters.retain(|(id, _), _| *id != campaign_id);
    }

    fn for_campaign(&self, campaign_id: Uuid) -> Vec<ChannelStats> {
        let counters = self
            .counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut stats: Vec<ChannelStats> = counters
            .iter()
            .filter(|((id, _), _)| *id == campaign_id)
            .map(|((_, kind), c)| ChannelStats {
                channel: *kind,
                counters: c.clone(),
            })
            .collect();
        stats.sort_by_key(|s| s.channel);
        stats
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Queue
// ────────────────────────────────────────────────────────────────────────────

/// Sending half of the outreach queue. Cloning shares the queue and counters.
#[derive(Clone)]
pub struct OutreachQueue {
    sender: mpsc::Sender<OutreachRequest>,
    stats: Arc<ChannelStatsRegistry>,
}

/// Receiving half, consumed by `spawn_worker`.
pub struct OutreachReceiver {
    receiver: mpsc::Receiver<OutreachRequest>,
    stats: Arc<ChannelStatsRegistry>,
}

impl OutreachQueue {
    pub fn new(capacity: usize) -> (Self, OutreachReceiver) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let stats = Arc::new(ChannelStatsRegistry::default());
        (
            Self {
                sender,
                stats: Arc::clone(&stats),
            },
            OutreachReceiver { receiver, stats },
        )
    }

    /// Queue + running worker in one call.
    pub fn spawn(
        capacity: usize,
        client: Arc<dyn AcquisitionClient>,
        retry: RetryPolicy,
    ) -> (Self, JoinHandle<()>) {
        let (queue, receiver) = Self::new(capacity);
        let handle = spawn_worker(receiver, client, retry);
        (queue, handle)
    }

    /// Never blocks. Returns false when the request was dropped (queue full or closed).
    pub fn enqueue(&self, request: OutreachRequest) -> bool {
        let campaign_id = request.campaign_id;
        let kind = request.channel();
        let count = request.count;

        match self.sender.try_send(request) {
            Ok(()) => {
                self.stats.update(campaign_id, kind, |c| {
                    c.requests_queued += 1;
                    c.contractors_requested += count;
                });
                true
            }
            Err(e) => {
                warn!(
                    %campaign_id,
                    channel = %kind,
                    count,
                    error = %e,
                    "outreach queue rejected request; dropping"
                );
                self.stats
                    .update(campaign_id, kind, |c| c.requests_dropped += 1);
                false
            }
        }
    }

    pub fn channel_stats(&self, campaign_id: Uuid) -> Vec<ChannelStats> {
        self.stats.for_campaign(campaign_id)
    }

    /// Drops the counters of a campaign that reached a terminal status.
    pub fn forget_campaign(&self, campaign_id: Uuid) {
        self.stats.remove_campaign(campaign_id);
    }
}

/// Drains the queue, dispatching each request on its own task so a slow
/// channel never holds up the others.
pub fn spawn_worker(
    mut receiver: OutreachReceiver,
    client: Arc<dyn AcquisitionClient>,
    retry: RetryPolicy,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request) = receiver.receiver.recv().await {
            let client = Arc::clone(&client);
            let stats = Arc::clone(&receiver.stats);
            tokio::spawn(async move {
                let kind = request.channel();
                let result = retry_transient(
                    retry,
                    "dispatch_outreach",
                    DispatchError::is_transient,
                    || client.dispatch_outreach(&request),
                )
                .await;

                match result {
                    Ok(dispatch_id) => {
                        debug!(
                            campaign_id = %request.campaign_id,
                            tier_id = request.tier_id,
                            count = request.count,
                            channel = %kind,
                            %dispatch_id,
                            "outreach dispatched"
                        );
                        stats.update_existing(request.campaign_id, kind, |c| c.requests_dispatched += 1);
                    }
                    Err(e) => {
                        warn!(
                            campaign_id = %request.campaign_id,
                            tier_id = request.tier_id,
                            channel = %kind,
                            error = %e,
                            "outreach dispatch failed after retries"
                        );
                        stats.update_existing(request.campaign_id, kind, |c| c.requests_failed += 1);
                    }
                }
            });
        }
        debug!("outreach queue closed; worker exiting");
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Records every request it receives and fails the first `fail_first` calls.
    pub(crate) struct RecordingClient {
        pub sent: Mutex<Vec<OutreachRequest>>,
        notify: mpsc::UnboundedSender<OutreachRequest>,
        fail_first: Mutex<u32>,
    }

    impl RecordingClient {
        pub(crate) fn new(fail_first: u32) -> (Arc<Self>, mpsc::UnboundedReceiver<OutreachRequest>) {
            let (notify, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    sent: Mutex::new(Vec::new()),
                    notify,
                    fail_first: Mutex::new(fail_first),
                }),
                rx,
            )
        }
    }

    #[async_trait]
    impl AcquisitionClient for RecordingClient {
        async fn dispatch_outreach(
            &self,
            request: &OutreachRequest,
        ) -> Result<String, DispatchError> {
            {
                let mut remaining = self.fail_first.lock().unwrap();
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(DispatchError::Rejected {
                        status: 503,
                        message: "busy".to_string(),
                    });
                }
            }
            self.sent.lock().unwrap().push(request.clone());
            let _ = self.notify.send(request.clone());
            Ok(format!("dispatch-{}", request.tier_id))
        }
    }

    fn request(tier_id: u8, count: u32, channel_hint: Option<ChannelKind>) -> OutreachRequest {
        OutreachRequest {
            campaign_id: Uuid::new_v4(),
            bid_card_id: "bc-1".to_string(),
            tier_id,
            count,
            channel_hint,
            reason: OutreachReason::Initial,
            requested_at: Utc::now(),
        }
    }

    #[test]
    fn test_default_channel_by_tier_and_urgency() {
        assert_eq!(default_channel(1, UrgencyLevel::Emergency), ChannelKind::Sms);
        assert_eq!(default_channel(1, UrgencyLevel::Standard), ChannelKind::Email);
        assert_eq!(default_channel(2, UrgencyLevel::Emergency), ChannelKind::Email);
        assert_eq!(default_channel(3, UrgencyLevel::Urgent), ChannelKind::Form);
    }

    #[test]
    fn test_channel_kind_parse() {
        assert_eq!("SMS".parse::<ChannelKind>(), Ok(ChannelKind::Sms));
        assert!("fax".parse::<ChannelKind>().is_err());
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let (queue, _receiver) = OutreachQueue::new(1);
        let first = request(1, 5, Some(ChannelKind::Email));
        let campaign_id = first.campaign_id;
        let mut second = request(2, 3, Some(ChannelKind::Email));
        second.campaign_id = campaign_id;

        assert!(queue.enqueue(first));
        assert!(!queue.enqueue(second));

        let stats = queue.channel_stats(campaign_id);
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].counters.requests_queued, 1);
        assert_eq!(stats[0].counters.contractors_requested, 5);
        assert_eq!(stats[0].counters.requests_dropped, 1);
    }

    #[test]
    fn test_forgotten_campaign_counters_stay_gone() {
        let (queue, _receiver) = OutreachQueue::new(4);
        let req = request(1, 2, Some(ChannelKind::Sms));
        let campaign_id = req.campaign_id;
        let other = request(2, 1, Some(ChannelKind::Email));
        assert!(queue.enqueue(req));
        assert!(queue.enqueue(other.clone()));

        queue.forget_campaign(campaign_id);
        assert!(queue.channel_stats(campaign_id).is_empty());
        assert_eq!(queue.channel_stats(other.campaign_id).len(), 1);

        // A dispatch finishing after the campaign closed must not recreate it.
        queue
            .stats
            .update_existing(campaign_id, ChannelKind::Sms, |c| c.requests_dispatched += 1);
        assert!(queue.channel_stats(campaign_id).is_empty());
    }

    #[tokio::test]
    async fn test_worker_dispatches_and_counts() {
        let (client, mut delivered) = RecordingClient::new(0);
        let (queue, _worker) = OutreachQueue::spawn(8, client.clone(), RetryPolicy::default());
        let req = request(3, 12, Some(ChannelKind::Form));
        let campaign_id = req.campaign_id;

        assert!(queue.enqueue(req));
        let got = tokio::time::timeout(Duration::from_secs(5), delivered.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.count, 12);

        // the counter update happens right after the client returns
        for _ in 0..50 {
            let stats = queue.channel_stats(campaign_id);
            if stats[0].counters.requests_dispatched == 1 {
                return;
            }
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("dispatch was never counted");
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_retries_transient_failures() {
        let (client, mut delivered) = RecordingClient::new(2);
        let (queue, _worker) = OutreachQueue::spawn(8, client.clone(), RetryPolicy::default());
        assert!(queue.enqueue(request(2, 4, None)));

        let got = tokio::time::timeout(Duration::from_secs(5), delivered.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.channel(), ChannelKind::Email);
        assert_eq!(client.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_router_without_channel_errors() {
        let router = ChannelRouter::new().with_channel(Arc::new(LogOnlyChannel {
            kind: ChannelKind::Email,
        }));
        assert!(router
            .dispatch_outreach(&request(1, 1, Some(ChannelKind::Email)))
            .await
            .is_ok());
        let err = router
            .dispatch_outreach(&request(1, 1, Some(ChannelKind::Sms)))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::NoChannel(ChannelKind::Sms)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_log_only_router_covers_every_channel() {
        let router = ChannelRouter::from_endpoint(None);
        for kind in ChannelKind::ALL {
            assert!(router
                .dispatch_outreach(&request(1, 2, Some(kind)))
                .await
                .is_ok());
        }
    }
}
