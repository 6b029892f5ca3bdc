//! Owned push state shared by every handler.

use std::sync::Arc;
use std::time::{Duration, Instant};

use beacon_core::{StateError, StateSnapshot, VersionedState};
use beacon_push::{BroadcastDispatcher, BroadcastReport, PollResponder, SubscriberRegistry};
use beacon_telemetry::MetricsRecorder;
use beacon_webhook::{DeliveryLog, EndpointRegistry, WebhookDispatcher, WebhookReceiver, WebhookTransport};
use parking_lot::Mutex;
use secrecy::SecretString;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::ServerConfig;

/// What a committed change produced.
#[derive(Debug)]
pub struct CommitResult {
    pub snapshot: StateSnapshot,
    pub broadcast: BroadcastReport,
    /// Webhook chains started for matching endpoints.
    pub webhooks: usize,
}

/// State, subscribers and webhook machinery behind one handle.
///
/// `commit_change` holds `commit_lock` across the version bump and the
/// broadcast, so broadcasts go out in version order with no version
/// skipped or announced twice.
pub struct PushHub {
    state: Arc<VersionedState>,
    poller: PollResponder,
    dispatcher: Arc<BroadcastDispatcher>,
    webhooks: Arc<WebhookDispatcher>,
    receiver: WebhookReceiver,
    metrics: Arc<MetricsRecorder>,
    commit_lock: Mutex<()>,
    started_at: Instant,
    shutdown: CancellationToken,
}

impl PushHub {
    pub fn new(
        config: &ServerConfig,
        transport: Arc<dyn WebhookTransport>,
        metrics: Arc<MetricsRecorder>,
        shutdown: CancellationToken,
    ) -> Self {
        let state = Arc::new(VersionedState::new(json!("Initial data")));
        let poller = PollResponder::new(Arc::clone(&state), config.max_pending_polls)
            .with_metrics(Arc::clone(&metrics));
        let registry = Arc::new(SubscriberRegistry::new(config.max_send_queue));
        let dispatcher =
            Arc::new(BroadcastDispatcher::new(registry).with_metrics(Arc::clone(&metrics)));
        let webhooks = Arc::new(
            WebhookDispatcher::new(
                transport,
                Arc::new(EndpointRegistry::new()),
                Arc::new(DeliveryLog::new(config.webhook_history_capacity)),
                config.retry.policy(),
            )
            .with_metrics(Arc::clone(&metrics)),
        );
        let receiver = WebhookReceiver::new(
            SecretString::from(config.receiver_secret.clone()),
            config.receiver_tolerance(),
            config.receiver_dedup_window,
            config.webhook_history_capacity,
        );

        Self {
            state,
            poller,
            dispatcher,
            webhooks,
            receiver,
            metrics,
            commit_lock: Mutex::new(()),
            started_at: Instant::now(),
            shutdown,
        }
    }

    pub fn state(&self) -> &Arc<VersionedState> {
        &self.state
    }

    pub fn poller(&self) -> &PollResponder {
        &self.poller
    }

    pub fn dispatcher(&self) -> &Arc<BroadcastDispatcher> {
        &self.dispatcher
    }

    pub fn webhooks(&self) -> &Arc<WebhookDispatcher> {
        &self.webhooks
    }

    pub fn receiver(&self) -> &WebhookReceiver {
        &self.receiver
    }

    pub fn metrics(&self) -> &Arc<MetricsRecorder> {
        &self.metrics
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Advance the state and announce it to push subscribers and webhooks.
    ///
    /// Version overflow is fatal: the shutdown token is cancelled and the
    /// error returned.
    pub fn commit_change(&self, event_type: &str, data: Value) -> Result<CommitResult, StateError> {
        let (snapshot, broadcast) = {
            let _guard = self.commit_lock.lock();
            let snapshot = match self.state.update(data) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    error!(error_kind = e.error_kind(), error = %e, "Fatal state error, shutting down");
                    self.shutdown.cancel();
                    return Err(e);
                }
            };
            let broadcast = self.dispatcher.broadcast(
                event_type,
                json!({
                    "version": snapshot.version,
                    "message": snapshot.payload,
                }),
            );
            (snapshot, broadcast)
        };

        let webhooks = self
            .webhooks
            .fan_out(
                event_type,
                &json!({
                    "version": snapshot.version,
                    "message": snapshot.payload,
                    "updatedAt": snapshot.updated_at,
                }),
            )
            .len();

        info!(
            version = snapshot.version,
            event_type,
            event_id = broadcast.event_id,
            recipients = broadcast.delivered,
            webhooks,
            "State change committed"
        );

        Ok(CommitResult {
            snapshot,
            broadcast,
            webhooks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_core::Transport;
    use beacon_push::PollMode;
    use beacon_webhook::mock::{MockResponse, MockTransport};
    use beacon_webhook::WebhookEndpoint;

    fn hub_with(mock: Arc<MockTransport>) -> PushHub {
        PushHub::new(
            &ServerConfig::default(),
            mock,
            Arc::new(MetricsRecorder::new()),
            CancellationToken::new(),
        )
    }

    fn hub() -> PushHub {
        hub_with(Arc::new(MockTransport::always(MockResponse::Status(200))))
    }

    #[tokio::test]
    async fn commit_bumps_version_and_broadcasts() {
        let hub = hub();
        let (_a, mut rx_a) = hub.dispatcher().subscribe(Transport::Sse, None);
        let (_b, mut rx_b) = hub.dispatcher().subscribe(Transport::WebSocket, None);

        let result = hub.commit_change("update", json!("first")).unwrap();
        assert_eq!(result.snapshot.version, 1);
        assert_eq!(result.broadcast.delivered, 2);

        let ea = rx_a.recv().await.unwrap();
        let eb = rx_b.recv().await.unwrap();
        assert_eq!(ea.id, eb.id);
        assert_eq!(ea.data["version"], 1);
        assert_eq!(ea.data["message"], "first");
    }

    #[tokio::test]
    async fn commit_wakes_long_poll() {
        let hub = Arc::new(hub());
        let poller_hub = Arc::clone(&hub);
        let waiter = tokio::spawn(async move {
            poller_hub
                .poller()
                .poll(Some(0), PollMode::Long { timeout: Duration::from_secs(5) })
                .await
        });
        tokio::task::yield_now().await;

        hub.commit_change("update", json!("changed")).unwrap();
        let response = waiter.await.unwrap().unwrap();
        assert_eq!(response.version, 1);
        assert!(!response.timed_out);
        assert_eq!(response.message, Some(json!("changed")));
    }

    #[tokio::test]
    async fn commit_fans_out_to_matching_webhooks() {
        let mock = Arc::new(MockTransport::always(MockResponse::Status(200)));
        let hub = hub_with(Arc::clone(&mock));
        hub.webhooks()
            .endpoints()
            .register(WebhookEndpoint::new("http://hook.test", "s"));
        hub.webhooks().endpoints().register(
            WebhookEndpoint::new("http://other.test", "s").with_event_types(vec!["deploy".into()]),
        );

        let result = hub.commit_change("update", json!({"n": 1})).unwrap();
        assert_eq!(result.webhooks, 1);
    }

    #[tokio::test]
    async fn versions_are_sequential_under_concurrency() {
        let hub = Arc::new(hub());
        let (_s, mut rx) = hub.dispatcher().subscribe(Transport::Sse, None);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let hub = Arc::clone(&hub);
                tokio::spawn(async move {
                    for _ in 0..25 {
                        hub.commit_change("update", json!(null)).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }

        let mut last = 0;
        for _ in 0..100 {
            let event = rx.recv().await.unwrap();
            let version = event.data["version"].as_u64().unwrap();
            assert_eq!(version, last + 1);
            last = version;
        }
        assert_eq!(hub.state().version(), 100);
    }
}
