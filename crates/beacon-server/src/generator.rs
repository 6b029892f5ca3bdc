//! Simulated state changes for demos and soak runs.

use std::sync::Arc;
use std::time::Duration;

use beacon_core::UPDATE_EVENT;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::hub::PushHub;

/// Commits `"Server update #N"` every `interval`.
pub struct ChangeGenerator {
    hub: Arc<PushHub>,
    interval: Duration,
    count: u64,
}

impl ChangeGenerator {
    pub fn new(hub: Arc<PushHub>, interval: Duration) -> Self {
        Self {
            hub,
            interval,
            count: 0,
        }
    }

    /// Commit the next update. Returns false once the state can no longer
    /// advance.
    pub fn tick(&mut self) -> bool {
        self.count += 1;
        let message = format!("Server update #{}", self.count);
        self.hub.commit_change(UPDATE_EVENT, json!(message)).is_ok()
    }

    pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // consume first immediate tick
            info!(interval_secs = self.interval.as_secs(), "Change generator started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !self.tick() {
                            break;
                        }
                    }
                    () = cancel.cancelled() => break,
                }
            }
            info!(updates = self.count, "Change generator stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_telemetry::MetricsRecorder;
    use beacon_webhook::mock::{MockResponse, MockTransport};

    use crate::config::ServerConfig;

    fn hub() -> Arc<PushHub> {
        Arc::new(PushHub::new(
            &ServerConfig::default(),
            Arc::new(MockTransport::always(MockResponse::Status(200))),
            Arc::new(MetricsRecorder::new()),
            CancellationToken::new(),
        ))
    }

    #[tokio::test]
    async fn tick_commits_numbered_message() {
        let hub = hub();
        let mut generator = ChangeGenerator::new(Arc::clone(&hub), Duration::from_secs(1));
        assert!(generator.tick());
        assert!(generator.tick());

        let snap = hub.state().snapshot();
        assert_eq!(snap.version, 2);
        assert_eq!(snap.payload, "Server update #2");
    }

    #[tokio::test(start_paused = true)]
    async fn runs_on_interval_until_cancelled() {
        let hub = hub();
        let cancel = CancellationToken::new();
        let handle = ChangeGenerator::new(Arc::clone(&hub), Duration::from_secs(5))
            .spawn(cancel.clone());

        time::sleep(Duration::from_millis(15_500)).await;
        assert_eq!(hub.state().version(), 3);

        cancel.cancel();
        handle.await.unwrap();
        time::sleep(Duration::from_secs(20)).await;
        assert_eq!(hub.state().version(), 3);
    }
}
