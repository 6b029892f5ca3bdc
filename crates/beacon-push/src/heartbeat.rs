//! Periodic keep-alive events for push subscribers.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::broadcast::{BroadcastDispatcher, BroadcastReport};

/// Emits `heartbeat` events on a fixed interval, whether or not any data
/// events were sent in between. Heartbeats share the dispatcher's sequence,
/// and a subscriber whose heartbeat write fails is dropped like any other
/// failed write.
pub struct HeartbeatScheduler {
    dispatcher: Arc<BroadcastDispatcher>,
    interval: Duration,
}

impl HeartbeatScheduler {
    pub fn new(dispatcher: Arc<BroadcastDispatcher>, interval: Duration) -> Self {
        Self {
            dispatcher,
            interval,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// One keep-alive pass.
    pub fn tick(&self) -> BroadcastReport {
        let report = self.dispatcher.heartbeat();
        debug!(
            event_id = report.event_id,
            recipients = report.delivered,
            dropped = report.dropped.len(),
            "heartbeat"
        );
        report
    }

    /// Run until `cancel` fires. The first beat goes out one full interval
    /// after start.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // consume first immediate tick

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick();
                    }
                    () = cancel.cancelled() => {
                        info!("Heartbeat scheduler stopped");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SubscriberRegistry;
    use beacon_core::Transport;

    fn setup() -> Arc<BroadcastDispatcher> {
        Arc::new(BroadcastDispatcher::new(Arc::new(SubscriberRegistry::new(16))))
    }

    #[test]
    fn tick_reaches_all_subscribers() {
        let d = setup();
        let (_a, mut rx_a) = d.subscribe(Transport::Sse, None);
        let (_b, mut rx_b) = d.subscribe(Transport::WebSocket, None);

        let report = HeartbeatScheduler::new(Arc::clone(&d), Duration::from_secs(30)).tick();
        assert_eq!(report.delivered, 2);
        assert!(rx_a.try_recv().unwrap().is_heartbeat());
        assert!(rx_b.try_recv().unwrap().is_heartbeat());
    }

    #[test]
    fn failed_heartbeat_unregisters_subscriber() {
        let d = setup();
        let (gone, rx) = d.subscribe(Transport::Sse, None);
        drop(rx);

        let report = HeartbeatScheduler::new(Arc::clone(&d), Duration::from_secs(30)).tick();
        assert_eq!(report.dropped, vec![gone.id.clone()]);
        assert_eq!(d.registry().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn beats_on_schedule_without_data_events() {
        let d = setup();
        let (_s, mut rx) = d.subscribe(Transport::Sse, None);
        let cancel = CancellationToken::new();
        let handle =
            HeartbeatScheduler::new(Arc::clone(&d), Duration::from_secs(30)).spawn(cancel.clone());

        // Nothing before the first interval elapses.
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(36)).await;
        let mut beats = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            assert!(ev.is_heartbeat());
            beats.push(ev.id);
        }
        assert_eq!(beats, vec![1, 2]);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_the_loop() {
        let d = setup();
        let cancel = CancellationToken::new();
        let handle =
            HeartbeatScheduler::new(Arc::clone(&d), Duration::from_secs(1)).spawn(cancel.clone());
        cancel.cancel();
        handle.await.unwrap();

        let (_s, mut rx) = d.subscribe(Transport::Sse, None);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }
}
