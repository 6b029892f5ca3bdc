use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use beacon_core::ids::SubscriberId;
use beacon_core::{PushEvent, Transport};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Why an event could not be queued for a subscriber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendFailure {
    /// The subscriber's outbound queue is full (slow consumer).
    QueueFull,
    /// The connection task has gone away.
    Closed,
    /// The subscriber was unregistered before the send.
    Disconnected,
}

impl SendFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::Closed => "closed",
            Self::Disconnected => "disconnected",
        }
    }
}

/// A connected push subscriber (SSE stream or WebSocket).
pub struct Subscriber {
    pub id: SubscriberId,
    pub transport: Transport,
    pub connected_at: DateTime<Utc>,
    resume_from: Option<u64>,
    tx: mpsc::Sender<Arc<PushEvent>>,
    last_delivered_event_id: AtomicU64,
    connected: AtomicBool,
    removed: CancellationToken,
    last_pong: AtomicU64,
}

impl Subscriber {
    fn new(
        transport: Transport,
        cursor: u64,
        resume_from: Option<u64>,
        tx: mpsc::Sender<Arc<PushEvent>>,
    ) -> Self {
        Self {
            id: SubscriberId::new(),
            transport,
            connected_at: Utc::now(),
            resume_from,
            tx,
            last_delivered_event_id: AtomicU64::new(cursor),
            connected: AtomicBool::new(true),
            removed: CancellationToken::new(),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Completes once the subscriber has been unregistered, whoever removed it.
    pub async fn removed(&self) {
        self.removed.cancelled().await
    }

    /// Sequence number of the last event queued for this subscriber. Starts
    /// at the global cursor in effect when the subscriber registered.
    pub fn last_delivered_event_id(&self) -> u64 {
        self.last_delivered_event_id.load(Ordering::Relaxed)
    }

    /// `Last-Event-ID` the client reconnected with, if any. Informational:
    /// no history is kept, so nothing before `last_delivered_event_id` is
    /// replayed.
    pub fn resume_from(&self) -> Option<u64> {
        self.resume_from
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self, timeout: Duration) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < timeout.as_secs()
    }

    /// Queue an event without waiting.
    pub fn try_deliver(&self, event: &Arc<PushEvent>) -> Result<(), SendFailure> {
        if !self.is_connected() {
            return Err(SendFailure::Disconnected);
        }
        match self.tx.try_send(Arc::clone(event)) {
            Ok(()) => {
                self.last_delivered_event_id.store(event.id, Ordering::Relaxed);
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(SendFailure::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(SendFailure::Closed),
        }
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of all connected push subscribers.
pub struct SubscriberRegistry {
    subscribers: DashMap<SubscriberId, Arc<Subscriber>>,
    max_send_queue: usize,
}

impl SubscriberRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            max_send_queue: max_send_queue.max(1),
        }
    }

    /// Add a subscriber whose delivery cursor starts at `cursor`.
    pub fn register(
        &self,
        transport: Transport,
        cursor: u64,
        resume_from: Option<u64>,
    ) -> (Arc<Subscriber>, mpsc::Receiver<Arc<PushEvent>>) {
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let subscriber = Arc::new(Subscriber::new(transport, cursor, resume_from, tx));
        self.subscribers
            .insert(subscriber.id.clone(), Arc::clone(&subscriber));
        (subscriber, rx)
    }

    /// Remove a subscriber. Returns false if it was already gone.
    pub fn unregister(&self, id: &SubscriberId) -> bool {
        match self.subscribers.remove(id) {
            Some((_, subscriber)) => {
                subscriber.connected.store(false, Ordering::Relaxed);
                subscriber.removed.cancel();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &SubscriberId) -> Option<Arc<Subscriber>> {
        self.subscribers.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn count_transport(&self, transport: Transport) -> usize {
        self.subscribers
            .iter()
            .filter(|entry| entry.value().transport == transport)
            .count()
    }

    /// Visit every connected subscriber.
    ///
    /// Works on a snapshot of the current set, so `f` may unregister
    /// subscribers (itself or others). Anything unregistered before its turn
    /// is skipped. Returns the number of subscribers visited.
    pub fn for_each_active<F>(&self, mut f: F) -> usize
    where
        F: FnMut(&Arc<Subscriber>),
    {
        let snapshot: Vec<Arc<Subscriber>> = self
            .subscribers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut visited = 0;
        for subscriber in &snapshot {
            if !subscriber.is_connected() {
                continue;
            }
            f(subscriber);
            visited += 1;
        }
        visited
    }

    /// Remove WebSocket subscribers that have not answered pings within
    /// `timeout`. SSE has no client-to-server channel and is reaped on write
    /// failure instead.
    pub fn cleanup_dead_clients(&self, timeout: Duration) -> usize {
        let dead: Vec<SubscriberId> = self
            .subscribers
            .iter()
            .filter(|entry| {
                let s = entry.value();
                s.transport == Transport::WebSocket && !s.is_alive(timeout)
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut removed = 0;
        for id in dead {
            if self.unregister(&id) {
                removed += 1;
                tracing::info!(subscriber_id = %id, "Cleaned up dead client");
            }
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: u64) -> Arc<PushEvent> {
        Arc::new(PushEvent::new(id, "update", serde_json::json!({"n": id})))
    }

    #[test]
    fn register_and_unregister() {
        let registry = SubscriberRegistry::new(32);
        assert_eq!(registry.count(), 0);

        let (a, _rx_a) = registry.register(Transport::Sse, 0, None);
        let (b, _rx_b) = registry.register(Transport::WebSocket, 0, None);
        assert_eq!(registry.count(), 2);
        assert_eq!(registry.count_transport(Transport::Sse), 1);
        assert_eq!(registry.count_transport(Transport::WebSocket), 1);

        assert!(registry.unregister(&a.id));
        assert_eq!(registry.count(), 1);
        assert!(!a.is_connected());

        assert!(registry.unregister(&b.id));
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn unregister_is_idempotent() {
        let registry = SubscriberRegistry::new(32);
        let (s, _rx) = registry.register(Transport::Sse, 0, None);
        assert!(registry.unregister(&s.id));
        assert!(!registry.unregister(&s.id));
        assert!(!registry.unregister(&SubscriberId::new()));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn unregister_wakes_removal_waiters() {
        let registry = SubscriberRegistry::new(32);
        let (s, _rx) = registry.register(Transport::WebSocket, 0, None);
        let waiter = tokio::spawn({
            let s = Arc::clone(&s);
            async move { s.removed().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        assert!(registry.unregister(&s.id));
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("removal not signalled")
            .unwrap();
    }

    #[test]
    fn register_assigns_cursor() {
        let registry = SubscriberRegistry::new(32);
        let (s, _rx) = registry.register(Transport::Sse, 41, Some(17));
        assert_eq!(s.last_delivered_event_id(), 41);
        assert_eq!(s.resume_from(), Some(17));
    }

    #[test]
    fn try_deliver_advances_cursor() {
        let registry = SubscriberRegistry::new(32);
        let (s, mut rx) = registry.register(Transport::Sse, 0, None);
        s.try_deliver(&event(3)).unwrap();
        assert_eq!(s.last_delivered_event_id(), 3);
        assert_eq!(rx.try_recv().unwrap().id, 3);
    }

    #[test]
    fn try_deliver_reports_full_queue() {
        let registry = SubscriberRegistry::new(1);
        let (s, _rx) = registry.register(Transport::Sse, 0, None);
        s.try_deliver(&event(1)).unwrap();
        assert_eq!(s.try_deliver(&event(2)), Err(SendFailure::QueueFull));
        assert_eq!(s.last_delivered_event_id(), 1);
    }

    #[test]
    fn try_deliver_reports_closed_receiver() {
        let registry = SubscriberRegistry::new(4);
        let (s, rx) = registry.register(Transport::WebSocket, 0, None);
        drop(rx);
        assert_eq!(s.try_deliver(&event(1)), Err(SendFailure::Closed));
    }

    #[test]
    fn try_deliver_after_unregister_fails() {
        let registry = SubscriberRegistry::new(4);
        let (s, _rx) = registry.register(Transport::Sse, 0, None);
        registry.unregister(&s.id);
        assert_eq!(s.try_deliver(&event(1)), Err(SendFailure::Disconnected));
    }

    #[test]
    fn for_each_active_skips_subscribers_removed_mid_pass() {
        let registry = SubscriberRegistry::new(8);
        let subs: Vec<_> = (0..4)
            .map(|_| registry.register(Transport::Sse, 0, None))
            .collect();
        let ids: Vec<SubscriberId> = subs.iter().map(|(s, _)| s.id.clone()).collect();

        // The first visitor removes everyone else.
        let mut first = true;
        let visited = registry.for_each_active(|s| {
            if first {
                first = false;
                for id in &ids {
                    if *id != s.id {
                        registry.unregister(id);
                    }
                }
            }
        });

        assert_eq!(visited, 1);
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn for_each_active_allows_self_removal() {
        let registry = SubscriberRegistry::new(8);
        let _subs: Vec<_> = (0..3)
            .map(|_| registry.register(Transport::WebSocket, 0, None))
            .collect();
        let visited = registry.for_each_active(|s| {
            registry.unregister(&s.id);
        });
        assert_eq!(visited, 3);
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn pong_tracking() {
        let registry = SubscriberRegistry::new(8);
        let (s, _rx) = registry.register(Transport::WebSocket, 0, None);
        assert!(s.is_alive(Duration::from_secs(90)));
        s.record_pong();
        assert!(s.is_alive(Duration::from_secs(90)));
    }

    #[test]
    fn cleanup_dead_clients_only_reaps_stale_websockets() {
        let registry = SubscriberRegistry::new(8);
        let (ws, _rx1) = registry.register(Transport::WebSocket, 0, None);
        let (_sse, _rx2) = registry.register(Transport::Sse, 0, None);

        ws.last_pong.store(0, Ordering::Relaxed);

        let removed = registry.cleanup_dead_clients(Duration::from_secs(90));
        assert_eq!(removed, 1);
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.count_transport(Transport::Sse), 1);
    }
}
