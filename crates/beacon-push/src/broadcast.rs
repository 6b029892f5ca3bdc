//! Sequenced fan-out to every registered subscriber.

use std::sync::Arc;

use beacon_core::ids::SubscriberId;
use beacon_core::{PushEvent, Transport, HEARTBEAT_EVENT};
use beacon_telemetry::MetricsRecorder;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::registry::{SendFailure, Subscriber, SubscriberRegistry};

/// Outcome of one broadcast pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub event_id: u64,
    /// Subscribers the event was offered to.
    pub attempted: usize,
    pub delivered: usize,
    /// Subscribers unregistered because the send failed.
    pub dropped: Vec<SubscriberId>,
}

/// Assigns global sequence numbers and pushes events to subscribers.
///
/// Sequence assignment and fan-out happen under one lock, and each
/// subscriber has a FIFO queue, so every subscriber observes events in
/// sequence order. Sends never wait: a full or closed queue counts as a
/// write failure and the subscriber is unregistered rather than skipped,
/// which would leave a silent gap.
pub struct BroadcastDispatcher {
    registry: Arc<SubscriberRegistry>,
    sequence: Mutex<u64>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl BroadcastDispatcher {
    pub fn new(registry: Arc<SubscriberRegistry>) -> Self {
        Self {
            registry,
            sequence: Mutex::new(0),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    /// Last sequence number handed out.
    pub fn current_sequence(&self) -> u64 {
        *self.sequence.lock()
    }

    /// Register a subscriber at the current cursor. Taking the sequence lock
    /// means the new subscriber sees exactly the events after the cursor.
    pub fn subscribe(
        &self,
        transport: Transport,
        resume_from: Option<u64>,
    ) -> (Arc<Subscriber>, mpsc::Receiver<Arc<PushEvent>>) {
        let seq = self.sequence.lock();
        let (subscriber, rx) = self.registry.register(transport, *seq, resume_from);
        drop(seq);
        self.record_subscriber_gauges();
        (subscriber, rx)
    }

    /// Remove a subscriber (connection closed). Idempotent.
    pub fn unsubscribe(&self, id: &SubscriberId) -> bool {
        let removed = self.registry.unregister(id);
        if removed {
            self.record_subscriber_gauges();
        }
        removed
    }

    /// Send an event to every active subscriber.
    pub fn broadcast(&self, event_type: &str, data: serde_json::Value) -> BroadcastReport {
        self.broadcast_where(event_type, data, |_| true)
    }

    /// Keep-alive frame through the same sequenced path as data events.
    pub fn heartbeat(&self) -> BroadcastReport {
        self.broadcast(HEARTBEAT_EVENT, serde_json::json!({}))
    }

    /// Send an event to the active subscribers accepted by `filter`. The
    /// event still consumes a global sequence number.
    pub fn broadcast_where<F>(
        &self,
        event_type: &str,
        data: serde_json::Value,
        filter: F,
    ) -> BroadcastReport
    where
        F: Fn(&Subscriber) -> bool,
    {
        let mut seq = self.sequence.lock();
        *seq += 1;
        let event = Arc::new(PushEvent::new(*seq, event_type, data));

        let mut report = BroadcastReport {
            event_id: event.id,
            ..Default::default()
        };
        let mut failures = Vec::new();

        self.registry.for_each_active(|subscriber| {
            if !filter(subscriber) {
                return;
            }
            report.attempted += 1;
            match subscriber.try_deliver(&event) {
                Ok(()) => report.delivered += 1,
                Err(failure) => failures.push((subscriber.id.clone(), failure)),
            }
        });

        for (id, failure) in failures {
            self.drop_subscriber(&id, failure);
            report.dropped.push(id);
        }
        drop(seq);

        debug!(
            event_id = report.event_id,
            event_type,
            recipients = report.delivered,
            dropped = report.dropped.len(),
            "broadcast event"
        );
        self.record_broadcast(&event, &report);
        report
    }

    /// Sequenced event for a single subscriber (welcome, error replies).
    pub fn send_to(
        &self,
        id: &SubscriberId,
        event_type: &str,
        data: serde_json::Value,
    ) -> Result<u64, SendFailure> {
        let mut seq = self.sequence.lock();
        let subscriber = self.registry.get(id).ok_or(SendFailure::Disconnected)?;
        *seq += 1;
        let event = Arc::new(PushEvent::new(*seq, event_type, data));
        match subscriber.try_deliver(&event) {
            Ok(()) => Ok(event.id),
            Err(failure) => {
                self.drop_subscriber(id, failure);
                Err(failure)
            }
        }
    }

    fn drop_subscriber(&self, id: &SubscriberId, failure: SendFailure) {
        if !self.registry.unregister(id) {
            return;
        }
        match failure {
            SendFailure::QueueFull => {
                warn!(subscriber_id = %id, "Send queue full, dropping slow subscriber")
            }
            SendFailure::Closed | SendFailure::Disconnected => {
                debug!(subscriber_id = %id, reason = failure.as_str(), "Subscriber gone")
            }
        }
        if let Some(metrics) = &self.metrics {
            metrics.counter_inc(
                "push_subscribers_dropped_total",
                &[("reason", failure.as_str())],
                1,
            );
        }
        self.record_subscriber_gauges();
    }

    fn record_broadcast(&self, event: &PushEvent, report: &BroadcastReport) {
        if let Some(metrics) = &self.metrics {
            let kind = if event.is_heartbeat() { "heartbeat" } else { "data" };
            metrics.counter_inc("push_events_total", &[("kind", kind)], 1);
            metrics.counter_inc(
                "push_deliveries_total",
                &[("kind", kind)],
                report.delivered as u64,
            );
        }
    }

    fn record_subscriber_gauges(&self) {
        if let Some(metrics) = &self.metrics {
            for transport in [Transport::Sse, Transport::WebSocket] {
                metrics.gauge_set(
                    "push_subscribers",
                    &[("transport", transport.as_str())],
                    self.registry.count_transport(transport) as f64,
                );
            }
        }
    }
}
