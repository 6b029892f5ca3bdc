use std::collections::VecDeque;

use beacon_core::ids::DeliveryId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    /// Transient failure; another attempt is scheduled.
    Pending,
    Success,
    /// Permanent rejection. Not retried.
    Failed,
    /// Last transient failure once the retry budget is spent.
    Exhausted,
    /// Endpoint deregistered while a retry was pending.
    Aborted,
}

impl AttemptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Exhausted => "exhausted",
            Self::Aborted => "aborted",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// One row of the delivery log.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAttempt {
    pub delivery_id: DeliveryId,
    pub endpoint_url: String,
    pub event_type: String,
    pub payload: Value,
    pub attempt_number: u32,
    pub status: AttemptStatus,
    pub signature: String,
    pub sent_at: DateTime<Utc>,
    pub response_status: Option<u16>,
    pub error: Option<String>,
    pub latency_ms: u64,
    pub verified: bool,
}

/// Bounded, newest-first record of every attempt.
pub struct DeliveryLog {
    entries: Mutex<VecDeque<DeliveryAttempt>>,
    capacity: usize,
}

impl DeliveryLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, attempt: DeliveryAttempt) {
        let mut entries = self.entries.lock();
        entries.push_front(attempt);
        entries.truncate(self.capacity);
    }

    /// Up to `limit` entries, newest first.
    pub fn recent(&self, limit: usize) -> Vec<DeliveryAttempt> {
        self.entries.lock().iter().take(limit).cloned().collect()
    }

    /// All attempts for one delivery, oldest first.
    pub fn for_delivery(&self, id: &DeliveryId) -> Vec<DeliveryAttempt> {
        let mut rows: Vec<_> = self
            .entries
            .lock()
            .iter()
            .filter(|a| &a.delivery_id == id)
            .cloned()
            .collect();
        rows.reverse();
        rows
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
