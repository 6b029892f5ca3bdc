//! Short and long polling against the versioned state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use beacon_core::{StateSnapshot, VersionedState};
use beacon_telemetry::MetricsRecorder;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

/// How a poll request is answered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollMode {
    /// Compare and return immediately, never block.
    Short,
    /// Hold the request until a newer version exists or `timeout` elapses.
    Long { timeout: Duration },
}

impl PollMode {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Short => "short",
            Self::Long { .. } => "long",
        }
    }
}

/// Wire shape of a poll answer: `{version, timestamp, message, timedOut}`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResponse {
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    /// Current payload; `null` when a long poll timed out without a change.
    pub message: Option<serde_json::Value>,
    pub timed_out: bool,
}

impl PollResponse {
    fn data(snapshot: StateSnapshot) -> Self {
        Self {
            version: snapshot.version,
            timestamp: snapshot.updated_at,
            message: Some(snapshot.payload),
            timed_out: false,
        }
    }

    fn timed_out(snapshot: &StateSnapshot) -> Self {
        Self {
            version: snapshot.version,
            timestamp: snapshot.updated_at,
            message: None,
            timed_out: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    #[error("too many pending long polls (limit {limit})")]
    TooManyPending { limit: usize },
}

/// A held long-poll request. Resolution consumes it, so it can only be
/// resolved once; dropping it unresolved means the caller went away.
struct PendingPoll {
    client_known_version: i64,
    deadline: Instant,
    resolved: bool,
    pending: Arc<AtomicUsize>,
}

impl PendingPoll {
    fn resolve(mut self, response: PollResponse) -> PollResponse {
        self.resolved = true;
        response
    }
}

impl Drop for PendingPoll {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        if !self.resolved {
            debug!(
                client_known_version = self.client_known_version,
                remaining_ms = self
                    .deadline
                    .saturating_duration_since(Instant::now())
                    .as_millis() as u64,
                "Long poll cancelled by client"
            );
        }
    }
}

/// Answers pull requests against [`VersionedState`].
///
/// A single state change wakes every pending long poll at once, since all
/// of them wait on the same watch channel.
pub struct PollResponder {
    state: Arc<VersionedState>,
    max_pending: usize,
    pending: Arc<AtomicUsize>,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl PollResponder {
    pub fn new(state: Arc<VersionedState>, max_pending: usize) -> Self {
        Self {
            state,
            max_pending,
            pending: Arc::new(AtomicUsize::new(0)),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Long polls currently held open.
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Answer a poll. A `client_known_version` that is absent or negative
    /// means the client knows nothing and is always answered immediately.
    pub async fn poll(
        &self,
        client_known_version: Option<i64>,
        mode: PollMode,
    ) -> Result<PollResponse, PollError> {
        let current = self.state.snapshot();
        if current.is_newer_than(client_known_version) {
            self.record(mode, "immediate");
            return Ok(PollResponse::data(current));
        }

        let timeout = match mode {
            PollMode::Short => {
                self.record(mode, "unchanged");
                return Ok(PollResponse::data(current));
            }
            PollMode::Long { timeout } => timeout,
        };

        // Past the fast path the client knows a real version.
        let known = client_known_version.unwrap_or(-1);
        let deadline = Instant::now() + timeout;
        let pending = match self.acquire_slot(known, deadline) {
            Ok(pending) => pending,
            Err(e) => {
                self.record(mode, "rejected");
                return Err(e);
            }
        };

        let mut rx = self.state.subscribe();
        let changed: Option<StateSnapshot> = {
            let outcome =
                tokio::time::timeout_at(deadline, rx.wait_for(|s| s.is_newer_than(Some(known))))
                    .await;
            match outcome {
                Ok(Ok(snapshot)) => Some(snapshot.clone()),
                _ => None,
            }
        };

        let response = match changed {
            Some(snapshot) => {
                self.record(mode, "changed");
                PollResponse::data(snapshot)
            }
            None => {
                self.record(mode, "timed_out");
                PollResponse::timed_out(&self.state.snapshot())
            }
        };
        Ok(pending.resolve(response))
    }

    fn acquire_slot(&self, known: i64, deadline: Instant) -> Result<PendingPoll, PollError> {
        let limit = self.max_pending;
        self.pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .map_err(|_| PollError::TooManyPending { limit })?;

        Ok(PendingPoll {
            client_known_version: known,
            deadline,
            resolved: false,
            pending: Arc::clone(&self.pending),
        })
    }

    fn record(&self, mode: PollMode, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.counter_inc(
                "poll_requests_total",
                &[("mode", mode.as_str()), ("outcome", outcome)],
                1,
            );
        }
    }
}
