use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use crate::errors::StateError;

/// A consistent view of the versioned state at one point in time.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub version: u64,
    pub payload: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl StateSnapshot {
    /// Whether this snapshot is newer than what a client reports knowing.
    /// A negative (or absent) known version means "nothing known yet".
    pub fn is_newer_than(&self, client_known_version: Option<i64>) -> bool {
        match client_known_version {
            None => true,
            Some(known) if known < 0 => true,
            Some(known) => self.version > known as u64,
        }
    }
}

/// Monotonic change counter plus payload, observed by every transport.
///
/// Writers are serialized by `writer`; readers go through the watch channel,
/// which hands out whole snapshots so version, payload and timestamp always
/// belong together. Long polls wait on `subscribe()` receivers.
pub struct VersionedState {
    writer: Mutex<()>,
    tx: watch::Sender<StateSnapshot>,
}

impl VersionedState {
    pub fn new(initial_payload: serde_json::Value) -> Self {
        Self::starting_at(0, initial_payload)
    }

    fn starting_at(version: u64, payload: serde_json::Value) -> Self {
        let (tx, _) = watch::channel(StateSnapshot {
            version,
            payload,
            updated_at: Utc::now(),
        });
        Self {
            writer: Mutex::new(()),
            tx,
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        self.tx.borrow().clone()
    }

    pub fn version(&self) -> u64 {
        self.tx.borrow().version
    }

    /// Replace the payload and advance the version by exactly one.
    pub fn update(&self, payload: serde_json::Value) -> Result<StateSnapshot, StateError> {
        let _guard = self.writer.lock();
        let current = self.tx.borrow().version;
        let version = current
            .checked_add(1)
            .ok_or(StateError::VersionOverflow(current))?;
        let next = StateSnapshot {
            version,
            payload,
            updated_at: Utc::now(),
        };
        self.tx.send_replace(next.clone());
        Ok(next)
    }

    /// Receiver that observes every committed snapshot.
    pub fn subscribe(&self) -> watch::Receiver<StateSnapshot> {
        self.tx.subscribe()
    }
}

impl Default for VersionedState {
    fn default() -> Self {
        Self::new(serde_json::Value::Null)
    }
}
