use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event type used for keep-alive frames.
pub const HEARTBEAT_EVENT: &str = "heartbeat";

/// Event type used for state changes when the caller does not name one.
pub const UPDATE_EVENT: &str = "update";

/// Push transport a subscriber is connected through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Sse,
    WebSocket,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sse => "sse",
            Self::WebSocket => "websocket",
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sequenced event delivered to push subscribers.
///
/// `id` comes from the single global sequence shared by data and heartbeat
/// events, so ordering by `id` is the order every subscriber observes.
/// Framing differs per transport; this is the content both agree on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PushEvent {
    pub id: u64,
    pub event_type: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl PushEvent {
    pub fn new(id: u64, event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id,
            event_type: event_type.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.event_type == HEARTBEAT_EVENT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_detection() {
        let hb = PushEvent::new(1, HEARTBEAT_EVENT, serde_json::json!({}));
        let update = PushEvent::new(2, UPDATE_EVENT, serde_json::json!({"v": 1}));
        assert!(hb.is_heartbeat());
        assert!(!update.is_heartbeat());
    }

    #[test]
    fn transport_names() {
        assert_eq!(Transport::Sse.as_str(), "sse");
        assert_eq!(Transport::WebSocket.to_string(), "websocket");
        assert_eq!(
            serde_json::to_string(&Transport::WebSocket).unwrap(),
            "\"websocket\""
        );
    }
}
