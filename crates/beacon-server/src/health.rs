//! `/health` endpoint.

use beacon_core::Transport;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::hub::PushHub;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` while the server is serving.
    pub status: &'static str,
    /// All push subscribers, SSE and WebSocket.
    pub connected_clients: usize,
    pub sse_clients: usize,
    pub websocket_clients: usize,
    pub pending_polls: usize,
    pub version: u64,
    pub webhook_endpoints: usize,
    pub uptime_secs: u64,
    pub timestamp: DateTime<Utc>,
}

/// Build a health response from live counters.
pub fn health_check(hub: &PushHub) -> HealthResponse {
    let registry = hub.dispatcher().registry();
    HealthResponse {
        status: "ok",
        connected_clients: registry.count(),
        sse_clients: registry.count_transport(Transport::Sse),
        websocket_clients: registry.count_transport(Transport::WebSocket),
        pending_polls: hub.poller().pending_count(),
        version: hub.state().version(),
        webhook_endpoints: hub.webhooks().endpoints().count(),
        uptime_secs: hub.uptime().as_secs(),
        timestamp: Utc::now(),
    }
}
