//! Server configuration.

use std::time::Duration;

use beacon_webhook::RetryPolicy;
use serde::{Deserialize, Serialize};

/// Webhook retry schedule as it appears in config files.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per delivery, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_factor: 0.2,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            jitter_factor: self.jitter_factor,
        }
    }
}

/// Configuration for the beacon server.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind; `0` picks a free port.
    pub port: u16,
    /// Outbound queue per push subscriber.
    pub max_send_queue: usize,
    /// Heartbeat event interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// WebSocket ping interval in seconds.
    pub ws_ping_interval_secs: u64,
    /// WebSocket clients silent for longer than this are dropped.
    pub client_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
    /// Long-poll timeout when the request names none.
    pub long_poll_default_timeout_ms: u64,
    pub long_poll_max_timeout_ms: u64,
    pub max_pending_polls: usize,
    /// Simulated update interval in seconds; `0` disables the generator.
    pub generator_interval_secs: u64,
    pub webhook_history_capacity: usize,
    pub webhook_timeout_secs: u64,
    pub retry: RetryConfig,
    /// Shared secret for `/webhook/receive`.
    #[serde(skip_serializing)]
    pub receiver_secret: String,
    pub receiver_tolerance_secs: u64,
    pub receiver_dedup_window: usize,
    /// Inbound WebSocket messages buffered for the processor task.
    pub inbound_queue: usize,
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 3000,
            max_send_queue: 256,
            heartbeat_interval_secs: 30,
            ws_ping_interval_secs: 30,
            client_timeout_secs: 90,
            cleanup_interval_secs: 60,
            long_poll_default_timeout_ms: 30_000,
            long_poll_max_timeout_ms: 60_000,
            max_pending_polls: 10_000,
            generator_interval_secs: 0,
            webhook_history_capacity: 100,
            webhook_timeout_secs: 10,
            retry: RetryConfig::default(),
            receiver_secret: "beacon-dev-secret".into(),
            receiver_tolerance_secs: 300,
            receiver_dedup_window: 1024,
            inbound_queue: 1024,
            shutdown_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn ws_ping_interval(&self) -> Duration {
        Duration::from_secs(self.ws_ping_interval_secs.max(1))
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    /// Clamp a requested long-poll timeout to the configured maximum.
    pub fn long_poll_timeout(&self, requested_ms: Option<u64>) -> Duration {
        let ms = requested_ms
            .unwrap_or(self.long_poll_default_timeout_ms)
            .min(self.long_poll_max_timeout_ms);
        Duration::from_millis(ms)
    }

    pub fn generator_interval(&self) -> Option<Duration> {
        (self.generator_interval_secs > 0).then(|| Duration::from_secs(self.generator_interval_secs))
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs.max(1))
    }

    pub fn receiver_tolerance(&self) -> Duration {
        Duration::from_secs(self.receiver_tolerance_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
