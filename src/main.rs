//! # beacon
//!
//! Push-delivery server binary: loads configuration, installs telemetry and
//! runs the HTTP/SSE/WebSocket surface until Ctrl-C.

#![deny(unsafe_code)]

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use beacon_server::ServerConfig;
use beacon_telemetry::{init_telemetry, TelemetryConfig};
use clap::Parser;
use tracing::Level;

/// Beacon real-time update server.
#[derive(Parser, Debug)]
#[command(name = "beacon", about = "Real-time update distribution server")]
struct Cli {
    /// JSON config file, applied before the flags below.
    #[arg(long, env = "BEACON_CONFIG")]
    config: Option<PathBuf>,

    /// Host to bind.
    #[arg(long, env = "BEACON_HOST")]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long, env = "BEACON_PORT")]
    port: Option<u16>,

    /// Heartbeat interval in seconds.
    #[arg(long, env = "BEACON_HEARTBEAT_SECS")]
    heartbeat_secs: Option<u64>,

    /// Simulated update interval in seconds (0 disables).
    #[arg(long, env = "BEACON_GENERATOR_SECS")]
    generator_secs: Option<u64>,

    /// Shared secret for `/webhook/receive`.
    #[arg(long, env = "BEACON_RECEIVER_SECRET", hide_env_values = true)]
    receiver_secret: Option<String>,

    /// Default log level; `RUST_LOG` takes precedence.
    #[arg(long, env = "BEACON_LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Plain-text logs instead of JSON lines.
    #[arg(long)]
    plain_logs: bool,
}

impl Cli {
    fn server_config(&self) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => ServerConfig::default(),
        };
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(secs) = self.heartbeat_secs {
            config.heartbeat_interval_secs = secs;
        }
        if let Some(secs) = self.generator_secs {
            config.generator_interval_secs = secs;
        }
        if let Some(secret) = &self.receiver_secret {
            config.receiver_secret = secret.clone();
        }
        Ok(config)
    }
}

fn load_config(path: &Path) -> Result<ServerConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let telemetry = init_telemetry(TelemetryConfig {
        log_level: cli.log_level,
        module_levels: Vec::new(),
        json: !cli.plain_logs,
    });

    let config = cli.server_config()?;
    tracing::info!(
        addr = %config.bind_addr(),
        heartbeat_secs = config.heartbeat_interval_secs,
        generator_secs = config.generator_interval_secs,
        "Starting beacon server"
    );

    let handle = beacon_server::start(config, telemetry.metrics())
        .await
        .context("Failed to start server")?;
    let token = handle.shutdown_token();

    tracing::info!(port = handle.port, "Beacon server ready");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for ctrl+c")?;
            tracing::info!("Shutting down");
        }
        () = token.cancelled() => {
            tracing::error!("Server stopped after a fatal error");
        }
    }

    let fatal = token.is_cancelled();
    handle.shutdown().await;
    if fatal {
        anyhow::bail!("state counter can no longer advance");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from(["beacon", "--port", "8080", "--generator-secs", "5"]);
        let config = cli.server_config().unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.generator_interval_secs, 5);
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let cli = Cli::parse_from(["beacon", "--config", "/nonexistent/beacon.json"]);
        let err = cli.server_config().unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
