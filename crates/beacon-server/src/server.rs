use std::sync::Arc;
use std::time::Duration;

use axum::routing::{delete, get, post};
use axum::Router;
use beacon_core::ids::SubscriberId;
use beacon_push::{BroadcastDispatcher, HeartbeatScheduler};
use beacon_telemetry::MetricsRecorder;
use beacon_webhook::{DeliveryError, HttpTransport, WebhookTransport};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::generator::ChangeGenerator;
use crate::hub::PushHub;
use crate::{handlers, sse, webhooks, ws};

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<PushHub>,
    pub config: Arc<ServerConfig>,
    pub inbound_tx: mpsc::Sender<(SubscriberId, String)>,
    pub shutdown: CancellationToken,
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to build webhook transport: {0}")]
    Transport(#[from] DeliveryError),
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/data", get(handlers::poll_handler))
        .route("/trigger", post(handlers::trigger_handler))
        .route("/events", get(sse::sse_handler))
        .route("/ws", get(ws::ws_handler))
        .route("/webhook/send", post(webhooks::send_handler))
        .route("/webhook/history", get(webhooks::history_handler))
        .route(
            "/webhook/endpoints",
            post(webhooks::register_endpoint_handler).get(webhooks::list_endpoints_handler),
        )
        .route("/webhook/endpoints/{id}", delete(webhooks::remove_endpoint_handler))
        .route("/webhook/receive", post(webhooks::receive_handler))
        .route("/webhook/received", get(webhooks::received_handler))
        .route("/health", get(handlers::health_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Start the server with an HTTP webhook transport.
pub async fn start(
    config: ServerConfig,
    metrics: Arc<MetricsRecorder>,
) -> Result<ServerHandle, StartError> {
    let transport = Arc::new(HttpTransport::new(config.webhook_timeout())?);
    start_with_transport(config, metrics, transport).await
}

/// Bind, spawn background tasks and serve. Returns a handle to shut it down.
pub async fn start_with_transport(
    config: ServerConfig,
    metrics: Arc<MetricsRecorder>,
    transport: Arc<dyn WebhookTransport>,
) -> Result<ServerHandle, StartError> {
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| StartError::Bind {
            addr: addr.clone(),
            source,
        })?;
    let local_addr = listener
        .local_addr()
        .map_err(|source| StartError::Bind { addr, source })?;

    let shutdown = CancellationToken::new();
    let hub = Arc::new(PushHub::new(&config, transport, metrics, shutdown.clone()));
    let mut tasks = Vec::new();

    tasks.push(
        HeartbeatScheduler::new(Arc::clone(hub.dispatcher()), config.heartbeat_interval())
            .spawn(shutdown.clone()),
    );
    tasks.push(start_cleanup_task(
        Arc::clone(hub.dispatcher()),
        config.cleanup_interval(),
        config.client_timeout(),
        shutdown.clone(),
    ));
    if let Some(interval) = config.generator_interval() {
        tasks.push(ChangeGenerator::new(Arc::clone(&hub), interval).spawn(shutdown.clone()));
    }

    let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue.max(1));
    tasks.push(tokio::spawn(ws::process_inbound(inbound_rx, Arc::clone(&hub))));

    let shutdown_timeout = config.shutdown_timeout();
    let state = AppState {
        hub: Arc::clone(&hub),
        config: Arc::new(config),
        inbound_tx,
        shutdown: shutdown.clone(),
    };
    let router = build_router(state);

    let serve_shutdown = shutdown.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(serve_shutdown.cancelled_owned())
            .await
        {
            error!(error = %e, "Server error");
        }
    }));

    info!(addr = %local_addr, "Beacon server started");

    Ok(ServerHandle {
        port: local_addr.port(),
        hub,
        shutdown,
        tasks,
        shutdown_timeout,
    })
}

/// Periodically drop WebSocket subscribers that stopped answering pings.
fn start_cleanup_task(
    dispatcher: Arc<BroadcastDispatcher>,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = dispatcher.registry().cleanup_dead_clients(timeout);
                    if removed > 0 {
                        info!(removed, "Dead client cleanup");
                    }
                }
                () = cancel.cancelled() => break,
            }
        }
    })
}

/// Handle returned by `start()`; owns the background tasks.
pub struct ServerHandle {
    pub port: u16,
    hub: Arc<PushHub>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl ServerHandle {
    pub fn hub(&self) -> &Arc<PushHub> {
        &self.hub
    }

    /// Cancelled on shutdown, including fatal state errors.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel every task and wait for them, up to the configured timeout.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        info!(
            task_count = self.tasks.len(),
            timeout_secs = self.shutdown_timeout.as_secs(),
            "waiting for tasks to complete"
        );

        let drain = futures::future::join_all(self.tasks);
        if tokio::time::timeout(self.shutdown_timeout, drain).await.is_err() {
            warn!("shutdown timed out after {:?}, some tasks may still be running", self.shutdown_timeout);
        }
    }
}
