//! HTTP, SSE and WebSocket surface for the beacon push core.

pub mod config;
pub mod error;
pub mod extract;
pub mod generator;
pub mod handlers;
pub mod health;
pub mod hub;
pub mod server;
pub mod sse;
pub mod webhooks;
pub mod ws;

pub use config::{RetryConfig, ServerConfig};
pub use error::ApiError;
pub use hub::{CommitResult, PushHub};
pub use server::{build_router, start, start_with_transport, AppState, ServerHandle, StartError};
