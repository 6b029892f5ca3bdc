//! Polling, trigger, health and metrics routes.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use beacon_core::{HEARTBEAT_EVENT, UPDATE_EVENT};
use beacon_push::{PollMode, PollResponse};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::extract::{ApiJson, ApiQuery};
use crate::health;
use crate::server::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct PollQuery {
    pub version: Option<i64>,
    pub timeout: Option<u64>,
    pub mode: Option<String>,
}

impl PollQuery {
    /// `mode` wins when given; otherwise a `timeout` implies long polling.
    fn mode(&self, state: &AppState) -> Result<PollMode, ApiError> {
        let long = match self.mode.as_deref() {
            Some("short") => false,
            Some("long") => true,
            Some(other) => {
                return Err(ApiError::BadRequest(format!(
                    "unknown mode '{other}', expected short or long"
                )))
            }
            None => self.timeout.is_some(),
        };
        Ok(if long {
            PollMode::Long {
                timeout: state.config.long_poll_timeout(self.timeout),
            }
        } else {
            PollMode::Short
        })
    }
}

/// `GET /api/data`
pub async fn poll_handler(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<PollQuery>,
) -> Result<Json<PollResponse>, ApiError> {
    let mode = query.mode(&state)?;
    let response = state.hub.poller().poll(query.version, mode).await?;
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRequest {
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub data: Value,
}

/// `POST /trigger`
pub async fn trigger_handler(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<TriggerRequest>,
) -> Result<Json<Value>, ApiError> {
    let event_type = req.event_type.unwrap_or_else(|| UPDATE_EVENT.to_string());
    if event_type.trim().is_empty() {
        return Err(ApiError::BadRequest("eventType must not be empty".into()));
    }
    if event_type == HEARTBEAT_EVENT {
        return Err(ApiError::BadRequest("eventType 'heartbeat' is reserved".into()));
    }

    let result = state.hub.commit_change(&event_type, req.data)?;
    Ok(Json(json!({
        "version": result.snapshot.version,
        "eventId": result.broadcast.event_id,
        "eventType": event_type,
        "delivered": result.broadcast.delivered,
        "webhooks": result.webhooks,
        "timestamp": result.snapshot.updated_at,
    })))
}

/// `GET /health`
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(health::health_check(&state.hub))
}

/// `GET /metrics`
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.hub.metrics().report())
}
