//! Webhook routes: ad-hoc sends, endpoint registry, history, receiver.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use beacon_core::ids::EndpointId;
use beacon_webhook::{DeliveryAttempt, EndpointSummary, ReceivedWebhook, SignedHeaders, WebhookEndpoint};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiError;
use crate::extract::{ApiJson, ApiQuery};
use crate::server::AppState;

const DEFAULT_LIMIT: usize = 50;

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

impl LimitQuery {
    fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT)
    }
}

fn validate_url(url: &str) -> Result<(), ApiError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(ApiError::BadRequest(format!("url must be http(s): '{url}'")))
    }
}

fn validate_secret(secret: &str) -> Result<(), ApiError> {
    if secret.is_empty() {
        return Err(ApiError::BadRequest("secret must not be empty".into()));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub url: String,
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    pub secret: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct SendQuery {
    #[serde(default)]
    pub wait: bool,
}

/// `POST /webhook/send`
///
/// Answers with the first attempt by default (202 while retries remain).
/// `?wait=true` holds the request until the chain finishes.
pub async fn send_handler(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<SendQuery>,
    ApiJson(req): ApiJson<SendRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_url(&req.url)?;
    validate_secret(&req.secret)?;
    if req.event_type.trim().is_empty() {
        return Err(ApiError::BadRequest("eventType must not be empty".into()));
    }

    let endpoint = WebhookEndpoint::new(req.url, req.secret);
    let pending = state
        .hub
        .webhooks()
        .spawn_delivery(endpoint, None, req.event_type, req.payload);

    if query.wait {
        let report = pending
            .completion
            .await
            .map_err(|e| ApiError::Internal(format!("delivery task failed: {e}")))?;
        return Ok((StatusCode::OK, Json(json!(report))));
    }

    let first: DeliveryAttempt = pending
        .first_attempt
        .await
        .map_err(|_| ApiError::Internal("delivery task ended before the first attempt".into()))?;
    let status = if first.status.is_terminal() {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((
        status,
        Json(json!({
            "deliveryId": pending.delivery_id,
            "status": first.status,
            "final": first.status.is_terminal(),
            "attempt": first,
        })),
    ))
}

/// `GET /webhook/history`
pub async fn history_handler(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<LimitQuery>,
) -> Json<Vec<DeliveryAttempt>> {
    Json(state.hub.webhooks().log().recent(query.limit()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub url: String,
    pub secret: String,
    #[serde(default)]
    pub event_types: Option<Vec<String>>,
}

/// `POST /webhook/endpoints`
pub async fn register_endpoint_handler(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    validate_url(&req.url)?;
    validate_secret(&req.secret)?;

    let mut endpoint = WebhookEndpoint::new(req.url, req.secret);
    if let Some(types) = req.event_types {
        endpoint = endpoint.with_event_types(types);
    }
    let registered = state.hub.webhooks().endpoints().register(endpoint);
    Ok((StatusCode::CREATED, Json(EndpointSummary::from(&registered))))
}

/// `GET /webhook/endpoints`
pub async fn list_endpoints_handler(State(state): State<AppState>) -> Json<Vec<EndpointSummary>> {
    Json(state.hub.webhooks().endpoints().list())
}

/// `DELETE /webhook/endpoints/{id}`
pub async fn remove_endpoint_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id = EndpointId::from_raw(id);
    if state.hub.webhooks().endpoints().remove(&id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("no endpoint {id}")))
    }
}

/// `POST /webhook/receive`
pub async fn receive_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let signed = SignedHeaders::from_lookup(|name| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    });
    let received = state.hub.receiver().receive(&signed, &body)?;
    Ok(Json(json!({
        "received": true,
        "deliveryId": received.delivery_id,
        "duplicate": received.duplicate,
    })))
}

/// `GET /webhook/received`
pub async fn received_handler(
    State(state): State<AppState>,
    ApiQuery(query): ApiQuery<LimitQuery>,
) -> Json<Vec<ReceivedWebhook>> {
    Json(state.hub.receiver().recent(query.limit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_validation() {
        assert!(validate_url("http://localhost:9000/hook").is_ok());
        assert!(validate_url("https://example.com").is_ok());
        assert!(validate_url("ftp://example.com").is_err());
        assert!(validate_url("").is_err());
    }

    #[test]
    fn secret_validation() {
        assert!(validate_secret("s").is_ok());
        assert!(validate_secret("").is_err());
    }

    #[test]
    fn default_limit() {
        assert_eq!(LimitQuery::default().limit(), DEFAULT_LIMIT);
        assert_eq!(LimitQuery { limit: Some(3) }.limit(), 3);
    }
}
