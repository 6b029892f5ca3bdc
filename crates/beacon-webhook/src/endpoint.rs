use beacon_core::ids::EndpointId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

/// Where and how to deliver a webhook.
#[derive(Clone)]
pub struct WebhookEndpoint {
    pub url: String,
    pub secret: SecretString,
    /// Event types this endpoint wants; `None` means all.
    pub event_types: Option<Vec<String>>,
}

impl std::fmt::Debug for WebhookEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookEndpoint")
            .field("url", &self.url)
            .field("event_types", &self.event_types)
            .finish()
    }
}

impl WebhookEndpoint {
    pub fn new(url: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            secret: SecretString::from(secret.into()),
            event_types: None,
        }
    }

    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    pub fn accepts(&self, event_type: &str) -> bool {
        match &self.event_types {
            None => true,
            Some(types) => types.iter().any(|t| t == event_type || t == "*"),
        }
    }

    pub(crate) fn secret_str(&self) -> &str {
        self.secret.expose_secret()
    }
}

/// An endpoint known to the registry.
#[derive(Clone, Debug)]
pub struct RegisteredEndpoint {
    pub id: EndpointId,
    pub endpoint: WebhookEndpoint,
    pub created_at: DateTime<Utc>,
}

/// Public view of a registered endpoint. Never carries the secret.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSummary {
    pub id: EndpointId,
    pub url: String,
    pub event_types: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
}

impl From<&RegisteredEndpoint> for EndpointSummary {
    fn from(r: &RegisteredEndpoint) -> Self {
        Self {
            id: r.id.clone(),
            url: r.endpoint.url.clone(),
            event_types: r.endpoint.event_types.clone(),
            created_at: r.created_at,
        }
    }
}

/// Externally registered webhook endpoints.
///
/// Retry chains consult `is_registered` before each retry, so removing an
/// endpoint stops deliveries that are still backing off.
#[derive(Default)]
pub struct EndpointRegistry {
    endpoints: DashMap<EndpointId, RegisteredEndpoint>,
}

impl EndpointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, endpoint: WebhookEndpoint) -> RegisteredEndpoint {
        let registered = RegisteredEndpoint {
            id: EndpointId::new(),
            endpoint,
            created_at: Utc::now(),
        };
        self.endpoints
            .insert(registered.id.clone(), registered.clone());
        tracing::info!(endpoint_id = %registered.id, url = %registered.endpoint.url, "Webhook endpoint registered");
        registered
    }

    pub fn remove(&self, id: &EndpointId) -> bool {
        let removed = self.endpoints.remove(id).is_some();
        if removed {
            tracing::info!(endpoint_id = %id, "Webhook endpoint removed");
        }
        removed
    }

    pub fn is_registered(&self, id: &EndpointId) -> bool {
        self.endpoints.contains_key(id)
    }

    pub fn count(&self) -> usize {
        self.endpoints.len()
    }

    /// Endpoints whose filter accepts `event_type`.
    pub fn matching(&self, event_type: &str) -> Vec<RegisteredEndpoint> {
        self.endpoints
            .iter()
            .filter(|entry| entry.value().endpoint.accepts(event_type))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Summaries, oldest first.
    pub fn list(&self) -> Vec<EndpointSummary> {
        let mut all: Vec<EndpointSummary> = self
            .endpoints
            .iter()
            .map(|entry| EndpointSummary::from(entry.value()))
            .collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.as_str().cmp(b.id.as_str())));
        all
    }
}
