//! Receiving side of a webhook: verify, deduplicate, record.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use beacon_core::ids::DeliveryId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::signing::{self, VerificationError, DELIVERY_HEADER, EVENT_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER};

/// The signing headers of an inbound request.
#[derive(Clone, Debug, Default)]
pub struct SignedHeaders {
    pub signature: Option<String>,
    pub timestamp: Option<String>,
    pub event_type: Option<String>,
    pub delivery_id: Option<String>,
}

impl SignedHeaders {
    /// Collect the headers through a case-insensitive lookup.
    pub fn from_lookup(lookup: impl Fn(&'static str) -> Option<String>) -> Self {
        Self {
            signature: lookup(SIGNATURE_HEADER),
            timestamp: lookup(TIMESTAMP_HEADER),
            event_type: lookup(EVENT_HEADER),
            delivery_id: lookup(DELIVERY_HEADER),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedWebhook {
    pub delivery_id: Option<DeliveryId>,
    pub event_type: Option<String>,
    pub attempt: Option<u32>,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
    pub verified: bool,
    pub duplicate: bool,
    pub error: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InboundEnvelope {
    id: String,
    event_type: String,
    #[serde(default)]
    attempt: Option<u32>,
    #[serde(default)]
    payload: Value,
}

struct SeenIds {
    order: VecDeque<String>,
    set: HashSet<String>,
    window: usize,
}

impl SeenIds {
    /// Returns true if `id` was already inside the window.
    fn check_and_insert(&mut self, id: &str) -> bool {
        if self.set.contains(id) {
            return true;
        }
        self.set.insert(id.to_owned());
        self.order.push_back(id.to_owned());
        while self.order.len() > self.window {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        false
    }
}

pub struct WebhookReceiver {
    secret: SecretString,
    tolerance: Duration,
    seen: Mutex<SeenIds>,
    log: Mutex<VecDeque<ReceivedWebhook>>,
    capacity: usize,
}

impl WebhookReceiver {
    pub fn new(secret: SecretString, tolerance: Duration, dedup_window: usize, capacity: usize) -> Self {
        Self {
            secret,
            tolerance,
            seen: Mutex::new(SeenIds {
                order: VecDeque::new(),
                set: HashSet::new(),
                window: dedup_window.max(1),
            }),
            log: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Verify one inbound delivery. Rejections are recorded too, with
    /// `verified: false`.
    pub fn receive(&self, headers: &SignedHeaders, body: &[u8]) -> Result<ReceivedWebhook, VerificationError> {
        self.receive_at(headers, body, Utc::now())
    }

    fn receive_at(
        &self,
        headers: &SignedHeaders,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<ReceivedWebhook, VerificationError> {
        match self.check(headers, body, now.timestamp()) {
            Ok(envelope) => {
                let duplicate = self.seen.lock().check_and_insert(&envelope.id);
                if duplicate {
                    debug!(delivery_id = %envelope.id, "Duplicate webhook delivery");
                }
                let entry = ReceivedWebhook {
                    delivery_id: Some(DeliveryId::from_raw(envelope.id)),
                    event_type: Some(envelope.event_type),
                    attempt: envelope.attempt,
                    payload: envelope.payload,
                    received_at: now,
                    verified: true,
                    duplicate,
                    error: None,
                };
                self.push(entry.clone());
                Ok(entry)
            }
            Err(e) => {
                warn!(error_kind = e.error_kind(), error = %e, "Rejected inbound webhook");
                self.push(ReceivedWebhook {
                    delivery_id: headers.delivery_id.clone().map(DeliveryId::from_raw),
                    event_type: headers.event_type.clone(),
                    attempt: None,
                    payload: Value::Null,
                    received_at: now,
                    verified: false,
                    duplicate: false,
                    error: Some(e.to_string()),
                });
                Err(e)
            }
        }
    }

    fn check(&self, headers: &SignedHeaders, body: &[u8], now: i64) -> Result<InboundEnvelope, VerificationError> {
        let signature = headers
            .signature
            .as_deref()
            .ok_or(VerificationError::MissingHeader(SIGNATURE_HEADER))?;
        let timestamp = headers
            .timestamp
            .as_deref()
            .ok_or(VerificationError::MissingHeader(TIMESTAMP_HEADER))?
            .trim()
            .parse::<i64>()
            .map_err(|_| VerificationError::MalformedTimestamp)?;
        let event_type = headers
            .event_type
            .as_deref()
            .ok_or(VerificationError::MissingHeader(EVENT_HEADER))?;

        signing::check_freshness(timestamp, now, self.tolerance)?;
        signing::verify(self.secret.expose_secret(), signature, timestamp, event_type, body)?;

        let envelope: InboundEnvelope =
            serde_json::from_slice(body).map_err(|e| VerificationError::MalformedBody(e.to_string()))?;
        if envelope.event_type != event_type {
            return Err(VerificationError::MalformedBody(
                "event type header does not match body".into(),
            ));
        }
        Ok(envelope)
    }

    fn push(&self, entry: ReceivedWebhook) {
        let mut log = self.log.lock();
        log.push_front(entry);
        log.truncate(self.capacity);
    }

    /// Up to `limit` entries, newest first.
    pub fn recent(&self, limit: usize) -> Vec<ReceivedWebhook> {
        self.log.lock().iter().take(limit).cloned().collect()
    }
}
