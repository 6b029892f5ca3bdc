//! At-least-once webhook delivery with retry.
//!
//! A delivery is one logical notification, identified by a [`DeliveryId`]
//! carried in every attempt's body so receivers can deduplicate. Each
//! attempt is signed with its own timestamp, self-verified, and appended to
//! the [`DeliveryLog`]. Transient failures (network, timeout, 5xx, 429) are
//! retried with exponential backoff until the attempt budget runs out;
//! other 4xx responses end the chain immediately.

use std::sync::Arc;
use std::time::{Duration, Instant};

use beacon_core::ids::{DeliveryId, EndpointId};
use beacon_telemetry::MetricsRecorder;
use bytes::Bytes;
use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::endpoint::{EndpointRegistry, RegisteredEndpoint, WebhookEndpoint};
use crate::error::DeliveryError;
use crate::history::{AttemptStatus, DeliveryAttempt, DeliveryLog};
use crate::signing::{self, ATTEMPT_HEADER, DELIVERY_HEADER, EVENT_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use crate::transport::{OutboundRequest, WebhookTransport};

/// Backoff schedule for a delivery chain.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based).
    ///
    /// `base * 2^(attempt-1)` capped at `max_delay`, then spread by
    /// `±jitter_factor`. A server hint replaces the computed value but is
    /// still capped.
    pub fn delay_for(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        if let Some(delay) = suggested {
            return delay.min(self.max_delay);
        }

        let exp = 2f64.powi(attempt.saturating_sub(1).min(30) as i32);
        let capped = (self.base_delay.as_millis() as f64 * exp).min(self.max_delay.as_millis() as f64);

        let jitter_range = capped * self.jitter_factor.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

/// How a delivery chain ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryOutcome {
    Delivered,
    /// Permanent client error.
    Rejected,
    /// Retry budget spent.
    Exhausted,
    /// Endpoint deregistered while a retry was pending.
    Aborted,
}

impl DeliveryOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Rejected => "rejected",
            Self::Exhausted => "exhausted",
            Self::Aborted => "aborted",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReport {
    pub delivery_id: DeliveryId,
    pub endpoint_url: String,
    pub event_type: String,
    pub outcome: DeliveryOutcome,
    pub attempts: u32,
    pub last_status: Option<u16>,
    pub last_error: Option<String>,
}

/// Handle to a delivery running in the background.
pub struct PendingDelivery {
    pub delivery_id: DeliveryId,
    /// Resolves once the first attempt has been recorded.
    pub first_attempt: oneshot::Receiver<DeliveryAttempt>,
    pub completion: JoinHandle<DeliveryReport>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<'a> {
    id: &'a DeliveryId,
    event_type: &'a str,
    timestamp: i64,
    attempt: u32,
    payload: &'a Value,
}

pub struct WebhookDispatcher {
    transport: Arc<dyn WebhookTransport>,
    endpoints: Arc<EndpointRegistry>,
    log: Arc<DeliveryLog>,
    policy: RetryPolicy,
    metrics: Option<Arc<MetricsRecorder>>,
}

impl WebhookDispatcher {
    pub fn new(
        transport: Arc<dyn WebhookTransport>,
        endpoints: Arc<EndpointRegistry>,
        log: Arc<DeliveryLog>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            endpoints,
            log,
            policy,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn endpoints(&self) -> &Arc<EndpointRegistry> {
        &self.endpoints
    }

    pub fn log(&self) -> &Arc<DeliveryLog> {
        &self.log
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run a full chain to an ad-hoc endpoint.
    pub async fn deliver(
        &self,
        endpoint: &WebhookEndpoint,
        event_type: &str,
        payload: Value,
    ) -> DeliveryReport {
        self.run_chain(DeliveryId::new(), endpoint, None, event_type, &payload, None)
            .await
    }

    /// Run a full chain to a registered endpoint, aborting if it is removed
    /// between attempts.
    pub async fn deliver_registered(
        &self,
        registered: &RegisteredEndpoint,
        event_type: &str,
        payload: Value,
    ) -> DeliveryReport {
        self.run_chain(
            DeliveryId::new(),
            &registered.endpoint,
            Some(&registered.id),
            event_type,
            &payload,
            None,
        )
        .await
    }

    /// Start a chain in the background. The caller can await the first
    /// attempt for a synchronous acknowledgment and the report for the rest.
    pub fn spawn_delivery(
        self: &Arc<Self>,
        endpoint: WebhookEndpoint,
        registration: Option<EndpointId>,
        event_type: impl Into<String>,
        payload: Value,
    ) -> PendingDelivery {
        let delivery_id = DeliveryId::new();
        let (first_tx, first_attempt) = oneshot::channel();
        let this = Arc::clone(self);
        let event_type = event_type.into();
        let id = delivery_id.clone();

        let completion = tokio::spawn(async move {
            this.run_chain(
                id,
                &endpoint,
                registration.as_ref(),
                &event_type,
                &payload,
                Some(first_tx),
            )
            .await
        });

        PendingDelivery {
            delivery_id,
            first_attempt,
            completion,
        }
    }

    /// Spawn one chain per registered endpoint whose filter matches.
    pub fn fan_out(self: &Arc<Self>, event_type: &str, payload: &Value) -> Vec<PendingDelivery> {
        let targets = self.endpoints.matching(event_type);
        if !targets.is_empty() {
            debug!(event_type, endpoints = targets.len(), "Fanning out webhook");
        }
        targets
            .into_iter()
            .map(|r| self.spawn_delivery(r.endpoint, Some(r.id), event_type, payload.clone()))
            .collect()
    }

    async fn run_chain(
        &self,
        delivery_id: DeliveryId,
        endpoint: &WebhookEndpoint,
        registration: Option<&EndpointId>,
        event_type: &str,
        payload: &Value,
        mut first_tx: Option<oneshot::Sender<DeliveryAttempt>>,
    ) -> DeliveryReport {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let (record, result) = self
                .attempt_once(&delivery_id, endpoint, event_type, payload, attempt, max_attempts)
                .await;
            let status = record.status;
            self.log.record(record.clone());
            if let Some(tx) = first_tx.take() {
                let _ = tx.send(record.clone());
            }

            let report = |outcome: DeliveryOutcome| DeliveryReport {
                delivery_id: delivery_id.clone(),
                endpoint_url: endpoint.url.clone(),
                event_type: event_type.to_string(),
                outcome,
                attempts: attempt,
                last_status: match &result {
                    Ok(code) => Some(*code),
                    Err(e) => e.status_code(),
                },
                last_error: result.as_ref().err().map(ToString::to_string),
            };

            let outcome = match status {
                AttemptStatus::Success => Some(DeliveryOutcome::Delivered),
                AttemptStatus::Failed => Some(DeliveryOutcome::Rejected),
                AttemptStatus::Exhausted => Some(DeliveryOutcome::Exhausted),
                AttemptStatus::Aborted => Some(DeliveryOutcome::Aborted),
                AttemptStatus::Pending => None,
            };
            if let Some(outcome) = outcome {
                return self.finish(report(outcome));
            }

            let suggested = result.as_ref().err().and_then(DeliveryError::suggested_delay);
            let delay = self.policy.delay_for(attempt, suggested);
            debug!(
                delivery_id = %delivery_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Retrying webhook delivery"
            );
            tokio::time::sleep(delay).await;

            if let Some(id) = registration {
                if !self.endpoints.is_registered(id) {
                    info!(delivery_id = %delivery_id, endpoint_id = %id, "Endpoint removed, abandoning delivery");
                    self.log.record(DeliveryAttempt {
                        status: AttemptStatus::Aborted,
                        sent_at: Utc::now(),
                        error: Some(format!("endpoint {id} removed before retry")),
                        latency_ms: 0,
                        ..record
                    });
                    return self.finish(report(DeliveryOutcome::Aborted));
                }
            }
            attempt += 1;
        }
    }

    async fn attempt_once(
        &self,
        delivery_id: &DeliveryId,
        endpoint: &WebhookEndpoint,
        event_type: &str,
        payload: &Value,
        attempt: u32,
        max_attempts: u32,
    ) -> (DeliveryAttempt, Result<u16, DeliveryError>) {
        let sent_at = Utc::now();
        let timestamp = sent_at.timestamp();
        let secret = endpoint.secret_str();

        let prepared = serde_json::to_vec(&Envelope {
            id: delivery_id,
            event_type,
            timestamp,
            attempt,
            payload,
        })
        .map_err(|e| DeliveryError::InvalidRequest(e.to_string()))
        .and_then(|body| {
            signing::sign(secret, timestamp, event_type, &body)
                .map(|signature| (body, signature))
                .map_err(|e| DeliveryError::InvalidRequest(e.to_string()))
        });

        let started = Instant::now();
        let (signature, verified, result) = match prepared {
            Ok((body, signature)) => {
                let verified = signing::verify(secret, &signature, timestamp, event_type, &body).is_ok();
                let request = OutboundRequest {
                    url: endpoint.url.clone(),
                    headers: vec![
                        (SIGNATURE_HEADER, signature.clone()),
                        (TIMESTAMP_HEADER, timestamp.to_string()),
                        (EVENT_HEADER, event_type.to_string()),
                        (DELIVERY_HEADER, delivery_id.to_string()),
                        (ATTEMPT_HEADER, attempt.to_string()),
                    ],
                    body: Bytes::from(body),
                };
                let result = self.transport.post(&request).await;
                (signature, verified, result)
            }
            Err(e) => (String::new(), false, Err(e)),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        let status = match &result {
            Ok(_) => AttemptStatus::Success,
            Err(e) if !e.is_retryable() => AttemptStatus::Failed,
            Err(_) if attempt >= max_attempts => AttemptStatus::Exhausted,
            Err(_) => AttemptStatus::Pending,
        };

        match &result {
            Ok(code) => debug!(
                delivery_id = %delivery_id,
                attempt,
                status = code,
                latency_ms,
                "Webhook delivered"
            ),
            Err(e) => warn!(
                delivery_id = %delivery_id,
                url = %endpoint.url,
                attempt,
                error_kind = e.error_kind(),
                error = %e,
                "Webhook attempt failed"
            ),
        }

        if let Some(metrics) = &self.metrics {
            metrics.counter_inc("webhook_attempts_total", &[("status", status.as_str())], 1);
            metrics.histogram_observe("webhook_latency_ms", &[], latency_ms as f64);
        }

        let record = DeliveryAttempt {
            delivery_id: delivery_id.clone(),
            endpoint_url: endpoint.url.clone(),
            event_type: event_type.to_string(),
            payload: payload.clone(),
            attempt_number: attempt,
            status,
            signature,
            sent_at,
            response_status: match &result {
                Ok(code) => Some(*code),
                Err(e) => e.status_code(),
            },
            error: result.as_ref().err().map(ToString::to_string),
            latency_ms,
            verified,
        };
        (record, result)
    }

    fn finish(&self, report: DeliveryReport) -> DeliveryReport {
        if let Some(metrics) = &self.metrics {
            metrics.counter_inc(
                "webhook_deliveries_total",
                &[("outcome", report.outcome.as_str())],
                1,
            );
        }
        match report.outcome {
            DeliveryOutcome::Delivered => info!(
                delivery_id = %report.delivery_id,
                attempts = report.attempts,
                "Webhook delivery complete"
            ),
            _ => warn!(
                delivery_id = %report.delivery_id,
                url = %report.endpoint_url,
                attempts = report.attempts,
                outcome = report.outcome.as_str(),
                "Webhook delivery ended without success"
            ),
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockResponse, MockTransport};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_factor: 0.0,
        }
    }

    fn dispatcher(mock: Arc<MockTransport>, max_attempts: u32) -> Arc<WebhookDispatcher> {
        Arc::new(WebhookDispatcher::new(
            mock,
            Arc::new(EndpointRegistry::new()),
            Arc::new(DeliveryLog::new(100)),
            policy(max_attempts),
        ))
    }

    fn endpoint() -> WebhookEndpoint {
        WebhookEndpoint::new("http://receiver.test/hook", "whsec_test")
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let p = policy(10);
        assert_eq!(p.delay_for(1, None), Duration::from_secs(1));
        assert_eq!(p.delay_for(2, None), Duration::from_secs(2));
        assert_eq!(p.delay_for(3, None), Duration::from_secs(4));
        assert_eq!(p.delay_for(6, None), Duration::from_secs(30));
        assert_eq!(p.delay_for(60, None), Duration::from_secs(30));
    }

    #[test]
    fn backoff_honours_hint_within_cap() {
        let p = policy(10);
        assert_eq!(p.delay_for(1, Some(Duration::from_secs(5))), Duration::from_secs(5));
        assert_eq!(p.delay_for(1, Some(Duration::from_secs(500))), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_in_range() {
        let p = RetryPolicy {
            jitter_factor: 0.2,
            ..policy(10)
        };
        for _ in 0..100 {
            let d = p.delay_for(2, None);
            assert!(d >= Duration::from_millis(1600) && d <= Duration::from_millis(2400), "{d:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_on_first_attempt() {
        let mock = Arc::new(MockTransport::new(vec![MockResponse::Status(200)]));
        let d = dispatcher(Arc::clone(&mock), 4);
        let report = d.deliver(&endpoint(), "update", serde_json::json!({"n": 1})).await;

        assert_eq!(report.outcome, DeliveryOutcome::Delivered);
        assert_eq!(report.attempts, 1);
        assert_eq!(report.last_status, Some(200));
        let log = d.log().recent(10);
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].status, AttemptStatus::Success);
        assert!(log[0].verified);
    }

    #[tokio::test(start_paused = true)]
    async fn client_error_is_not_retried() {
        let mock = Arc::new(MockTransport::always(MockResponse::Status(404)));
        let d = dispatcher(Arc::clone(&mock), 4);
        let report = d.deliver(&endpoint(), "update", Value::Null).await;

        assert_eq!(report.outcome, DeliveryOutcome::Rejected);
        assert_eq!(mock.call_count(), 1);
        assert_eq!(d.log().recent(10)[0].status, AttemptStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn always_500_exhausts_after_max_attempts() {
        let mock = Arc::new(MockTransport::always(MockResponse::Status(500)));
        let d = dispatcher(Arc::clone(&mock), 4);
        let report = d.deliver(&endpoint(), "update", Value::Null).await;

        assert_eq!(report.outcome, DeliveryOutcome::Exhausted);
        assert_eq!(report.attempts, 4);
        assert_eq!(mock.call_count(), 4);

        let log = d.log().recent(10);
        let statuses: Vec<_> = log.iter().map(|a| a.status).collect();
        assert_eq!(
            statuses,
            vec![
                AttemptStatus::Exhausted,
                AttemptStatus::Pending,
                AttemptStatus::Pending,
                AttemptStatus::Pending
            ]
        );
        let numbers: Vec<_> = log.iter().map(|a| a.attempt_number).collect();
        assert_eq!(numbers, vec![4, 3, 2, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_and_network_errors_are_retried() {
        let mock = Arc::new(MockTransport::new(vec![
            MockResponse::RateLimited(Some(Duration::from_secs(2))),
            MockResponse::Error(DeliveryError::Network("connection reset".into())),
            MockResponse::Status(202),
        ]));
        let d = dispatcher(Arc::clone(&mock), 4);
        let start = tokio::time::Instant::now();
        let report = d.deliver(&endpoint(), "update", Value::Null).await;

        assert_eq!(report.outcome, DeliveryOutcome::Delivered);
        assert_eq!(report.attempts, 3);
        // 2s hint + 2s backoff for attempt 2
        assert!(start.elapsed() >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn every_attempt_signed_with_same_delivery_id() {
        let mock = Arc::new(MockTransport::new(vec![
            MockResponse::Status(503),
            MockResponse::Status(200),
        ]));
        let d = dispatcher(Arc::clone(&mock), 4);
        let ep = endpoint();
        d.deliver(&ep, "update", serde_json::json!({"k": "v"})).await;

        let requests = mock.requests();
        assert_eq!(requests.len(), 2);
        let ids: Vec<_> = requests
            .iter()
            .map(|r| r.header(DELIVERY_HEADER).unwrap().to_string())
            .collect();
        assert_eq!(ids[0], ids[1]);

        for (i, r) in requests.iter().enumerate() {
            assert_eq!(r.header(ATTEMPT_HEADER), Some((i + 1).to_string().as_str()));
            let ts: i64 = r.header(TIMESTAMP_HEADER).unwrap().parse().unwrap();
            let sig = r.header(SIGNATURE_HEADER).unwrap();
            assert!(signing::verify("whsec_test", sig, ts, "update", &r.body).is_ok());

            let body: Value = serde_json::from_slice(&r.body).unwrap();
            assert_eq!(body["id"], ids[0].as_str());
            assert_eq!(body["payload"]["k"], "v");
            assert_eq!(body["attempt"], (i + 1) as u64);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn spawned_delivery_acknowledges_first_attempt() {
        let mock = Arc::new(MockTransport::new(vec![
            MockResponse::Status(500),
            MockResponse::Status(200),
        ]));
        let d = dispatcher(Arc::clone(&mock), 4);
        let pending = d.spawn_delivery(endpoint(), None, "update", Value::Null);

        let first = pending.first_attempt.await.unwrap();
        assert_eq!(first.attempt_number, 1);
        assert_eq!(first.status, AttemptStatus::Pending);
        assert_eq!(first.delivery_id, pending.delivery_id);

        let report = pending.completion.await.unwrap();
        assert_eq!(report.outcome, DeliveryOutcome::Delivered);
        assert_eq!(report.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn deregistration_aborts_retry_chain() {
        let mock = Arc::new(MockTransport::always(MockResponse::Status(500)));
        let d = dispatcher(Arc::clone(&mock), 5);
        let registered = d.endpoints().register(endpoint());

        let pending = d.spawn_delivery(
            registered.endpoint.clone(),
            Some(registered.id.clone()),
            "update",
            Value::Null,
        );
        pending.first_attempt.await.unwrap();
        assert!(d.endpoints().remove(&registered.id));

        let report = pending.completion.await.unwrap();
        assert_eq!(report.outcome, DeliveryOutcome::Aborted);
        assert_eq!(report.attempts, 1);
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_fan_out_chain_ends_with_terminal_history_row() {
        let mock = Arc::new(MockTransport::always(MockResponse::Status(500)));
        let d = dispatcher(Arc::clone(&mock), 5);
        let registered = d.endpoints().register(endpoint());

        let mut chains = d.fan_out("update", &serde_json::json!({"n": 1}));
        assert_eq!(chains.len(), 1);
        let chain = chains.remove(0);
        chain.first_attempt.await.unwrap();
        assert!(d.endpoints().remove(&registered.id));
        chain.completion.await.unwrap();

        let history = d.log().recent(10);
        let statuses: Vec<_> = history.iter().map(|a| a.status).collect();
        assert_eq!(statuses, vec![AttemptStatus::Aborted, AttemptStatus::Pending]);
        assert_eq!(history[0].delivery_id, chain.delivery_id);
        assert_eq!(history[0].attempt_number, 1);
        assert!(history[0].error.as_deref().unwrap().contains("removed"));
    }

    #[tokio::test(start_paused = true)]
    async fn fan_out_targets_matching_endpoints() {
        let mock = Arc::new(MockTransport::always(MockResponse::Status(200)));
        let d = dispatcher(Arc::clone(&mock), 3);
        d.endpoints().register(endpoint());
        d.endpoints().register(
            WebhookEndpoint::new("http://other.test", "s").with_event_types(vec!["deploy".into()]),
        );

        let pending = d.fan_out("update", &serde_json::json!({"version": 1}));
        assert_eq!(pending.len(), 1);
        for p in pending {
            assert_eq!(p.completion.await.unwrap().outcome, DeliveryOutcome::Delivered);
        }
        assert_eq!(mock.call_count(), 1);
        assert_eq!(mock.requests()[0].url, "http://receiver.test/hook");
    }

    #[tokio::test(start_paused = true)]
    async fn metrics_count_attempts_by_status() {
        let metrics = Arc::new(MetricsRecorder::new());
        let mock = Arc::new(MockTransport::always(MockResponse::Status(500)));
        let d = WebhookDispatcher::new(
            mock,
            Arc::new(EndpointRegistry::new()),
            Arc::new(DeliveryLog::new(10)),
            policy(3),
        )
        .with_metrics(Arc::clone(&metrics));
        d.deliver(&endpoint(), "update", Value::Null).await;

        assert_eq!(metrics.counter_get("webhook_attempts_total", &[("status", "pending")]), 2);
        assert_eq!(metrics.counter_get("webhook_attempts_total", &[("status", "exhausted")]), 1);
        assert_eq!(
            metrics.counter_get("webhook_deliveries_total", &[("outcome", "exhausted")]),
            1
        );
    }
}
