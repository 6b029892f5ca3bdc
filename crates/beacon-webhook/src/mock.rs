use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::DeliveryError;
use crate::transport::{classify_status, OutboundRequest, WebhookTransport};

/// Pre-programmed endpoint behaviour for deterministic testing.
#[derive(Clone, Debug)]
pub enum MockResponse {
    /// Respond with this HTTP status.
    Status(u16),
    /// 429 carrying a `Retry-After` hint.
    RateLimited(Option<Duration>),
    /// Fail before a response arrives.
    Error(DeliveryError),
    /// Wait a duration, then yield the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock transport that answers scripted responses in sequence and records
/// every request it sees.
///
/// Once the script runs out, the fallback (if any) answers every further call.
pub struct MockTransport {
    script: Mutex<VecDeque<MockResponse>>,
    fallback: Option<MockResponse>,
    requests: Mutex<Vec<OutboundRequest>>,
    call_count: AtomicUsize,
}

impl MockTransport {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            script: Mutex::new(responses.into()),
            fallback: None,
            requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    /// Answer every call with the same response.
    pub fn always(response: MockResponse) -> Self {
        Self {
            fallback: Some(response),
            ..Self::new(Vec::new())
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.requests.lock().clone()
    }

    fn next_response(&self) -> Option<MockResponse> {
        self.script
            .lock()
            .pop_front()
            .or_else(|| self.fallback.clone())
    }
}

async fn resolve(mut response: MockResponse) -> Result<u16, DeliveryError> {
    loop {
        match response {
            MockResponse::Status(status) => return classify_status(status, None),
            MockResponse::RateLimited(retry_after) => {
                return Err(DeliveryError::RateLimited { retry_after })
            }
            MockResponse::Error(e) => return Err(e),
            MockResponse::Delay(delay, inner) => {
                tokio::time::sleep(delay).await;
                response = *inner;
            }
        }
    }
}

#[async_trait]
impl WebhookTransport for MockTransport {
    async fn post(&self, request: &OutboundRequest) -> Result<u16, DeliveryError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(request.clone());

        match self.next_response() {
            Some(response) => resolve(response).await,
            None => Err(DeliveryError::InvalidRequest(format!(
                "MockTransport: no response configured for call {idx}"
            ))),
        }
    }
}
