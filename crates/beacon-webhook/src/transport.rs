use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::DeliveryError;

/// A fully signed request ready to go on the wire.
#[derive(Clone, Debug)]
pub struct OutboundRequest {
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Bytes,
}

impl OutboundRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Sends one attempt. Implementations return the 2xx status on success and
/// a classified [`DeliveryError`] for anything else.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn post(&self, request: &OutboundRequest) -> Result<u16, DeliveryError>;
}

/// Map a response status onto the delivery outcome.
pub(crate) fn classify_status(status: u16, retry_after: Option<Duration>) -> Result<u16, DeliveryError> {
    if (200..300).contains(&status) {
        Ok(status)
    } else {
        Err(DeliveryError::from_status(status, retry_after))
    }
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

/// reqwest-backed transport with a per-request timeout.
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("beacon-webhook/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| DeliveryError::InvalidRequest(e.to_string()))?;
        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn post(&self, request: &OutboundRequest) -> Result<u16, DeliveryError> {
        let mut builder = self
            .client
            .post(&request.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(*name, value);
        }

        let response = builder.send().await.map_err(|e| match DeliveryError::from(e) {
            DeliveryError::Timeout(_) => DeliveryError::Timeout(self.timeout),
            other => other,
        })?;

        let status = response.status().as_u16();
        let retry_after = parse_retry_after(response.headers());
        classify_status(status, retry_after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER};

    #[test]
    fn classify_2xx_is_ok() {
        assert_eq!(classify_status(200, None), Ok(200));
        assert_eq!(classify_status(204, None), Ok(204));
    }

    #[test]
    fn classify_errors() {
        assert_eq!(
            classify_status(404, None),
            Err(DeliveryError::ClientError { status: 404 })
        );
        assert_eq!(
            classify_status(503, None),
            Err(DeliveryError::ServerError { status: 503 })
        );
        assert_eq!(
            classify_status(429, Some(Duration::from_secs(2))),
            Err(DeliveryError::RateLimited {
                retry_after: Some(Duration::from_secs(2))
            })
        );
    }

    #[test]
    fn retry_after_seconds() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(parse_retry_after(&headers), Some(Duration::from_secs(7)));

        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(parse_retry_after(&headers), None);
        assert_eq!(parse_retry_after(&HeaderMap::new()), None);
    }

    /// Serve one connection with a canned response, after reading the
    /// whole request.
    async fn one_shot_server(response: &'static str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = sock.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&buf);
                if let Some(end) = text.find("\r\n\r\n") {
                    let len = text[..end]
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length").then(|| v.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if buf.len() >= end + 4 + len {
                        break;
                    }
                }
            }
            sock.write_all(response.as_bytes()).await.unwrap();
            sock.shutdown().await.ok();
        });
        format!("http://{addr}/hook")
    }

    fn request(url: String) -> OutboundRequest {
        OutboundRequest {
            url,
            headers: vec![("x-webhook-event", "update".into())],
            body: Bytes::from_static(b"{}"),
        }
    }

    #[tokio::test]
    async fn redirects_are_reported_not_followed() {
        let url = one_shot_server(
            "HTTP/1.1 307 Temporary Redirect\r\nLocation: http://127.0.0.1:1/elsewhere\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        let result = transport.post(&request(url)).await;
        assert_eq!(result, Err(DeliveryError::ServerError { status: 307 }));
    }

    #[tokio::test]
    async fn success_status_is_returned() {
        let url = one_shot_server("HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n").await;
        let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
        assert_eq!(transport.post(&request(url)).await, Ok(204));
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let req = OutboundRequest {
            url: "http://x".into(),
            headers: vec![("x-webhook-event", "update".into())],
            body: Bytes::new(),
        };
        assert_eq!(req.header("X-Webhook-Event"), Some("update"));
        assert_eq!(req.header("missing"), None);
    }
}
