//! `GET /events`: Server-Sent Events stream.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::{IntoResponse, Response};
use beacon_core::ids::SubscriberId;
use beacon_core::{PushEvent, Transport};
use beacon_push::frame::encode_sse;
use beacon_push::BroadcastDispatcher;
use futures::Stream;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::WaitForCancellationFutureOwned;
use tracing::{debug, info, warn};

use crate::server::AppState;

const LAST_EVENT_ID: &str = "last-event-id";

/// Frames queued for one SSE client. Dropping the stream (client gone or
/// server shutting down) unregisters the subscriber.
struct SseStream {
    rx: mpsc::Receiver<Arc<PushEvent>>,
    shutdown: Pin<Box<WaitForCancellationFutureOwned>>,
    dispatcher: Arc<BroadcastDispatcher>,
    id: SubscriberId,
}

impl Stream for SseStream {
    type Item = Result<String, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.shutdown.as_mut().poll(cx).is_ready() {
            return Poll::Ready(None);
        }
        loop {
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(event)) => match encode_sse(&event) {
                    Ok(frame) => return Poll::Ready(Some(Ok(frame))),
                    Err(e) => {
                        warn!(subscriber_id = %this.id, event_id = event.id, error = %e, "Failed to encode SSE frame");
                    }
                },
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl Drop for SseStream {
    fn drop(&mut self) {
        if self.dispatcher.unsubscribe(&self.id) {
            info!(subscriber_id = %self.id, "SSE client disconnected");
        }
    }
}

fn last_event_id(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(LAST_EVENT_ID)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// `GET /events`
pub async fn sse_handler(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let resume_from = last_event_id(&headers);
    let dispatcher = Arc::clone(state.hub.dispatcher());
    let (subscriber, rx) = dispatcher.subscribe(Transport::Sse, resume_from);
    let id = subscriber.id.clone();
    drop(subscriber);

    info!(subscriber_id = %id, "SSE client connected");
    if let Some(last) = resume_from {
        // No history is kept; the client resumes from the live cursor.
        debug!(subscriber_id = %id, last_event_id = last, cursor = dispatcher.current_sequence(), "SSE reconnect without replay");
    }

    let _ = dispatcher.send_to(
        &id,
        "connected",
        json!({
            "subscriberId": id,
            "lastEventId": resume_from,
        }),
    );

    let stream = SseStream {
        rx,
        shutdown: Box::pin(state.shutdown.clone().cancelled_owned()),
        dispatcher,
        id,
    };

    (
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream")),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-cache")),
            (
                header::HeaderName::from_static("x-accel-buffering"),
                HeaderValue::from_static("no"),
            ),
        ],
        Body::from_stream(stream),
    )
        .into_response()
}
