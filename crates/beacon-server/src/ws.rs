//! `GET /ws`: WebSocket push and chat relay.
//!
//! Each socket is split into a writer task (queued events out, periodic
//! pings) and a reader task (client frames into the shared inbound channel,
//! pong tracking). A single processor task handles every inbound message.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use beacon_core::ids::SubscriberId;
use beacon_core::{PushEvent, Transport};
use beacon_push::frame::encode_ws;
use beacon_push::{BroadcastDispatcher, Subscriber};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::hub::PushHub;
use crate::server::AppState;

/// `GET /ws`
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let dispatcher = Arc::clone(state.hub.dispatcher());
    let (subscriber, rx) = dispatcher.subscribe(Transport::WebSocket, None);
    let id = subscriber.id.clone();
    info!(subscriber_id = %id, "WebSocket client connected");

    let clients = dispatcher.registry().count_transport(Transport::WebSocket);
    let _ = dispatcher.send_to(&id, "welcome", json!({ "subscriberId": id, "clients": clients }));
    announce_presence(&dispatcher, &id, "joined");

    run_connection(
        socket,
        subscriber,
        rx,
        state.inbound_tx.clone(),
        state.config.ws_ping_interval(),
        state.shutdown.clone(),
    )
    .await;

    dispatcher.unsubscribe(&id);
    info!(subscriber_id = %id, "WebSocket client disconnected");
    announce_presence(&dispatcher, &id, "left");
}

fn others(id: &SubscriberId) -> impl Fn(&Subscriber) -> bool + '_ {
    move |s: &Subscriber| s.transport == Transport::WebSocket && &s.id != id
}

fn announce_presence(dispatcher: &BroadcastDispatcher, id: &SubscriberId, action: &str) {
    let clients = dispatcher.registry().count_transport(Transport::WebSocket);
    dispatcher.broadcast_where(
        "presence",
        json!({ "action": action, "subscriberId": id, "clients": clients }),
        others(id),
    );
}

async fn run_connection(
    socket: WebSocket,
    subscriber: Arc<Subscriber>,
    mut rx: mpsc::Receiver<Arc<PushEvent>>,
    inbound: mpsc::Sender<(SubscriberId, String)>,
    ping_interval: Duration,
    shutdown: CancellationToken,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_sub = Arc::clone(&subscriber);
    let mut writer: JoinHandle<()> = tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_interval);
        ping.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(event) = msg else { break };
                    let text = match encode_ws(&event) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!(subscriber_id = %writer_sub.id, event_id = event.id, error = %e, "Failed to encode WebSocket frame");
                            continue;
                        }
                    };
                    if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if !writer_sub.is_connected() {
                        break;
                    }
                    if ws_tx.send(WsMessage::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                    tracing::trace!(subscriber_id = %writer_sub.id, "Sent ping");
                }
                () = writer_sub.removed() => {
                    debug!(subscriber_id = %writer_sub.id, "Subscriber dropped by server, closing socket");
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
                () = shutdown.cancelled() => {
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }
    });

    let reader_sub = Arc::clone(&subscriber);
    let mut reader: JoinHandle<()> = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    if inbound
                        .send((reader_sub.id.clone(), text.to_string()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                WsMessage::Pong(_) => reader_sub.record_pong(),
                WsMessage::Close(_) => break,
                WsMessage::Ping(_) | WsMessage::Binary(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }
}

/// Drain inbound WebSocket messages until every sender is gone.
pub async fn process_inbound(mut rx: mpsc::Receiver<(SubscriberId, String)>, hub: Arc<PushHub>) {
    while let Some((from, raw)) = rx.recv().await {
        handle_inbound(hub.dispatcher(), &from, &raw);
    }
    debug!("Inbound processor stopped");
}

/// `chat`/`message` frames are relayed to every other socket; `ping` gets a
/// `pong`; anything else gets an `error` reply.
pub fn handle_inbound(dispatcher: &BroadcastDispatcher, from: &SubscriberId, raw: &str) {
    let parsed: Option<Value> = serde_json::from_str(raw).ok();
    let msg_type = parsed
        .as_ref()
        .and_then(|v| v.get("type"))
        .and_then(Value::as_str);

    match (msg_type, &parsed) {
        (Some(kind @ ("chat" | "message")), Some(msg)) => {
            let content = msg
                .get("data")
                .or_else(|| msg.get("message"))
                .cloned()
                .unwrap_or(Value::Null);
            let report = dispatcher.broadcast_where(
                kind,
                json!({ "from": from, "message": content }),
                others(from),
            );
            debug!(subscriber_id = %from, recipients = report.delivered, "Relayed chat message");
        }
        (Some("ping"), _) => {
            let _ = dispatcher.send_to(from, "pong", json!({}));
        }
        (other, _) => {
            let message = match other {
                Some(t) => format!("unknown message type '{t}'"),
                None => "message must be a JSON object with a string 'type'".to_string(),
            };
            debug!(subscriber_id = %from, %message, "Rejected inbound message");
            let _ = dispatcher.send_to(from, "error", json!({ "message": message }));
        }
    }
}
