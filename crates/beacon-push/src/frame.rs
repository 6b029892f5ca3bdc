//! Transport framing for [`PushEvent`]s.
//!
//! Both transports carry the same content (id, type, data, timestamp); only
//! the envelope differs.

use beacon_core::PushEvent;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// WebSocket message body: `{type, id, data, timestamp}`.
#[derive(Serialize)]
struct WireFrame<'a> {
    #[serde(rename = "type")]
    event_type: &'a str,
    id: u64,
    data: &'a serde_json::Value,
    timestamp: DateTime<Utc>,
}

/// Encode an event as a WebSocket text message.
pub fn encode_ws(event: &PushEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(&WireFrame {
        event_type: &event.event_type,
        id: event.id,
        data: &event.data,
        timestamp: event.timestamp,
    })
}

/// SSE `data:` payload. The timestamp travels inside the JSON since the
/// SSE envelope has no field for it.
#[derive(Serialize)]
struct SseData<'a> {
    data: &'a serde_json::Value,
    timestamp: DateTime<Utc>,
}

/// Encode an event as a complete SSE frame:
/// `id: <seq>\nevent: <type>\ndata: <json>\n\n`.
pub fn encode_sse(event: &PushEvent) -> Result<String, serde_json::Error> {
    let data = serde_json::to_string(&SseData {
        data: &event.data,
        timestamp: event.timestamp,
    })?;
    Ok(format!(
        "id: {}\nevent: {}\ndata: {}\n\n",
        event.id,
        sanitize_field(&event.event_type),
        data
    ))
}

/// Event names are single-line in the SSE grammar.
fn sanitize_field(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> PushEvent {
        PushEvent::new(7, "update", serde_json::json!({"message": "line1\nline2"}))
    }

    #[test]
    fn ws_frame_shape() {
        let json: serde_json::Value = serde_json::from_str(&encode_ws(&event()).unwrap()).unwrap();
        assert_eq!(json["type"], "update");
        assert_eq!(json["id"], 7);
        assert_eq!(json["data"]["message"], "line1\nline2");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn sse_frame_shape() {
        let frame = encode_sse(&event()).unwrap();
        assert!(frame.starts_with("id: 7\nevent: update\ndata: {"));
        assert!(frame.ends_with("}\n\n"));
        // Embedded newlines are escaped by JSON, so the frame has exactly
        // three field lines.
        assert_eq!(frame.trim_end().lines().count(), 3);

        let data_line = frame.lines().nth(2).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(data_line.trim_start_matches("data: ")).unwrap();
        assert_eq!(json["data"]["message"], "line1\nline2");
    }

    #[test]
    fn sse_heartbeat_frame() {
        let hb = PushEvent::new(3, beacon_core::HEARTBEAT_EVENT, serde_json::json!({}));
        let frame = encode_sse(&hb).unwrap();
        assert!(frame.contains("event: heartbeat\n"));
    }

    #[test]
    fn event_name_newlines_are_flattened() {
        let ev = PushEvent::new(1, "bad\nname", serde_json::json!(null));
        let frame = encode_sse(&ev).unwrap();
        assert!(frame.contains("event: bad name\n"));
    }
}
