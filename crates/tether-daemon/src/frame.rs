//! Wire protocol frames.
//!
//! Everything on the socket is JSON sent as text WebSocket frames. Heartbeat
//! frames are `{"type":"ping"}` / `{"type":"pong"}`; anything else is an
//! application event whose payload rides in `data`. The event name comes
//! from the `event` field, falling back to `type`, and a well-formed frame
//! carrying neither is delivered as the catch-all `message` event rather
//! than silently dropped.

use serde_json::{Value, json};

/// Normal closure, no reconnect expected.
pub const CLOSE_NORMAL: u16 = 1000;

/// Application close code: the server stopped answering heartbeats.
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4002;

/// Name of the catch-all event for frames without a `type` field.
pub const MESSAGE_EVENT: &str = "message";

/// A parsed wire frame.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    Ping,
    Pong,
    Event { name: String, data: Value },
}

impl WireFrame {
    /// Parse a text frame. Returns None for invalid JSON.
    pub fn parse(text: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(text).ok()?;
        match value.get("type").and_then(Value::as_str) {
            Some("ping") => return Some(Self::Ping),
            Some("pong") => return Some(Self::Pong),
            _ => {}
        }

        let name = value
            .get("event")
            .or_else(|| value.get("type"))
            .and_then(Value::as_str);
        match name {
            Some(name) => Some(Self::Event {
                name: name.to_string(),
                data: value.get("data").cloned().unwrap_or(Value::Null),
            }),
            None => Some(Self::Event {
                name: MESSAGE_EVENT.to_string(),
                data: value,
            }),
        }
    }

    /// Serialize for sending as a text WebSocket frame.
    pub fn to_text(&self) -> String {
        let value = match self {
            Self::Ping => json!({"type": "ping"}),
            Self::Pong => json!({"type": "pong"}),
            Self::Event { name, data } => json!({"type": name, "data": data}),
        };
        value.to_string()
    }

    /// Build an application event frame.
    pub fn event(name: &str, data: Value) -> Self {
        Self::Event {
            name: name.to_string(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_heartbeat_frames() {
        assert_eq!(WireFrame::parse(r#"{"type":"ping"}"#), Some(WireFrame::Ping));
        assert_eq!(WireFrame::parse(r#"{"type":"pong"}"#), Some(WireFrame::Pong));
    }

    #[test]
    fn parses_event_with_data() {
        let frame = WireFrame::parse(r#"{"type":"task_assigned","data":{"id":7}}"#).unwrap();
        assert_eq!(
            frame,
            WireFrame::Event {
                name: "task_assigned".into(),
                data: json!({"id": 7}),
            }
        );
    }

    #[test]
    fn event_field_takes_precedence_over_type() {
        let frame = WireFrame::parse(r#"{"event":"notify","type":"broadcast","data":1}"#).unwrap();
        assert_eq!(
            frame,
            WireFrame::Event {
                name: "notify".into(),
                data: json!(1),
            }
        );
    }

    #[test]
    fn missing_type_falls_back_to_message_event() {
        let frame = WireFrame::parse(r#"{"hello":"world"}"#).unwrap();
        assert_eq!(
            frame,
            WireFrame::Event {
                name: MESSAGE_EVENT.into(),
                data: json!({"hello": "world"}),
            }
        );
    }

    #[test]
    fn invalid_json_is_rejected() {
        assert_eq!(WireFrame::parse("not json"), None);
        assert_eq!(WireFrame::parse(""), None);
    }

    #[test]
    fn event_roundtrip() {
        let frame = WireFrame::event("notify", json!({"n": 1}));
        assert_eq!(WireFrame::parse(&frame.to_text()), Some(frame));
    }

    #[test]
    fn event_without_payload_carries_null_data() {
        let frame = WireFrame::parse(r#"{"type":"refresh"}"#).unwrap();
        assert_eq!(
            frame,
            WireFrame::Event {
                name: "refresh".into(),
                data: Value::Null,
            }
        );
    }
}
