//! Relay wire frames.
//!
//! Relay messages are JSON arrays like:
//! - `["EVENT", <sub_id>, <event>]`
//! - `["EOSE", <sub_id>]`
//! - `["CLOSED", <sub_id>, <message>]`
//! - `["OK", <event_id>, <accepted>, <message>]`
//! - `["NOTICE", <message>]`
//! - `["AUTH", <challenge>]`

use nostr_sdk::{Event, Filter, SubscriptionId};
use serde_json::{json, Value};

/// Parsed relay-to-client frame.
#[derive(Debug, Clone)]
pub enum RelayFrame {
    Event {
        sub_id: String,
        event: Box<Event>,
    },
    EndOfStoredEvents {
        sub_id: String,
    },
    Closed {
        sub_id: String,
        message: String,
    },
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Notice {
        message: String,
    },
    Auth {
        challenge: String,
    },
    /// Anything we can't make sense of, kept for logging.
    Unknown(String),
}

fn str_at(arr: &[Value], idx: usize) -> String {
    arr.get(idx)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// Parse one text frame. Events whose signature doesn't verify are reported
/// as `Unknown` so they never reach a subscription.
pub fn parse_frame(msg: &str) -> RelayFrame {
    let parsed: Value = match serde_json::from_str(msg) {
        Ok(v) => v,
        Err(_) => return RelayFrame::Unknown(msg.to_string()),
    };

    let arr = match parsed.as_array() {
        Some(a) => a,
        None => return RelayFrame::Unknown(msg.to_string()),
    };

    match arr.first().and_then(|v| v.as_str()) {
        Some("EVENT") => {
            let Some(raw) = arr.get(2) else {
                return RelayFrame::Unknown(msg.to_string());
            };
            let event: Event = match serde_json::from_value(raw.clone()) {
                Ok(e) => e,
                Err(_) => return RelayFrame::Unknown(msg.to_string()),
            };
            if event.verify().is_err() {
                return RelayFrame::Unknown(msg.to_string());
            }
            RelayFrame::Event {
                sub_id: str_at(arr, 1),
                event: Box::new(event),
            }
        }
        Some("EOSE") => RelayFrame::EndOfStoredEvents {
            sub_id: str_at(arr, 1),
        },
        Some("CLOSED") => RelayFrame::Closed {
            sub_id: str_at(arr, 1),
            message: str_at(arr, 2),
        },
        Some("OK") => RelayFrame::Ok {
            event_id: str_at(arr, 1),
            accepted: arr.get(2).and_then(|v| v.as_bool()).unwrap_or(false),
            message: str_at(arr, 3),
        },
        Some("NOTICE") => RelayFrame::Notice {
            message: str_at(arr, 1),
        },
        Some("AUTH") => RelayFrame::Auth {
            challenge: str_at(arr, 1),
        },
        _ => RelayFrame::Unknown(msg.to_string()),
    }
}

/// `["REQ", id, filter, filter, ...]`
pub fn req_frame(id: &SubscriptionId, filters: &[Filter]) -> String {
    let mut frame = vec![json!("REQ"), json!(id.to_string())];
    for filter in filters {
        frame.push(serde_json::to_value(filter).unwrap_or(Value::Null));
    }
    Value::Array(frame).to_string()
}

/// `["CLOSE", id]`
pub fn close_frame(id: &SubscriptionId) -> String {
    json!(["CLOSE", id.to_string()]).to_string()
}

/// `["EVENT", event]`
pub fn event_frame(event: &Event) -> String {
    json!(["EVENT", event]).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_sdk::{EventBuilder, Keys, Kind, PublicKey};

    #[test]
    fn parses_eose() {
        match parse_frame(r#"["EOSE","feed:1"]"#) {
            RelayFrame::EndOfStoredEvents { sub_id } => assert_eq!(sub_id, "feed:1"),
            other => panic!("Expected EOSE, got {:?}", other),
        }
    }

    #[test]
    fn parses_ok_and_closed() {
        match parse_frame(r#"["OK","abc123",false,"blocked: spam"]"#) {
            RelayFrame::Ok {
                event_id,
                accepted,
                message,
            } => {
                assert_eq!(event_id, "abc123");
                assert!(!accepted);
                assert_eq!(message, "blocked: spam");
            }
            other => panic!("Expected Ok, got {:?}", other),
        }
        match parse_frame(r#"["CLOSED","repl:3","error: too many filters"]"#) {
            RelayFrame::Closed { sub_id, message } => {
                assert_eq!(sub_id, "repl:3");
                assert_eq!(message, "error: too many filters");
            }
            other => panic!("Expected Closed, got {:?}", other),
        }
    }

    #[test]
    fn parses_signed_event() {
        let keys = Keys::generate();
        let event = EventBuilder::new(Kind::TextNote, "hello")
            .sign_with_keys(&keys)
            .unwrap();
        let frame = serde_json::json!(["EVENT", "feed:9", event]).to_string();

        match parse_frame(&frame) {
            RelayFrame::Event { sub_id, event: got } => {
                assert_eq!(sub_id, "feed:9");
                assert_eq!(got.id, event.id);
            }
            other => panic!("Expected Event, got {:?}", other),
        }
    }

    #[test]
    fn tampered_event_is_rejected() {
        let keys = Keys::generate();
        let event = EventBuilder::new(Kind::TextNote, "hello")
            .sign_with_keys(&keys)
            .unwrap();
        let mut raw = serde_json::to_value(&event).unwrap();
        raw["content"] = serde_json::json!("tampered");
        let frame = serde_json::json!(["EVENT", "feed:9", raw]).to_string();

        assert!(matches!(parse_frame(&frame), RelayFrame::Unknown(_)));
    }

    #[test]
    fn garbage_is_unknown() {
        assert!(matches!(parse_frame("not json"), RelayFrame::Unknown(_)));
        assert!(matches!(parse_frame(r#"{"a":1}"#), RelayFrame::Unknown(_)));
    }

    #[test]
    fn req_frame_carries_every_filter() {
        let a = Keys::generate().public_key();
        let b: PublicKey = Keys::generate().public_key();
        let filters = vec![
            Filter::new().kind(Kind::TextNote).author(a),
            Filter::new().kind(Kind::TextNote).author(b),
        ];
        let id = SubscriptionId::new("feed:1");
        let frame: Value = serde_json::from_str(&req_frame(&id, &filters)).unwrap();
        let arr = frame.as_array().unwrap();
        assert_eq!(arr.len(), 4);
        assert_eq!(arr[0], "REQ");
        assert_eq!(arr[1], "feed:1");
        assert_eq!(arr[2]["authors"][0], a.to_hex());
        assert_eq!(arr[3]["authors"][0], b.to_hex());
    }
}
