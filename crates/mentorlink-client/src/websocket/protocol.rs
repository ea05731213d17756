//! JSON hub protocol framing.
//!
//! Pure encode/parse functions for the SignalR-style JSON hub protocol. Every
//! record on the wire is a JSON object terminated by the ASCII record
//! separator (`0x1E`); one WebSocket text frame may carry several records.
//!
//! | `type` | Meaning                         |
//! |--------|---------------------------------|
//! | 1      | Invocation (client or server)   |
//! | 3      | Completion of a client call     |
//! | 6      | Ping                            |
//! | 7      | Close                           |

use chrono::{DateTime, NaiveDateTime, Utc};
use mentorlink_core::{ChatError, InboundMessage, InvocationId, RoomId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// Terminates every protocol record.
pub const RECORD_SEPARATOR: char = '\u{1e}';

const INVOCATION: u8 = 1;
const COMPLETION: u8 = 3;
const PING: u8 = 6;
const CLOSE: u8 = 7;

/// Record received from the hub.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    /// Hub invokes a client method (`ReceiveMessage`).
    Invocation {
        /// Client method name.
        target: String,
        /// Positional arguments.
        arguments: Vec<Value>,
    },
    /// Completion of one of our invocations.
    Completion {
        /// Invocation being completed.
        invocation_id: InvocationId,
        /// Hub error, if the call failed.
        error: Option<String>,
    },
    /// Keepalive.
    Ping,
    /// Hub is closing the connection.
    Close {
        /// Close reason.
        error: Option<String>,
        /// Whether the hub allows reconnecting.
        allow_reconnect: Option<bool>,
    },
    /// Record type this client does not use (streaming, acks).
    Other(u8),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutgoingInvocation<'a> {
    #[serde(rename = "type")]
    kind: u8,
    invocation_id: String,
    target: &'a str,
    arguments: [RoomId; 1],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFrame {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    invocation_id: Option<String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    arguments: Vec<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    allow_reconnect: Option<bool>,
}

#[derive(Deserialize)]
struct HandshakeResponse {
    #[serde(default)]
    error: Option<String>,
}

/// Build the WebSocket URL for `hub_url` authenticated with `credential`.
///
/// `http(s)` is mapped to `ws(s)` and the credential is passed as the
/// `access_token` query parameter.
///
/// # Errors
///
/// - `ChatError::Protocol` if the URL does not parse or has an unsupported
///   scheme
pub fn hub_url(hub_url: &str, credential: &str) -> Result<Url, ChatError> {
    let mut url =
        Url::parse(hub_url).map_err(|e| ChatError::Protocol(format!("invalid hub url: {e}")))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(ChatError::Protocol(format!("unsupported hub url scheme: {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|()| ChatError::Protocol(format!("cannot use {scheme} for {hub_url}")))?;

    url.query_pairs_mut().append_pair("access_token", credential);
    Ok(url)
}

/// First record sent after the socket opens.
pub fn handshake_request() -> String {
    format!(r#"{{"protocol":"json","version":1}}{RECORD_SEPARATOR}"#)
}

/// Check the hub's handshake reply (`{}` on success).
///
/// # Errors
///
/// - `ChatError::Rejected` if the hub reports a handshake error
/// - `ChatError::Protocol` if the reply is not a handshake response
pub fn parse_handshake_response(record: &str) -> Result<(), ChatError> {
    let response: HandshakeResponse = serde_json::from_str(record)
        .map_err(|e| ChatError::Protocol(format!("bad handshake response: {e}")))?;

    match response.error {
        Some(error) => Err(ChatError::Rejected(error)),
        None => Ok(()),
    }
}

/// Non-empty records in a text frame.
pub fn split_records(text: &str) -> impl Iterator<Item = &str> {
    text.split(RECORD_SEPARATOR).filter(|record| !record.trim().is_empty())
}

/// Encode a client invocation of `target(room_id)`.
///
/// # Errors
///
/// - `ChatError::Protocol` if serialization fails
pub fn encode_invocation(
    invocation_id: InvocationId,
    target: &str,
    room_id: RoomId,
) -> Result<String, ChatError> {
    let invocation = OutgoingInvocation {
        kind: INVOCATION,
        invocation_id: invocation_id.to_string(),
        target,
        arguments: [room_id],
    };

    let json = serde_json::to_string(&invocation)
        .map_err(|e| ChatError::Protocol(format!("encode invocation: {e}")))?;
    Ok(format!("{json}{RECORD_SEPARATOR}"))
}

/// Keepalive record.
pub fn encode_ping() -> String {
    format!(r#"{{"type":{PING}}}{RECORD_SEPARATOR}"#)
}

/// Client-initiated close record.
pub fn encode_close() -> String {
    format!(r#"{{"type":{CLOSE}}}{RECORD_SEPARATOR}"#)
}

/// Parse one record.
///
/// # Errors
///
/// - `ChatError::Protocol` on malformed JSON, a missing target, or a
///   non-numeric invocation id
pub fn parse_frame(record: &str) -> Result<ServerFrame, ChatError> {
    let raw: RawFrame = serde_json::from_str(record)
        .map_err(|e| ChatError::Protocol(format!("malformed hub record: {e}")))?;

    match raw.kind {
        INVOCATION => {
            let target = raw
                .target
                .ok_or_else(|| ChatError::Protocol("invocation without target".to_string()))?;
            Ok(ServerFrame::Invocation { target, arguments: raw.arguments })
        },
        COMPLETION => {
            let id = raw
                .invocation_id
                .ok_or_else(|| ChatError::Protocol("completion without id".to_string()))?;
            let invocation_id = id
                .parse()
                .map_err(|_| ChatError::Protocol(format!("unknown invocation id {id:?}")))?;
            Ok(ServerFrame::Completion { invocation_id, error: raw.error })
        },
        PING => Ok(ServerFrame::Ping),
        CLOSE => Ok(ServerFrame::Close { error: raw.error, allow_reconnect: raw.allow_reconnect }),
        other => Ok(ServerFrame::Other(other)),
    }
}

/// Decode `ReceiveMessage(senderId, text, sentAt)` arguments.
///
/// Numeric sender ids are accepted. An absent or unparseable `sentAt` yields
/// `sent_at: None`; timestamps without an offset are taken as UTC.
///
/// # Errors
///
/// - `ChatError::Protocol` if the sender or text is missing
pub fn parse_message(arguments: &[Value]) -> Result<InboundMessage, ChatError> {
    let sender_id = match arguments.first() {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => return Err(ChatError::Protocol("ReceiveMessage without sender".to_string())),
    };

    let Some(Value::String(text)) = arguments.get(1) else {
        return Err(ChatError::Protocol("ReceiveMessage without text".to_string()));
    };

    let sent_at = match arguments.get(2) {
        Some(Value::String(raw)) => parse_timestamp(raw),
        _ => None,
    };

    Ok(InboundMessage { sender_id, text: text.clone(), sent_at })
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").ok().map(|ts| ts.and_utc())
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    #[test]
    fn http_url_becomes_ws_with_token() {
        let url = hub_url("https://api.example.com/chatHub", "tok en").unwrap();
        assert_eq!(url.as_str(), "wss://api.example.com/chatHub?access_token=tok+en");

        let url = hub_url("http://localhost:5000/chatHub", "t").unwrap();
        assert_eq!(url.scheme(), "ws");
    }

    #[test]
    fn unsupported_scheme_rejected() {
        assert!(matches!(hub_url("ftp://example.com", "t"), Err(ChatError::Protocol(_))));
        assert!(matches!(hub_url("not a url", "t"), Err(ChatError::Protocol(_))));
    }

    #[test]
    fn handshake_reply() {
        assert_eq!(parse_handshake_response("{}"), Ok(()));
        assert_eq!(
            parse_handshake_response(r#"{"error":"Requested protocol 'json' is not available."}"#),
            Err(ChatError::Rejected("Requested protocol 'json' is not available.".to_string()))
        );
        assert!(handshake_request().ends_with(RECORD_SEPARATOR));
    }

    #[test]
    fn invocation_wire_shape() {
        let encoded = encode_invocation(7, "JoinChat", 42).unwrap();
        let record = encoded.trim_end_matches(RECORD_SEPARATOR);
        let value: Value = serde_json::from_str(record).unwrap();

        assert_eq!(
            value,
            json!({"type": 1, "invocationId": "7", "target": "JoinChat", "arguments": [42]})
        );
    }

    #[test]
    fn multiple_records_per_frame() {
        let text = format!(r#"{{"type":6}}{RECORD_SEPARATOR}{{"type":3,"invocationId":"2"}}{RECORD_SEPARATOR}"#);
        let frames: Vec<_> = split_records(&text).map(|r| parse_frame(r).unwrap()).collect();

        assert_eq!(frames, vec![ServerFrame::Ping, ServerFrame::Completion {
            invocation_id: 2,
            error: None
        }]);
    }

    #[test]
    fn completion_with_error() {
        let frame = parse_frame(r#"{"type":3,"invocationId":"5","error":"not a participant"}"#);
        assert_eq!(
            frame.unwrap(),
            ServerFrame::Completion { invocation_id: 5, error: Some("not a participant".into()) }
        );
    }

    #[test]
    fn close_without_reconnect() {
        let frame = parse_frame(r#"{"type":7,"error":"token expired","allowReconnect":false}"#);
        assert_eq!(frame.unwrap(), ServerFrame::Close {
            error: Some("token expired".into()),
            allow_reconnect: Some(false)
        });
    }

    #[test]
    fn malformed_records_are_protocol_errors() {
        assert!(matches!(parse_frame("{"), Err(ChatError::Protocol(_))));
        assert!(matches!(parse_frame(r#"{"type":1}"#), Err(ChatError::Protocol(_))));
        assert!(matches!(
            parse_frame(r#"{"type":3,"invocationId":"abc"}"#),
            Err(ChatError::Protocol(_))
        ));
    }

    #[test]
    fn receive_message_arguments() {
        let args = vec![json!("u-17"), json!("see you at 5"), json!("2025-03-01T09:30:00Z")];
        let message = parse_message(&args).unwrap();

        assert_eq!(message.sender_id, "u-17");
        assert_eq!(message.text, "see you at 5");
        assert_eq!(message.sent_at, Some(Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 0).unwrap()));
    }

    #[test]
    fn receive_message_lenient_fields() {
        let args = vec![json!(17), json!("hi"), json!("2025-03-01T09:30:00.123")];
        let message = parse_message(&args).unwrap();
        assert_eq!(message.sender_id, "17");
        assert!(message.sent_at.is_some());

        let message = parse_message(&[json!("a"), json!("b")]).unwrap();
        assert_eq!(message.sent_at, None);

        assert!(parse_message(&[json!("a")]).is_err());
    }
}
