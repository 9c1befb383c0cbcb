//! Wire codec for the real-time RPC/pub-sub protocol.
//!
//! A [`Frame`] is the only thing that crosses the wire, in any of the three
//! transports (WebSocket, HTTP POST, SSE). [`encode`]/[`decode`] are the
//! codec's only entry points; everything else here is the frame's data
//! model and the frozen error-code table.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// The channel name used when a subscription or emission targets no
/// specific channel. Never evicted even when empty.
pub const NO_CHANNEL: &str = "NO_CHANNEL";

// ---------------------------------------------------------------------------
// RequestId
// ---------------------------------------------------------------------------

/// A 128-bit opaque token, unique per originator per outstanding request.
///
/// Renders as a fixed-width 32-character lowercase hex string (no hyphens)
/// so the encoding is stable regardless of how the id was generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(Uuid);

impl RequestId {
    pub fn new() -> Self {
        RequestId(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for RequestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(RequestId)
    }
}

impl Serialize for RequestId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        RequestId::from_str(&raw).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// A single unit of the wire protocol. Tagged on `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frame {
    /// First frame from a WebSocket client, carrying its chosen uuid.
    Setup { uuid: String },
    /// A method invocation.
    Method {
        id: RequestId,
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        void: Option<bool>,
    },
    /// A successful method response.
    Result {
        id: RequestId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        method: Option<String>,
        result: Value,
    },
    /// An error response, or an unsolicited parse failure (`id: None`).
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<RequestId>,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stack: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        errors: Option<Value>,
    },
    /// A broadcast event delivered to a subscribed session.
    Event {
        id: RequestId,
        channel: String,
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Value>,
    },
    /// Keep-alive ping/pong. Carries no payload.
    Heartbeat,
}

impl Frame {
    /// Build an error frame, collapsing internal details per the
    /// public/internal error split enforced by `realtime-core`.
    pub fn error(id: Option<RequestId>, code: ErrorCode, detail: Option<String>) -> Frame {
        Frame::Error {
            id,
            message: code.to_string(),
            stack: None,
            errors: detail.map(Value::String),
        }
    }
}

/// Encode a frame to its wire bytes. Stable: the same logical frame always
/// encodes to the same bytes, modulo user-payload key ordering.
pub fn encode(frame: &Frame) -> Vec<u8> {
    // serde_json::to_vec cannot fail for well-formed Frame values — Value
    // and String keys are always serializable.
    serde_json::to_vec(frame).expect("Frame is always serializable")
}

/// Decode wire bytes into a frame. Malformed input yields [`ParseError`];
/// the caller (dispatcher) turns that into a `PARSE_ERROR` response frame
/// without tearing down the connection.
pub fn decode(bytes: &[u8]) -> Result<Frame, ParseError> {
    serde_json::from_slice(bytes).map_err(|e| ParseError(e.to_string()))
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("parse error: {0}")]
pub struct ParseError(pub String);

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

/// The frozen `ERROR.message` vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    AuthenticationFailed,
    MethodNotFound,
    MethodForbidden,
    InvalidParams,
    InvalidRequest,
    ParseError,
    InternalError,
    RateLimitExceeded,
    EventNotFound,
    EventForbidden,
    EventNotSubscribed,
    InvalidToken,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::AuthenticationFailed => "Authentication Failed",
            ErrorCode::MethodNotFound => "Method Not Found",
            ErrorCode::MethodForbidden => "Method Forbidden",
            ErrorCode::InvalidParams => "Invalid Params",
            ErrorCode::InvalidRequest => "Invalid Request",
            ErrorCode::ParseError => "Parse Error",
            ErrorCode::InternalError => "Internal Error",
            ErrorCode::RateLimitExceeded => "Rate Limit Exceeded",
            ErrorCode::EventNotFound => "Event Not Found",
            ErrorCode::EventForbidden => "Event Forbidden",
            ErrorCode::EventNotSubscribed => "Event Not Subscribed",
            ErrorCode::InvalidToken => "Invalid Token",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) {
        let bytes = encode(&frame);
        let decoded = decode(&bytes).expect("decode should succeed");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn setup_frame_roundtrips() {
        roundtrip(Frame::Setup {
            uuid: "client-chosen-id".to_owned(),
        });
    }

    #[test]
    fn method_frame_roundtrips_with_and_without_params() {
        roundtrip(Frame::Method {
            id: RequestId::new(),
            method: "echo".to_owned(),
            params: Some(Value::String("test".to_owned())),
            void: None,
        });
        roundtrip(Frame::Method {
            id: RequestId::new(),
            method: "keep:alive".to_owned(),
            params: None,
            void: Some(true),
        });
    }

    #[test]
    fn result_frame_roundtrips() {
        roundtrip(Frame::Result {
            id: RequestId::new(),
            method: Some("echo".to_owned()),
            result: Value::String("test".to_owned()),
        });
    }

    #[test]
    fn error_frame_roundtrips_including_unsolicited_parse_error() {
        roundtrip(Frame::error(None, ErrorCode::ParseError, None));
        roundtrip(Frame::error(
            Some(RequestId::new()),
            ErrorCode::MethodForbidden,
            None,
        ));
    }

    #[test]
    fn event_frame_roundtrips() {
        roundtrip(Frame::Event {
            id: RequestId::new(),
            channel: "room".to_owned(),
            event: "test:event".to_owned(),
            params: Some(serde_json::json!([1, 2, 3])),
        });
    }

    #[test]
    fn heartbeat_frame_roundtrips() {
        roundtrip(Frame::Heartbeat);
    }

    #[test]
    fn decode_malformed_bytes_yields_parse_error_not_panic() {
        let result = decode(b"{not-json");
        assert!(result.is_err());
    }

    #[test]
    fn frame_type_tag_is_screaming_snake_case_on_the_wire() {
        let bytes = encode(&Frame::Heartbeat);
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(text, r#"{"type":"HEARTBEAT"}"#);
    }

    #[test]
    fn request_id_renders_as_fixed_width_hex_and_roundtrips_through_strings() {
        let id = RequestId::new();
        let text = id.to_string();
        assert_eq!(text.len(), 32);
        assert!(text.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(RequestId::from_str(&text).unwrap(), id);
    }

    #[test]
    fn error_code_display_matches_frozen_vocabulary() {
        assert_eq!(ErrorCode::MethodNotFound.to_string(), "Method Not Found");
        assert_eq!(ErrorCode::InvalidToken.to_string(), "Invalid Token");
    }
}
