use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("request timed out")]
    Timeout,
    #[error("not connected")]
    Disconnected,
    #[error("client was disconnected before the call completed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("{message}")]
    Server { message: String, detail: Option<String> },
}

impl From<wire_protocol::Frame> for ClientError {
    /// Converts an `ERROR` frame into the equivalent client error. Panics
    /// if handed anything else — callers only route `Frame::Error` here.
    fn from(frame: wire_protocol::Frame) -> Self {
        match frame {
            wire_protocol::Frame::Error { message, errors, .. } => ClientError::Server {
                message,
                detail: errors.map(|v| v.to_string()),
            },
            other => unreachable!("expected Frame::Error, got {other:?}"),
        }
    }
}
