//! The public/internal error split described in the error-handling design:
//! public errors keep their message (and optional structured detail) across
//! the wire; everything else collapses to `Internal Error`.

use serde_json::Value;
use wire_protocol::{ErrorCode, Frame, RequestId};

/// An error a method handler or middleware step can return.
#[derive(Debug, Clone)]
pub enum DispatchError {
    /// User-visible message, optionally with structured detail (e.g. a
    /// schema validation error list).
    Public(String, Option<Value>),
    /// Internal detail, replaced with `Internal Error` on the wire. The
    /// original message is preserved here for server-side logs only.
    Internal(String),
}

impl DispatchError {
    pub fn public(message: impl Into<String>) -> Self {
        DispatchError::Public(message.into(), None)
    }

    pub fn public_with_detail(message: impl Into<String>, detail: Value) -> Self {
        DispatchError::Public(message.into(), Some(detail))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        DispatchError::Internal(message.into())
    }
}

impl std::fmt::Display for DispatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchError::Public(msg, _) => f.write_str(msg),
            DispatchError::Internal(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for DispatchError {}

/// An error already resolved to a wire-level error code, as produced by the
/// dispatcher's own protocol checks (rate limit, not found, forbidden, ...).
#[derive(Debug, Clone)]
pub(crate) enum FrameError {
    Known(ErrorCode, Option<Value>),
    FromHandler(DispatchError),
}

impl FrameError {
    pub(crate) fn to_frame(&self, id: Option<RequestId>) -> Frame {
        match self {
            FrameError::Known(code, detail) => Frame::Error {
                id,
                message: code.to_string(),
                stack: None,
                errors: detail.clone(),
            },
            FrameError::FromHandler(DispatchError::Public(msg, errs)) => Frame::Error {
                id,
                message: msg.clone(),
                stack: None,
                errors: errs.clone(),
            },
            FrameError::FromHandler(DispatchError::Internal(detail)) => {
                tracing::error!(detail = %detail, "internal error collapsed for client");
                Frame::Error {
                    id,
                    message: ErrorCode::InternalError.to_string(),
                    stack: None,
                    errors: None,
                }
            }
        }
    }
}

impl From<DispatchError> for FrameError {
    fn from(err: DispatchError) -> Self {
        FrameError::FromHandler(err)
    }
}
