use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::proto::Response;

/// Framing-level failures. Short reads are connection loss, not
/// protocol violations.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("connection closed")]
    ConnectionClosed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown response code {0}")]
    UnknownResponse(i8),
    #[error("payload length {0} exceeds frame limit")]
    PayloadTooLarge(u32),
}

/// Everything a `call` can fail with. Each kind is distinct so callers
/// handle them explicitly; nothing here is retried by the core.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection closed before response")]
    ConnectionClosed,
    #[error("not connected")]
    NotConnected,
    #[error("server error: {}", String::from_utf8_lossy(.0))]
    Server(Bytes),
    #[error("unexpected response {response}")]
    UnexpectedResponse { response: Response, payload: Bytes },
    #[error("remote handler error: {0}")]
    Remote(RemoteError),
    #[error("payload encode/decode failed: {0}")]
    Codec(String),
    #[error(transparent)]
    Proto(#[from] ProtoError),
}

impl CallError {
    /// Short classification string for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::ConnectionClosed => "connection_closed",
            Self::NotConnected => "not_connected",
            Self::Server(_) => "server_error",
            Self::UnexpectedResponse { .. } => "unexpected_response",
            Self::Remote(_) => "remote_error",
            Self::Codec(_) => "codec",
            Self::Proto(_) => "proto",
        }
    }
}

/// A domain error raised inside a structured handler, serialized back
/// to the caller so it can be re-raised there. Distinct from
/// infrastructure faults, which surface as an opaque server error.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: String,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Failure of a registered command handler. Caught at the dispatch
/// boundary: logged with full detail, reported to the peer as an
/// opaque internal error.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("{0}")]
    Fault(String),
    #[error(transparent)]
    Call(#[from] CallError),
}
