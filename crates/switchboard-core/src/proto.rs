//! Frame codec for the coordination protocol.
//!
//! Every frame on the wire is:
//!
//! ```text
//! [4 bytes] request id (big-endian i32)
//! [1 byte]  action code (i8): >= 0 command, < 0 response
//! [4 bytes] payload length (big-endian u32)
//! [N bytes] payload
//! ```
//!
//! Request id `0` marks a fire-and-forget command; no response is
//! correlated to it.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtoError;

/// Fixed header size: request id + action code + payload length.
pub const HEADER_LEN: usize = 9;

/// Maximum accepted payload length: 16 MB.
pub const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

/// First wire code of the application-command space.
pub const APP_CODE_BASE: i8 = 64;

/// Commands (non-negative action codes).
///
/// `App` codes (`64..=127`) are routed through the registry without the
/// core knowing their semantics; the surrounding bridge installs
/// handlers for them. Any other unrecognized non-negative code decodes
/// as `Unknown` so the connection can answer diagnostically instead of
/// dying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Unknown,
    Connect,
    Quit,
    Lock,
    OptionalLock,
    Unlock,
    CheckAction,
    CheckMessage,
    UpdateMessage,
    Proxy,
    Broadcast,
    /// Application command; carries its raw wire code (`64..=127`).
    App(u8),
}

impl Command {
    /// Decode from a wire code. Returns `None` for negative codes
    /// (those are responses).
    pub fn from_code(code: i8) -> Option<Self> {
        match code {
            0 => Some(Self::Unknown),
            1 => Some(Self::Connect),
            2 => Some(Self::Quit),
            3 => Some(Self::Lock),
            4 => Some(Self::OptionalLock),
            5 => Some(Self::Unlock),
            6 => Some(Self::CheckAction),
            7 => Some(Self::CheckMessage),
            8 => Some(Self::UpdateMessage),
            9 => Some(Self::Proxy),
            10 => Some(Self::Broadcast),
            c if (APP_CODE_BASE..=i8::MAX).contains(&c) => Some(Self::App(c as u8)),
            c if c >= 0 => Some(Self::Unknown),
            _ => None,
        }
    }

    /// Construct an application command. `code` must be in `64..=127`.
    pub fn app(code: u8) -> Option<Self> {
        if (APP_CODE_BASE as u8..=i8::MAX as u8).contains(&code) {
            Some(Self::App(code))
        } else {
            None
        }
    }

    pub fn code(self) -> i8 {
        match self {
            Self::Unknown => 0,
            Self::Connect => 1,
            Self::Quit => 2,
            Self::Lock => 3,
            Self::OptionalLock => 4,
            Self::Unlock => 5,
            Self::CheckAction => 6,
            Self::CheckMessage => 7,
            Self::UpdateMessage => 8,
            Self::Proxy => 9,
            Self::Broadcast => 10,
            Self::App(c) => c as i8,
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "UNKNOWN"),
            Self::Connect => write!(f, "CONNECT"),
            Self::Quit => write!(f, "QUIT"),
            Self::Lock => write!(f, "LOCK"),
            Self::OptionalLock => write!(f, "OPTIONAL_LOCK"),
            Self::Unlock => write!(f, "UNLOCK"),
            Self::CheckAction => write!(f, "CHECK_ACTION"),
            Self::CheckMessage => write!(f, "CHECK_MESSAGE"),
            Self::UpdateMessage => write!(f, "UPDATE_MESSAGE"),
            Self::Proxy => write!(f, "PROXY"),
            Self::Broadcast => write!(f, "BROADCAST"),
            Self::App(c) => write!(f, "APP({c})"),
        }
    }
}

/// Responses (negative action codes). Closed: both ends know the full
/// set, so an unrecognized negative code is a protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Response {
    ConnectOk,
    Error,
    Locked,
    LockNotFound,
    Unlocked,
    Found,
    NotFound,
    BroadcastResult,
    CallOk,
    CallError,
}

impl Response {
    pub fn from_code(code: i8) -> Option<Self> {
        match code {
            -1 => Some(Self::ConnectOk),
            -2 => Some(Self::Error),
            -3 => Some(Self::Locked),
            -4 => Some(Self::LockNotFound),
            -5 => Some(Self::Unlocked),
            -6 => Some(Self::Found),
            -7 => Some(Self::NotFound),
            -8 => Some(Self::BroadcastResult),
            -9 => Some(Self::CallOk),
            -10 => Some(Self::CallError),
            _ => None,
        }
    }

    pub fn code(self) -> i8 {
        match self {
            Self::ConnectOk => -1,
            Self::Error => -2,
            Self::Locked => -3,
            Self::LockNotFound => -4,
            Self::Unlocked => -5,
            Self::Found => -6,
            Self::NotFound => -7,
            Self::BroadcastResult => -8,
            Self::CallOk => -9,
            Self::CallError => -10,
        }
    }
}

impl std::fmt::Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ConnectOk => "CONNECT_OK",
            Self::Error => "ERROR",
            Self::Locked => "LOCKED",
            Self::LockNotFound => "LOCK_NOT_FOUND",
            Self::Unlocked => "UNLOCKED",
            Self::Found => "FOUND",
            Self::NotFound => "NOT_FOUND",
            Self::BroadcastResult => "BROADCAST_RESULT",
            Self::CallOk => "CALL_OK",
            Self::CallError => "CALL_ERROR",
        };
        write!(f, "{name}")
    }
}

/// Either side of the command/response split.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Command(Command),
    Response(Response),
}

impl Action {
    pub fn from_code(code: i8) -> Result<Self, ProtoError> {
        if code >= 0 {
            // from_code never fails for non-negative codes
            Ok(Self::Command(Command::from_code(code).unwrap_or(Command::Unknown)))
        } else {
            Response::from_code(code)
                .map(Self::Response)
                .ok_or(ProtoError::UnknownResponse(code))
        }
    }

    pub fn code(self) -> i8 {
        match self {
            Self::Command(c) => c.code(),
            Self::Response(r) => r.code(),
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Command(c) => c.fmt(f),
            Self::Response(r) => r.fmt(f),
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub request_id: i32,
    pub action: Action,
    pub payload: Bytes,
}

/// Read one frame. A short read of either the header or the payload
/// maps to `ProtoError::ConnectionClosed`, not a protocol error.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, ProtoError> {
    let mut header = [0u8; HEADER_LEN];
    read_exact_or_closed(reader, &mut header).await?;

    let request_id = i32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let code = header[4] as i8;
    let len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]);
    if len > MAX_PAYLOAD_LEN {
        return Err(ProtoError::PayloadTooLarge(len));
    }

    let mut payload = vec![0u8; len as usize];
    read_exact_or_closed(reader, &mut payload).await?;

    Ok(Frame {
        request_id,
        action: Action::from_code(code)?,
        payload: payload.into(),
    })
}

/// Write one frame and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    request_id: i32,
    action: Action,
    payload: &[u8],
) -> Result<(), ProtoError> {
    let len = u32::try_from(payload.len()).map_err(|_| ProtoError::PayloadTooLarge(u32::MAX))?;
    if len > MAX_PAYLOAD_LEN {
        return Err(ProtoError::PayloadTooLarge(len));
    }
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(&request_id.to_be_bytes());
    header[4] = action.code() as u8;
    header[5..9].copy_from_slice(&len.to_be_bytes());
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_exact_or_closed<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<(), ProtoError> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(ProtoError::ConnectionClosed),
        Err(e) => Err(ProtoError::Io(e)),
    }
}

/// Reply payload of a `BROADCAST` command: every targeted connection id
/// mapped to the response it gave. Payloads are base64 so the whole map
/// serializes as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastReply {
    pub responses: BTreeMap<i32, BroadcastEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastEntry {
    pub response: i8,
    pub payload: String,
}

impl BroadcastEntry {
    pub fn new(response: Response, payload: &[u8]) -> Self {
        use base64::Engine;
        Self {
            response: response.code(),
            payload: base64::engine::general_purpose::STANDARD.encode(payload),
        }
    }

    pub fn response(&self) -> Option<Response> {
        Response::from_code(self.response)
    }

    pub fn decode_payload(&self) -> Result<Bytes, base64::DecodeError> {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD
            .decode(&self.payload)
            .map(Bytes::from)
    }
}
