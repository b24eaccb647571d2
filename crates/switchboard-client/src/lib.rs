//! Worker-side client of the coordination server.
//!
//! Each bucket process owns one [`Client`]: it dials the central
//! server, performs the CONNECT handshake (retrying forever with a
//! fixed backoff, since the coordination sidecar is treated as
//! always-eventually-available), and then issues calls through its
//! connection handler. With [`Client::listen`] running, the client
//! also serves commands the server proxies or broadcasts to it.

pub mod lock;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use url::Url;

use switchboard_core::{
    CallError, CallOptions, Command, CommandRegistry, ConnInfo, ConnectionHandler, RemoteError,
    Response, Role,
};

pub use lock::DistLock;

/// Fixed delay between connection attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Coordination server address, by scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAddr {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddrParseError {
    #[error("unknown protocol, expected tcp:// or unix://")]
    UnknownScheme,
    #[error("invalid port")]
    InvalidPort,
    #[error("missing host")]
    MissingHost,
}

impl FromStr for ServerAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("tcp://") {
            let (host, port) = rest.rsplit_once(':').ok_or(AddrParseError::InvalidPort)?;
            if host.is_empty() {
                return Err(AddrParseError::MissingHost);
            }
            let port = port.parse().map_err(|_| AddrParseError::InvalidPort)?;
            Ok(Self::Tcp {
                host: host.to_string(),
                port,
            })
        } else if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(AddrParseError::MissingHost);
            }
            Ok(Self::Unix(PathBuf::from(path)))
        } else {
            Err(AddrParseError::UnknownScheme)
        }
    }
}

impl std::fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub address: ServerAddr,
    pub conn_id: i32,
    pub conn_name: String,
    pub callback_address: Url,
    pub reconnect_delay: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Addr(#[from] AddrParseError),
    #[error("bad callback address: {0}")]
    Callback(#[from] url::ParseError),
}

impl ClientConfig {
    pub fn new(
        address: &str,
        conn_id: i32,
        conn_name: impl Into<String>,
        callback_address: &str,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            address: address.parse()?,
            conn_id,
            conn_name: conn_name.into(),
            callback_address: Url::parse(callback_address)?,
            reconnect_delay: RECONNECT_DELAY,
        })
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

/// The per-worker coordination client.
pub struct Client {
    config: ClientConfig,
    registry: Arc<CommandRegistry>,
    handler: parking_lot::Mutex<Option<Arc<ConnectionHandler>>>,
}

impl Client {
    /// The registry carries the handlers this worker serves when the
    /// server proxies or broadcasts commands to it; the surrounding
    /// bridge registers its application handlers there first.
    pub fn new(config: ClientConfig, registry: CommandRegistry) -> Self {
        Self {
            config,
            registry: Arc::new(registry),
            handler: parking_lot::Mutex::new(None),
        }
    }

    pub fn conn_id(&self) -> i32 {
        self.config.conn_id
    }

    pub fn conn_name(&self) -> &str {
        &self.config.conn_name
    }

    pub fn address(&self) -> &ServerAddr {
        &self.config.address
    }

    /// Dial and handshake, retrying with a fixed backoff until the
    /// server accepts. Returns once connected.
    pub async fn connect(&self) {
        tracing::debug!(address = %self.config.address, "connecting to coordination server");
        loop {
            match self.try_connect().await {
                Ok(handler) => {
                    *self.handler.lock() = Some(handler);
                    tracing::info!(
                        address = %self.config.address,
                        conn_id = self.config.conn_id,
                        "connected to coordination server"
                    );
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        address = %self.config.address,
                        error = %e,
                        retry_in = ?self.config.reconnect_delay,
                        "connection attempt failed"
                    );
                    tokio::time::sleep(self.config.reconnect_delay).await;
                }
            }
        }
    }

    fn conn_info(&self) -> ConnInfo {
        ConnInfo {
            id: self.config.conn_id,
            name: self.config.conn_name.clone(),
            callback: self.config.callback_address.clone(),
        }
    }

    async fn try_connect(&self) -> Result<Arc<ConnectionHandler>, CallError> {
        let handler = self.dial().await?;
        match handler
            .call_expecting(
                Command::Connect,
                self.conn_info().handshake_payload(),
                &[Response::ConnectOk],
            )
            .await
        {
            Ok(_) => Ok(handler),
            Err(e) => {
                handler.disconnect().await;
                Err(e)
            }
        }
    }

    async fn dial(&self) -> Result<Arc<ConnectionHandler>, CallError> {
        let info = self.conn_info();
        let handler = match &self.config.address {
            ServerAddr::Tcp { host, port } => {
                let stream = tokio::net::TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(io_err)?;
                ConnectionHandler::new(stream, info, Role::Client, Arc::clone(&self.registry))
            }
            #[cfg(unix)]
            ServerAddr::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await.map_err(io_err)?;
                ConnectionHandler::new(stream, info, Role::Client, Arc::clone(&self.registry))
            }
            #[cfg(not(unix))]
            ServerAddr::Unix(_) => {
                return Err(io_err(std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "unix sockets are not available on this platform",
                )));
            }
        };
        Ok(handler)
    }

    fn handler(&self) -> Result<Arc<ConnectionHandler>, CallError> {
        self.handler.lock().clone().ok_or(CallError::NotConnected)
    }

    /// Issue a call with default options.
    pub async fn call(
        &self,
        command: Command,
        payload: Bytes,
    ) -> Result<(Response, Bytes), CallError> {
        self.handler()?.call(command, payload).await
    }

    /// Issue a call that must be answered by one of `expected`.
    pub async fn call_expecting(
        &self,
        command: Command,
        payload: Bytes,
        expected: &[Response],
    ) -> Result<(Response, Bytes), CallError> {
        self.handler()?.call_expecting(command, payload, expected).await
    }

    pub async fn call_with(
        &self,
        command: Command,
        payload: Bytes,
        options: CallOptions,
    ) -> Result<(Response, Bytes), CallError> {
        self.handler()?.call_with(command, payload, options).await
    }

    /// Fire-and-forget.
    pub async fn send(&self, command: Command, payload: Bytes) -> Result<(), CallError> {
        self.handler()?.send(command, payload).await
    }

    /// Structured RPC over an application command: serialize the
    /// request, decode the reply, re-raise a remote domain error
    /// locally as [`CallError::Remote`].
    pub async fn call_structured<Req, Resp>(
        &self,
        command: Command,
        request: &Req,
    ) -> Result<Resp, CallError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload =
            serde_json::to_vec(request).map_err(|e| CallError::Codec(e.to_string()))?;
        let (response, data) = self
            .call_expecting(
                command,
                payload.into(),
                &[Response::CallOk, Response::CallError],
            )
            .await?;
        match response {
            Response::CallOk => {
                serde_json::from_slice(&data).map_err(|e| CallError::Codec(e.to_string()))
            }
            _ => {
                let err = serde_json::from_slice(&data).unwrap_or_else(|_| {
                    RemoteError::new("unknown", String::from_utf8_lossy(&data))
                });
                Err(CallError::Remote(err))
            }
        }
    }

    /// Start the dispatch loop so the server can call back into this
    /// worker.
    pub fn listen(&self) -> Result<(), CallError> {
        self.handler()?.start();
        Ok(())
    }

    /// Stop the dispatch loop and tear the connection down.
    pub async fn stop_listen(&self) -> Result<(), CallError> {
        self.handler()?.stop().await;
        Ok(())
    }

    pub async fn disconnect(&self) {
        let handler = self.handler.lock().take();
        if let Some(handler) = handler {
            handler.disconnect().await;
        }
    }

    pub fn is_connected(&self) -> bool {
        self.handler
            .lock()
            .as_ref()
            .map(|h| !h.is_closed())
            .unwrap_or(false)
    }

    /// Outstanding calls awaiting responses, for diagnostics.
    pub fn pending_calls(&self) -> Result<usize, CallError> {
        Ok(self.handler()?.pending_calls())
    }
}

fn io_err(e: std::io::Error) -> CallError {
    CallError::Proto(switchboard_core::ProtoError::Io(e))
}

/// Stable content hash for dedup keys: every bucket hashing the same
/// event fields gets the same hex digest.
pub fn event_hash<I, T>(parts: I) -> String
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    use sha2::{Digest, Sha256};
    use std::fmt::Write;

    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref());
        // separator so ("ab","c") and ("a","bc") differ
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
