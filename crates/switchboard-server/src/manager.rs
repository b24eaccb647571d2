//! Accepting side of the coordination server: handshake, the live
//! connection registry, and teardown.

use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use url::Url;

use switchboard_core::proto::{self, Action, Command, Response};
use switchboard_core::{CommandRegistry, ConnInfo, ConnectionHandler, Role};

/// Live registry of named connections: at most one handler per conn
/// id. Shared with the proxy/broadcast handlers and the transaction
/// multiplexer.
pub struct ConnectionMap {
    conns: DashMap<i32, Arc<ConnectionHandler>>,
}

impl ConnectionMap {
    pub fn new() -> Self {
        Self {
            conns: DashMap::new(),
        }
    }

    pub fn get(&self, id: i32) -> Option<Arc<ConnectionHandler>> {
        self.conns.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn insert(&self, id: i32, handler: Arc<ConnectionHandler>) {
        self.conns.insert(id, handler);
    }

    /// Remove the entry for `id` only if it still points at this
    /// handler instance; a stale removal must not race out a fresh
    /// reconnect that already took the slot.
    pub fn remove_if_same(&self, id: i32, handler: &Arc<ConnectionHandler>) {
        self.conns.remove_if(&id, |_, current| Arc::ptr_eq(current, handler));
    }

    pub fn all(&self) -> Vec<Arc<ConnectionHandler>> {
        self.conns
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }
}

impl Default for ConnectionMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Where the server listens.
#[derive(Debug, Clone)]
pub enum BindAddr {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl std::fmt::Display for BindAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// A bound listener, TCP or Unix domain.
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl Listener {
    pub async fn bind(addr: &BindAddr) -> std::io::Result<Self> {
        match addr {
            BindAddr::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                Ok(Self::Tcp(listener))
            }
            #[cfg(unix)]
            BindAddr::Unix(path) => {
                // a stale socket file from a previous run blocks bind
                let _ = std::fs::remove_file(path);
                Ok(Self::Unix(UnixListener::bind(path)?))
            }
            #[cfg(not(unix))]
            BindAddr::Unix(_) => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            )),
        }
    }

    /// Resolved address, e.g. `"tcp://127.0.0.1:43817"` after binding
    /// port 0.
    pub fn local_addr(&self) -> String {
        match self {
            Self::Tcp(listener) => match listener.local_addr() {
                Ok(addr) => format!("tcp://{addr}"),
                Err(_) => "tcp://<unknown>".to_string(),
            },
            #[cfg(unix)]
            Self::Unix(listener) => match listener.local_addr() {
                Ok(addr) => match addr.as_pathname() {
                    Some(path) => format!("unix://{}", path.display()),
                    None => "unix://<unnamed>".to_string(),
                },
                Err(_) => "unix://<unknown>".to_string(),
            },
        }
    }
}

/// Accepts inbound connections, performs the CONNECT handshake, and
/// keeps the connection registry consistent across reconnects.
pub struct ConnectionManager {
    conns: Arc<ConnectionMap>,
    registry: Arc<CommandRegistry>,
}

impl ConnectionManager {
    pub fn new(conns: Arc<ConnectionMap>, registry: Arc<CommandRegistry>) -> Arc<Self> {
        Arc::new(Self { conns, registry })
    }

    pub fn conns(&self) -> &Arc<ConnectionMap> {
        &self.conns
    }

    /// Accept loop. Only a fatal listener error returns; per-connection
    /// failures are handled inside their own task.
    pub async fn serve(self: Arc<Self>, listener: Listener) -> std::io::Result<()> {
        loop {
            match &listener {
                Listener::Tcp(tcp) => {
                    let (stream, peer) = tcp.accept().await?;
                    let manager = Arc::clone(&self);
                    tokio::spawn(async move {
                        manager.handle(stream, peer.to_string()).await;
                    });
                }
                #[cfg(unix)]
                Listener::Unix(unix) => {
                    let (stream, _) = unix.accept().await?;
                    let manager = Arc::clone(&self);
                    tokio::spawn(async move {
                        manager.handle(stream, "unix".to_string()).await;
                    });
                }
            }
        }
    }

    async fn handle<S>(self: Arc<Self>, mut stream: S, peer: String)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (connect_req_id, info) = match self.handshake(&mut stream, &peer).await {
            Some(accepted) => accepted,
            None => return,
        };
        let conn_id = info.id;

        if let Some(existing) = self.conns.get(conn_id) {
            tracing::warn!(conn_id, "existing connection found, stopping it");
            existing.stop().await;
        }

        let handler =
            ConnectionHandler::new(stream, info.clone(), Role::Server, Arc::clone(&self.registry));
        self.conns.insert(conn_id, Arc::clone(&handler));

        if let Err(e) = handler.respond(connect_req_id, Response::ConnectOk, b"").await {
            tracing::warn!(conn_id, peer = %peer, error = %e, "failed to confirm handshake");
            self.conns.remove_if_same(conn_id, &handler);
            handler.disconnect().await;
            return;
        }
        tracing::info!(conn = %info.name, conn_id, peer = %peer, "worker connected");

        handler.run().await;

        self.conns.remove_if_same(conn_id, &handler);
        tracing::info!(conn = %info.name, conn_id, "worker disconnected");
    }

    /// Read and validate the CONNECT frame. On any violation the
    /// specific error is written back and `None` returned; the caller
    /// drops the socket.
    async fn handshake<S>(&self, stream: &mut S, peer: &str) -> Option<(i32, ConnInfo)>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let frame = match proto::read_frame(stream).await {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(peer = %peer, error = %e, "connection lost before handshake");
                return None;
            }
        };
        let req_id = frame.request_id;

        if frame.action != Action::Command(Command::Connect) {
            self.reject(stream, req_id, peer, "expected connect command").await;
            return None;
        }
        let text = match std::str::from_utf8(&frame.payload) {
            Ok(text) => text,
            Err(_) => {
                self.reject(stream, req_id, peer, "invalid connect payload: not utf-8").await;
                return None;
            }
        };
        let parts: Vec<&str> = text.split(';').collect();
        if parts.len() != 3 {
            self.reject(stream, req_id, peer, "invalid connect payload: part count != 3").await;
            return None;
        }
        let conn_id: i32 = match parts[0].parse() {
            Ok(id) => id,
            Err(_) => {
                self.reject(
                    stream,
                    req_id,
                    peer,
                    "invalid connect payload: connection ID not an integer",
                )
                .await;
                return None;
            }
        };
        let callback = match Url::parse(parts[2]) {
            Ok(url) => url,
            Err(_) => {
                self.reject(
                    stream,
                    req_id,
                    peer,
                    "invalid connect payload: bad callback address",
                )
                .await;
                return None;
            }
        };

        Some((
            req_id,
            ConnInfo {
                id: conn_id,
                name: parts[1].to_string(),
                callback,
            },
        ))
    }

    async fn reject<S>(&self, stream: &mut S, req_id: i32, peer: &str, message: &str)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        tracing::warn!(peer = %peer, reason = message, "rejecting handshake");
        let _ = proto::write_frame(
            stream,
            req_id,
            Action::Response(Response::Error),
            message.as_bytes(),
        )
        .await;
    }

    /// Graceful shutdown: QUIT to every worker, then close everything.
    pub async fn close_all(&self) {
        let conns = self.conns.all();
        tracing::debug!(count = conns.len(), "disconnecting all workers");
        futures::future::join_all(conns.iter().map(|conn| conn.send(Command::Quit, Bytes::new())))
            .await;
        futures::future::join_all(conns.iter().map(|conn| conn.disconnect())).await;
    }
}
