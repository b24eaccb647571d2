//! Per-socket connection handler: framing, request/response
//! correlation, and command dispatch for one full-duplex connection.
//!
//! The same type serves both ends: the server wraps every accepted
//! socket in one, the worker client wraps its dialed socket in one.
//! Either side may originate requests toward the other, so request ids
//! are sign-partitioned by role: the client counts up from 1, the
//! server counts down from -1, and the two spaces never collide.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{CallError, ProtoError};
use crate::proto::{self, Action, Command, Frame, Response};
use crate::registry::{CommandRegistry, Reply};

/// Default deadline for a correlated call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Which end of the connection this handler plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Identity fixed at the CONNECT handshake, immutable afterwards.
#[derive(Debug, Clone)]
pub struct ConnInfo {
    pub id: i32,
    pub name: String,
    pub callback: Url,
}

impl ConnInfo {
    pub fn new(
        id: i32,
        name: impl Into<String>,
        callback: &str,
    ) -> Result<Self, url::ParseError> {
        Ok(Self {
            id,
            name: name.into(),
            callback: Url::parse(callback)?,
        })
    }

    /// Handshake payload: `"{id};{name};{callback}"`.
    pub fn handshake_payload(&self) -> Bytes {
        format!("{};{};{}", self.id, self.name, self.callback).into()
    }
}

/// Options for [`ConnectionHandler::call_with`].
#[derive(Clone, Debug)]
pub struct CallOptions {
    pub timeout: Duration,
    /// When set, any response outside this set fails the call.
    pub expected: Option<Vec<Response>>,
    /// When set, a generic `ERROR` response fails the call. Proxying
    /// turns this off to relay error responses verbatim.
    pub check_error: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CALL_TIMEOUT,
            expected: None,
            check_error: true,
        }
    }
}

impl CallOptions {
    pub fn expecting(responses: &[Response]) -> Self {
        Self {
            expected: Some(responses.to_vec()),
            ..Self::default()
        }
    }

    pub fn unchecked() -> Self {
        Self {
            check_error: false,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// One live connection: owns the socket halves, the pending-call
/// table, and the dispatch loop.
pub struct ConnectionHandler {
    info: ConnInfo,
    role: Role,
    registry: Arc<CommandRegistry>,
    reader: Mutex<BoxedReader>,
    writer: Mutex<BoxedWriter>,
    pending: DashMap<i32, oneshot::Sender<(Response, Bytes)>>,
    handler_tasks: DashMap<i32, JoinHandle<()>>,
    req_id: AtomicI32,
    listening: AtomicBool,
    closed: AtomicBool,
    cancel: CancellationToken,
    loop_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    me: Weak<ConnectionHandler>,
}

impl ConnectionHandler {
    pub fn new<S>(
        stream: S,
        info: ConnInfo,
        role: Role,
        registry: Arc<CommandRegistry>,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Arc::new_cyclic(|me| Self {
            info,
            role,
            registry,
            reader: Mutex::new(Box::new(reader)),
            writer: Mutex::new(Box::new(writer)),
            pending: DashMap::new(),
            handler_tasks: DashMap::new(),
            req_id: AtomicI32::new(0),
            listening: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            loop_task: parking_lot::Mutex::new(None),
            me: me.clone(),
        })
    }

    pub fn id(&self) -> i32 {
        self.info.id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn callback(&self) -> &Url {
        &self.info.callback
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Outstanding outbound calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    fn arc(&self) -> Arc<Self> {
        // &self guarantees a live strong reference
        self.me.upgrade().expect("connection handler upgraded from live reference")
    }

    fn next_req_id(&self) -> i32 {
        match self.role {
            Role::Client => self.req_id.fetch_add(1, Ordering::SeqCst) + 1,
            Role::Server => self.req_id.fetch_sub(1, Ordering::SeqCst) - 1,
        }
    }

    /// Issue a call with default options.
    pub async fn call(
        &self,
        command: Command,
        payload: Bytes,
    ) -> Result<(Response, Bytes), CallError> {
        self.call_with(command, payload, CallOptions::default()).await
    }

    /// Issue a call that must be answered by one of `expected`.
    pub async fn call_expecting(
        &self,
        command: Command,
        payload: Bytes,
        expected: &[Response],
    ) -> Result<(Response, Bytes), CallError> {
        self.call_with(command, payload, CallOptions::expecting(expected))
            .await
    }

    /// Issue a call and await its correlated response.
    pub async fn call_with(
        &self,
        command: Command,
        payload: Bytes,
        options: CallOptions,
    ) -> Result<(Response, Bytes), CallError> {
        if self.is_closed() {
            return Err(CallError::ConnectionClosed);
        }
        let req_id = self.next_req_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(req_id, tx);

        if let Err(e) = self.write_action(req_id, Action::Command(command), &payload).await {
            self.pending.remove(&req_id);
            return Err(e.into());
        }

        // Without a running dispatch loop (handshake time) the response
        // still has to be read from the socket.
        if !self.listening.load(Ordering::SeqCst) {
            let me = self.arc();
            tokio::spawn(async move {
                tokio::select! {
                    _ = me.read_one() => {}
                    _ = me.cancel.cancelled() => {}
                }
            });
        }

        let (response, payload) = match tokio::time::timeout(options.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => return Err(CallError::ConnectionClosed),
            Err(_) => {
                self.pending.remove(&req_id);
                return Err(CallError::Timeout(options.timeout));
            }
        };

        if options.check_error {
            if response == Response::Error {
                return Err(CallError::Server(payload));
            }
            if let Some(expected) = &options.expected {
                if !expected.contains(&response) {
                    return Err(CallError::UnexpectedResponse { response, payload });
                }
            }
        }
        Ok((response, payload))
    }

    /// Fire-and-forget: request id 0, no response tracked.
    pub async fn send(&self, command: Command, payload: Bytes) -> Result<(), CallError> {
        if self.is_closed() {
            return Err(CallError::ConnectionClosed);
        }
        self.write_action(0, Action::Command(command), &payload).await?;
        Ok(())
    }

    /// Write a response frame for the given request id.
    pub async fn respond(
        &self,
        req_id: i32,
        response: Response,
        payload: &[u8],
    ) -> Result<(), ProtoError> {
        self.write_action(req_id, Action::Response(response), payload).await
    }

    async fn write_action(
        &self,
        req_id: i32,
        action: Action,
        payload: &[u8],
    ) -> Result<(), ProtoError> {
        let mut writer = self.writer.lock().await;
        proto::write_frame(&mut *writer, req_id, action, payload).await
    }

    /// Read and process a single frame. Returns `true` when the
    /// connection should stop (closed, read error, or QUIT).
    async fn read_one(&self) -> bool {
        let frame = {
            let mut reader = self.reader.lock().await;
            match proto::read_frame(&mut *reader).await {
                Ok(frame) => frame,
                Err(ProtoError::ConnectionClosed) => {
                    tracing::debug!(conn = %self.info.name, "connection closed by peer");
                    return true;
                }
                Err(e) => {
                    tracing::warn!(conn = %self.info.name, error = %e, "read failed, disconnecting");
                    return true;
                }
            }
        };
        self.process_frame(frame)
    }

    fn process_frame(&self, frame: Frame) -> bool {
        match frame.action {
            Action::Command(Command::Quit) => {
                tracing::info!(conn = %self.info.name, "received QUIT, disconnecting");
                true
            }
            Action::Command(command) => {
                tracing::debug!(
                    conn = %self.info.name,
                    req_id = frame.request_id,
                    command = %command,
                    "received command"
                );
                let me = self.arc();
                let req_id = frame.request_id;
                let task = tokio::spawn(async move {
                    me.run_handler(req_id, command, frame.payload).await;
                });
                if req_id != 0 {
                    self.handler_tasks.insert(req_id, task);
                }
                false
            }
            Action::Response(response) => {
                if frame.request_id == 0 {
                    tracing::warn!(
                        conn = %self.info.name,
                        response = %response,
                        "response with request id 0, ignoring"
                    );
                    return false;
                }
                match self.pending.remove(&frame.request_id) {
                    Some((_, tx)) => {
                        tracing::debug!(
                            conn = %self.info.name,
                            req_id = frame.request_id,
                            response = %response,
                            "received response"
                        );
                        let _ = tx.send((response, frame.payload));
                    }
                    None => {
                        tracing::warn!(
                            conn = %self.info.name,
                            req_id = frame.request_id,
                            "response for unknown request, ignoring"
                        );
                    }
                }
                false
            }
        }
    }

    async fn run_handler(self: Arc<Self>, req_id: i32, command: Command, payload: Bytes) {
        let handler = self
            .registry
            .get(command)
            .or_else(|| self.registry.get(Command::Unknown));
        let reply = match handler {
            Some(handler) => match handler.handle(&self, payload).await {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::error!(
                        conn = %self.info.name,
                        command = %command,
                        error = %e,
                        "command handler failed"
                    );
                    Reply::error("internal error")
                }
            },
            None => Reply::error("unknown command"),
        };
        if req_id != 0 {
            if let Err(e) = self.respond(req_id, reply.response, &reply.payload).await {
                tracing::warn!(
                    conn = %self.info.name,
                    req_id,
                    error = %e,
                    "failed to write handler response"
                );
            }
            self.handler_tasks.remove(&req_id);
        }
    }

    /// Run the dispatch loop until the connection closes, QUIT
    /// arrives, or the handler is stopped, then disconnect.
    pub async fn run(&self) {
        if self.listening.swap(true, Ordering::SeqCst) {
            tracing::warn!(conn = %self.info.name, "dispatch loop already running");
            return;
        }
        loop {
            tokio::select! {
                stop = self.read_one() => {
                    if stop {
                        break;
                    }
                }
                _ = self.cancel.cancelled() => {
                    break;
                }
            }
        }
        self.listening.store(false, Ordering::SeqCst);
        self.disconnect().await;
    }

    /// Spawn the dispatch loop as a background task.
    pub fn start(&self) {
        let me = self.arc();
        let task = tokio::spawn(async move {
            me.run().await;
        });
        *self.loop_task.lock() = Some(task);
    }

    /// Abort the dispatch loop and tear the connection down.
    pub async fn stop(&self) {
        if let Some(task) = self.loop_task.lock().take() {
            task.abort();
        }
        self.disconnect().await;
    }

    /// Cancel pending calls and in-flight handlers, close the socket.
    /// Idempotent.
    pub async fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(conn = %self.info.name, "disconnecting");
        self.cancel.cancel();
        // Dropping the senders fails every awaiting call with a
        // connection-closed error.
        self.pending.clear();
        let in_flight: Vec<i32> = self.handler_tasks.iter().map(|e| *e.key()).collect();
        for req_id in in_flight {
            if let Some((_, task)) = self.handler_tasks.remove(&req_id) {
                task.abort();
            }
        }
        use tokio::io::AsyncWriteExt;
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            tracing::debug!(conn = %self.info.name, error = %e, "error closing write half");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use std::collections::HashSet;

    fn echo_registry() -> Arc<CommandRegistry> {
        let mut registry = CommandRegistry::new();
        registry.register_fn(Command::App(64), |_conn, payload| async move {
            Ok(Reply::new(Response::CallOk, payload))
        });
        registry.register_fn(Command::App(65), |_conn, _payload| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Reply::from(Response::CallOk))
        });
        registry.register_fn(Command::App(66), |_conn, _payload| async move {
            Err::<Reply, _>(HandlerError::Fault("boom".into()))
        });
        Arc::new(registry)
    }

    fn info(id: i32, name: &str) -> ConnInfo {
        ConnInfo::new(id, name, "http://localhost:8080").unwrap()
    }

    fn pair() -> (Arc<ConnectionHandler>, Arc<ConnectionHandler>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = ConnectionHandler::new(
            a,
            info(1, "worker-1"),
            Role::Client,
            Arc::new(CommandRegistry::new()),
        );
        let server = ConnectionHandler::new(b, info(1, "worker-1"), Role::Server, echo_registry());
        client.start();
        server.start();
        (client, server)
    }

    #[test]
    fn request_ids_are_sign_partitioned_by_role() {
        let (a, _keep) = tokio::io::duplex(64);
        let client =
            ConnectionHandler::new(a, info(1, "c"), Role::Client, Arc::new(CommandRegistry::new()));
        assert_eq!(client.next_req_id(), 1);
        assert_eq!(client.next_req_id(), 2);

        let (b, _keep) = tokio::io::duplex(64);
        let server =
            ConnectionHandler::new(b, info(1, "s"), Role::Server, Arc::new(CommandRegistry::new()));
        assert_eq!(server.next_req_id(), -1);
        assert_eq!(server.next_req_id(), -2);
    }

    #[tokio::test]
    async fn call_correlates_response() {
        let (client, _server) = pair();
        let (resp, payload) = client
            .call(Command::App(64), Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert_eq!(resp, Response::CallOk);
        assert_eq!(&payload[..], b"hello");
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn concurrent_calls_get_unique_ids_and_correct_payloads() {
        let (client, _server) = pair();
        let client = &client;

        let calls = (0u32..32).map(|i| async move {
            let body = format!("payload-{i}");
            let (resp, payload) = client
                .call(Command::App(64), Bytes::from(body.clone()))
                .await
                .unwrap();
            assert_eq!(resp, Response::CallOk);
            assert_eq!(&payload[..], body.as_bytes());
        });
        futures::future::join_all(calls).await;

        // every id must have been distinct for all calls to resolve
        let mut seen = HashSet::new();
        for _ in 0..32 {
            assert!(seen.insert(client.next_req_id()));
        }
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn call_timeout_removes_pending_entry() {
        let (client, _server) = pair();
        let err = client
            .call_with(
                Command::App(65),
                Bytes::new(),
                CallOptions::default().with_timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Timeout(_)));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn error_response_fails_the_call() {
        let (client, _server) = pair();
        // Lock is unregistered on the peer, so the unknown-command
        // default answers with ERROR.
        let err = client
            .call(Command::Lock, Bytes::from_static(b"k"))
            .await
            .unwrap_err();
        match err {
            CallError::Server(payload) => assert_eq!(&payload[..], b"unknown command"),
            other => panic!("expected server error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn handler_fault_surfaces_as_opaque_internal_error() {
        let (client, _server) = pair();
        let err = client.call(Command::App(66), Bytes::new()).await.unwrap_err();
        match err {
            CallError::Server(payload) => assert_eq!(&payload[..], b"internal error"),
            other => panic!("expected server error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unexpected_response_fails_the_call() {
        let (client, _server) = pair();
        let err = client
            .call_expecting(Command::App(64), Bytes::new(), &[Response::Locked])
            .await
            .unwrap_err();
        match err {
            CallError::UnexpectedResponse { response, .. } => {
                assert_eq!(response, Response::CallOk);
            }
            other => panic!("expected unexpected-response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unchecked_call_relays_error_responses() {
        let (client, _server) = pair();
        let (resp, payload) = client
            .call_with(Command::Lock, Bytes::new(), CallOptions::unchecked())
            .await
            .unwrap();
        assert_eq!(resp, Response::Error);
        assert_eq!(&payload[..], b"unknown command");
    }

    #[tokio::test]
    async fn fire_and_forget_tracks_nothing() {
        let (client, _server) = pair();
        client.send(Command::App(64), Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn peer_disconnect_cancels_pending_calls() {
        let (client, server) = pair();
        let call = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.call(Command::App(65), Bytes::new()).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.stop().await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, CallError::ConnectionClosed));
        assert_eq!(client.pending_calls(), 0);
    }

    #[tokio::test]
    async fn quit_stops_the_dispatch_loop() {
        let (client, server) = pair();
        client.send(Command::Quit, Bytes::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(server.is_closed());
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let (client, _server) = pair();
        client.disconnect().await;
        client.disconnect().await;
        assert!(client.is_closed());
        assert!(matches!(
            client.call(Command::App(64), Bytes::new()).await,
            Err(CallError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn call_without_dispatch_loop_reads_its_own_response() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let client = ConnectionHandler::new(
            a,
            info(1, "worker-1"),
            Role::Client,
            Arc::new(CommandRegistry::new()),
        );
        let server = ConnectionHandler::new(b, info(1, "worker-1"), Role::Server, echo_registry());
        server.start();
        // client never calls start(): the handshake-style single read
        // must still complete the call
        let (resp, payload) = client
            .call(Command::App(64), Bytes::from_static(b"hi"))
            .await
            .unwrap();
        assert_eq!(resp, Response::CallOk);
        assert_eq!(&payload[..], b"hi");
    }
}
