//! Command registry: the table mapping command codes to async
//! handlers, shared by one server or client process.
//!
//! Built mutably at startup, then frozen behind an `Arc` and handed to
//! every connection. The surrounding bridge installs its own handlers
//! for [`Command::App`] codes through [`CommandRegistry::register_fn`]
//! or [`CommandRegistry::register_structured`]; the core routes them
//! without knowing what they mean.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::conn::ConnectionHandler;
use crate::error::{HandlerError, RemoteError};
use crate::proto::{Command, Response};

/// What a handler gives back: a response code plus optional payload.
#[derive(Debug, Clone)]
pub struct Reply {
    pub response: Response,
    pub payload: Bytes,
}

impl Reply {
    pub fn new(response: Response, payload: impl Into<Bytes>) -> Self {
        Self {
            response,
            payload: payload.into(),
        }
    }

    pub fn error(message: &'static str) -> Self {
        Self::new(Response::Error, Bytes::from_static(message.as_bytes()))
    }
}

impl From<Response> for Reply {
    fn from(response: Response) -> Self {
        Self {
            response,
            payload: Bytes::new(),
        }
    }
}

/// An async command handler. The connection argument identifies the
/// caller and lets handlers issue calls of their own (proxying).
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(
        &self,
        conn: &Arc<ConnectionHandler>,
        payload: Bytes,
    ) -> Result<Reply, HandlerError>;
}

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> CommandHandler for FnHandler<F>
where
    F: Fn(Arc<ConnectionHandler>, Bytes) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Reply, HandlerError>> + Send,
{
    async fn handle(
        &self,
        conn: &Arc<ConnectionHandler>,
        payload: Bytes,
    ) -> Result<Reply, HandlerError> {
        (self.f)(Arc::clone(conn), payload).await
    }
}

/// Registry of command handlers.
pub struct CommandRegistry {
    handlers: HashMap<Command, Arc<dyn CommandHandler>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
        };
        registry.register_fn(Command::Unknown, |_conn, _payload| async {
            Ok(Reply::error("unknown command"))
        });
        // CONNECT is only valid as the first frame; the handshake path
        // consumes it before dispatch ever sees one.
        registry.register_fn(Command::Connect, |_conn, _payload| async {
            Ok(Reply::error("received duplicate connect command"))
        });
        registry
    }

    /// Register a raw byte-payload handler.
    pub fn register(&mut self, command: Command, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(command, handler);
    }

    /// Register a raw handler from an async closure.
    pub fn register_fn<F, Fut>(&mut self, command: Command, f: F)
    where
        F: Fn(Arc<ConnectionHandler>, Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Reply, HandlerError>> + Send + 'static,
    {
        self.register(command, Arc::new(FnHandler { f }));
    }

    /// Register a structured handler: the payload is deserialized into
    /// `Req`, the return value serialized back. A [`RemoteError`] from
    /// the handler travels as [`Response::CallError`] so the caller can
    /// re-raise it; any other failure is an infrastructure fault and
    /// surfaces to the peer as an opaque internal error.
    pub fn register_structured<Req, Resp, F, Fut>(&mut self, command: Command, f: F)
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, RemoteError>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.register_fn(command, move |_conn, payload: Bytes| {
            let f = Arc::clone(&f);
            async move {
                let req: Req = serde_json::from_slice(&payload)
                    .map_err(|e| HandlerError::Fault(format!("structured payload decode: {e}")))?;
                match f(req).await {
                    Ok(resp) => {
                        let body = serde_json::to_vec(&resp).map_err(|e| {
                            HandlerError::Fault(format!("structured reply encode: {e}"))
                        })?;
                        Ok(Reply::new(Response::CallOk, body))
                    }
                    Err(err) => {
                        let body = serde_json::to_vec(&err)
                            .map_err(|e| HandlerError::Fault(format!("error encode: {e}")))?;
                        Ok(Reply::new(Response::CallError, body))
                    }
                }
            }
        });
    }

    /// Look up the handler for a command.
    pub fn get(&self, command: Command) -> Option<Arc<dyn CommandHandler>> {
        self.handlers.get(&command).cloned()
    }

    pub fn contains(&self, command: Command) -> bool {
        self.handlers.contains_key(&command)
    }

    pub fn count(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{ConnInfo, ConnectionHandler, Role};
    use serde::Deserialize;

    fn test_conn(registry: Arc<CommandRegistry>) -> Arc<ConnectionHandler> {
        let (stream, _peer) = tokio::io::duplex(1024);
        ConnectionHandler::new(
            stream,
            ConnInfo::new(1, "test", "http://localhost:8080").unwrap(),
            Role::Client,
            registry,
        )
    }

    #[tokio::test]
    async fn default_unknown_handler_replies_error() {
        let registry = Arc::new(CommandRegistry::new());
        let conn = test_conn(Arc::clone(&registry));

        let handler = registry.get(Command::Unknown).unwrap();
        let reply = handler.handle(&conn, Bytes::new()).await.unwrap();
        assert_eq!(reply.response, Response::Error);
        assert_eq!(&reply.payload[..], b"unknown command");
    }

    #[tokio::test]
    async fn duplicate_connect_replies_error() {
        let registry = Arc::new(CommandRegistry::new());
        let conn = test_conn(Arc::clone(&registry));

        let handler = registry.get(Command::Connect).unwrap();
        let reply = handler.handle(&conn, Bytes::new()).await.unwrap();
        assert_eq!(reply.response, Response::Error);
        assert_eq!(&reply.payload[..], b"received duplicate connect command");
    }

    #[tokio::test]
    async fn registered_fn_handler_sees_payload() {
        let mut registry = CommandRegistry::new();
        registry.register_fn(Command::app(64).unwrap(), |_conn, payload| async move {
            let mut echoed = payload.to_vec();
            echoed.reverse();
            Ok(Reply::new(Response::CallOk, echoed))
        });
        let registry = Arc::new(registry);
        let conn = test_conn(Arc::clone(&registry));

        let handler = registry.get(Command::App(64)).unwrap();
        let reply = handler
            .handle(&conn, Bytes::from_static(b"abc"))
            .await
            .unwrap();
        assert_eq!(reply.response, Response::CallOk);
        assert_eq!(&reply.payload[..], b"cba");
    }

    #[derive(Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    #[derive(Serialize, Deserialize)]
    struct Pong {
        seq: u32,
    }

    #[tokio::test]
    async fn structured_handler_roundtrip() {
        let mut registry = CommandRegistry::new();
        registry.register_structured(Command::App(65), |req: Ping| async move {
            Ok(Pong { seq: req.seq + 1 })
        });
        let registry = Arc::new(registry);
        let conn = test_conn(Arc::clone(&registry));

        let payload = serde_json::to_vec(&Ping { seq: 9 }).unwrap();
        let handler = registry.get(Command::App(65)).unwrap();
        let reply = handler.handle(&conn, payload.into()).await.unwrap();
        assert_eq!(reply.response, Response::CallOk);
        let pong: Pong = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(pong.seq, 10);
    }

    #[tokio::test]
    async fn structured_handler_domain_error_travels_as_call_error() {
        let mut registry = CommandRegistry::new();
        registry.register_structured(Command::App(66), |_req: Ping| async move {
            Err::<Pong, _>(RemoteError::new("not_here", "user not in this bucket"))
        });
        let registry = Arc::new(registry);
        let conn = test_conn(Arc::clone(&registry));

        let payload = serde_json::to_vec(&Ping { seq: 0 }).unwrap();
        let handler = registry.get(Command::App(66)).unwrap();
        let reply = handler.handle(&conn, payload.into()).await.unwrap();
        assert_eq!(reply.response, Response::CallError);
        let err: RemoteError = serde_json::from_slice(&reply.payload).unwrap();
        assert_eq!(err.kind, "not_here");
    }

    #[tokio::test]
    async fn structured_handler_bad_payload_is_a_fault() {
        let mut registry = CommandRegistry::new();
        registry.register_structured(Command::App(67), |req: Ping| async move {
            Ok(Pong { seq: req.seq })
        });
        let registry = Arc::new(registry);
        let conn = test_conn(Arc::clone(&registry));

        let handler = registry.get(Command::App(67)).unwrap();
        let result = handler
            .handle(&conn, Bytes::from_static(b"not json"))
            .await;
        assert!(matches!(result, Err(HandlerError::Fault(_))));
    }

    #[test]
    fn unregistered_command_is_absent() {
        let registry = CommandRegistry::new();
        assert!(registry.get(Command::Lock).is_none());
        assert!(registry.contains(Command::Unknown));
    }
}
