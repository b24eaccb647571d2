//! Request proxying and fan-out between workers.
//!
//! PROXY forwards one inner command to the connection that owns a
//! piece of state; BROADCAST fans it out to every live connection.
//! Inner responses are relayed verbatim, errors included, so the
//! caller sees exactly what the target answered.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;

use crate::manager::ConnectionMap;
use switchboard_core::{
    BroadcastEntry, BroadcastReply, CallOptions, Command, CommandRegistry, ConnectionHandler,
    HandlerError, Reply, Response,
};

/// PROXY sub-header: target conn id (i32 BE) + inner command (i8).
pub const PROXY_HEADER_LEN: usize = 5;
/// BROADCAST sub-header: inner command (i8) + include_self (u8).
pub const BROADCAST_HEADER_LEN: usize = 2;

pub struct ProxyService {
    conns: Arc<ConnectionMap>,
}

impl ProxyService {
    pub fn new(conns: Arc<ConnectionMap>) -> Self {
        Self { conns }
    }

    /// Install the PROXY / BROADCAST handlers.
    pub fn register(self, registry: &mut CommandRegistry) {
        let svc = Arc::new(self);
        let proxy = Arc::clone(&svc);
        registry.register_fn(Command::Proxy, move |_conn, payload| {
            let svc = Arc::clone(&proxy);
            async move { svc.proxy(&payload).await }
        });
        registry.register_fn(Command::Broadcast, move |conn, payload| {
            let svc = Arc::clone(&svc);
            async move { svc.broadcast(&conn, &payload).await }
        });
    }

    async fn proxy(&self, payload: &Bytes) -> Result<Reply, HandlerError> {
        if payload.len() < PROXY_HEADER_LEN {
            return Ok(Reply::error("bad request"));
        }
        let target = i32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let command = match inner_command(payload[4] as i8) {
            Some(command) => command,
            None => return Ok(Reply::error("invalid command to proxy")),
        };
        let inner = payload.slice(PROXY_HEADER_LEN..);

        let conn = match self.conns.get(target) {
            Some(conn) => conn,
            None => return Ok(Reply::error("proxy target connection not found")),
        };
        // relay whatever comes back, error responses included
        let (response, data) = conn
            .call_with(command, inner, CallOptions::unchecked())
            .await?;
        Ok(Reply::new(response, data))
    }

    async fn broadcast(
        &self,
        sender: &Arc<ConnectionHandler>,
        payload: &Bytes,
    ) -> Result<Reply, HandlerError> {
        if payload.len() < BROADCAST_HEADER_LEN {
            return Ok(Reply::error("bad request"));
        }
        let command = match inner_command(payload[0] as i8) {
            Some(command) => command,
            None => return Ok(Reply::error("invalid command to broadcast")),
        };
        let include_self = payload[1] != 0;
        let inner = payload.slice(BROADCAST_HEADER_LEN..);

        let targets: Vec<Arc<ConnectionHandler>> = self
            .conns
            .all()
            .into_iter()
            .filter(|conn| include_self || !Arc::ptr_eq(conn, sender))
            .collect();

        let calls = targets.into_iter().map(|conn| {
            let inner = inner.clone();
            async move {
                let id = conn.id();
                let result = conn.call_with(command, inner, CallOptions::unchecked()).await;
                (id, result)
            }
        });
        let results = futures::future::join_all(calls).await;

        let mut responses = BTreeMap::new();
        for (id, result) in results {
            let entry = match result {
                Ok((response, data)) => BroadcastEntry::new(response, &data),
                Err(e) => {
                    tracing::warn!(target = id, error = %e, "broadcast target failed");
                    BroadcastEntry::new(Response::Error, e.to_string().as_bytes())
                }
            };
            responses.insert(id, entry);
        }

        let body = serde_json::to_vec(&BroadcastReply { responses })
            .map_err(|e| HandlerError::Fault(format!("broadcast reply encode: {e}")))?;
        Ok(Reply::new(Response::BroadcastResult, body))
    }
}

/// Validate an inner command code. `UNKNOWN` itself (code 0) stays
/// forwardable for diagnostics; codes that merely decode as unknown
/// are rejected here instead of being silently mangled.
fn inner_command(code: i8) -> Option<Command> {
    match Command::from_code(code) {
        Some(Command::Unknown) if code != 0 => None,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> ProxyService {
        ProxyService::new(Arc::new(ConnectionMap::new()))
    }

    #[tokio::test]
    async fn short_proxy_payload_is_a_bad_request() {
        let reply = service().proxy(&Bytes::from_static(b"abc")).await.unwrap();
        assert_eq!(reply.response, Response::Error);
        assert_eq!(&reply.payload[..], b"bad request");
    }

    #[tokio::test]
    async fn unassigned_inner_command_is_rejected() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1i32.to_be_bytes());
        payload.push(33); // unassigned, outside the app space
        let reply = service().proxy(&payload.into()).await.unwrap();
        assert_eq!(&reply.payload[..], b"invalid command to proxy");
    }

    #[tokio::test]
    async fn missing_target_is_reported() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&42i32.to_be_bytes());
        payload.push(Command::Lock.code() as u8);
        payload.extend_from_slice(b"key");
        let reply = service().proxy(&payload.into()).await.unwrap();
        assert_eq!(reply.response, Response::Error);
        assert_eq!(&reply.payload[..], b"proxy target connection not found");
    }

    #[tokio::test]
    async fn short_broadcast_payload_is_a_bad_request() {
        let sender = test_conn();
        let reply = service()
            .broadcast(&sender, &Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert_eq!(&reply.payload[..], b"bad request");
    }

    #[tokio::test]
    async fn broadcast_with_no_targets_returns_an_empty_map() {
        let sender = test_conn();
        let payload = Bytes::from_static(&[0, 0]); // UNKNOWN, include_self=false
        let reply = service().broadcast(&sender, &payload).await.unwrap();
        assert_eq!(reply.response, Response::BroadcastResult);
        let decoded: BroadcastReply = serde_json::from_slice(&reply.payload).unwrap();
        assert!(decoded.responses.is_empty());
    }

    fn test_conn() -> Arc<ConnectionHandler> {
        let (stream, _peer) = tokio::io::duplex(1024);
        ConnectionHandler::new(
            stream,
            switchboard_core::ConnInfo::new(1, "test", "http://localhost:1").unwrap(),
            switchboard_core::Role::Server,
            Arc::new(CommandRegistry::new()),
        )
    }

    #[test]
    fn inner_command_accepts_known_and_app_codes() {
        assert_eq!(inner_command(0), Some(Command::Unknown));
        assert_eq!(inner_command(3), Some(Command::Lock));
        assert_eq!(inner_command(64), Some(Command::App(64)));
        assert_eq!(inner_command(33), None);
        assert_eq!(inner_command(-1), None);
    }
}
