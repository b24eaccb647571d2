//! Transaction multiplexer: the one HTTP surface of the server.
//!
//! The homeserver delivers each transaction once, to this listener;
//! the body is fanned out via HTTP PUT to every connected worker's
//! callback address so all buckets see it. Individual forward failures
//! are logged and swallowed, the sender always gets an empty OK.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::put;
use axum::{Json, Router};
use bytes::Bytes;
use url::Url;

use crate::manager::ConnectionMap;

pub struct TxnMux {
    conns: Arc<ConnectionMap>,
    http: reqwest::Client,
}

impl TxnMux {
    pub fn new(conns: Arc<ConnectionMap>) -> Arc<Self> {
        Arc::new(Self {
            conns,
            http: reqwest::Client::new(),
        })
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/transactions/{txn_id}", put(mux_txn))
            .with_state(self)
    }

    /// Serve on an already-bound listener until the task is dropped.
    pub async fn serve(self: Arc<Self>, listener: tokio::net::TcpListener) -> std::io::Result<()> {
        axum::serve(listener, self.router()).await
    }
}

async fn mux_txn(
    State(mux): State<Arc<TxnMux>>,
    Path(txn_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Json<serde_json::Value> {
    let token = params.get("access_token");
    let forwards = mux.conns.all().into_iter().map(|conn| {
        let url = transactions_url(conn.callback(), &txn_id, token);
        let http = mux.http.clone();
        let body = body.clone();
        let name = conn.name().to_string();
        async move {
            let Some(url) = url else {
                tracing::warn!(conn = %name, "callback address cannot take a transactions path");
                return;
            };
            if let Err(e) = http.put(url).body(body).send().await {
                tracing::warn!(conn = %name, error = %e, "transaction forward failed");
            }
        }
    });
    futures::future::join_all(forwards).await;
    Json(serde_json::json!({}))
}

fn transactions_url(base: &Url, txn_id: &str, token: Option<&String>) -> Option<Url> {
    let mut url = base.clone();
    {
        let mut segments = url.path_segments_mut().ok()?;
        segments.pop_if_empty();
        segments.push("transactions");
        segments.push(txn_id);
    }
    if let Some(token) = token {
        url.query_pairs_mut().append_pair("access_token", token);
    }
    Some(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use switchboard_core::{CommandRegistry, ConnInfo, ConnectionHandler, Role};

    #[test]
    fn transactions_url_joins_path_and_token() {
        let base = Url::parse("http://localhost:29317").unwrap();
        let url = transactions_url(&base, "txn%201", Some(&"secret".to_string())).unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:29317/transactions/txn%25201?access_token=secret"
        );

        let base = Url::parse("http://localhost:29317/prefix/").unwrap();
        let url = transactions_url(&base, "t1", None).unwrap();
        assert_eq!(url.as_str(), "http://localhost:29317/prefix/transactions/t1");
    }

    /// Tiny callback receiver recording every PUT it sees.
    async fn spawn_receiver() -> (String, Arc<parking_lot::Mutex<Vec<(String, String)>>>) {
        let seen: Arc<parking_lot::Mutex<Vec<(String, String)>>> =
            Arc::new(parking_lot::Mutex::new(Vec::new()));
        let state = Arc::clone(&seen);
        let app = Router::new().route(
            "/transactions/{txn_id}",
            put(move |Path(txn_id): Path<String>, body: String| {
                let state = Arc::clone(&state);
                async move {
                    state.lock().push((txn_id, body));
                    Json(serde_json::json!({}))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        (format!("http://{addr}"), seen)
    }

    fn fake_conn(id: i32, callback: &str) -> Arc<ConnectionHandler> {
        let (stream, _peer) = tokio::io::duplex(1024);
        ConnectionHandler::new(
            stream,
            ConnInfo::new(id, format!("worker-{id}"), callback).unwrap(),
            Role::Server,
            Arc::new(CommandRegistry::new()),
        )
    }

    #[tokio::test]
    async fn transactions_fan_out_to_every_worker() {
        let (addr_a, seen_a) = spawn_receiver().await;
        let (addr_b, seen_b) = spawn_receiver().await;

        let conns = Arc::new(ConnectionMap::new());
        conns.insert(1, fake_conn(1, &addr_a));
        conns.insert(2, fake_conn(2, &addr_b));

        let mux = TxnMux::new(Arc::clone(&conns));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mux_addr = listener.local_addr().unwrap();
        tokio::spawn(mux.serve(listener));

        let client = reqwest::Client::new();
        let resp = client
            .put(format!("http://{mux_addr}/transactions/txn-1?access_token=tok"))
            .body("transaction body")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        tokio::time::sleep(Duration::from_millis(100)).await;
        for seen in [&seen_a, &seen_b] {
            let entries = seen.lock();
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0], ("txn-1".to_string(), "transaction body".to_string()));
        }
    }

    #[tokio::test]
    async fn unreachable_callback_does_not_fail_the_request() {
        let conns = Arc::new(ConnectionMap::new());
        // nothing listens on this port
        conns.insert(1, fake_conn(1, "http://127.0.0.1:9"));

        let mux = TxnMux::new(conns);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mux_addr = listener.local_addr().unwrap();
        tokio::spawn(mux.serve(listener));

        let resp = reqwest::Client::new()
            .put(format!("http://{mux_addr}/transactions/txn-2"))
            .body("x")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }
}
