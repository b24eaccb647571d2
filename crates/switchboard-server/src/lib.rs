//! Central coordination server for sharded bridge workers.
//!
//! One [`Coordinator`] owns all shared state (lock table, dedup
//! caches, connection registry) and wires the handler set into a
//! command registry; multiple independent instances can coexist in one
//! process, which is how the tests run whole servers on port 0.

pub mod dedup;
pub mod locks;
pub mod manager;
pub mod proxy;
pub mod txn_mux;

use std::sync::Arc;

use tokio::task::JoinHandle;

use switchboard_core::CommandRegistry;

pub use dedup::{DedupCache, CACHE_QUEUE_LENGTH};
pub use locks::LockService;
pub use manager::{BindAddr, ConnectionManager, ConnectionMap, Listener};
pub use proxy::ProxyService;
pub use txn_mux::TxnMux;

/// A fully wired server instance.
pub struct Coordinator {
    conns: Arc<ConnectionMap>,
    locks: Arc<LockService>,
    dedup: Arc<DedupCache>,
    registry: Arc<CommandRegistry>,
    manager: Arc<ConnectionManager>,
}

impl Coordinator {
    pub fn new() -> Self {
        Self::with_app_handlers(|_| {})
    }

    /// Build a coordinator, letting the caller install additional
    /// handlers (application commands) before the registry freezes.
    pub fn with_app_handlers(install: impl FnOnce(&mut CommandRegistry)) -> Self {
        let conns = Arc::new(ConnectionMap::new());
        let locks = Arc::new(LockService::new());
        let dedup = Arc::new(DedupCache::new());

        let mut registry = CommandRegistry::new();
        Arc::clone(&locks).register(&mut registry);
        Arc::clone(&dedup).register(&mut registry);
        ProxyService::new(Arc::clone(&conns)).register(&mut registry);
        install(&mut registry);
        let registry = Arc::new(registry);

        let manager = ConnectionManager::new(Arc::clone(&conns), Arc::clone(&registry));
        Self {
            conns,
            locks,
            dedup,
            registry,
            manager,
        }
    }

    pub fn manager(&self) -> Arc<ConnectionManager> {
        Arc::clone(&self.manager)
    }

    pub fn conns(&self) -> &Arc<ConnectionMap> {
        &self.conns
    }

    pub fn locks(&self) -> &Arc<LockService> {
        &self.locks
    }

    pub fn dedup(&self) -> &Arc<DedupCache> {
        &self.dedup
    }

    pub fn registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    /// Bind and spawn the accept loop. Returns the resolved listen
    /// address and the serving task; the task resolves with an error
    /// only on a fatal accept-loop failure.
    pub async fn spawn_listener(
        &self,
        addr: &BindAddr,
    ) -> std::io::Result<(String, JoinHandle<std::io::Result<()>>)> {
        let listener = Listener::bind(addr).await?;
        let local = listener.local_addr();
        let manager = Arc::clone(&self.manager);
        let task = tokio::spawn(manager.serve(listener));
        Ok((local, task))
    }

    /// Spawn the transaction multiplexer on `addr`.
    pub async fn spawn_txn_mux(
        &self,
        addr: &str,
    ) -> std::io::Result<(std::net::SocketAddr, JoinHandle<std::io::Result<()>>)> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let mux = TxnMux::new(Arc::clone(&self.conns));
        let task = tokio::spawn(mux.serve(listener));
        Ok((local, task))
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}
