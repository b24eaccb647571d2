//! Distributed named locks.
//!
//! Workers serialize per-entity critical sections across processes by
//! locking an opaque byte key here. Lock objects are created lazily on
//! first acquisition and live for the server's lifetime; the key space
//! is bounded in practice (per-entity ids), so no eviction runs.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use switchboard_core::{Command, CommandRegistry, HandlerError, Reply, Response};

/// The shared lock table plus the permits currently held on behalf of
/// callers. A permit has to outlive the handler task that acquired it,
/// so grants are parked here until the matching UNLOCK arrives.
pub struct LockService {
    locks: DashMap<Bytes, Arc<Semaphore>>,
    held: DashMap<Bytes, OwnedSemaphorePermit>,
}

impl LockService {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
            held: DashMap::new(),
        }
    }

    /// Install the LOCK / OPTIONAL_LOCK / UNLOCK handlers.
    pub fn register(self: Arc<Self>, registry: &mut CommandRegistry) {
        let svc = Arc::clone(&self);
        registry.register_fn(Command::Lock, move |_conn, key| {
            let svc = Arc::clone(&svc);
            async move { svc.lock(key).await }
        });
        let svc = Arc::clone(&self);
        registry.register_fn(Command::OptionalLock, move |_conn, key| {
            let svc = Arc::clone(&svc);
            async move { svc.optional_lock(key).await }
        });
        let svc = self;
        registry.register_fn(Command::Unlock, move |_conn, key| {
            let svc = Arc::clone(&svc);
            async move { svc.unlock(&key) }
        });
    }

    /// Acquire the lock for `key`, creating it if absent. Blocks until
    /// the lock is free; runs in its own handler task, so the wait
    /// never stalls the connection's dispatch loop.
    pub async fn lock(&self, key: Bytes) -> Result<Reply, HandlerError> {
        let sem = {
            let entry = self
                .locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(1)));
            Arc::clone(entry.value())
        };
        let permit = sem
            .acquire_owned()
            .await
            .map_err(|_| HandlerError::Fault("lock semaphore closed".into()))?;
        self.held.insert(key, permit);
        Ok(Reply::from(Response::Locked))
    }

    /// Acquire only if a lock object already exists for `key`.
    pub async fn optional_lock(&self, key: Bytes) -> Result<Reply, HandlerError> {
        let sem = match self.locks.get(&key) {
            Some(entry) => Arc::clone(entry.value()),
            None => return Ok(Reply::from(Response::LockNotFound)),
        };
        let permit = sem
            .acquire_owned()
            .await
            .map_err(|_| HandlerError::Fault("lock semaphore closed".into()))?;
        self.held.insert(key, permit);
        Ok(Reply::from(Response::Locked))
    }

    /// Release the lock for `key`. Unlocking a key that is not held is
    /// a caller contract violation and answers with an explicit error.
    pub fn unlock(&self, key: &Bytes) -> Result<Reply, HandlerError> {
        if !self.locks.contains_key(key) {
            return Ok(Reply::error("unlock on unknown key"));
        }
        match self.held.remove(key) {
            Some((_, permit)) => {
                drop(permit);
                Ok(Reply::from(Response::Unlocked))
            }
            None => Ok(Reply::error("unlock on key that is not held")),
        }
    }

    /// Number of lock objects ever created.
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// Number of keys currently held.
    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}

impl Default for LockService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn lock_creates_lazily_and_grants() {
        let svc = LockService::new();
        assert_eq!(svc.lock_count(), 0);

        let reply = svc.lock(Bytes::from_static(b"entity-1")).await.unwrap();
        assert_eq!(reply.response, Response::Locked);
        assert_eq!(svc.lock_count(), 1);
        assert_eq!(svc.held_count(), 1);
    }

    #[tokio::test]
    async fn second_lock_blocks_until_unlock() {
        let svc = Arc::new(LockService::new());
        let key = Bytes::from_static(b"entity-1");

        svc.lock(key.clone()).await.unwrap();

        let waiter = tokio::spawn({
            let svc = Arc::clone(&svc);
            let key = key.clone();
            async move { svc.lock(key).await.unwrap() }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished(), "second lock completed while held");

        svc.unlock(&key).unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.response, Response::Locked);
    }

    #[tokio::test]
    async fn optional_lock_on_unknown_key_creates_nothing() {
        let svc = LockService::new();
        let reply = svc
            .optional_lock(Bytes::from_static(b"never-seen"))
            .await
            .unwrap();
        assert_eq!(reply.response, Response::LockNotFound);
        assert_eq!(svc.lock_count(), 0);
    }

    #[tokio::test]
    async fn optional_lock_on_existing_key_acquires() {
        let svc = LockService::new();
        let key = Bytes::from_static(b"entity-1");
        svc.lock(key.clone()).await.unwrap();
        svc.unlock(&key).unwrap();

        let reply = svc.optional_lock(key).await.unwrap();
        assert_eq!(reply.response, Response::Locked);
    }

    #[tokio::test]
    async fn unlock_violations_answer_with_errors() {
        let svc = LockService::new();

        let reply = svc.unlock(&Bytes::from_static(b"unknown")).unwrap();
        assert_eq!(reply.response, Response::Error);
        assert_eq!(&reply.payload[..], b"unlock on unknown key");

        let key = Bytes::from_static(b"entity-1");
        svc.lock(key.clone()).await.unwrap();
        svc.unlock(&key).unwrap();
        let reply = svc.unlock(&key).unwrap();
        assert_eq!(reply.response, Response::Error);
        assert_eq!(&reply.payload[..], b"unlock on key that is not held");
    }

    #[tokio::test]
    async fn independent_keys_do_not_contend() {
        let svc = LockService::new();
        svc.lock(Bytes::from_static(b"a")).await.unwrap();
        let reply = tokio::time::timeout(
            Duration::from_millis(100),
            svc.lock(Bytes::from_static(b"b")),
        )
        .await
        .expect("lock on a different key must not block")
        .unwrap();
        assert_eq!(reply.response, Response::Locked);
    }
}
