//! Acquire/release guard over the server's distributed locks.

use bytes::Bytes;

use switchboard_core::{CallError, Command, Response};

use crate::Client;

/// A distributed lock keyed by an opaque byte string.
///
/// `required` mirrors the two server commands: a required lock creates
/// the key on first use and always blocks to acquire; an optional one
/// only acquires when some worker already created the key, and
/// [`DistLock::acquire`] reports whether it did.
///
/// Release is explicit. Dropping a guard that still holds the lock
/// only logs a warning; the key stays locked on the server until some
/// caller unlocks it.
pub struct DistLock<'a> {
    client: &'a Client,
    key: Bytes,
    required: bool,
    locked: bool,
}

impl Client {
    /// Guard for a lock that is created on first acquisition.
    pub fn lock(&self, key: impl Into<Bytes>) -> DistLock<'_> {
        DistLock {
            client: self,
            key: key.into(),
            required: true,
            locked: false,
        }
    }

    /// Guard that only acquires if the lock already exists.
    pub fn optional_lock(&self, key: impl Into<Bytes>) -> DistLock<'_> {
        DistLock {
            client: self,
            key: key.into(),
            required: false,
            locked: false,
        }
    }
}

impl DistLock<'_> {
    /// Acquire the lock. Returns whether it is now held; an optional
    /// lock on an unknown key returns `false` without creating it.
    pub async fn acquire(&mut self) -> Result<bool, CallError> {
        let (response, _) = if self.required {
            self.client
                .call_expecting(Command::Lock, self.key.clone(), &[Response::Locked])
                .await?
        } else {
            self.client
                .call_expecting(
                    Command::OptionalLock,
                    self.key.clone(),
                    &[Response::Locked, Response::LockNotFound],
                )
                .await?
        };
        self.locked = response == Response::Locked;
        Ok(self.locked)
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Release the lock if held.
    pub async fn release(mut self) -> Result<(), CallError> {
        if !self.locked {
            return Ok(());
        }
        self.client
            .call_expecting(Command::Unlock, self.key.clone(), &[Response::Unlocked])
            .await?;
        self.locked = false;
        Ok(())
    }
}

impl Drop for DistLock<'_> {
    fn drop(&mut self) {
        if self.locked {
            tracing::warn!(
                key = %String::from_utf8_lossy(&self.key),
                "distributed lock guard dropped while held"
            );
        }
    }
}
