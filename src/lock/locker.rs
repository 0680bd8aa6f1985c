use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{BusError, LockError, Result};
use crate::store::Store;

/// Handle to a held lock.
///
/// There is no retry or queueing: `obtain` fails with `BusError::LockHeld`
/// when someone else holds the key and the caller decides whether to try
/// again. Dropping an unreleased `Locker` releases it.
pub struct Locker<S: Store> {
    store: Arc<S>,
    key: String,
    token: String,
    ttl: Duration,
    released: bool,
}

impl<S: Store> Locker<S> {
    /// Takes `key` for `ttl`. A zero `ttl` never expires.
    pub fn obtain(store: Arc<S>, key: &str, ttl: Duration) -> Result<Self, LockError> {
        let token = Uuid::new_v4().to_string();
        if !store.set_nx(key, token.as_bytes(), ttl)? {
            return Err(BusError::LockHeld(key.to_string()));
        }
        debug!(key, ?ttl, "lock obtained");
        Ok(Self {
            store,
            key: key.to_string(),
            token,
            ttl,
            released: false,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Whether the key still holds this handle's token, i.e. the lock has
    /// neither expired nor been taken over.
    pub fn is_held(&self) -> Result<bool> {
        let current = self.store.get(&self.key)?;
        Ok(current.as_deref() == Some(self.token.as_bytes()))
    }

    /// Releases the lock if this handle still owns it. Releasing a lock that
    /// expired and now belongs to another owner is a no-op.
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.release_if_owner()
    }

    fn release_if_owner(&self) -> Result<(), LockError> {
        if self
            .store
            .compare_and_delete(&self.key, self.token.as_bytes())?
        {
            debug!(key = %self.key, "lock released");
        } else {
            debug!(key = %self.key, "lock no longer owned; release skipped");
        }
        Ok(())
    }
}

impl<S: Store> Drop for Locker<S> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(err) = self.release_if_owner() {
                warn!(key = %self.key, error = %err, "releasing dropped lock failed");
            }
        }
    }
}
