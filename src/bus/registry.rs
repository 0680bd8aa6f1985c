//! Registry of live subscriptions owned by one bus.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};
use uuid::Uuid;

use crate::store::Channel;

/// Identifier handed out by `MessageBus::subscribe`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub(crate) struct Registration<C: Channel> {
    pub(crate) name: String,
    pub(crate) channel: Arc<C>,
    pub(crate) stopped: Arc<AtomicBool>,
    pub(crate) worker: Option<JoinHandle<()>>,
}

impl<C: Channel> Registration<C> {
    /// Stops delivery, unsubscribes and closes the channel, then waits for
    /// the dispatch loop to exit. Store failures are logged: the channel is
    /// closed and the loop ends regardless.
    fn teardown(mut self, id: &SubscriptionId) {
        self.stopped.store(true, Ordering::Release);

        if let Err(err) = self.channel.unsubscribe() {
            warn!(subscription = %id, name = %self.name, error = %err, "unsubscribe failed");
        }
        if let Err(err) = self.channel.close() {
            warn!(subscription = %id, name = %self.name, error = %err, "closing channel failed");
        }

        if let Some(worker) = self.worker.take() {
            // A callback running inline on the loop thread may unsubscribe
            // its own subscription; that thread exits on its own.
            if worker.thread().id() != thread::current().id() && worker.join().is_err() {
                warn!(subscription = %id, name = %self.name, "dispatch loop panicked");
            }
        }
        debug!(subscription = %id, name = %self.name, "subscription removed");
    }
}

/// Maps subscription ids to their channel and dispatch loop.
///
/// One read/write lock guards every insert, lookup and removal. Teardown of
/// a removed entry happens after the lock is released, so a slow store never
/// blocks other subscribers.
pub(crate) struct SubscriptionRegistry<C: Channel> {
    entries: RwLock<HashMap<SubscriptionId, Registration<C>>>,
}

impl<C: Channel> SubscriptionRegistry<C> {
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn insert(&self, id: SubscriptionId, registration: Registration<C>) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, registration);
    }

    /// Hands the entry its dispatch loop. A loop that already evicted its
    /// own entry is left to finish on its own.
    pub(crate) fn attach_worker(&self, id: &SubscriptionId, worker: JoinHandle<()>) {
        if let Some(registration) = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(id)
        {
            registration.worker = Some(worker);
        }
    }

    /// Removes and tears down `id`. Returns false if it was not registered.
    pub(crate) fn remove(&self, id: &SubscriptionId) -> bool {
        let removed = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
        match removed {
            Some(registration) => {
                registration.teardown(id);
                true
            }
            None => false,
        }
    }

    /// Removes and tears down every subscription; returns how many there were.
    pub(crate) fn clear(&self) -> usize {
        let drained: Vec<_> = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        let count = drained.len();
        for (id, registration) in drained {
            registration.teardown(&id);
        }
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: &SubscriptionId) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(id)
    }

    pub(crate) fn topics(&self, id: &SubscriptionId) -> Option<Vec<String>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|r| r.channel.topics().to_vec())
    }
}

impl<C: Channel> Drop for SubscriptionRegistry<C> {
    fn drop(&mut self) {
        self.clear();
    }
}
