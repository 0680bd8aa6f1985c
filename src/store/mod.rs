//! The key-value store the bus is composed over.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   MessageBus (per connection)               │
//! │  publish / subscribe / push / pop / consumers / locks       │
//! └─────────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Store + Channel traits                    │
//! │  Store: ping, publish, subscribe, lpush/rpop/brpop, set_nx  │
//! │  Channel: receive(timeout) / unsubscribe / close            │
//! └─────────────────────────────────────────────────────────────┘
//!                  │                              │
//!                  ▼                              ▼
//!        ┌──────────────────┐          ┌──────────────────────┐
//!        │  InMemoryStore   │          │ RedisStore (feature) │
//!        └──────────────────┘          └──────────────────────┘
//! ```
//!
//! The store is trusted for transport, persistence and fan-out. Nothing in
//! this module adds delivery guarantees on top of what it offers.

mod memory;
mod pattern;
#[cfg(feature = "redis")]
mod redis;

use std::time::Duration;

use thiserror::Error;

pub use memory::{InMemoryChannel, InMemoryStore};
pub use pattern::glob_match;
#[cfg(feature = "redis")]
pub use self::redis::{RedisChannel, RedisStore};

/// Failure reported by a store implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },
    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store answered with an error.
    #[error("store error: {0}")]
    Backend(String),
}

/// Outcome of a channel read that produced no message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReceiveError {
    #[error("receive timed out")]
    Timeout,
    /// The channel was closed; no further messages will arrive.
    #[error("channel closed")]
    Closed,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How a channel matches topic names.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscribeMode {
    /// Only the listed topic names.
    Exact,
    /// Any topic matching one of the listed glob patterns.
    Pattern,
}

impl SubscribeMode {
    /// A `*` anywhere in any topic makes the whole subscription a pattern
    /// subscription.
    pub fn for_topics<S: AsRef<str>>(topics: &[S]) -> Self {
        if topics.iter().any(|t| t.as_ref().contains('*')) {
            SubscribeMode::Pattern
        } else {
            SubscribeMode::Exact
        }
    }
}

/// A payload received on a channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawMessage {
    /// Topic the payload was published to.
    pub channel: String,
    /// Pattern that matched, for pattern subscriptions.
    pub pattern: Option<String>,
    pub payload: Vec<u8>,
}

/// A live subscription on the store.
///
/// Reads and teardown happen on different threads: the dispatch loop blocks
/// in `receive` while `unsubscribe`/`close` are called from the caller.
pub trait Channel: Send + Sync + 'static {
    /// Waits for the next payload. `None` waits until a payload arrives or
    /// the channel closes.
    fn receive(&self, timeout: Option<Duration>) -> Result<RawMessage, ReceiveError>;

    /// Unsubscribes every topic the channel was created with, in the mode
    /// it was created with.
    fn unsubscribe(&self) -> Result<(), StoreError>;

    /// Releases the channel. Pending and future `receive` calls observe
    /// `ReceiveError::Closed`. Closing twice is a no-op.
    fn close(&self) -> Result<(), StoreError>;

    fn topics(&self) -> &[String];

    fn mode(&self) -> SubscribeMode;
}

/// The primitives the bus composes.
///
/// Handles are shared between threads behind an `Arc`; implementations are
/// expected to be safe for concurrent use without external locking.
pub trait Store: Send + Sync + Sized + 'static {
    /// The channel type returned by `subscribe`.
    type Channel: Channel;

    /// Parses `address` and opens a connection to it.
    fn connect(address: &str) -> Result<Self, StoreError>;

    /// Opens a new, independent connection to the same address.
    fn reconnect(&self) -> Result<Self, StoreError>;

    fn address(&self) -> &str;

    /// Tags the connection with a client name visible to the store.
    fn set_client_name(&self, name: &str) -> Result<(), StoreError>;

    fn ping(&self) -> Result<(), StoreError>;

    /// Publishes `payload` to `topic`; returns the number of receivers.
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<usize, StoreError>;

    fn subscribe(&self, topics: &[String], mode: SubscribeMode)
        -> Result<Self::Channel, StoreError>;

    /// Pushes onto the head of the list at `key`; returns the new length.
    fn lpush(&self, key: &str, value: &[u8]) -> Result<usize, StoreError>;

    /// Removes and returns the tail of the list at `key`.
    fn rpop(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Blocking `rpop` over several lists, checked in order. Returns the
    /// list that produced the value, or `None` once `timeout` elapses.
    /// `timeout` must be non-zero.
    fn brpop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, Vec<u8>)>, StoreError>;

    fn llen(&self, key: &str) -> Result<usize, StoreError>;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Sets `key` only if it does not exist. A zero `ttl` sets no expiry.
    fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, StoreError>;

    /// Deletes `key` only if it currently holds `expected`, atomically.
    fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError>;
}
