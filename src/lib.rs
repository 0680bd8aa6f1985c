//! storebus: a message bus composed over a key-value store.
//!
//! The store offers keys with expiry, lists with (blocking) push and pop,
//! and channel publish/subscribe. On top of those this crate provides
//! broadcast pub/sub with callback subscriptions, pull-based consumers and
//! producers, durable work queues, and TTL locks, all sharing one
//! connection and one subscription registry per [`MessageBus`].
//!
//! [`store::InMemoryStore`] is always available; `store::RedisStore` is
//! enabled with the `redis` feature.

pub mod bus;
pub mod codec;
pub mod config;
mod error;
pub mod lock;
pub mod message;
pub mod store;

pub use bus::{Consumer, DispatchMode, MessageBus, Producer, SubscriptionId};
pub use codec::{BitcodeCodec, Codec, JsonCodec};
pub use config::BusConfig;
pub use error::{
    BusError, CloseError, ConnectError, LockError, PopError, PublishError, PushError, ReadError,
    Result, SubscribeError,
};
pub use lock::Locker;
pub use message::{Envelope, Message, MessageFactory};
