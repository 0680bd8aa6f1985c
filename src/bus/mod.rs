//! Message bus over a key-value store.
//!
//! One `MessageBus` owns one store connection and one subscription
//! registry, and serves three delivery models from them:
//!
//! ```text
//!   broadcast        publish ──► channel ──► every subscriber / consumer
//!   work queue       push ──► list ──► pop (exactly one taker)
//!   streams          Producer::publish ──► channel ──► Consumer::read
//! ```
//!
//! plus TTL locks through `obtain_lock`.
//!
//! ## Example
//!
//! ```
//! use std::time::Duration;
//! use storebus::{Envelope, MessageBus};
//! use storebus::store::InMemoryStore;
//!
//! let bus: MessageBus<InMemoryStore> = MessageBus::connect("memory://docs").unwrap();
//!
//! bus.push(&[Envelope::new("jobs", 1u32), Envelope::new("jobs", 2u32)]).unwrap();
//! let job: Envelope<u32> = bus.pop(Envelope::default, Duration::ZERO, &["jobs"]).unwrap();
//! assert_eq!(job.payload, 1);
//! ```

mod consumer;
mod dispatch;
mod producer;
mod queue;
mod registry;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

pub use consumer::{Consumer, UNBOUNDED_READ};
pub use dispatch::DispatchMode;
pub use producer::Producer;
pub use registry::SubscriptionId;

use crate::codec::{Codec, JsonCodec};
use crate::config::{default_client_name, BusConfig};
use crate::error::{BusError, ConnectError, PublishError, Result, SubscribeError};
use crate::lock::Locker;
use crate::message::{Message, MessageFactory};
use crate::store::{Store, SubscribeMode};
use dispatch::{DispatchLoop, Dispatcher};
use registry::{Registration, SubscriptionRegistry};

/// Bus handle bound to one store connection.
///
/// Dropping the bus tears down every subscription it registered.
pub struct MessageBus<S: Store, K: Codec = JsonCodec> {
    store: Arc<S>,
    codec: Arc<K>,
    config: BusConfig,
    dispatcher: Dispatcher,
    registry: Arc<SubscriptionRegistry<S::Channel>>,
}

impl<S: Store> MessageBus<S> {
    /// Connects to `address` with default settings and the JSON codec.
    pub fn connect(address: &str) -> Result<Self, ConnectError> {
        Self::with_config(BusConfig::new(address))
    }

    pub fn with_config(config: BusConfig) -> Result<Self, ConnectError> {
        let store = S::connect(&config.address)?;
        Self::with_codec(store, JsonCodec, config)
    }

    /// Wraps an already open store connection.
    pub fn from_store(store: S) -> Result<Self, ConnectError> {
        let config = BusConfig::new(store.address());
        Self::with_codec(store, JsonCodec, config)
    }
}

impl<S: Store, K: Codec> MessageBus<S, K> {
    /// Builds a bus from an open store connection and an explicit codec.
    ///
    /// Tags the connection with the configured client name (or the
    /// executable name); a store that refuses the name is logged, not an
    /// error. When `config.ping_retries > 0` the store must answer a probe
    /// before the bus is returned.
    pub fn with_codec(store: S, codec: K, config: BusConfig) -> Result<Self, ConnectError> {
        Self::build(Arc::new(store), Arc::new(codec), config)
    }

    fn build(store: Arc<S>, codec: Arc<K>, config: BusConfig) -> Result<Self, ConnectError> {
        if let Some(name) = config.client_name.clone().or_else(default_client_name) {
            if let Err(err) = store.set_client_name(&name) {
                warn!(address = %store.address(), client = %name, error = %err, "could not set client name");
            }
        }

        let dispatcher = Dispatcher::new(config.dispatch, config.dispatch_threads)?;
        let bus = Self {
            store,
            codec,
            config,
            dispatcher,
            registry: Arc::new(SubscriptionRegistry::new()),
        };

        if bus.config.ping_retries > 0 {
            bus.ping(bus.config.ping_retries, bus.config.ping_interval())?;
        }
        info!(address = %bus.store.address(), dispatch = ?bus.config.dispatch, "message bus connected");
        Ok(bus)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Probes the store up to `retries` times, sleeping `interval` between
    /// attempts. Succeeds on the first healthy answer.
    pub fn ping(&self, retries: u32, interval: Duration) -> Result<(), ConnectError> {
        for attempt in 1..=retries {
            match self.store.ping() {
                Ok(()) => return Ok(()),
                Err(err) => {
                    debug!(attempt, retries, error = %err, "ping failed");
                    if attempt < retries {
                        thread::sleep(interval);
                    }
                }
            }
        }
        Err(BusError::Unreachable {
            address: self.store.address().to_string(),
            attempts: retries,
        })
    }

    /// Opens a second, independent connection to the same address.
    ///
    /// The new bus shares nothing mutable with this one: it has its own
    /// connection, registry and callback pool.
    pub fn try_clone(&self) -> Result<Self, ConnectError> {
        let store = self.store.reconnect()?;
        let config = BusConfig {
            ping_retries: 0,
            ..self.config.clone()
        };
        Self::build(Arc::new(store), Arc::clone(&self.codec), config)
    }

    /// Tears down every subscription, then drops the connection.
    pub fn close(self) {
        let closed = self.registry.clear();
        debug!(address = %self.store.address(), subscriptions = closed, "message bus closed");
    }

    /// Publishes each message to its own topic.
    ///
    /// Stops at the first failure. Messages before it stay published.
    pub fn publish<M: Message>(&self, messages: &[M]) -> Result<(), PublishError> {
        producer::publish_all(&*self.store, &*self.codec, None, messages)
    }

    /// Registers `callback` for every message on `topics`.
    ///
    /// A topic containing `*` makes the subscription a pattern subscription
    /// over all of `topics`. Messages are decoded into the shape `factory`
    /// returns; payloads that fail to decode are dropped. Under
    /// [`DispatchMode::Concurrent`] the callback may run on several threads
    /// at once and out of order.
    pub fn subscribe<M, F, H>(
        &self,
        name: &str,
        factory: F,
        callback: H,
        topics: &[&str],
    ) -> Result<SubscriptionId, SubscribeError>
    where
        M: Message,
        F: MessageFactory<M>,
        H: Fn(M) + Send + Sync + 'static,
    {
        if topics.is_empty() {
            return Err(BusError::NoTopics);
        }
        let topics: Vec<String> = topics.iter().map(|t| t.to_string()).collect();
        let mode = SubscribeMode::for_topics(&topics);

        let channel = Arc::new(self.store.subscribe(&topics, mode)?);
        let id = SubscriptionId::generate();
        let stopped = Arc::new(AtomicBool::new(false));

        // Registered before the loop starts, so a loop that loses its
        // channel straight away still finds its entry to evict.
        self.registry.insert(
            id.clone(),
            Registration {
                name: name.to_string(),
                channel: Arc::clone(&channel),
                stopped: Arc::clone(&stopped),
                worker: None,
            },
        );

        let worker = DispatchLoop {
            subscription: id.clone(),
            channel,
            stopped,
            codec: Arc::clone(&self.codec),
            factory: Box::new(factory),
            callback: Arc::new(callback),
            dispatcher: self.dispatcher.clone(),
            registry: Arc::downgrade(&self.registry),
        }
        .spawn(name);

        match worker {
            Ok(worker) => self.registry.attach_worker(&id, worker),
            Err(err) => {
                self.registry.remove(&id);
                return Err(BusError::Dispatch(err.to_string()));
            }
        }
        debug!(subscription = %id, name, ?topics, ?mode, "subscribed");
        Ok(id)
    }

    /// Removes a subscription and stops its dispatch loop.
    ///
    /// Returns false if `id` is not registered. Store errors while
    /// unsubscribing are logged; the subscription is removed either way.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        self.registry.remove(id)
    }

    pub fn subscription_count(&self) -> usize {
        self.registry.len()
    }

    /// Topics (or patterns) a live subscription was created with.
    pub fn subscription_topics(&self, id: &SubscriptionId) -> Option<Vec<String>> {
        self.registry.topics(id)
    }

    /// Returns a publish-only handle for `topic`.
    pub fn create_producer(&self, topic: &str) -> Producer<S, K> {
        Producer::new(Arc::clone(&self.store), Arc::clone(&self.codec), topic.to_string())
    }

    /// Opens a pull-based consumer on `topics`, with the same pattern rule
    /// as [`subscribe`](Self::subscribe).
    pub fn create_consumer<M, F>(
        &self,
        name: &str,
        factory: F,
        topics: &[&str],
    ) -> Result<Consumer<S::Channel, M, K>, SubscribeError>
    where
        M: Message,
        F: MessageFactory<M>,
    {
        if topics.is_empty() {
            return Err(BusError::NoTopics);
        }
        let topics: Vec<String> = topics.iter().map(|t| t.to_string()).collect();
        let mode = SubscribeMode::for_topics(&topics);
        let channel = self.store.subscribe(&topics, mode)?;
        debug!(consumer = name, ?topics, ?mode, "consumer created");
        Ok(Consumer::new(
            name.to_string(),
            channel,
            Box::new(factory),
            Arc::clone(&self.codec),
        ))
    }

    /// Takes the lock `key` for `ttl`, or fails with `BusError::LockHeld`.
    /// See [`Locker`].
    pub fn obtain_lock(&self, key: &str, ttl: Duration) -> Result<Locker<S>> {
        Locker::obtain(Arc::clone(&self.store), key, ttl)
    }
}
