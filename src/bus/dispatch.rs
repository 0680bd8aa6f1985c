//! Per-subscription dispatch loop.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::Deserialize;
use tracing::{debug, error, trace, warn};

use super::registry::SubscriptionRegistry;
use super::SubscriptionId;
use crate::codec::Codec;
use crate::error::{BusError, Result};
use crate::message::Message;
use crate::store::{Channel, RawMessage, ReceiveError};

/// How a subscription's callback is invoked.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Each message is handed to the bus's worker pool. Callbacks for one
    /// subscription may overlap and complete out of order, so they must
    /// guard any shared state themselves.
    #[default]
    Concurrent,
    /// Callbacks run one at a time on the subscription's own thread, in
    /// the order the store delivered the messages.
    Sequential,
}

pub(crate) type Callback<M> = Arc<dyn Fn(M) + Send + Sync>;
pub(crate) type Factory<M> = Box<dyn Fn() -> M + Send + Sync>;

/// Where decoded messages go.
#[derive(Clone)]
pub(crate) enum Dispatcher {
    Inline,
    Pool(Arc<ThreadPool>),
}

impl Dispatcher {
    pub(crate) fn new(mode: DispatchMode, threads: usize) -> Result<Self> {
        match mode {
            DispatchMode::Sequential => Ok(Dispatcher::Inline),
            DispatchMode::Concurrent => {
                let pool = ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|i| format!("storebus-dispatch-{i}"))
                    .panic_handler(|panic| log_panic(&*panic))
                    .build()
                    .map_err(|e| BusError::Dispatch(e.to_string()))?;
                Ok(Dispatcher::Pool(Arc::new(pool)))
            }
        }
    }

    fn dispatch<M: Message>(&self, callback: &Callback<M>, message: M) {
        match self {
            Dispatcher::Inline => {
                if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| callback(message))) {
                    log_panic(&*panic);
                }
            }
            Dispatcher::Pool(pool) => {
                let callback = Arc::clone(callback);
                pool.spawn(move || callback(message));
            }
        }
    }
}

fn log_panic(panic: &(dyn std::any::Any + Send)) {
    let reason = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    error!(%reason, "subscription callback panicked");
}

/// Receives from one channel until it closes, decoding each payload and
/// handing it to the callback.
///
/// Payloads that fail to decode are dropped; nobody is waiting on the loop
/// to report them. A loop whose channel dies underneath it, rather than
/// being torn down, evicts its own registry entry.
pub(crate) struct DispatchLoop<C: Channel, M: Message, K: Codec> {
    pub(crate) subscription: SubscriptionId,
    pub(crate) channel: Arc<C>,
    /// Set by teardown before the channel is closed, so messages still
    /// buffered in the channel are not delivered afterwards.
    pub(crate) stopped: Arc<AtomicBool>,
    pub(crate) codec: Arc<K>,
    pub(crate) factory: Factory<M>,
    pub(crate) callback: Callback<M>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) registry: Weak<SubscriptionRegistry<C>>,
}

impl<C: Channel, M: Message, K: Codec> DispatchLoop<C, M, K> {
    pub(crate) fn spawn(self, name: &str) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("storebus-sub-{name}"))
            .spawn(move || self.run())
    }

    fn run(self) {
        debug!(subscription = %self.subscription, "dispatch loop started");
        loop {
            match self.channel.receive(None) {
                Ok(raw) => {
                    if self.stopped.load(Ordering::Acquire) {
                        break;
                    }
                    self.deliver(raw);
                }
                Err(ReceiveError::Timeout) => continue,
                Err(ReceiveError::Closed) => break,
                Err(ReceiveError::Store(err)) => {
                    warn!(subscription = %self.subscription, error = %err, "channel failed");
                    break;
                }
            }
        }
        if self.stopped.load(Ordering::Acquire) {
            debug!(subscription = %self.subscription, "dispatch loop finished");
            return;
        }
        warn!(subscription = %self.subscription, "channel lost, removing subscription");
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.subscription);
        }
    }

    fn deliver(&self, raw: RawMessage) {
        match self.codec.decode(&*self.factory, &raw.payload) {
            Ok(mut message) => {
                message.set_topic(&raw.channel);
                self.dispatcher.dispatch(&self.callback, message);
            }
            Err(err) => {
                trace!(
                    subscription = %self.subscription,
                    topic = %raw.channel,
                    error = %err,
                    "dropping undecodable message"
                );
            }
        }
    }
}
