//! In-process store for tests and single-process deployments.
//!
//! Mirrors the semantics the bus relies on from a networked store: lists
//! with head push and tail pop, keys with expiry, and channel fan-out with
//! exact or glob-pattern subscriptions. Clones and `reconnect` share the
//! same data, the way two connections to one server do.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};

use super::{glob_match, Channel, RawMessage, ReceiveError, Store, StoreError, SubscribeMode};

const SCHEME: &str = "memory://";

/// In-memory implementation of [`Store`].
///
/// ## Example
///
/// ```
/// use storebus::store::{InMemoryStore, Store};
///
/// let store = InMemoryStore::connect("memory://test").unwrap();
/// store.lpush("jobs", b"one").unwrap();
/// assert_eq!(store.rpop("jobs").unwrap(), Some(b"one".to_vec()));
/// ```
pub struct InMemoryStore {
    address: String,
    client_name: Mutex<Option<String>>,
    shared: Arc<Shared>,
}

struct Shared {
    data: Mutex<Data>,
    /// Signalled on every list push, for blocked `brpop` callers.
    pushed: Condvar,
    channels: RwLock<HashMap<u64, Subscriber>>,
    next_channel: AtomicU64,
    available: AtomicBool,
}

#[derive(Default)]
struct Data {
    keys: HashMap<String, Entry>,
    lists: HashMap<String, VecDeque<Vec<u8>>>,
}

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

struct Subscriber {
    topics: Vec<String>,
    mode: SubscribeMode,
    sender: Sender<RawMessage>,
}

impl Data {
    fn live_value(&mut self, key: &str) -> Option<&Vec<u8>> {
        let now = Instant::now();
        if self.keys.get(key).is_some_and(|e| !e.is_live(now)) {
            self.keys.remove(key);
        }
        self.keys.get(key).map(|e| &e.value)
    }

    fn pop_tail(&mut self, key: &str) -> Option<Vec<u8>> {
        let list = self.lists.get_mut(key)?;
        let value = list.pop_back();
        if list.is_empty() {
            self.lists.remove(key);
        }
        value
    }
}

impl InMemoryStore {
    /// Store with an empty data set, reachable as `memory://default`.
    pub fn new() -> Self {
        Self::with_address(format!("{SCHEME}default"))
    }

    fn with_address(address: String) -> Self {
        Self {
            address,
            client_name: Mutex::new(None),
            shared: Arc::new(Shared {
                data: Mutex::new(Data::default()),
                pushed: Condvar::new(),
                channels: RwLock::new(HashMap::new()),
                next_channel: AtomicU64::new(1),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Simulates the store going away (`false`) or coming back (`true`).
    /// While unavailable every command fails with `StoreError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    /// Client name set on this connection, if any.
    pub fn client_name(&self) -> Option<String> {
        lock(&self.client_name).clone()
    }

    /// Number of open channels across all connections.
    pub fn channel_count(&self) -> usize {
        self.shared
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drops every open channel on the server side, the way a restart
    /// drops subscriber connections. Blocked readers see `Closed`.
    pub fn drop_channels(&self) -> usize {
        let mut channels = self
            .shared
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let dropped = channels.len();
        channels.clear();
        dropped
    }

    fn check(&self) -> Result<(), StoreError> {
        self.shared.check()
    }

    fn data(&self) -> MutexGuard<'_, Data> {
        lock(&self.shared.data)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for InMemoryStore {
    fn clone(&self) -> Self {
        Self {
            address: self.address.clone(),
            client_name: Mutex::new(None),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Shared {
    fn check(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store is offline".into()))
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Store for InMemoryStore {
    type Channel = InMemoryChannel;

    fn connect(address: &str) -> Result<Self, StoreError> {
        match address.strip_prefix(SCHEME) {
            Some(name) if !name.is_empty() => Ok(Self::with_address(address.to_string())),
            Some(_) => Err(StoreError::InvalidAddress {
                address: address.to_string(),
                reason: "missing store name".into(),
            }),
            None => Err(StoreError::InvalidAddress {
                address: address.to_string(),
                reason: format!("expected {SCHEME}<name>"),
            }),
        }
    }

    fn reconnect(&self) -> Result<Self, StoreError> {
        self.check()?;
        Ok(self.clone())
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn set_client_name(&self, name: &str) -> Result<(), StoreError> {
        self.check()?;
        *lock(&self.client_name) = Some(name.to_string());
        Ok(())
    }

    fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }

    fn publish(&self, topic: &str, payload: &[u8]) -> Result<usize, StoreError> {
        self.check()?;
        let channels = self
            .shared
            .channels
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let mut receivers = 0;
        for sub in channels.values() {
            let matches: Vec<Option<&String>> = match sub.mode {
                SubscribeMode::Exact => sub
                    .topics
                    .iter()
                    .any(|t| t == topic)
                    .then_some(None)
                    .into_iter()
                    .collect(),
                SubscribeMode::Pattern => sub
                    .topics
                    .iter()
                    .filter(|p| glob_match(p, topic))
                    .map(Some)
                    .collect(),
            };
            // One delivery per matching pattern, as the store would do.
            for pattern in matches {
                let raw = RawMessage {
                    channel: topic.to_string(),
                    pattern: pattern.cloned(),
                    payload: payload.to_vec(),
                };
                if sub.sender.send(raw).is_ok() {
                    receivers += 1;
                }
            }
        }
        Ok(receivers)
    }

    fn subscribe(
        &self,
        topics: &[String],
        mode: SubscribeMode,
    ) -> Result<InMemoryChannel, StoreError> {
        self.check()?;
        let (sender, receiver) = mpsc::channel();
        let id = self.shared.next_channel.fetch_add(1, Ordering::Relaxed);
        self.shared
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                Subscriber {
                    topics: topics.to_vec(),
                    mode,
                    sender,
                },
            );

        Ok(InMemoryChannel {
            id,
            shared: Arc::clone(&self.shared),
            receiver: Mutex::new(receiver),
            topics: topics.to_vec(),
            mode,
        })
    }

    fn lpush(&self, key: &str, value: &[u8]) -> Result<usize, StoreError> {
        self.check()?;
        let len = {
            let mut data = self.data();
            let list = data.lists.entry(key.to_string()).or_default();
            list.push_front(value.to_vec());
            list.len()
        };
        self.shared.pushed.notify_all();
        Ok(len)
    }

    fn rpop(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check()?;
        Ok(self.data().pop_tail(key))
    }

    fn brpop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, Vec<u8>)>, StoreError> {
        self.check()?;
        // A timeout past the clock's range waits without a deadline.
        let deadline = Instant::now().checked_add(timeout);
        let mut data = self.data();

        loop {
            for key in keys {
                if let Some(value) = data.pop_tail(key) {
                    return Ok(Some((key.clone(), value)));
                }
            }

            data = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    self.shared
                        .pushed
                        .wait_timeout(data, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .shared
                    .pushed
                    .wait(data)
                    .unwrap_or_else(PoisonError::into_inner),
            };
            self.check()?;
        }
    }

    fn llen(&self, key: &str) -> Result<usize, StoreError> {
        self.check()?;
        Ok(self.data().lists.get(key).map_or(0, VecDeque::len))
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check()?;
        Ok(self.data().live_value(key).cloned())
    }

    fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, StoreError> {
        self.check()?;
        let mut data = self.data();
        if data.live_value(key).is_some() {
            return Ok(false);
        }
        // Zero, or too far out to represent, means no expiry.
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Instant::now().checked_add(ttl)
        };
        data.keys.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at,
            },
        );
        Ok(true)
    }

    fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError> {
        self.check()?;
        let mut data = self.data();
        if data.live_value(key).is_some_and(|v| v == expected) {
            data.keys.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

/// Channel handed out by [`InMemoryStore::subscribe`].
pub struct InMemoryChannel {
    id: u64,
    shared: Arc<Shared>,
    receiver: Mutex<Receiver<RawMessage>>,
    topics: Vec<String>,
    mode: SubscribeMode,
}

impl Channel for InMemoryChannel {
    fn receive(&self, timeout: Option<Duration>) -> Result<RawMessage, ReceiveError> {
        let receiver = lock(&self.receiver);
        match timeout {
            Some(timeout) => receiver.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => ReceiveError::Timeout,
                RecvTimeoutError::Disconnected => ReceiveError::Closed,
            }),
            None => receiver.recv().map_err(|_| ReceiveError::Closed),
        }
    }

    fn unsubscribe(&self) -> Result<(), StoreError> {
        self.shared.check()?;
        let mut channels = self
            .shared
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(sub) = channels.get_mut(&self.id) {
            sub.topics.clear();
        }
        Ok(())
    }

    fn close(&self) -> Result<(), StoreError> {
        // Dropping the sender wakes a blocked `receive` with `Closed`.
        self.shared
            .channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
        Ok(())
    }

    fn topics(&self) -> &[String] {
        &self.topics
    }

    fn mode(&self) -> SubscribeMode {
        self.mode
    }
}

impl Drop for InMemoryChannel {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
