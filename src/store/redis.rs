//! Redis implementation of [`Store`], enabled with the `redis` feature.
//!
//! Plain commands share one connection. Blocking pops and subscriptions
//! each get a dedicated connection so they never stall other callers. A
//! subscription whose connection drops reconnects and resubscribes until it
//! is closed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use redis::{Client, Connection, Msg, RedisError, RedisResult, Script};
use tracing::{debug, warn};

use super::{Channel, RawMessage, ReceiveError, Store, StoreError, SubscribeMode};

/// Deletes KEYS[1] only while it still holds ARGV[1].
const RELEASE_IF_OWNER: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Upper bound on one blocking socket read inside `RedisChannel::receive`,
/// so `close` from another thread is observed promptly.
const RECEIVE_SLICE: Duration = Duration::from_millis(100);

/// Pause between attempts to reopen a dropped subscription connection.
const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Longest TTL or blocking timeout passed to the server. Anything longer
/// is sent as "no expiry" / "block forever", which the server can represent.
const MAX_SERVER_DURATION: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 100);

/// Opens a connection and subscribes it to `topics`, consuming one
/// confirmation per topic so the subscription is live on return.
fn open_subscription(
    client: &Client,
    topics: &[String],
    mode: SubscribeMode,
) -> RedisResult<Connection> {
    let mut conn = client.get_connection()?;
    let verb = match mode {
        SubscribeMode::Exact => "SUBSCRIBE",
        SubscribeMode::Pattern => "PSUBSCRIBE",
    };
    conn.send_packed_command(&redis::cmd(verb).arg(topics).get_packed_command())?;
    for _ in topics {
        conn.recv_response()?;
    }
    Ok(conn)
}

fn backend(err: RedisError) -> StoreError {
    if err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error() {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Backend(err.to_string())
    }
}

pub struct RedisStore {
    address: String,
    client: Client,
    conn: Mutex<Connection>,
    release: Script,
}

impl RedisStore {
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Store for RedisStore {
    type Channel = RedisChannel;

    fn connect(address: &str) -> Result<Self, StoreError> {
        let client = Client::open(address).map_err(|e| StoreError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })?;
        let conn = client.get_connection().map_err(backend)?;
        Ok(Self {
            address: address.to_string(),
            client,
            conn: Mutex::new(conn),
            release: Script::new(RELEASE_IF_OWNER),
        })
    }

    fn reconnect(&self) -> Result<Self, StoreError> {
        Self::connect(&self.address)
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn set_client_name(&self, name: &str) -> Result<(), StoreError> {
        redis::cmd("CLIENT")
            .arg("SETNAME")
            .arg(name)
            .query::<()>(&mut *self.conn())
            .map_err(backend)
    }

    fn ping(&self) -> Result<(), StoreError> {
        redis::cmd("PING")
            .query::<String>(&mut *self.conn())
            .map(|_| ())
            .map_err(backend)
    }

    fn publish(&self, topic: &str, payload: &[u8]) -> Result<usize, StoreError> {
        redis::cmd("PUBLISH")
            .arg(topic)
            .arg(payload)
            .query(&mut *self.conn())
            .map_err(backend)
    }

    fn subscribe(
        &self,
        topics: &[String],
        mode: SubscribeMode,
    ) -> Result<RedisChannel, StoreError> {
        let conn = open_subscription(&self.client, topics, mode).map_err(backend)?;
        Ok(RedisChannel {
            client: self.client.clone(),
            conn: Mutex::new(Some(conn)),
            closed: AtomicBool::new(false),
            subscribed: AtomicBool::new(true),
            topics: topics.to_vec(),
            mode,
        })
    }

    fn lpush(&self, key: &str, value: &[u8]) -> Result<usize, StoreError> {
        redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query(&mut *self.conn())
            .map_err(backend)
    }

    fn rpop(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        redis::cmd("RPOP")
            .arg(key)
            .query(&mut *self.conn())
            .map_err(backend)
    }

    fn brpop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, Vec<u8>)>, StoreError> {
        let mut conn = self.client.get_connection().map_err(backend)?;
        // Zero tells the server to block without a deadline.
        let seconds = if timeout > MAX_SERVER_DURATION {
            0.0
        } else {
            timeout.as_secs_f64()
        };
        redis::cmd("BRPOP")
            .arg(keys)
            .arg(seconds)
            .query(&mut conn)
            .map_err(backend)
    }

    fn llen(&self, key: &str) -> Result<usize, StoreError> {
        redis::cmd("LLEN")
            .arg(key)
            .query(&mut *self.conn())
            .map_err(backend)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        redis::cmd("GET")
            .arg(key)
            .query(&mut *self.conn())
            .map_err(backend)
    }

    fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, StoreError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if !ttl.is_zero() && ttl <= MAX_SERVER_DURATION {
            let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
            cmd.arg("PX").arg(millis.max(1));
        }
        let reply: Option<String> = cmd.query(&mut *self.conn()).map_err(backend)?;
        Ok(reply.is_some())
    }

    fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool, StoreError> {
        let deleted: i64 = self
            .release
            .key(key)
            .arg(expected)
            .invoke(&mut *self.conn())
            .map_err(backend)?;
        Ok(deleted > 0)
    }
}

/// Subscription on a dedicated Redis connection.
///
/// `conn` is `None` while the connection is being reopened after a drop,
/// and for good once the channel is closed.
pub struct RedisChannel {
    client: Client,
    conn: Mutex<Option<Connection>>,
    closed: AtomicBool,
    subscribed: AtomicBool,
    topics: Vec<String>,
    mode: SubscribeMode,
}

impl RedisChannel {
    fn conn(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reopens the subscription into `slot`. Returns false when the server
    /// is still unreachable.
    fn resubscribe(&self, slot: &mut Option<Connection>) -> bool {
        if self.closed.load(Ordering::Acquire) || !self.subscribed.load(Ordering::Acquire) {
            return false;
        }
        match open_subscription(&self.client, &self.topics, self.mode) {
            Ok(conn) => {
                debug!(topics = ?self.topics, "subscription connection restored");
                *slot = Some(conn);
                true
            }
            Err(err) => {
                debug!(topics = ?self.topics, error = %err, "resubscribe failed");
                false
            }
        }
    }
}

impl Channel for RedisChannel {
    fn receive(&self, timeout: Option<Duration>) -> Result<RawMessage, ReceiveError> {
        // A timeout past the clock's range waits without a deadline.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));

        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(ReceiveError::Closed);
            }
            let slice = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(ReceiveError::Timeout);
                    }
                    left.min(RECEIVE_SLICE)
                }
                None => RECEIVE_SLICE,
            };

            let mut guard = self.conn();
            if guard.is_none() && !self.resubscribe(&mut guard) {
                drop(guard);
                let ended = self.closed.load(Ordering::Acquire)
                    || !self.subscribed.load(Ordering::Acquire);
                if ended {
                    return Err(ReceiveError::Closed);
                }
                thread::sleep(RECONNECT_DELAY.min(slice));
                continue;
            }
            let Some(conn) = guard.as_mut() else {
                continue;
            };
            conn.set_read_timeout(Some(slice)).map_err(backend)?;

            match conn.recv_response() {
                Ok(value) => {
                    // Subscribe/unsubscribe confirmations are not messages.
                    if let Some(msg) = Msg::from_value(&value) {
                        return Ok(RawMessage {
                            channel: msg.get_channel_name().to_string(),
                            pattern: msg.get_pattern::<Option<String>>().ok().flatten(),
                            payload: msg.get_payload_bytes().to_vec(),
                        });
                    }
                }
                Err(err) if err.is_timeout() => {}
                Err(err) if err.is_connection_dropped() || err.is_io_error() => {
                    // Close drops the connection too; only reopen after a
                    // drop nobody asked for.
                    if self.closed.load(Ordering::Acquire) {
                        return Err(ReceiveError::Closed);
                    }
                    warn!(
                        topics = ?self.topics,
                        error = %err,
                        "subscription connection dropped, reconnecting"
                    );
                    *guard = None;
                }
                Err(err) => return Err(ReceiveError::Store(backend(err))),
            }
        }
    }

    fn unsubscribe(&self) -> Result<(), StoreError> {
        let verb = match self.mode {
            SubscribeMode::Exact => "UNSUBSCRIBE",
            SubscribeMode::Pattern => "PUNSUBSCRIBE",
        };
        self.subscribed.store(false, Ordering::Release);
        let mut guard = self.conn();
        match guard.as_mut() {
            Some(conn) => conn
                .send_packed_command(&redis::cmd(verb).arg(&self.topics).get_packed_command())
                .map_err(backend),
            None => Ok(()),
        }
    }

    fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        // Dropping the connection closes the socket.
        self.conn().take();
        Ok(())
    }

    fn topics(&self) -> &[String] {
        &self.topics
    }

    fn mode(&self) -> SubscribeMode {
        self.mode
    }
}
