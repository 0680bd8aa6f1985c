//! Pull-based reader over a channel.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::dispatch::Factory;
use crate::codec::Codec;
use crate::error::{BusError, CloseError, ReadError};
use crate::message::Message;
use crate::store::{Channel, ReceiveError};

/// Stand-in for "no timeout" on `Consumer::read`: long enough to be
/// unbounded in practice while keeping deadline arithmetic finite.
pub const UNBOUNDED_READ: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Reads messages from one or more topics (or a pattern) on demand.
///
/// Unlike a callback subscription, decode failures are returned from
/// `read` so the caller can decide what to do with them. `read` takes
/// `&mut self`: one consumer drains one stream, and sharing it across
/// threads requires the caller's own synchronization.
///
/// Dropping an open consumer closes it.
pub struct Consumer<C: Channel, M: Message, K: Codec> {
    name: String,
    channel: C,
    factory: Factory<M>,
    codec: Arc<K>,
    closed: bool,
}

impl<C: Channel, M: Message, K: Codec> Consumer<C, M, K> {
    pub(crate) fn new(name: String, channel: C, factory: Factory<M>, codec: Arc<K>) -> Self {
        Self {
            name,
            channel,
            factory,
            codec,
            closed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn topics(&self) -> &[String] {
        self.channel.topics()
    }

    /// Blocks until a message arrives or `timeout` elapses. A zero timeout
    /// waits for [`UNBOUNDED_READ`].
    ///
    /// Returns `BusError::ReadTimeout` when nothing arrived in time, which
    /// callers polling in a loop can treat as "try again".
    pub fn read(&mut self, timeout: Duration) -> Result<M, ReadError> {
        let timeout = if timeout.is_zero() {
            UNBOUNDED_READ
        } else {
            timeout
        };

        match self.channel.receive(Some(timeout)) {
            Ok(raw) => {
                let mut message = self.codec.decode(&*self.factory, &raw.payload)?;
                message.set_topic(&raw.channel);
                Ok(message)
            }
            Err(ReceiveError::Timeout) => Err(BusError::ReadTimeout(timeout)),
            Err(ReceiveError::Closed) => Err(BusError::ChannelClosed),
            Err(ReceiveError::Store(err)) => Err(err.into()),
        }
    }

    /// Unsubscribes the consumer's topics and closes its channel.
    ///
    /// The channel is closed even when the unsubscribe fails; the first
    /// failure is returned.
    pub fn close(mut self) -> Result<(), CloseError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), CloseError> {
        self.closed = true;
        let unsubscribed = self.channel.unsubscribe();
        let closed = self.channel.close();
        debug!(consumer = %self.name, "consumer closed");
        unsubscribed?;
        closed?;
        Ok(())
    }
}

impl<C: Channel, M: Message, K: Codec> Drop for Consumer<C, M, K> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.shutdown() {
                warn!(consumer = %self.name, error = %err, "closing dropped consumer failed");
            }
        }
    }
}
