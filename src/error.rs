use std::time::Duration;

use thiserror::Error;

use crate::store::StoreError;

/// Every failure the bus surfaces to callers.
#[derive(Debug, Error)]
pub enum BusError {
    /// The connection address could not be parsed.
    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// The store never answered a liveness probe.
    #[error("no connection to {address} after {attempts} attempt(s)")]
    Unreachable { address: String, attempts: u32 },

    /// A message payload could not be serialized.
    #[error("encode failed: {0}")]
    Encode(String),

    /// Bytes received from the store did not decode into the expected shape.
    #[error("decode failed: {0}")]
    Decode(String),

    /// The store rejected or failed a command.
    #[error(transparent)]
    Store(StoreError),

    /// `Consumer::read` waited for its full timeout without a message.
    #[error("no message received within {0:?}")]
    ReadTimeout(Duration),

    /// The channel behind a consumer was closed.
    #[error("channel closed")]
    ChannelClosed,

    /// Non-blocking pop found nothing to take.
    #[error("queue {0} is empty")]
    QueueEmpty(String),

    /// Blocking pop waited for its full timeout on every queue.
    #[error("no message on {queues:?} within {timeout:?}")]
    PopTimeout {
        queues: Vec<String>,
        timeout: Duration,
    },

    /// A message was pushed or published without a destination.
    #[error("message has no topic")]
    MissingTopic,

    /// A subscription or consumer was requested for zero topics.
    #[error("at least one topic is required")]
    NoTopics,

    /// Another owner holds the lock.
    #[error("lock {0} is held by another owner")]
    LockHeld(String),

    /// The dispatch thread or callback pool could not be started.
    #[error("dispatch: {0}")]
    Dispatch(String),
}

pub type Result<T, E = BusError> = std::result::Result<T, E>;

// Operation-specific names. They are the same error type; the aliases keep
// signatures close to the operation they describe.
pub type ConnectError = BusError;
pub type PublishError = BusError;
pub type PushError = BusError;
pub type PopError = BusError;
pub type ReadError = BusError;
pub type SubscribeError = BusError;
pub type CloseError = BusError;
pub type LockError = BusError;

impl BusError {
    /// True for the outcomes a polling caller is expected to loop on.
    pub fn is_timeout(&self) -> bool {
        matches!(self, BusError::ReadTimeout(_) | BusError::PopTimeout { .. })
    }
}

impl From<StoreError> for BusError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidAddress { address, reason } => {
                BusError::InvalidAddress { address, reason }
            }
            other => BusError::Store(other),
        }
    }
}
