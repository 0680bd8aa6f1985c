//! Work-queue operations over store lists.
//!
//! Messages are pushed onto the head of the list named by their topic and
//! popped from its tail, so each queue is first-in, first-out and each
//! message is taken by exactly one popper.

use std::time::Duration;

use tracing::trace;

use super::MessageBus;
use crate::codec::Codec;
use crate::error::{BusError, PopError, PushError, Result};
use crate::message::Message;
use crate::store::Store;

impl<S: Store, K: Codec> MessageBus<S, K> {
    /// Appends each message to the queue named by its topic.
    ///
    /// Stops at the first failure. Messages before it stay queued.
    pub fn push<M: Message>(&self, messages: &[M]) -> Result<(), PushError> {
        for message in messages {
            let queue = message.topic();
            if queue.is_empty() {
                return Err(BusError::MissingTopic);
            }
            let bytes = self.codec.encode(message)?;
            let len = self.store.lpush(queue, &bytes)?;
            trace!(queue, len, "pushed");
        }
        Ok(())
    }

    /// Takes the oldest message from a queue.
    ///
    /// With no `queues`, the factory's topic names the queue.
    ///
    /// * `timeout == 0`: one non-blocking attempt on the **first** queue;
    ///   `BusError::QueueEmpty` if it has nothing.
    /// * `timeout > 0`: waits on **all** queues at once and returns as soon
    ///   as any has a message, or `BusError::PopTimeout` once `timeout`
    ///   elapses.
    ///
    /// The returned message's topic is the queue it was taken from.
    pub fn pop<M, F>(&self, factory: F, timeout: Duration, queues: &[&str]) -> Result<M, PopError>
    where
        M: Message,
        F: Fn() -> M,
    {
        let queues: Vec<String> = if queues.is_empty() {
            let default = factory().topic().to_string();
            if default.is_empty() {
                return Err(BusError::MissingTopic);
            }
            vec![default]
        } else {
            queues.iter().map(|q| q.to_string()).collect()
        };

        let (queue, bytes) = if timeout.is_zero() {
            let queue = &queues[0];
            match self.store.rpop(queue)? {
                Some(bytes) => (queue.clone(), bytes),
                None => return Err(BusError::QueueEmpty(queue.clone())),
            }
        } else {
            match self.store.brpop(&queues, timeout)? {
                Some(popped) => popped,
                None => return Err(BusError::PopTimeout { queues, timeout }),
            }
        };

        let mut message = self.codec.decode(&factory, &bytes)?;
        message.set_topic(&queue);
        Ok(message)
    }

    /// Number of messages waiting in `queue`.
    pub fn queue_len(&self, queue: &str) -> Result<usize> {
        Ok(self.store.llen(queue)?)
    }
}
