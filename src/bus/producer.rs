//! Publish-only handle bound to a topic.

use std::sync::Arc;

use tracing::trace;

use crate::codec::Codec;
use crate::error::{BusError, PublishError};
use crate::message::Message;
use crate::store::Store;

/// Fire-and-forget broadcaster for one topic.
///
/// Holds no state beyond the topic, so clones can be handed to as many
/// threads as needed.
pub struct Producer<S: Store, K: Codec> {
    store: Arc<S>,
    codec: Arc<K>,
    topic: String,
}

impl<S: Store, K: Codec> Clone for Producer<S, K> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            codec: Arc::clone(&self.codec),
            topic: self.topic.clone(),
        }
    }
}

impl<S: Store, K: Codec> Producer<S, K> {
    pub(crate) fn new(store: Arc<S>, codec: Arc<K>, topic: String) -> Self {
        Self {
            store,
            codec,
            topic,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publishes each message to its own topic, or to the producer's topic
    /// when the message has none.
    ///
    /// Stops at the first failure. Messages before it stay published.
    pub fn publish<M: Message>(&self, messages: &[M]) -> Result<(), PublishError> {
        publish_all(&*self.store, &*self.codec, Some(&self.topic), messages)
    }
}

pub(crate) fn publish_all<S: Store, K: Codec, M: Message>(
    store: &S,
    codec: &K,
    default_topic: Option<&str>,
    messages: &[M],
) -> Result<(), PublishError> {
    for message in messages {
        let topic = match (message.topic(), default_topic) {
            ("", Some(fallback)) if !fallback.is_empty() => fallback,
            ("", _) => return Err(BusError::MissingTopic),
            (own, _) => own,
        };
        let bytes = codec.encode(message)?;
        let receivers = store.publish(topic, &bytes)?;
        trace!(topic, receivers, "published");
    }
    Ok(())
}
