//! Messages carried by the bus.
//!
//! The bus never knows the concrete payload type of what it moves. Callers
//! hand it a factory producing an empty instance of the shape they expect,
//! and the codec fills that shape from the received bytes.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Anything the bus can publish, push, or deliver.
///
/// The topic doubles as the channel name for broadcast and as the list name
/// for queue operations.
pub trait Message: Serialize + DeserializeOwned + Send + 'static {
    fn topic(&self) -> &str;

    /// Overwrites the topic. The receiving side calls this with the channel
    /// or queue the message actually arrived on.
    fn set_topic(&mut self, topic: &str);

    fn op_code(&self) -> i32 {
        0
    }

    fn session_id(&self) -> &str {
        ""
    }

    fn addressee(&self) -> &str {
        ""
    }
}

/// Produces the empty instance a received message is decoded into.
///
/// Its topic is the default queue for `MessageBus::pop` when no queue name
/// is given.
pub trait MessageFactory<M>: Fn() -> M + Send + Sync + 'static {}

impl<M, F: Fn() -> M + Send + Sync + 'static> MessageFactory<M> for F {}

/// Standard message: routing header plus a typed payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope<P> {
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub op_code: i32,
    #[serde(default)]
    pub addressee: String,
    #[serde(default)]
    pub session_id: String,
    pub payload: P,
}

impl<P> Envelope<P> {
    pub fn new(topic: impl Into<String>, payload: P) -> Self {
        Self {
            topic: topic.into(),
            op_code: 0,
            addressee: String::new(),
            session_id: String::new(),
            payload,
        }
    }

    pub fn with_op_code(mut self, op_code: i32) -> Self {
        self.op_code = op_code;
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn with_addressee(mut self, addressee: impl Into<String>) -> Self {
        self.addressee = addressee.into();
        self
    }
}

impl<P: Default> Envelope<P> {
    /// Empty envelope bound to `topic`, suitable as a factory result.
    pub fn empty(topic: impl Into<String>) -> Self {
        Self::new(topic, P::default())
    }
}

impl<P> Message for Envelope<P>
where
    P: Serialize + DeserializeOwned + Send + 'static,
{
    fn topic(&self) -> &str {
        &self.topic
    }

    fn set_topic(&mut self, topic: &str) {
        self.topic = topic.to_string();
    }

    fn op_code(&self) -> i32 {
        self.op_code
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    fn addressee(&self) -> &str {
        &self.addressee
    }
}
