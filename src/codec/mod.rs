//! Message codecs.
//!
//! `JsonCodec` is the default and the wire format other services on the
//! same store expect. `BitcodeCodec` trades that interoperability for a
//! compact binary encoding.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{BusError, Result};
use crate::message::Message;

/// Converts messages to the bytes stored in lists and sent on channels.
pub trait Codec: Send + Sync + 'static {
    fn encode_value<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    fn decode_value<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;

    fn encode<M: Message>(&self, message: &M) -> Result<Vec<u8>> {
        self.encode_value(message)
    }

    /// Decodes `bytes` into the shape produced by `factory`.
    ///
    /// The factory runs first; a payload that carries no topic inherits the
    /// factory's. Formats that always carry every field need nothing more,
    /// so this default takes only the topic from the template. A malformed
    /// payload never yields a half-populated message.
    fn decode<M, F>(&self, factory: &F, bytes: &[u8]) -> Result<M>
    where
        M: Message,
        F: Fn() -> M + ?Sized,
    {
        let template = factory();
        let mut message: M = self.decode_value(bytes)?;
        if message.topic().is_empty() {
            message.set_topic(template.topic());
        }
        Ok(message)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode_value<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| BusError::Encode(e.to_string()))
    }

    fn decode_value<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| BusError::Decode(e.to_string()))
    }

    /// JSON payloads may omit fields. Every field the payload leaves out
    /// keeps the value the factory gave it, nested objects included.
    fn decode<M, F>(&self, factory: &F, bytes: &[u8]) -> Result<M>
    where
        M: Message,
        F: Fn() -> M + ?Sized,
    {
        let template = factory();
        let incoming: Value = self.decode_value(bytes)?;
        let mut merged =
            serde_json::to_value(&template).map_err(|e| BusError::Decode(e.to_string()))?;
        overlay(&mut merged, incoming);

        let mut message: M =
            serde_json::from_value(merged).map_err(|e| BusError::Decode(e.to_string()))?;
        if message.topic().is_empty() {
            message.set_topic(template.topic());
        }
        Ok(message)
    }
}

/// Writes `incoming` over `base`, recursing into objects present in both.
fn overlay(base: &mut Value, incoming: Value) {
    match (base, incoming) {
        (Value::Object(base), Value::Object(incoming)) => {
            for (key, value) in incoming {
                match base.get_mut(&key) {
                    Some(slot) => overlay(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, incoming) => *slot = incoming,
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BitcodeCodec;

impl Codec for BitcodeCodec {
    fn encode_value<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        bitcode::serialize(value).map_err(|e| BusError::Encode(e.to_string()))
    }

    fn decode_value<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        bitcode::deserialize(bytes).map_err(|e| BusError::Decode(e.to_string()))
    }
}
