//! Payload codec registry.
//!
//! Wire transports carry payloads as bytes; the registry maps each event name
//! to the concrete payload type registered for it and owns both directions of
//! the conversion. Registration happens at program startup, after which the
//! registry is read-mostly.

use std::any::Any;
use std::collections::HashMap;
use std::sync::RwLock;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::{CodecError, CodecResult};
use crate::event::Payload;
use crate::types::EventName;

type EncodeFn = Box<dyn Fn(&Payload) -> CodecResult<Vec<u8>> + Send + Sync>;
type DecodeFn = Box<dyn Fn(&[u8]) -> CodecResult<Payload> + Send + Sync>;

struct Entry {
    encode: EncodeFn,
    decode: DecodeFn,
}

/// Maps event names to payload serializers and deserializers.
///
/// The wire representation is JSON. Unknown names fail with
/// [`CodecError::UnregisteredName`] in both directions.
#[derive(Default)]
pub struct EventRegistry {
    entries: RwLock<HashMap<EventName, Entry>>,
}

impl EventRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the payload type for an event name.
    ///
    /// Later registrations under the same name replace earlier ones.
    pub fn register<T>(&self, name: EventName)
    where
        T: Serialize + DeserializeOwned + Any + Send + Sync,
    {
        let encode_name = name.clone();
        let decode_name = name.clone();
        let entry = Entry {
            encode: Box::new(move |payload| {
                let value = payload.downcast_ref::<T>().ok_or_else(|| {
                    CodecError::WrongPayloadType {
                        name: encode_name.to_string(),
                    }
                })?;
                serde_json::to_vec(value).map_err(|err| CodecError::Encode {
                    name: encode_name.to_string(),
                    reason: err.to_string(),
                })
            }),
            decode: Box::new(move |bytes| {
                let value: T =
                    serde_json::from_slice(bytes).map_err(|err| CodecError::Decode {
                        name: decode_name.to_string(),
                        reason: err.to_string(),
                    })?;
                Ok(Payload::new(value))
            }),
        };

        self.entries
            .write()
            .expect("codec registry lock poisoned")
            .insert(name, entry);
    }

    /// Serializes a payload registered under `name`.
    pub fn encode(&self, name: &EventName, payload: &Payload) -> CodecResult<Vec<u8>> {
        let entries = self.entries.read().expect("codec registry lock poisoned");
        let entry = entries
            .get(name)
            .ok_or_else(|| CodecError::UnregisteredName(name.to_string()))?;
        (entry.encode)(payload)
    }

    /// Deserializes the payload registered under `name` from bytes.
    pub fn decode(&self, name: &EventName, bytes: &[u8]) -> CodecResult<Payload> {
        let entries = self.entries.read().expect("codec registry lock poisoned");
        let entry = entries
            .get(name)
            .ok_or_else(|| CodecError::UnregisteredName(name.to_string()))?;
        (entry.decode)(bytes)
    }

    /// Whether a payload type is registered under `name`.
    pub fn is_registered(&self, name: &EventName) -> bool {
        self.entries
            .read()
            .expect("codec registry lock poisoned")
            .contains_key(name)
    }
}
