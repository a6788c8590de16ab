//! Type-tagged opaque payloads.
//!
//! The kernel never interprets payload bytes. A payload is a type tag plus the
//! encoded value; decoding is done by whoever knows the concrete type (typed
//! handlers, or the type registry during state replay).

use crate::error::{KernelError, KernelResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A value that can travel in an envelope or be recorded as a state event.
///
/// The default tag is the Rust type name, which is only stable for one build.
/// Types written to a durable log should override [`AgentEvent::type_tag`]
/// with a fixed name.
pub trait AgentEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn type_tag() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Encoded payload: type tag + opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypedPayload {
    pub type_tag: String,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

impl TypedPayload {
    pub fn new(type_tag: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            type_tag: type_tag.into(),
            data,
        }
    }

    pub fn encode<E: AgentEvent>(event: &E) -> KernelResult<Self> {
        Ok(Self {
            type_tag: E::type_tag().to_owned(),
            data: serde_json::to_vec(event)?,
        })
    }

    /// Whether the payload carries `E`, judged by tag alone.
    pub fn is<E: AgentEvent>(&self) -> bool {
        self.type_tag == E::type_tag()
    }

    /// Decode as `E`. Fails on tag mismatch or malformed bytes.
    pub fn decode<E: AgentEvent>(&self) -> KernelResult<E> {
        if !self.is::<E>() {
            return Err(KernelError::Serialization(format!(
                "payload tag {} does not match {}",
                self.type_tag,
                E::type_tag()
            )));
        }
        Ok(serde_json::from_slice(&self.data)?)
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        hex::decode(raw).map_err(serde::de::Error::custom)
    }
}
