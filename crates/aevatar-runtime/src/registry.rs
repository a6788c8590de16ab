//! Type-tag resolution for replaying durable events.
//!
//! Decoders are registered explicitly per event type (no runtime scanning).
//! Resolution results, misses included, are cached for the life of the
//! registry; types are assumed stable for the process lifetime.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use aevatar_protocol::{AgentEvent, TypedPayload};
use parking_lot::RwLock;
use tracing::{debug, warn};

pub type DecodeFn =
    Arc<dyn Fn(&[u8]) -> anyhow::Result<Box<dyn Any + Send + Sync>> + Send + Sync>;

/// A payload decoded by the registry into its concrete type.
pub struct DecodedEvent {
    type_tag: String,
    value: Box<dyn Any + Send + Sync>,
}

impl DecodedEvent {
    pub fn new<E: AgentEvent>(event: E) -> Self {
        Self {
            type_tag: E::type_tag().to_owned(),
            value: Box::new(event),
        }
    }

    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn is<E: AgentEvent>(&self) -> bool {
        self.value.is::<E>()
    }

    pub fn downcast_ref<E: AgentEvent>(&self) -> Option<&E> {
        self.value.downcast_ref::<E>()
    }
}

impl fmt::Debug for DecodedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodedEvent")
            .field("type_tag", &self.type_tag)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct TypeRegistry {
    decoders: RwLock<HashMap<String, DecodeFn>>,
    resolved: RwLock<HashMap<String, Option<DecodeFn>>>,
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags: Vec<String> = self.decoders.read().keys().cloned().collect();
        tags.sort();
        f.debug_struct("TypeRegistry").field("tags", &tags).finish()
    }
}

/// Last `::` or `.` separated segment of a tag.
fn short_name(tag: &str) -> &str {
    tag.rsplit([':', '.']).next().unwrap_or(tag)
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide registry used when a host does not supply its own.
    pub fn global() -> Arc<TypeRegistry> {
        static GLOBAL: OnceLock<Arc<TypeRegistry>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(TypeRegistry::new())))
    }

    pub fn register<E: AgentEvent>(&self) -> &Self {
        let decoder: DecodeFn = Arc::new(|bytes: &[u8]| {
            let event: E = serde_json::from_slice(bytes)?;
            Ok(Box::new(event) as Box<dyn Any + Send + Sync>)
        });
        let tag = E::type_tag().to_owned();
        self.decoders.write().insert(tag.clone(), Arc::clone(&decoder));
        self.resolved.write().insert(tag, Some(decoder));
        self
    }

    pub fn is_registered(&self, tag: &str) -> bool {
        self.decoders.read().contains_key(tag)
    }

    /// Decoder for `tag`, falling back to a unique short-name match.
    pub fn resolve(&self, tag: &str) -> Option<DecodeFn> {
        if let Some(cached) = self.resolved.read().get(tag) {
            return cached.clone();
        }
        let resolved = self.resolve_uncached(tag);
        self.resolved
            .write()
            .insert(tag.to_owned(), resolved.clone());
        resolved
    }

    fn resolve_uncached(&self, tag: &str) -> Option<DecodeFn> {
        let decoders = self.decoders.read();
        if let Some(decoder) = decoders.get(tag) {
            return Some(Arc::clone(decoder));
        }
        let wanted = short_name(tag);
        let mut candidates = decoders
            .iter()
            .filter(|(registered, _)| short_name(registered) == wanted);
        match (candidates.next(), candidates.next()) {
            (Some((registered, decoder)), None) => {
                debug!(tag, registered = %registered, "type tag resolved by short name");
                Some(Arc::clone(decoder))
            }
            (Some(_), Some(_)) => {
                warn!(tag, "type tag short name is ambiguous");
                None
            }
            _ => None,
        }
    }

    /// Decodes `payload`, or logs and returns `None` so the caller can skip it.
    pub fn decode(&self, payload: &TypedPayload) -> Option<DecodedEvent> {
        let Some(decoder) = self.resolve(&payload.type_tag) else {
            warn!(type_tag = %payload.type_tag, "unknown event type; skipping");
            return None;
        };
        match decoder(&payload.data) {
            Ok(value) => Some(DecodedEvent {
                type_tag: payload.type_tag.clone(),
                value,
            }),
            Err(error) => {
                warn!(type_tag = %payload.type_tag, error = %error, "event payload failed to decode; skipping");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use aevatar_protocol::{AgentEvent, TypedPayload};
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Renamed {
        value: u32,
    }

    impl AgentEvent for Renamed {
        fn type_tag() -> &'static str {
            "billing::v2::Renamed"
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Other {
        value: u32,
    }

    impl AgentEvent for Other {
        fn type_tag() -> &'static str {
            "billing::v2::Other"
        }
    }

    #[test]
    fn decodes_registered_types() {
        let registry = TypeRegistry::new();
        registry.register::<Renamed>();
        let payload = TypedPayload::encode(&Renamed { value: 3 }).unwrap();
        let decoded = registry.decode(&payload).unwrap();
        assert!(decoded.is::<Renamed>());
        assert_eq!(decoded.downcast_ref::<Renamed>(), Some(&Renamed { value: 3 }));
        assert!(decoded.downcast_ref::<Other>().is_none());
    }

    #[test]
    fn unknown_tags_are_skipped_not_fatal() {
        let registry = TypeRegistry::new();
        let payload = TypedPayload::new("gone::Removed", b"{}".to_vec());
        assert!(registry.decode(&payload).is_none());
        assert!(registry.resolve("gone::Removed").is_none());
    }

    #[test]
    fn moved_namespaces_resolve_by_short_name() {
        let registry = TypeRegistry::new();
        registry.register::<Renamed>();
        let payload = TypedPayload::new("billing.v1.Renamed", b"{\"value\":9}".to_vec());
        let decoded = registry.decode(&payload).unwrap();
        assert_eq!(decoded.downcast_ref::<Renamed>().unwrap().value, 9);
    }

    #[test]
    fn registration_after_a_cached_miss_takes_effect() {
        let registry = TypeRegistry::new();
        assert!(registry.resolve(Other::type_tag()).is_none());
        registry.register::<Other>();
        assert!(registry.resolve(Other::type_tag()).is_some());
    }

    #[test]
    fn malformed_payload_is_skipped() {
        let registry = TypeRegistry::new();
        registry.register::<Renamed>();
        let payload = TypedPayload::new(Renamed::type_tag(), b"[1,2]".to_vec());
        assert!(registry.decode(&payload).is_none());
    }

    #[test]
    fn short_name_takes_last_segment() {
        assert_eq!(short_name("a::b::C"), "C");
        assert_eq!(short_name("a.b.C"), "C");
        assert_eq!(short_name("C"), "C");
    }
}
