//! # aevatar-protocol: Agent kernel contract
//!
//! Shared types and boundary traits used by the kernel core, the store
//! adapters, and hosts. Kept free of runtime dependencies (no tokio) so it can
//! be used as a pure contract crate.
//!
//! ## Module Overview
//!
//! - [`ids`]: Typed ID wrappers (AgentId, EventId, CorrelationId)
//! - [`payload`]: `AgentEvent` trait and type-tagged opaque payloads
//! - [`envelope`]: EventEnvelope + Direction
//! - [`event`]: AgentStateEvent, AgentSnapshot, HandlerFailed
//! - [`hierarchy`]: Parent/children record
//! - [`ports`]: Transport, StateStore, EventLogStore, KernelObserver
//! - [`error`]: KernelError, KernelResult

pub mod envelope;
pub mod error;
pub mod event;
pub mod hierarchy;
pub mod ids;
pub mod payload;
pub mod ports;

pub use envelope::{Direction, ENVELOPE_SCHEMA_VERSION, EventEnvelope};
pub use error::{KernelError, KernelResult};
pub use event::{AgentSnapshot, AgentStateEvent, HandlerFailed};
pub use hierarchy::AgentHierarchy;
pub use ids::{AgentId, CorrelationId, EventId};
pub use payload::{AgentEvent, TypedPayload};
pub use ports::{
    EventLogStore, KernelObserver, RecordKind, SkipReason, StateKey, StateStore, Transport,
};
