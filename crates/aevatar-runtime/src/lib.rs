//! # aevatar-runtime: Agent kernel core
//!
//! Runtime-agnostic pieces that turn a behavior into a live agent:
//!
//! - [`guard`]: scope discipline for state and config writes
//! - [`registry`]: type-tag to decoder resolution for replay
//! - [`router`]: hierarchical propagation, cycle and hop checks
//! - [`dispatch`]: handler tables and failure-isolated dispatch
//! - [`sourcing`]: stage/confirm/replay/snapshot engine
//! - [`agent`]: [`GAgent`], composing all of the above
//!
//! Hosting (mailboxes, transports between agents) lives in `aevatar-kernel`.

pub mod agent;
pub mod config;
pub mod dispatch;
pub mod guard;
pub mod metrics;
pub mod registry;
pub mod router;
pub mod sourcing;

pub use agent::{AgentBehavior, GAgent, GAgentBuilder};
pub use config::{HOP_SAFETY_CEILING, RuntimeConfig};
pub use dispatch::{
    DispatchOutcome, HandlerCache, HandlerContext, HandlerFuture, HandlerKind, HandlerOptions,
    HandlerTable, HandlerTableBuilder,
};
pub use guard::{MutationGuard, MutationPermit, READ_ALLOW_LIST, ScopeHandle, ScopeKind};
pub use metrics::{KernelMetrics, MetricsSnapshot, ObserverSet};
pub use registry::{DecodedEvent, TypeRegistry};
pub use router::{EventRouter, Forward, RoutePlan};
pub use sourcing::{EventSourcing, IntervalSnapshotStrategy, NeverSnapshot, SnapshotStrategy};
