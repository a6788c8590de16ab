//! Handler tables and the per-envelope dispatch loop.
//!
//! A behavior registers its handlers once through [`HandlerTableBuilder`];
//! the resulting [`HandlerTable`] is cached process-wide per behavior type.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};

use aevatar_protocol::{AgentEvent, AgentId, CorrelationId, Direction, EventEnvelope, EventId};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::agent::{AgentBehavior, GAgent};

pub type HandlerFuture<'a> = BoxFuture<'a, anyhow::Result<()>>;

type ErasedHandler<A> = Arc<
    dyn for<'a> Fn(&'a mut GAgent<A>, &EventEnvelope, HandlerContext) -> Option<HandlerFuture<'a>>
        + Send
        + Sync,
>;

/// Envelope facts handed to every handler invocation.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub envelope_id: EventId,
    pub publisher_id: AgentId,
    pub correlation_id: CorrelationId,
    pub direction: Direction,
    pub hop_count: u32,
    pub cancel: CancellationToken,
}

impl HandlerContext {
    fn for_envelope(envelope: &EventEnvelope, cancel: &CancellationToken) -> Self {
        Self {
            envelope_id: envelope.id.clone(),
            publisher_id: envelope.publisher_id.clone(),
            correlation_id: envelope.correlation_id.clone(),
            direction: envelope.direction,
            hop_count: envelope.current_hop_count,
            cancel: cancel.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerOptions {
    /// Lower runs first. `None` runs after every prioritized handler.
    pub priority: Option<i32>,
    /// Also run for envelopes this agent published itself.
    pub allow_self_handling: bool,
}

impl HandlerOptions {
    pub fn priority(priority: i32) -> Self {
        Self {
            priority: Some(priority),
            ..Self::default()
        }
    }

    pub fn allow_self_handling(mut self) -> Self {
        self.allow_self_handling = true;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Typed { type_tag: &'static str },
    CatchAll,
}

pub struct HandlerEntry<A: AgentBehavior> {
    name: String,
    kind: HandlerKind,
    options: HandlerOptions,
    invoke: ErasedHandler<A>,
}

impl<A: AgentBehavior> HandlerEntry<A> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    pub fn options(&self) -> HandlerOptions {
        self.options
    }
}

impl<A: AgentBehavior> fmt::Debug for HandlerEntry<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Handlers of one behavior type in invocation order.
#[derive(Debug)]
pub struct HandlerTable<A: AgentBehavior> {
    entries: Vec<HandlerEntry<A>>,
}

impl<A: AgentBehavior> HandlerTable<A> {
    pub fn entries(&self) -> &[HandlerEntry<A>] {
        &self.entries
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(HandlerEntry::name).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct HandlerTableBuilder<A: AgentBehavior> {
    entries: Vec<HandlerEntry<A>>,
}

impl<A: AgentBehavior> Default for HandlerTableBuilder<A> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

// Pin the closure to a higher-ranked signature so its borrow of the agent
// can flow into the returned future.
fn erase<A, C>(handler: C) -> ErasedHandler<A>
where
    A: AgentBehavior,
    C: for<'a> Fn(&'a mut GAgent<A>, &EventEnvelope, HandlerContext) -> Option<HandlerFuture<'a>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(handler)
}

impl<A: AgentBehavior> HandlerTableBuilder<A> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Typed handler at default priority.
    pub fn on<M, F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        M: AgentEvent,
        F: for<'a> Fn(&'a mut GAgent<A>, M, HandlerContext) -> HandlerFuture<'a>
            + Send
            + Sync
            + 'static,
    {
        self.on_with::<M, F>(name, HandlerOptions::default(), handler)
    }

    pub fn on_with<M, F>(
        &mut self,
        name: impl Into<String>,
        options: HandlerOptions,
        handler: F,
    ) -> &mut Self
    where
        M: AgentEvent,
        F: for<'a> Fn(&'a mut GAgent<A>, M, HandlerContext) -> HandlerFuture<'a>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        let handler_name = name.clone();
        let invoke = erase::<A, _>(move |agent, envelope, ctx| {
            if !envelope.payload.is::<M>() {
                return None;
            }
            match envelope.payload.decode::<M>() {
                Ok(message) => Some(handler(agent, message, ctx)),
                Err(error) => {
                    debug!(handler = %handler_name, error = %error, "payload did not decode; handler skipped");
                    None
                }
            }
        });
        self.entries.push(HandlerEntry {
            name,
            kind: HandlerKind::Typed {
                type_tag: M::type_tag(),
            },
            options,
            invoke,
        });
        self
    }

    /// Handler that receives every envelope verbatim.
    pub fn catch_all<F>(
        &mut self,
        name: impl Into<String>,
        options: HandlerOptions,
        handler: F,
    ) -> &mut Self
    where
        F: for<'a> Fn(&'a mut GAgent<A>, EventEnvelope, HandlerContext) -> HandlerFuture<'a>
            + Send
            + Sync
            + 'static,
    {
        let invoke =
            erase::<A, _>(move |agent, envelope, ctx| Some(handler(agent, envelope.clone(), ctx)));
        self.entries.push(HandlerEntry {
            name: name.into(),
            kind: HandlerKind::CatchAll,
            options,
            invoke,
        });
        self
    }

    pub fn build(mut self) -> HandlerTable<A> {
        // Stable: registration order breaks priority ties.
        self.entries.sort_by_key(|entry| {
            (
                entry.options.priority.is_none(),
                entry.options.priority.unwrap_or_default(),
            )
        });
        HandlerTable {
            entries: self.entries,
        }
    }
}

/// Process-wide handler tables, built on first use per behavior type.
#[derive(Default)]
pub struct HandlerCache {
    tables: Mutex<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl HandlerCache {
    pub fn global() -> &'static HandlerCache {
        static GLOBAL: OnceLock<HandlerCache> = OnceLock::new();
        GLOBAL.get_or_init(HandlerCache::default)
    }

    pub fn table_for<A: AgentBehavior>(&self) -> Arc<HandlerTable<A>> {
        let key = TypeId::of::<A>();
        if let Some(table) = self.cached::<A>(&key) {
            return table;
        }
        // Built outside the lock; registration runs user code.
        let mut builder = HandlerTableBuilder::new();
        A::register_handlers(&mut builder);
        let built = Arc::new(builder.build());
        let mut tables = self.tables.lock();
        if let Some(Ok(raced)) = tables
            .get(&key)
            .map(|entry| Arc::clone(entry).downcast::<HandlerTable<A>>())
        {
            return raced;
        }
        tables.insert(key, Arc::clone(&built) as Arc<dyn Any + Send + Sync>);
        built
    }

    fn cached<A: AgentBehavior>(&self, key: &TypeId) -> Option<Arc<HandlerTable<A>>> {
        let entry = Arc::clone(self.tables.lock().get(key)?);
        entry.downcast::<HandlerTable<A>>().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub handler: String,
    /// Cause chain flattened into one line.
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Handlers that matched and ran, whether or not they succeeded.
    pub invoked: usize,
    pub failures: Vec<HandlerFailure>,
}

impl DispatchOutcome {
    /// True when no handler completed successfully.
    pub fn is_dropped(&self) -> bool {
        self.invoked == self.failures.len()
    }
}

pub(crate) fn flatten_error(error: &anyhow::Error, max_depth: usize) -> String {
    let mut parts: Vec<String> = error.chain().take(max_depth).map(ToString::to_string).collect();
    if error.chain().count() > max_depth {
        parts.push("...".to_owned());
    }
    parts.join(" -> ")
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_owned()
    }
}

/// Runs every matching handler in table order, isolating failures.
pub(crate) async fn run_handlers<A: AgentBehavior>(
    agent: &mut GAgent<A>,
    table: &HandlerTable<A>,
    envelope: &EventEnvelope,
    cancel: &CancellationToken,
    max_cause_depth: usize,
) -> DispatchOutcome {
    let mut outcome = DispatchOutcome::default();
    let from_self = envelope.publisher_id == *agent.id();
    for entry in &table.entries {
        if from_self && !entry.options.allow_self_handling {
            continue;
        }
        let ctx = HandlerContext::for_envelope(envelope, cancel);
        let Some(future) = (entry.invoke)(agent, envelope, ctx) else {
            continue;
        };
        outcome.invoked += 1;
        let message = match AssertUnwindSafe(future).catch_unwind().await {
            Ok(Ok(())) => continue,
            Ok(Err(error)) => flatten_error(&error, max_cause_depth),
            Err(panic) => panic_message(panic.as_ref()),
        };
        warn!(
            agent_id = %agent.id(),
            handler = %entry.name,
            envelope_id = %envelope.id,
            error = %message,
            "handler failed"
        );
        outcome.failures.push(HandlerFailure {
            handler: entry.name.clone(),
            message,
        });
    }
    outcome
}
