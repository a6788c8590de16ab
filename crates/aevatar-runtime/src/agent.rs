//! The per-agent kernel object.
//!
//! [`GAgent`] composes the router, the handler table, the event-sourcing
//! engine and the mutation guard around one behavior value. Every method that
//! handles traffic takes `&mut self`, so one agent handles one envelope at a
//! time; hosts add a mailbox per agent to honor that across tasks.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use aevatar_protocol::{
    AgentEvent, AgentHierarchy, AgentId, AgentStateEvent, Direction, EventEnvelope, EventId,
    EventLogStore, HandlerFailed, KernelError, KernelObserver, KernelResult, SkipReason,
    StateKey, StateStore, Transport,
};
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::RuntimeConfig;
use crate::dispatch::{
    self, HandlerCache, HandlerFailure, HandlerFuture, HandlerTable, HandlerTableBuilder,
};
use crate::guard::{MutationGuard, MutationPermit, ScopeKind};
use crate::metrics::{KernelMetrics, MetricsSnapshot, ObserverSet};
use crate::registry::{DecodedEvent, TypeRegistry};
use crate::router::{EventRouter, Forward, RoutePlan};
use crate::sourcing::{EventSourcing, IntervalSnapshotStrategy, SnapshotStrategy};

/// What an agent kind is: its state, config, handlers and state transition.
pub trait AgentBehavior: Send + Sync + Sized + 'static {
    type State: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static;
    /// Use `()` for agents without configuration.
    type Config: Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Stable name; also isolates config records in a shared store.
    fn agent_type() -> &'static str {
        std::any::type_name::<Self>()
    }

    fn description(&self) -> String {
        Self::agent_type().to_owned()
    }

    fn register_handlers(handlers: &mut HandlerTableBuilder<Self>);

    /// Registers the durable event types `transition_state` understands.
    fn register_event_types(_registry: &TypeRegistry) {}

    /// Runs at the end of activation, inside its initialization scope, after
    /// hierarchy, config and state have been restored. The place to seed an
    /// initial state or config.
    fn on_activate(_agent: &mut GAgent<Self>) -> HandlerFuture<'_> {
        Box::pin(async { Ok(()) })
    }

    /// Pure fold of one committed event into the state.
    fn transition_state(_state: &mut Self::State, _event: &DecodedEvent) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct ConfigRecord<C> {
    version: u64,
    config: C,
}

pub struct GAgent<A: AgentBehavior> {
    id: AgentId,
    behavior: A,
    state: A::State,
    config: A::Config,
    config_version: u64,
    config_dirty: bool,
    // Directly assigned state not yet recorded as the log's base snapshot.
    base_state_dirty: bool,
    router: EventRouter,
    sourcing: EventSourcing,
    handlers: Arc<HandlerTable<A>>,
    guard: MutationGuard,
    transport: Arc<dyn Transport>,
    store: Option<Arc<dyn StateStore>>,
    observers: ObserverSet,
    metrics: Arc<KernelMetrics>,
    runtime: RuntimeConfig,
}

impl<A: AgentBehavior> fmt::Debug for GAgent<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GAgent")
            .field("id", &self.id)
            .field("agent_type", &A::agent_type())
            .field("version", &self.sourcing.current_version())
            .field("config_version", &self.config_version)
            .field("hierarchy", self.router.hierarchy())
            .finish_non_exhaustive()
    }
}

fn ensure_live(cancel: &CancellationToken, operation: &str) -> KernelResult<()> {
    if cancel.is_cancelled() {
        return Err(KernelError::Cancelled(format!("{operation} cancelled")));
    }
    Ok(())
}

impl<A: AgentBehavior> GAgent<A> {
    pub fn builder(
        id: impl Into<AgentId>,
        behavior: A,
        transport: Arc<dyn Transport>,
    ) -> GAgentBuilder<A> {
        GAgentBuilder::new(id.into(), behavior, transport)
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn description(&self) -> String {
        self.guard.observe_read("description");
        self.behavior.description()
    }

    pub fn behavior(&self) -> &A {
        &self.behavior
    }

    pub fn behavior_mut(&mut self) -> &mut A {
        &mut self.behavior
    }

    pub fn state(&self) -> &A::State {
        self.guard.observe_read("state");
        &self.state
    }

    pub fn config(&self) -> &A::Config {
        self.guard.observe_read("config");
        &self.config
    }

    pub fn config_version(&self) -> u64 {
        self.config_version
    }

    /// Last committed state version.
    pub fn version(&self) -> u64 {
        self.guard.observe_read("version");
        self.sourcing.current_version()
    }

    pub fn pending_events(&self) -> &[AgentStateEvent] {
        self.sourcing.pending()
    }

    pub fn hierarchy(&self) -> &AgentHierarchy {
        self.router.hierarchy()
    }

    pub fn parent(&self) -> Option<&AgentId> {
        self.router.parent()
    }

    pub fn children(&self) -> Vec<AgentId> {
        self.router.children().cloned().collect()
    }

    pub(crate) fn guard(&self) -> &MutationGuard {
        &self.guard
    }

    pub fn runtime_config(&self) -> &RuntimeConfig {
        &self.runtime
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn handler_names(&self) -> Vec<&str> {
        self.handlers.names()
    }

    /// Replaces the state. Only legal in scope and before any committed event.
    ///
    /// With an event log the assigned state becomes the log's version 0
    /// snapshot at the end of the cycle, so replay starts from it.
    pub fn set_state(&mut self, state: A::State) -> KernelResult<()> {
        self.guard.ensure_modifiable("set_state")?;
        self.sourcing.ensure_unversioned("set_state")?;
        self.state = state;
        self.base_state_dirty = self.sourcing.has_log();
        Ok(())
    }

    /// Replaces the config and returns its new version. Saved with the state
    /// at the end of the current handling cycle.
    pub fn set_config(&mut self, config: A::Config) -> KernelResult<u64> {
        self.guard.ensure_modifiable("set_config")?;
        self.config = config;
        self.config_version += 1;
        self.config_dirty = true;
        Ok(self.config_version)
    }

    pub fn raise_event<E: AgentEvent>(&mut self, event: &E) -> KernelResult<u64> {
        self.sourcing.raise_event(event, HashMap::new())
    }

    pub fn raise_event_with_metadata<E: AgentEvent>(
        &mut self,
        event: &E,
        metadata: HashMap<String, String>,
    ) -> KernelResult<u64> {
        self.sourcing.raise_event(event, metadata)
    }

    pub fn discard_pending(&mut self) -> usize {
        self.sourcing.discard_pending()
    }

    /// Commits staged events and saves the state record.
    pub async fn confirm_events(&mut self, cancel: &CancellationToken) -> KernelResult<u64> {
        let scope = self.guard.begin_scope(ScopeKind::Handler);
        self.commit(scope.permit(), cancel).await?;
        Ok(self.sourcing.current_version())
    }

    pub async fn replay_events(&mut self, cancel: &CancellationToken) -> KernelResult<u64> {
        let scope = self.guard.begin_scope(ScopeKind::Initialization);
        self.sourcing
            .replay_events(&mut self.state, A::transition_state, scope.permit(), cancel)
            .await
    }

    pub fn create_envelope<E: AgentEvent>(
        &self,
        event: &E,
        direction: Direction,
    ) -> KernelResult<EventEnvelope> {
        self.router.create_envelope(event, direction)
    }

    /// Publishes `event`: own handlers first, then the hops. Returns the envelope id.
    #[instrument(skip(self, event, cancel), fields(agent_id = %self.id, event_type = E::type_tag()))]
    pub async fn publish<E: AgentEvent>(
        &mut self,
        event: &E,
        direction: Direction,
        cancel: &CancellationToken,
    ) -> KernelResult<EventId> {
        let envelope = self.router.create_envelope(event, direction)?;
        self.publish_envelope(envelope, cancel).await
    }

    /// Publishes an envelope built with [`GAgent::create_envelope`].
    ///
    /// Hops are issued even when local handling fails. The local error is
    /// returned first, then the first failed hop.
    pub async fn publish_envelope(
        &mut self,
        envelope: EventEnvelope,
        cancel: &CancellationToken,
    ) -> KernelResult<EventId> {
        let id = envelope.id.clone();
        self.observers.event_published(&self.id, &envelope);
        let RoutePlan {
            local,
            forwards,
            skipped,
        } = self.router.route_event(&envelope);
        let handled = match local {
            Some(local) => self.deliver_local(local, cancel).await,
            None => Ok(()),
        };
        let hops = self.forward(forwards, skipped, cancel).await;
        handled?;
        hops?;
        Ok(id)
    }

    /// Handles an envelope delivered by the transport and passes it on.
    #[instrument(
        skip(self, envelope, cancel),
        fields(agent_id = %self.id, envelope_id = %envelope.id, hops = envelope.current_hop_count)
    )]
    pub async fn handle_incoming(
        &mut self,
        envelope: EventEnvelope,
        cancel: &CancellationToken,
    ) -> KernelResult<()> {
        if envelope.should_stop_propagation {
            debug!("propagation stopped; envelope ignored");
            return Ok(());
        }
        let handled = self.deliver_local(envelope.clone(), cancel).await;
        let hops = if envelope.publisher_id != self.id {
            let RoutePlan {
                forwards, skipped, ..
            } = self.router.continue_propagation(&envelope);
            self.forward(forwards, skipped, cancel).await
        } else {
            Ok(())
        };
        handled.and(hops)
    }

    // Boxed: handler failures publish notifications, which deliver locally again.
    fn deliver_local<'a>(
        &'a mut self,
        envelope: EventEnvelope,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, KernelResult<()>> {
        Box::pin(async move {
            if !self.router.should_process_event(&envelope) {
                debug!(agent_id = %self.id, envelope_id = %envelope.id, "envelope not eligible here");
                return Ok(());
            }
            let scope = self.guard.begin_scope(ScopeKind::Handler);
            let started = Instant::now();
            let table = Arc::clone(&self.handlers);
            let max_cause_depth = self.runtime.max_cause_depth;
            let outcome =
                dispatch::run_handlers(self, &table, &envelope, cancel, max_cause_depth).await;
            if outcome.is_dropped() {
                debug!(
                    agent_id = %self.id,
                    envelope_id = %envelope.id,
                    event_type = %envelope.payload.type_tag,
                    "no handler succeeded"
                );
                self.observers.event_dropped(&self.id, &envelope);
            } else {
                self.observers
                    .event_handled(&self.id, &envelope, outcome.invoked, started.elapsed());
            }
            self.report_failures(&envelope, &outcome.failures, cancel)
                .await;
            self.commit(scope.permit(), cancel).await
        })
    }

    async fn report_failures(
        &mut self,
        envelope: &EventEnvelope,
        failures: &[HandlerFailure],
        cancel: &CancellationToken,
    ) {
        let is_notification = envelope.payload.is::<HandlerFailed>();
        for failure in failures {
            self.observers
                .handler_failed(&self.id, &failure.handler, &failure.message);
            if is_notification {
                warn!(
                    agent_id = %self.id,
                    handler = %failure.handler,
                    "failure while handling a failure notification; not re-notified"
                );
                continue;
            }
            let notice = HandlerFailed {
                agent_id: self.id.clone(),
                handler: failure.handler.clone(),
                event_id: envelope.id.clone(),
                event_type: envelope.payload.type_tag.clone(),
                message: failure.message.clone(),
            };
            let published = match self.router.create_envelope(&notice, Direction::Up) {
                Ok(notification) => self.publish_envelope(notification, cancel).await,
                Err(error) => Err(error),
            };
            if let Err(error) = published {
                warn!(agent_id = %self.id, error = %error, "handler failure notification not published");
            }
        }
    }

    /// Issues every hop in order and returns the first delivery failure.
    async fn forward(
        &self,
        forwards: Vec<Forward>,
        skipped: Vec<(AgentId, SkipReason)>,
        cancel: &CancellationToken,
    ) -> KernelResult<()> {
        for (target, reason) in &skipped {
            self.observers.routing_skipped(&self.id, target, *reason);
        }
        let mut first_error = None;
        let mut hops = forwards.into_iter();
        while let Some(Forward { target, envelope }) = hops.next() {
            if cancel.is_cancelled() {
                for target in std::iter::once(target).chain(hops.by_ref().map(|hop| hop.target)) {
                    self.observers
                        .routing_skipped(&self.id, &target, SkipReason::Cancelled);
                }
                debug!(agent_id = %self.id, "cancelled; remaining hops not issued");
                break;
            }
            if let Err(error) = self.transport.deliver_to_agent(&target, envelope).await {
                warn!(agent_id = %self.id, target = %target, error = %error, "hop delivery failed");
                first_error.get_or_insert(error);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn commit(
        &mut self,
        permit: MutationPermit<'_>,
        cancel: &CancellationToken,
    ) -> KernelResult<()> {
        if self.base_state_dirty {
            // Must land before any event is folded on top of it.
            ensure_live(cancel, "base state save")?;
            self.sourcing.record_base_state(&self.state).await?;
            self.base_state_dirty = false;
        }
        let confirmed = self
            .sourcing
            .confirm_events(&mut self.state, A::transition_state, permit, cancel)
            .await;
        if let Err(error) = &confirmed {
            warn!(
                agent_id = %self.id,
                pending = self.sourcing.pending().len(),
                error = %error,
                "confirm failed; pending events kept"
            );
        }
        let persisted = self.persist_records(cancel).await;
        confirmed.and(persisted)
    }

    async fn persist_records(&mut self, cancel: &CancellationToken) -> KernelResult<()> {
        let Some(store) = self.store.clone() else {
            return Ok(());
        };
        ensure_live(cancel, "state save")?;
        store
            .save(&StateKey::state(self.id.clone()), serde_json::to_vec(&self.state)?)
            .await?;
        if self.config_dirty {
            let record = ConfigRecord {
                version: self.config_version,
                config: &self.config,
            };
            store
                .save(
                    &StateKey::config(self.id.clone(), A::agent_type()),
                    serde_json::to_vec(&record)?,
                )
                .await?;
            self.config_dirty = false;
        }
        Ok(())
    }

    async fn persist_hierarchy(&self, cancel: &CancellationToken) -> KernelResult<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        ensure_live(cancel, "hierarchy save")?;
        store
            .save(
                &StateKey::hierarchy(self.id.clone()),
                serde_json::to_vec(self.router.hierarchy())?,
            )
            .await
    }

    /// Loads hierarchy, config and state, replays the log when one is
    /// configured, then runs [`AgentBehavior::on_activate`] and saves the result.
    #[instrument(skip(self, cancel), fields(agent_id = %self.id, agent_type = A::agent_type()))]
    pub async fn activate(&mut self, cancel: &CancellationToken) -> KernelResult<()> {
        let scope = self.guard.begin_scope(ScopeKind::Initialization);
        ensure_live(cancel, "activation")?;
        if let Some(store) = self.store.clone() {
            if let Some(bytes) = store.load(&StateKey::hierarchy(self.id.clone())).await? {
                self.router.replace_hierarchy(serde_json::from_slice(&bytes)?);
            }
            let config_key = StateKey::config(self.id.clone(), A::agent_type());
            if let Some(bytes) = store.load(&config_key).await? {
                let record: ConfigRecord<A::Config> = serde_json::from_slice(&bytes)?;
                self.config = record.config;
                self.config_version = record.version;
            }
            if !self.sourcing.has_log() {
                if let Some(bytes) = store.load(&StateKey::state(self.id.clone())).await? {
                    self.state = serde_json::from_slice(&bytes)?;
                }
            }
        }
        if self.sourcing.has_log() {
            self.sourcing
                .replay_events(&mut self.state, A::transition_state, scope.permit(), cancel)
                .await?;
        }
        A::on_activate(self).await.map_err(|error| {
            error.downcast::<KernelError>().unwrap_or_else(|other| {
                KernelError::PreconditionViolation(format!("activation hook failed: {other:#}"))
            })
        })?;
        self.commit(scope.permit(), cancel).await?;
        info!(
            version = self.sourcing.current_version(),
            config_version = self.config_version,
            children = self.router.hierarchy().children_ids.len(),
            "agent activated"
        );
        Ok(())
    }

    /// Flushes pending events, state, config and hierarchy. Every step is
    /// attempted; the first failure is returned.
    #[instrument(skip(self, cancel), fields(agent_id = %self.id))]
    pub async fn deactivate(&mut self, cancel: &CancellationToken) -> KernelResult<()> {
        let scope = self.guard.begin_scope(ScopeKind::Handler);
        let committed = self.commit(scope.permit(), cancel).await;
        let hierarchy = self.persist_hierarchy(cancel).await;
        drop(scope);
        if let Err(error) = committed.as_ref().and(hierarchy.as_ref()) {
            warn!(error = %error, "deactivation flush incomplete");
        } else {
            info!(version = self.sourcing.current_version(), "agent deactivated");
        }
        committed.and(hierarchy)
    }

    /// Returns false when `child` was already a child.
    pub async fn add_child(
        &mut self,
        child: AgentId,
        cancel: &CancellationToken,
    ) -> KernelResult<bool> {
        if child == self.id {
            return Err(KernelError::PreconditionViolation(format!(
                "agent {} cannot be its own child",
                self.id
            )));
        }
        let added = self.router.hierarchy_mut().add_child(child);
        if added {
            self.persist_hierarchy(cancel).await?;
        }
        Ok(added)
    }

    pub async fn remove_child(
        &mut self,
        child: &AgentId,
        cancel: &CancellationToken,
    ) -> KernelResult<bool> {
        let removed = self.router.hierarchy_mut().remove_child(child);
        if removed {
            self.persist_hierarchy(cancel).await?;
        }
        Ok(removed)
    }

    /// Returns the previous parent.
    pub async fn set_parent(
        &mut self,
        parent: AgentId,
        cancel: &CancellationToken,
    ) -> KernelResult<Option<AgentId>> {
        if parent == self.id {
            return Err(KernelError::PreconditionViolation(format!(
                "agent {} cannot be its own parent",
                self.id
            )));
        }
        let previous = self.router.hierarchy_mut().set_parent(parent);
        self.persist_hierarchy(cancel).await?;
        Ok(previous)
    }

    pub async fn clear_parent(
        &mut self,
        cancel: &CancellationToken,
    ) -> KernelResult<Option<AgentId>> {
        let previous = self.router.hierarchy_mut().clear_parent();
        if previous.is_some() {
            self.persist_hierarchy(cancel).await?;
        }
        Ok(previous)
    }

    /// Returns how many children were removed.
    pub async fn clear_children(&mut self, cancel: &CancellationToken) -> KernelResult<usize> {
        let removed = self.router.hierarchy().children_ids.len();
        self.router.hierarchy_mut().clear_children();
        if removed > 0 {
            self.persist_hierarchy(cancel).await?;
        }
        Ok(removed)
    }
}

pub struct GAgentBuilder<A: AgentBehavior> {
    id: AgentId,
    behavior: A,
    transport: Arc<dyn Transport>,
    runtime: RuntimeConfig,
    state_store: Option<Arc<dyn StateStore>>,
    event_log: Option<Arc<dyn EventLogStore>>,
    snapshot_strategy: Option<Arc<dyn SnapshotStrategy>>,
    registry: Option<Arc<TypeRegistry>>,
    observers: Vec<Arc<dyn KernelObserver>>,
}

impl<A: AgentBehavior> GAgentBuilder<A> {
    fn new(id: AgentId, behavior: A, transport: Arc<dyn Transport>) -> Self {
        Self {
            id,
            behavior,
            transport,
            runtime: RuntimeConfig::default(),
            state_store: None,
            event_log: None,
            snapshot_strategy: None,
            registry: None,
            observers: Vec::new(),
        }
    }

    pub fn runtime_config(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    pub fn event_log(mut self, log: Arc<dyn EventLogStore>) -> Self {
        self.event_log = Some(log);
        self
    }

    /// Defaults to every `snapshot_interval` versions of the runtime config.
    pub fn snapshot_strategy(mut self, strategy: Arc<dyn SnapshotStrategy>) -> Self {
        self.snapshot_strategy = Some(strategy);
        self
    }

    /// Defaults to [`TypeRegistry::global`].
    pub fn registry(mut self, registry: Arc<TypeRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn KernelObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn build(self) -> GAgent<A> {
        let registry = self.registry.unwrap_or_else(TypeRegistry::global);
        registry.register::<HandlerFailed>();
        A::register_event_types(&registry);

        let strategy = self.snapshot_strategy.unwrap_or_else(|| {
            Arc::new(IntervalSnapshotStrategy::new(self.runtime.snapshot_interval))
        });
        let mut sourcing =
            EventSourcing::new(self.id.clone(), registry).with_snapshot_strategy(strategy);
        if let Some(log) = self.event_log {
            sourcing = sourcing.with_log(log);
        }

        let metrics = Arc::new(KernelMetrics::new());
        let mut observers = ObserverSet::new();
        observers.push(Arc::clone(&metrics) as Arc<dyn KernelObserver>);
        for observer in self.observers {
            observers.push(observer);
        }

        GAgent {
            router: EventRouter::new(self.id.clone(), self.runtime.clone()),
            id: self.id,
            behavior: self.behavior,
            state: A::State::default(),
            config: A::Config::default(),
            config_version: 0,
            config_dirty: false,
            base_state_dirty: false,
            sourcing,
            handlers: HandlerCache::global().table_for::<A>(),
            guard: MutationGuard::new(),
            transport: self.transport,
            store: self.state_store,
            observers,
            metrics,
            runtime: self.runtime,
        }
    }
}

#[cfg(test)]
mod tests {
    use aevatar_events::{InMemoryEventLog, InMemoryStateStore};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::dispatch::HandlerOptions;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(AgentId, EventEnvelope)>>,
    }

    impl RecordingTransport {
        fn sent(&self) -> Vec<(AgentId, EventEnvelope)> {
            self.sent.lock().clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn deliver_to_agent(
            &self,
            target: &AgentId,
            envelope: EventEnvelope,
        ) -> KernelResult<()> {
            self.sent.lock().push((target.clone(), envelope));
            Ok(())
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Add {
        amount: i64,
    }

    impl AgentEvent for Add {
        fn type_tag() -> &'static str {
            "test.Add"
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Added {
        amount: i64,
    }

    impl AgentEvent for Added {
        fn type_tag() -> &'static str {
            "test.Added"
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Burst {
        count: u32,
    }

    impl AgentEvent for Burst {
        fn type_tag() -> &'static str {
            "test.Burst"
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ping;

    impl AgentEvent for Ping {
        fn type_tag() -> &'static str {
            "test.Ping"
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Explode {
        fatal: bool,
    }

    impl AgentEvent for Explode {
        fn type_tag() -> &'static str {
            "test.Explode"
        }
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Tally {
        total: i64,
    }

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Limits {
        ceiling: i64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Reset {
        total: i64,
    }

    impl AgentEvent for Reset {
        fn type_tag() -> &'static str {
            "test.Reset"
        }
    }

    #[derive(Default)]
    struct Counter {
        seen: Vec<&'static str>,
        // Seeded by `on_activate` while the agent is still unversioned.
        initial: Option<Tally>,
        limits: Option<Limits>,
    }

    impl AgentBehavior for Counter {
        type State = Tally;
        type Config = Limits;

        fn agent_type() -> &'static str {
            "test.Counter"
        }

        fn register_handlers(handlers: &mut HandlerTableBuilder<Self>) {
            handlers
                .on::<Add, _>("apply_add", |agent, add, _ctx| {
                    Box::pin(async move {
                        agent.behavior_mut().seen.push("apply_add");
                        agent.raise_event(&Added { amount: add.amount })?;
                        anyhow::Ok(())
                    })
                })
                .on_with::<Add, _>("reject_large", HandlerOptions::priority(0), |agent, add, _ctx| {
                    Box::pin(async move {
                        agent.behavior_mut().seen.push("reject_large");
                        anyhow::ensure!(add.amount < 100, "amount {} over limit", add.amount);
                        anyhow::Ok(())
                    })
                })
                .on::<Burst, _>("burst", |agent, burst, _ctx| {
                    Box::pin(async move {
                        for _ in 0..burst.count {
                            agent.raise_event(&Added { amount: 1 })?;
                        }
                        anyhow::Ok(())
                    })
                })
                .on::<Ping, _>("ping", |agent, _ping, _ctx| {
                    Box::pin(async move {
                        agent.behavior_mut().seen.push("ping");
                        anyhow::Ok(())
                    })
                })
                .on_with::<Ping, _>(
                    "ping_own",
                    HandlerOptions::default().allow_self_handling(),
                    |agent, _ping, _ctx| {
                        Box::pin(async move {
                            agent.behavior_mut().seen.push("ping_own");
                            anyhow::Ok(())
                        })
                    },
                )
                .on::<Explode, _>("explode", |_agent, explode, _ctx| {
                    Box::pin(async move {
                        if explode.fatal {
                            panic!("kaboom");
                        }
                        anyhow::Ok(())
                    })
                })
                .on::<HandlerFailed, _>("escalate", |_agent, failed, _ctx| {
                    Box::pin(async move {
                        Err::<(), _>(anyhow::anyhow!(
                            "cannot escalate failure in {}",
                            failed.handler
                        ))
                    })
                })
                .on::<Reset, _>("reset", |agent, reset, _ctx| {
                    Box::pin(async move {
                        agent.set_state(Tally { total: reset.total })?;
                        anyhow::Ok(())
                    })
                })
                .catch_all("audit", HandlerOptions::default(), |agent, _envelope, _ctx| {
                    Box::pin(async move {
                        agent.behavior_mut().seen.push("audit");
                        anyhow::Ok(())
                    })
                });
        }

        fn register_event_types(registry: &TypeRegistry) {
            registry.register::<Added>();
        }

        fn on_activate(agent: &mut GAgent<Self>) -> HandlerFuture<'_> {
            Box::pin(async move {
                if agent.version() == 0 {
                    if let Some(initial) = agent.behavior().initial.clone() {
                        agent.set_state(initial)?;
                    }
                }
                if agent.config_version() == 0 {
                    if let Some(limits) = agent.behavior().limits.clone() {
                        agent.set_config(limits)?;
                    }
                }
                anyhow::Ok(())
            })
        }

        fn transition_state(state: &mut Tally, event: &DecodedEvent) -> anyhow::Result<()> {
            if let Some(added) = event.downcast_ref::<Added>() {
                state.total += added.amount;
            }
            Ok(())
        }
    }

    fn counter(id: &str, transport: &Arc<RecordingTransport>) -> GAgentBuilder<Counter> {
        seeded_counter(id, transport, Counter::default())
    }

    fn seeded_counter(
        id: &str,
        transport: &Arc<RecordingTransport>,
        behavior: Counter,
    ) -> GAgentBuilder<Counter> {
        GAgent::builder(id, behavior, Arc::clone(transport) as Arc<dyn Transport>)
            .registry(Arc::new(TypeRegistry::new()))
    }

    fn incoming<E: AgentEvent>(from: &str, event: &E, direction: Direction) -> EventEnvelope {
        EventEnvelope::new(
            AgentId::from(from),
            aevatar_protocol::TypedPayload::encode(event).unwrap(),
            direction,
            50,
        )
    }

    #[test]
    fn handlers_are_ordered_by_priority_then_registration() {
        let transport = Arc::new(RecordingTransport::default());
        let agent = counter("a", &transport).build();
        assert_eq!(
            agent.handler_names(),
            vec![
                "reject_large",
                "apply_add",
                "burst",
                "ping",
                "ping_own",
                "explode",
                "escalate",
                "reset",
                "audit"
            ]
        );
    }

    #[tokio::test]
    async fn failing_handler_is_isolated_and_reported_once() -> anyhow::Result<()> {
        let transport = Arc::new(RecordingTransport::default());
        let mut agent = counter("a", &transport).build();
        let cancel = CancellationToken::new();
        agent.set_parent(AgentId::from("p"), &cancel).await?;

        agent
            .handle_incoming(incoming("x", &Add { amount: 500 }, Direction::Down), &cancel)
            .await?;

        assert_eq!(
            agent.behavior().seen,
            vec!["reject_large", "apply_add", "audit"]
        );
        assert_eq!(agent.state().total, 500);
        assert_eq!(agent.version(), 1);

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        let (target, notification) = &sent[0];
        assert_eq!(target, &AgentId::from("p"));
        assert_eq!(notification.direction, Direction::Up);
        let failed: HandlerFailed = notification.payload.decode()?;
        assert_eq!(failed.handler, "reject_large");
        assert_eq!(failed.agent_id, AgentId::from("a"));
        assert_eq!(failed.event_type, "test.Add");
        assert!(failed.message.contains("amount 500 over limit"));
        assert_eq!(agent.metrics().handler_failures, 1);
        Ok(())
    }

    #[tokio::test]
    async fn panicking_handler_becomes_a_failure_notification() -> anyhow::Result<()> {
        let transport = Arc::new(RecordingTransport::default());
        let mut agent = counter("a", &transport).build();
        let cancel = CancellationToken::new();
        agent.set_parent(AgentId::from("p"), &cancel).await?;

        agent
            .handle_incoming(incoming("x", &Explode { fatal: true }, Direction::Down), &cancel)
            .await?;

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        let failed: HandlerFailed = sent[0].1.payload.decode()?;
        assert_eq!(failed.handler, "explode");
        assert!(failed.message.contains("kaboom"));
        Ok(())
    }

    #[tokio::test]
    async fn failure_while_handling_a_notification_is_not_renotified() -> anyhow::Result<()> {
        let transport = Arc::new(RecordingTransport::default());
        let mut agent = counter("a", &transport).build();
        let cancel = CancellationToken::new();
        agent.set_parent(AgentId::from("p"), &cancel).await?;

        let notice = HandlerFailed {
            agent_id: AgentId::from("c"),
            handler: "child_handler".into(),
            event_id: EventId::new_uuid(),
            event_type: "test.Add".into(),
            message: "boom".into(),
        };
        agent
            .handle_incoming(incoming("c", &notice, Direction::Up), &cancel)
            .await?;

        // Only the child's own notification continues upward.
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1.publisher_id, AgentId::from("c"));
        assert_eq!(sent[0].1.current_hop_count, 1);
        assert_eq!(agent.metrics().handler_failures, 1);
        Ok(())
    }

    #[tokio::test]
    async fn own_envelopes_skip_handlers_without_self_handling() -> anyhow::Result<()> {
        let transport = Arc::new(RecordingTransport::default());
        let mut agent = counter("a", &transport).build();
        let cancel = CancellationToken::new();

        agent.publish(&Ping, Direction::Down, &cancel).await?;
        assert_eq!(agent.behavior().seen, vec!["ping_own"]);

        agent.behavior_mut().seen.clear();
        agent
            .handle_incoming(incoming("b", &Ping, Direction::Down), &cancel)
            .await?;
        assert_eq!(agent.behavior().seen, vec!["ping", "ping_own", "audit"]);
        Ok(())
    }

    #[tokio::test]
    async fn raised_events_commit_with_contiguous_versions() -> anyhow::Result<()> {
        let transport = Arc::new(RecordingTransport::default());
        let log = Arc::new(InMemoryEventLog::new());
        let mut agent = counter("a", &transport)
            .event_log(Arc::clone(&log) as Arc<dyn EventLogStore>)
            .build();
        let cancel = CancellationToken::new();

        agent
            .handle_incoming(incoming("x", &Burst { count: 3 }, Direction::Down), &cancel)
            .await?;

        let versions: Vec<u64> = log
            .get_events(&AgentId::from("a"), 1)
            .await?
            .iter()
            .map(|event| event.version)
            .collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(agent.version(), 3);
        assert_eq!(agent.state().total, 3);
        assert!(agent.pending_events().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn state_assignment_requires_a_scope() -> anyhow::Result<()> {
        let transport = Arc::new(RecordingTransport::default());
        let behavior = Counter {
            initial: Some(Tally { total: 7 }),
            limits: Some(Limits { ceiling: 1 }),
            ..Counter::default()
        };
        let mut agent = seeded_counter("a", &transport, behavior).build();

        let err = agent.set_state(Tally { total: 7 }).unwrap_err();
        assert!(matches!(err, KernelError::PreconditionViolation(_)));
        assert!(agent.set_config(Limits { ceiling: 1 }).is_err());
        assert_eq!(agent.state().total, 0);

        agent.activate(&CancellationToken::new()).await?;
        assert_eq!(agent.state().total, 7);
        assert_eq!(agent.config().ceiling, 1);
        assert_eq!(agent.config_version(), 1);
        assert!(!agent.guard().is_modifiable());
        assert!(agent.set_state(Tally::default()).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn direct_assignment_is_refused_once_versioned() -> anyhow::Result<()> {
        let transport = Arc::new(RecordingTransport::default());
        let mut agent = counter("a", &transport).build();
        let cancel = CancellationToken::new();
        agent.set_parent(AgentId::from("p"), &cancel).await?;
        agent
            .handle_incoming(incoming("x", &Add { amount: 1 }, Direction::Down), &cancel)
            .await?;
        assert_eq!(agent.version(), 1);

        agent
            .handle_incoming(incoming("x", &Reset { total: 99 }, Direction::Down), &cancel)
            .await?;
        assert_eq!(agent.state().total, 1);
        let sent = transport.sent();
        let failed: HandlerFailed = sent[0].1.payload.decode()?;
        assert_eq!(failed.handler, "reset");
        assert!(failed.message.contains("before the first committed event"));
        Ok(())
    }

    #[tokio::test]
    async fn seeded_state_survives_reactivation_with_a_log() -> anyhow::Result<()> {
        let transport = Arc::new(RecordingTransport::default());
        let log = Arc::new(InMemoryEventLog::new());
        let store = Arc::new(InMemoryStateStore::new());
        let cancel = CancellationToken::new();

        let build = || {
            let behavior = Counter {
                initial: Some(Tally { total: 100 }),
                ..Counter::default()
            };
            seeded_counter("a", &transport, behavior)
                .event_log(Arc::clone(&log) as Arc<dyn EventLogStore>)
                .state_store(Arc::clone(&store) as Arc<dyn StateStore>)
                .build()
        };

        let mut first = build();
        first.activate(&cancel).await?;
        assert_eq!(first.state().total, 100);
        first.deactivate(&cancel).await?;

        let mut second = build();
        second.activate(&cancel).await?;
        assert_eq!(second.state().total, 100);
        second
            .handle_incoming(incoming("x", &Add { amount: 5 }, Direction::Down), &cancel)
            .await?;
        second.deactivate(&cancel).await?;

        let mut third = build();
        third.activate(&cancel).await?;
        assert_eq!(third.state().total, 105);
        assert_eq!(third.version(), 1);
        Ok(())
    }

    struct FailingTransport;

    #[async_trait]
    impl Transport for FailingTransport {
        async fn deliver_to_agent(
            &self,
            _target: &AgentId,
            _envelope: EventEnvelope,
        ) -> KernelResult<()> {
            Err(KernelError::Transport("link down".into()))
        }
    }

    #[tokio::test]
    async fn failed_hops_surface_to_the_caller() -> anyhow::Result<()> {
        let mut agent = GAgent::builder("a", Counter::default(), Arc::new(FailingTransport))
            .registry(Arc::new(TypeRegistry::new()))
            .build();
        let cancel = CancellationToken::new();
        agent.add_child(AgentId::from("b"), &cancel).await?;
        agent.add_child(AgentId::from("c"), &cancel).await?;

        let err = agent
            .publish(&Ping, Direction::Down, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::Transport(ref message) if message == "link down"));
        // Local handling still ran.
        assert_eq!(agent.behavior().seen, vec!["ping_own"]);

        let from_parent = incoming("p", &Ping, Direction::Down);
        let err = agent.handle_incoming(from_parent, &cancel).await.unwrap_err();
        assert!(matches!(err, KernelError::Transport(_)));
        assert_eq!(agent.behavior().seen, vec!["ping_own", "ping", "ping_own", "audit"]);
        Ok(())
    }

    #[tokio::test]
    async fn incoming_envelopes_continue_to_children() -> anyhow::Result<()> {
        let transport = Arc::new(RecordingTransport::default());
        let mut agent = counter("b", &transport).build();
        let cancel = CancellationToken::new();
        agent.set_parent(AgentId::from("a"), &cancel).await?;
        agent.add_child(AgentId::from("c"), &cancel).await?;
        agent.add_child(AgentId::from("d"), &cancel).await?;

        let from_parent = incoming("a", &Ping, Direction::Down)
            .forwarded_by(&AgentId::from("a"), Direction::Down);
        agent.handle_incoming(from_parent, &cancel).await?;

        let sent = transport.sent();
        let targets: Vec<&str> = sent.iter().map(|(target, _)| target.as_str()).collect();
        assert_eq!(targets, vec!["c", "d"]);
        for (_, envelope) in &sent {
            assert_eq!(envelope.current_hop_count, 2);
            assert_eq!(
                envelope.publishers,
                vec![AgentId::from("a"), AgentId::from("b")]
            );
        }
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_token_stops_hops() -> anyhow::Result<()> {
        let transport = Arc::new(RecordingTransport::default());
        let mut agent = counter("a", &transport).build();
        let cancel = CancellationToken::new();
        agent.add_child(AgentId::from("b"), &cancel).await?;
        agent.add_child(AgentId::from("c"), &cancel).await?;

        cancel.cancel();
        agent.publish(&Ping, Direction::Down, &cancel).await?;

        assert!(transport.sent().is_empty());
        assert_eq!(agent.metrics().routing_skips, 2);
        Ok(())
    }

    #[tokio::test]
    async fn self_links_are_rejected() -> anyhow::Result<()> {
        let transport = Arc::new(RecordingTransport::default());
        let mut agent = counter("a", &transport).build();
        let cancel = CancellationToken::new();
        assert!(agent.add_child(AgentId::from("a"), &cancel).await.is_err());
        assert!(agent.set_parent(AgentId::from("a"), &cancel).await.is_err());
        assert!(agent.children().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn reactivation_restores_state_config_and_hierarchy() -> anyhow::Result<()> {
        let transport = Arc::new(RecordingTransport::default());
        let log = Arc::new(InMemoryEventLog::new());
        let store = Arc::new(InMemoryStateStore::new());
        let cancel = CancellationToken::new();

        let build = || {
            let behavior = Counter {
                limits: Some(Limits { ceiling: 40 }),
                ..Counter::default()
            };
            seeded_counter("a", &transport, behavior)
                .event_log(Arc::clone(&log) as Arc<dyn EventLogStore>)
                .state_store(Arc::clone(&store) as Arc<dyn StateStore>)
                .build()
        };

        let mut first = build();
        first.activate(&cancel).await?;
        first.add_child(AgentId::from("b"), &cancel).await?;
        first.set_parent(AgentId::from("root"), &cancel).await?;
        for amount in [5, 6, 7] {
            first
                .handle_incoming(incoming("x", &Add { amount }, Direction::Up), &cancel)
                .await?;
        }
        first.deactivate(&cancel).await?;

        let mut second = build();
        second.activate(&cancel).await?;
        assert_eq!(second.state(), &Tally { total: 18 });
        assert_eq!(second.version(), 3);
        assert_eq!(second.config(), &Limits { ceiling: 40 });
        assert_eq!(second.config_version(), 1);
        assert_eq!(second.children(), vec![AgentId::from("b")]);
        assert_eq!(second.parent(), Some(&AgentId::from("root")));
        Ok(())
    }

    #[tokio::test]
    async fn state_without_a_log_is_restored_from_the_store() -> anyhow::Result<()> {
        let transport = Arc::new(RecordingTransport::default());
        let store = Arc::new(InMemoryStateStore::new());
        let cancel = CancellationToken::new();

        let mut first = counter("a", &transport)
            .state_store(Arc::clone(&store) as Arc<dyn StateStore>)
            .build();
        first
            .handle_incoming(incoming("x", &Add { amount: 4 }, Direction::Down), &cancel)
            .await?;

        let mut second = counter("a", &transport)
            .state_store(Arc::clone(&store) as Arc<dyn StateStore>)
            .build();
        second.activate(&cancel).await?;
        assert_eq!(second.state().total, 4);
        Ok(())
    }
}
