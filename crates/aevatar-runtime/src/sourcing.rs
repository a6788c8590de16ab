//! Event-sourcing engine: stage, commit, apply, snapshot, replay.
//!
//! State is never written directly by a handler. Handlers raise events; a
//! confirm appends the staged batch to the log under optimistic versioning
//! and only then folds each event into the state with a pure transition.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use aevatar_protocol::{
    AgentEvent, AgentId, AgentSnapshot, AgentStateEvent, EventLogStore, KernelError, KernelResult,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::guard::MutationPermit;
use crate::registry::{DecodedEvent, TypeRegistry};

/// Decides which committed versions trigger a snapshot.
pub trait SnapshotStrategy: Send + Sync {
    fn should_snapshot(&self, version: u64) -> bool;
}

/// Snapshot every `interval` versions. An interval of zero never snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntervalSnapshotStrategy {
    interval: u64,
}

impl IntervalSnapshotStrategy {
    pub fn new(interval: u64) -> Self {
        Self { interval }
    }
}

impl Default for IntervalSnapshotStrategy {
    fn default() -> Self {
        Self::new(100)
    }
}

impl SnapshotStrategy for IntervalSnapshotStrategy {
    fn should_snapshot(&self, version: u64) -> bool {
        self.interval > 0 && version > 0 && version % self.interval == 0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NeverSnapshot;

impl SnapshotStrategy for NeverSnapshot {
    fn should_snapshot(&self, _version: u64) -> bool {
        false
    }
}

pub struct EventSourcing {
    agent_id: AgentId,
    current_version: u64,
    pending: Vec<AgentStateEvent>,
    log: Option<Arc<dyn EventLogStore>>,
    snapshots: Arc<dyn SnapshotStrategy>,
    registry: Arc<TypeRegistry>,
}

impl fmt::Debug for EventSourcing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSourcing")
            .field("agent_id", &self.agent_id)
            .field("current_version", &self.current_version)
            .field("pending", &self.pending.len())
            .field("has_log", &self.log.is_some())
            .finish_non_exhaustive()
    }
}

impl EventSourcing {
    pub fn new(agent_id: AgentId, registry: Arc<TypeRegistry>) -> Self {
        Self {
            agent_id,
            current_version: 0,
            pending: Vec::new(),
            log: None,
            snapshots: Arc::new(IntervalSnapshotStrategy::default()),
            registry,
        }
    }

    pub fn with_log(mut self, log: Arc<dyn EventLogStore>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn with_snapshot_strategy(mut self, strategy: Arc<dyn SnapshotStrategy>) -> Self {
        self.snapshots = strategy;
        self
    }

    pub fn current_version(&self) -> u64 {
        self.current_version
    }

    pub fn pending(&self) -> &[AgentStateEvent] {
        &self.pending
    }

    pub fn has_log(&self) -> bool {
        self.log.is_some()
    }

    /// Stages `event` and returns the version it will commit at.
    pub fn raise_event<E: AgentEvent>(
        &mut self,
        event: &E,
        metadata: HashMap<String, String>,
    ) -> KernelResult<u64> {
        let version = self.current_version + self.pending.len() as u64 + 1;
        let record = AgentStateEvent::new(self.agent_id.clone(), version, event, metadata)?;
        debug!(agent_id = %self.agent_id, version, event_type = %record.event_type, "event raised");
        self.pending.push(record);
        Ok(version)
    }

    /// Drops every staged event and returns how many there were.
    pub fn discard_pending(&mut self) -> usize {
        let discarded = self.pending.len();
        self.pending.clear();
        if discarded > 0 {
            debug!(agent_id = %self.agent_id, discarded, "pending events discarded");
        }
        discarded
    }

    /// Fails unless no event has been committed yet.
    pub fn ensure_unversioned(&self, operation: &str) -> KernelResult<()> {
        if self.current_version == 0 {
            return Ok(());
        }
        Err(KernelError::PreconditionViolation(format!(
            "{operation} is only allowed before the first committed event (agent {} is at version {})",
            self.agent_id, self.current_version
        )))
    }

    /// Commits the staged batch and folds it into `state`.
    ///
    /// On any failure the pending batch is left untouched and `state` is not
    /// modified. Returns the new current version.
    #[instrument(skip_all, fields(agent_id = %self.agent_id, pending = self.pending.len()))]
    pub async fn confirm_events<S, T>(
        &mut self,
        state: &mut S,
        transition: T,
        permit: MutationPermit<'_>,
        cancel: &CancellationToken,
    ) -> KernelResult<u64>
    where
        S: Clone + Serialize + Send,
        T: Fn(&mut S, &DecodedEvent) -> anyhow::Result<()>,
    {
        if self.pending.is_empty() {
            return Ok(self.current_version);
        }
        if cancel.is_cancelled() {
            return Err(KernelError::Cancelled(format!(
                "confirm for agent {} cancelled before append",
                self.agent_id
            )));
        }
        let base = self.current_version;
        let head = match &self.log {
            Some(log) => {
                log.append_events(&self.agent_id, self.pending.clone(), base)
                    .await?
            }
            None => base + self.pending.len() as u64,
        };

        let batch = std::mem::take(&mut self.pending);
        for event in &batch {
            self.apply_event(state, event, &transition, permit);
            self.current_version = event.version;
        }
        self.current_version = head;
        debug!(base, head, "events confirmed");

        if (base + 1..=head).any(|version| self.snapshots.should_snapshot(version)) {
            if let Err(error) = self.save_snapshot(state).await {
                // Events are durable; a missing snapshot only slows replay.
                warn!(error = %error, version = head, "snapshot save failed");
            }
        }
        Ok(head)
    }

    /// Applies one committed event. Unknown tags and failed transitions leave
    /// `state` untouched; returns whether the state changed.
    pub fn apply_event<S, T>(
        &self,
        state: &mut S,
        event: &AgentStateEvent,
        transition: &T,
        _permit: MutationPermit<'_>,
    ) -> bool
    where
        S: Clone,
        T: Fn(&mut S, &DecodedEvent) -> anyhow::Result<()>,
    {
        let Some(decoded) = self.registry.decode(&event.event_data) else {
            return false;
        };
        let mut next = state.clone();
        match transition(&mut next, &decoded) {
            Ok(()) => {
                *state = next;
                true
            }
            Err(error) => {
                warn!(
                    agent_id = %self.agent_id,
                    version = event.version,
                    event_type = %event.event_type,
                    error = %error,
                    "state transition failed; event not applied"
                );
                false
            }
        }
    }

    /// Saves `state` as the version 0 snapshot, the starting point of every
    /// later replay. Only legal before the first committed event.
    pub async fn record_base_state<S: Serialize>(&self, state: &S) -> KernelResult<()> {
        self.ensure_unversioned("base state snapshot")?;
        self.save_snapshot(state).await
    }

    async fn save_snapshot<S: Serialize>(&self, state: &S) -> KernelResult<()> {
        let Some(log) = &self.log else {
            return Ok(());
        };
        let data = serde_json::to_vec(state)?;
        let snapshot = AgentSnapshot::new(self.agent_id.clone(), self.current_version, data);
        log.save_snapshot(&self.agent_id, snapshot).await?;
        debug!(agent_id = %self.agent_id, version = self.current_version, "snapshot saved");
        Ok(())
    }

    /// Rebuilds `state` from the latest intact snapshot plus the events after it.
    ///
    /// Starts from `S::default()` every time, so repeated calls agree.
    #[instrument(skip_all, fields(agent_id = %self.agent_id))]
    pub async fn replay_events<S, T>(
        &mut self,
        state: &mut S,
        transition: T,
        permit: MutationPermit<'_>,
        cancel: &CancellationToken,
    ) -> KernelResult<u64>
    where
        S: Clone + Default + DeserializeOwned + Send,
        T: Fn(&mut S, &DecodedEvent) -> anyhow::Result<()>,
    {
        *state = S::default();
        self.current_version = 0;
        self.discard_pending();
        let Some(log) = self.log.clone() else {
            return Ok(0);
        };
        if cancel.is_cancelled() {
            return Err(KernelError::Cancelled(format!(
                "replay for agent {} cancelled",
                self.agent_id
            )));
        }

        if let Some(snapshot) = log.get_latest_snapshot(&self.agent_id).await? {
            self.restore_snapshot(state, &snapshot);
        }
        let from_snapshot = self.current_version;
        let events = log.get_events(&self.agent_id, from_snapshot + 1).await?;
        let replayed = events.len();
        for event in &events {
            self.apply_event(state, event, &transition, permit);
            self.current_version = event.version;
        }
        info!(
            from_snapshot,
            replayed,
            version = self.current_version,
            "state replayed"
        );
        Ok(self.current_version)
    }

    fn restore_snapshot<S: DeserializeOwned>(&mut self, state: &mut S, snapshot: &AgentSnapshot) {
        if !snapshot.is_intact() {
            warn!(version = snapshot.version, "snapshot hash mismatch; replaying full log");
            return;
        }
        match serde_json::from_slice::<S>(&snapshot.state_data) {
            Ok(restored) => {
                *state = restored;
                self.current_version = snapshot.version;
            }
            Err(error) => {
                warn!(version = snapshot.version, error = %error, "snapshot did not decode; replaying full log");
            }
        }
    }
}
