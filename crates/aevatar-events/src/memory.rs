use std::collections::HashMap;

use aevatar_protocol::{
    AgentId, AgentSnapshot, AgentStateEvent, EventLogStore, KernelError, KernelResult, StateKey,
    StateStore,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, instrument, warn};

#[derive(Debug, Default)]
struct AgentLog {
    events: Vec<AgentStateEvent>,
    snapshots: Vec<AgentSnapshot>,
}

impl AgentLog {
    fn head(&self) -> u64 {
        self.events.last().map(|event| event.version).unwrap_or(0)
    }
}

/// Process-local event log. Keeps every snapshot, newest last.
#[derive(Debug, Default)]
pub struct InMemoryEventLog {
    logs: Mutex<HashMap<AgentId, AgentLog>>,
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of snapshots stored for `agent_id`.
    pub fn snapshot_count(&self, agent_id: &AgentId) -> usize {
        self.logs
            .lock()
            .get(agent_id)
            .map(|log| log.snapshots.len())
            .unwrap_or(0)
    }
}

/// Checks that `batch` continues a log whose head is `head`.
pub(crate) fn validate_batch(
    agent_id: &AgentId,
    head: u64,
    batch: &[AgentStateEvent],
    expected_base_version: u64,
) -> KernelResult<()> {
    if head != expected_base_version {
        warn!(
            agent_id = %agent_id,
            expected_base_version,
            head,
            "version conflict while appending events"
        );
        return Err(KernelError::VersionConflict {
            expected: expected_base_version,
            actual: head,
        });
    }
    for (offset, event) in batch.iter().enumerate() {
        let expected = expected_base_version + offset as u64 + 1;
        if event.version != expected {
            warn!(
                agent_id = %agent_id,
                expected,
                actual = event.version,
                "non-contiguous batch rejected"
            );
            return Err(KernelError::VersionConflict {
                expected: expected - 1,
                actual: event.version.saturating_sub(1),
            });
        }
    }
    Ok(())
}

#[async_trait]
impl EventLogStore for InMemoryEventLog {
    #[instrument(skip(self, batch), fields(agent_id = %agent_id, batch = batch.len()))]
    async fn append_events(
        &self,
        agent_id: &AgentId,
        batch: Vec<AgentStateEvent>,
        expected_base_version: u64,
    ) -> KernelResult<u64> {
        let mut logs = self.logs.lock();
        let log = logs.entry(agent_id.clone()).or_default();
        validate_batch(agent_id, log.head(), &batch, expected_base_version)?;
        log.events.extend(batch);
        let head = log.head();
        debug!(head, "events appended");
        Ok(head)
    }

    async fn get_events(
        &self,
        agent_id: &AgentId,
        from_version: u64,
    ) -> KernelResult<Vec<AgentStateEvent>> {
        Ok(self
            .logs
            .lock()
            .get(agent_id)
            .map(|log| {
                log.events
                    .iter()
                    .filter(|event| event.version >= from_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn latest_version(&self, agent_id: &AgentId) -> KernelResult<u64> {
        Ok(self
            .logs
            .lock()
            .get(agent_id)
            .map(AgentLog::head)
            .unwrap_or(0))
    }

    async fn get_latest_snapshot(&self, agent_id: &AgentId) -> KernelResult<Option<AgentSnapshot>> {
        Ok(self
            .logs
            .lock()
            .get(agent_id)
            .and_then(|log| log.snapshots.last().cloned()))
    }

    async fn save_snapshot(&self, agent_id: &AgentId, snapshot: AgentSnapshot) -> KernelResult<()> {
        let mut logs = self.logs.lock();
        let log = logs.entry(agent_id.clone()).or_default();
        if snapshot.version > log.head() {
            return Err(KernelError::Persistence(format!(
                "snapshot version {} is ahead of log head {} for {agent_id}",
                snapshot.version,
                log.head()
            )));
        }
        log.snapshots.push(snapshot);
        Ok(())
    }
}

/// Process-local state/config/hierarchy store.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    records: Mutex<HashMap<StateKey, Vec<u8>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self, key: &StateKey) -> KernelResult<Option<Vec<u8>>> {
        Ok(self.records.lock().get(key).cloned())
    }

    async fn save(&self, key: &StateKey, data: Vec<u8>) -> KernelResult<()> {
        self.records.lock().insert(key.clone(), data);
        Ok(())
    }
}
