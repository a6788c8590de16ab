use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use aevatar_protocol::{
    AgentId, AgentSnapshot, AgentStateEvent, EventLogStore, KernelError, KernelResult, RecordKind,
    StateKey, StateStore,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, instrument};

use crate::memory::validate_batch;

fn persistence(error: anyhow::Error) -> KernelError {
    KernelError::Persistence(format!("{error:#}"))
}

/// Percent-encodes everything outside `[A-Za-z0-9._-]` so any agent id maps
/// to exactly one file name.
fn file_stem(agent_id: &AgentId) -> String {
    let mut out = String::with_capacity(agent_id.as_str().len());
    for byte in agent_id.as_str().bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => out.push(byte as char),
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create directory {parent:?}"))?;
    }
    Ok(())
}

async fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !fs::try_exists(path).await.unwrap_or(false) {
        return Ok(Vec::new());
    }
    let file = OpenOptions::new().read(true).open(path).await?;
    let mut reader = BufReader::new(file).lines();
    let mut out = Vec::new();
    while let Some(line) = reader.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line)
            .with_context(|| format!("failed parsing line in {path:?}"))?;
        out.push(record);
    }
    Ok(out)
}

async fn append_lines(path: &Path, lines: String) -> Result<()> {
    ensure_parent(path).await?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("failed opening {path:?}"))?;
    file.write_all(lines.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// JSON Lines event log: one `events/<agent>.jsonl` and one
/// `snapshots/<agent>.jsonl` per agent under `root`.
#[derive(Debug)]
pub struct FileEventLog {
    root: PathBuf,
    write_locks: Mutex<HashMap<AgentId, Arc<tokio::sync::Mutex<()>>>>,
    version_cache: Mutex<HashMap<AgentId, u64>>,
}

impl FileEventLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_locks: Mutex::new(HashMap::new()),
            version_cache: Mutex::new(HashMap::new()),
        }
    }

    fn events_path(&self, agent_id: &AgentId) -> PathBuf {
        self.root
            .join("events")
            .join(format!("{}.jsonl", file_stem(agent_id)))
    }

    fn snapshots_path(&self, agent_id: &AgentId) -> PathBuf {
        self.root
            .join("snapshots")
            .join(format!("{}.jsonl", file_stem(agent_id)))
    }

    fn lock_for(&self, agent_id: &AgentId) -> Arc<tokio::sync::Mutex<()>> {
        let mut guard = self.write_locks.lock();
        guard
            .entry(agent_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn cached_version(&self, agent_id: &AgentId) -> Option<u64> {
        self.version_cache.lock().get(agent_id).copied()
    }

    fn update_cached_version(&self, agent_id: &AgentId, version: u64) {
        self.version_cache.lock().insert(agent_id.clone(), version);
    }

    async fn scan_latest_version(&self, agent_id: &AgentId) -> Result<u64> {
        let events: Vec<AgentStateEvent> = read_jsonl(&self.events_path(agent_id)).await?;
        Ok(events.last().map(|event| event.version).unwrap_or(0))
    }

    async fn head(&self, agent_id: &AgentId) -> Result<u64> {
        if let Some(version) = self.cached_version(agent_id) {
            return Ok(version);
        }
        let version = self.scan_latest_version(agent_id).await?;
        self.update_cached_version(agent_id, version);
        Ok(version)
    }
}

#[async_trait]
impl EventLogStore for FileEventLog {
    #[instrument(skip(self, batch), fields(agent_id = %agent_id, batch = batch.len()))]
    async fn append_events(
        &self,
        agent_id: &AgentId,
        batch: Vec<AgentStateEvent>,
        expected_base_version: u64,
    ) -> KernelResult<u64> {
        let lock = self.lock_for(agent_id);
        let _guard = lock.lock().await;

        let head = self.head(agent_id).await.map_err(persistence)?;
        validate_batch(agent_id, head, &batch, expected_base_version)?;
        let Some(new_head) = batch.last().map(|event| event.version) else {
            return Ok(head);
        };

        let mut lines = String::new();
        for event in &batch {
            lines.push_str(&serde_json::to_string(event)?);
            lines.push('\n');
        }
        // Single write so a batch lands whole or, on a crash mid-write, as a
        // torn tail line that fails parsing instead of a silent partial batch.
        append_lines(&self.events_path(agent_id), lines)
            .await
            .map_err(persistence)?;
        self.update_cached_version(agent_id, new_head);
        debug!(new_head, "events appended to log");
        Ok(new_head)
    }

    #[instrument(skip(self), fields(agent_id = %agent_id))]
    async fn get_events(
        &self,
        agent_id: &AgentId,
        from_version: u64,
    ) -> KernelResult<Vec<AgentStateEvent>> {
        let events: Vec<AgentStateEvent> = read_jsonl(&self.events_path(agent_id))
            .await
            .map_err(persistence)?;
        let out: Vec<_> = events
            .into_iter()
            .filter(|event| event.version >= from_version)
            .collect();
        debug!(count = out.len(), "events loaded from log");
        Ok(out)
    }

    async fn latest_version(&self, agent_id: &AgentId) -> KernelResult<u64> {
        self.head(agent_id).await.map_err(persistence)
    }

    async fn get_latest_snapshot(&self, agent_id: &AgentId) -> KernelResult<Option<AgentSnapshot>> {
        let snapshots: Vec<AgentSnapshot> = read_jsonl(&self.snapshots_path(agent_id))
            .await
            .map_err(persistence)?;
        Ok(snapshots.into_iter().max_by_key(|snapshot| snapshot.version))
    }

    #[instrument(skip(self, snapshot), fields(agent_id = %agent_id, version = snapshot.version))]
    async fn save_snapshot(&self, agent_id: &AgentId, snapshot: AgentSnapshot) -> KernelResult<()> {
        let lock = self.lock_for(agent_id);
        let _guard = lock.lock().await;

        let head = self.head(agent_id).await.map_err(persistence)?;
        if snapshot.version > head {
            return Err(KernelError::Persistence(format!(
                "snapshot version {} is ahead of log head {head} for {agent_id}",
                snapshot.version
            )));
        }
        let mut line = serde_json::to_string(&snapshot)?;
        line.push('\n');
        append_lines(&self.snapshots_path(agent_id), line)
            .await
            .map_err(persistence)?;
        debug!("snapshot saved");
        Ok(())
    }
}

/// One JSON document per record under `root/state/<agent>/`.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn record_path(&self, key: &StateKey) -> PathBuf {
        let dir = self.root.join("state").join(file_stem(&key.agent_id));
        match &key.kind {
            RecordKind::State => dir.join("state.json"),
            RecordKind::Config { agent_type } => dir
                .join("config")
                .join(format!("{}.json", file_stem(&AgentId::from(agent_type.as_str())))),
            RecordKind::Hierarchy => dir.join("hierarchy.json"),
        }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, key: &StateKey) -> KernelResult<Option<Vec<u8>>> {
        let path = self.record_path(key);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        let data = fs::read(&path)
            .await
            .with_context(|| format!("failed reading record {path:?}"))
            .map_err(persistence)?;
        Ok(Some(data))
    }

    #[instrument(skip(self, data), fields(key = %key, bytes = data.len()))]
    async fn save(&self, key: &StateKey, data: Vec<u8>) -> KernelResult<()> {
        let path = self.record_path(key);
        let staged = path.with_extension("json.tmp");
        async {
            ensure_parent(&path).await?;
            fs::write(&staged, &data)
                .await
                .with_context(|| format!("failed writing {staged:?}"))?;
            fs::rename(&staged, &path)
                .await
                .with_context(|| format!("failed replacing {path:?}"))?;
            anyhow::Ok(())
        }
        .await
        .map_err(persistence)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use aevatar_protocol::{
        AgentEvent, AgentId, AgentSnapshot, AgentStateEvent, EventLogStore, KernelError,
        StateKey, StateStore,
    };
    use anyhow::Result;
    use serde::{Deserialize, Serialize};
    use tokio::fs;

    use super::{FileEventLog, FileStateStore, file_stem};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Tick {
        n: u64,
    }

    impl AgentEvent for Tick {
        fn type_tag() -> &'static str {
            "test.Tick"
        }
    }

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    fn batch(agent: &AgentId, from: u64, count: u64) -> Vec<AgentStateEvent> {
        (from..from + count)
            .map(|version| {
                AgentStateEvent::new(agent.clone(), version, &Tick { n: version }, HashMap::new())
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn file_stem_escapes_separators() {
        assert_eq!(file_stem(&AgentId::from("team/lead 1")), "team%2Flead%201");
        assert_eq!(file_stem(&AgentId::from("plain-id_2.x")), "plain-id_2.x");
    }

    #[tokio::test]
    async fn file_log_appends_and_reads_in_version_order() -> Result<()> {
        let root = unique_test_root("aevatar-events");
        let log = FileEventLog::new(&root);
        let agent = AgentId::from("worker/1");

        log.append_events(&agent, batch(&agent, 1, 2), 0).await?;
        log.append_events(&agent, batch(&agent, 3, 1), 2).await?;

        let from_two = log.get_events(&agent, 2).await?;
        let versions: Vec<_> = from_two.iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![2, 3]);

        let reopened = FileEventLog::new(&root);
        assert_eq!(reopened.latest_version(&agent).await?, 3);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn file_log_rejects_stale_base_after_reopen() -> Result<()> {
        let root = unique_test_root("aevatar-events-conflict");
        let agent = AgentId::from("a");
        FileEventLog::new(&root)
            .append_events(&agent, batch(&agent, 1, 1), 0)
            .await?;

        let err = FileEventLog::new(&root)
            .append_events(&agent, batch(&agent, 1, 1), 0)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expected base 0, store is at 1"));
        assert!(matches!(err, KernelError::VersionConflict { .. }));

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn file_log_returns_highest_snapshot() -> Result<()> {
        let root = unique_test_root("aevatar-events-snapshot");
        let log = FileEventLog::new(&root);
        let agent = AgentId::from("a");
        log.append_events(&agent, batch(&agent, 1, 4), 0).await?;

        assert!(log.get_latest_snapshot(&agent).await?.is_none());
        log.save_snapshot(&agent, AgentSnapshot::new(agent.clone(), 4, b"{}".to_vec()))
            .await?;
        log.save_snapshot(&agent, AgentSnapshot::new(agent.clone(), 2, b"{}".to_vec()))
            .await?;
        let latest = log.get_latest_snapshot(&agent).await?.unwrap();
        assert_eq!(latest.version, 4);
        assert!(latest.is_intact());

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn file_snapshot_waits_for_in_flight_append() -> Result<()> {
        let root = unique_test_root("aevatar-events-snapshot-lock");
        let log = FileEventLog::new(&root);
        let agent = AgentId::from("a");
        log.append_events(&agent, batch(&agent, 1, 4), 0).await?;

        let (appended, saved) = tokio::join!(
            log.append_events(&agent, batch(&agent, 5, 4), 4),
            log.save_snapshot(&agent, AgentSnapshot::new(agent.clone(), 8, b"{}".to_vec())),
        );
        assert_eq!(appended?, 8);
        saved?;
        assert_eq!(log.get_latest_snapshot(&agent).await?.unwrap().version, 8);

        let err = log
            .save_snapshot(&agent, AgentSnapshot::new(agent.clone(), 9, b"{}".to_vec()))
            .await
            .unwrap_err();
        assert!(err.is_persistence());

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn file_state_store_overwrites_records() -> Result<()> {
        let root = unique_test_root("aevatar-state");
        let store = FileStateStore::new(&root);
        let key = StateKey::config(AgentId::from("a"), "demo::Counter");

        assert_eq!(store.load(&key).await?, None);
        store.save(&key, b"{\"v\":1}".to_vec()).await?;
        store.save(&key, b"{\"v\":2}".to_vec()).await?;
        assert_eq!(store.load(&key).await?, Some(b"{\"v\":2}".to_vec()));
        assert_eq!(store.load(&StateKey::state(AgentId::from("a"))).await?, None);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }
}
