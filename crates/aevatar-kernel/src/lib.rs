//! # aevatar-kernel: Local agent host
//!
//! Assembles stores, the type registry and the stream hub into a
//! [`LocalRuntime`] that runs each agent in its own mailbox task.

mod local;

use std::path::PathBuf;
use std::sync::Arc;

use aevatar_events::{
    EventStreamHub, FileEventLog, FileStateStore, InMemoryEventLog, InMemoryStateStore,
};
use aevatar_protocol::{EventLogStore, StateStore};
use aevatar_runtime::{RuntimeConfig, TypeRegistry};

pub use local::{AgentHandle, LocalRuntime, LocalTransport};

#[derive(Debug, Clone)]
pub struct KernelBuilder {
    root: Option<PathBuf>,
    config: RuntimeConfig,
    stream_buffer: usize,
    event_sourced: bool,
    registry: Option<Arc<TypeRegistry>>,
}

impl Default for KernelBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl KernelBuilder {
    /// In-memory stores until [`KernelBuilder::root`] is set.
    pub fn new() -> Self {
        Self {
            root: None,
            config: RuntimeConfig::default(),
            stream_buffer: 1024,
            event_sourced: true,
            registry: None,
        }
    }

    /// Persist to JSON Lines and JSON documents under `root`.
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    pub fn runtime_config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn stream_buffer(mut self, buffer: usize) -> Self {
        self.stream_buffer = buffer.max(1);
        self
    }

    /// Without an event log, agent state is restored from the state store only.
    pub fn event_sourced(mut self, enabled: bool) -> Self {
        self.event_sourced = enabled;
        self
    }

    /// Defaults to a registry private to the built runtime.
    pub fn registry(mut self, registry: Arc<TypeRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> LocalRuntime {
        let (state_store, event_log): (Arc<dyn StateStore>, Arc<dyn EventLogStore>) =
            match &self.root {
                Some(root) => (
                    Arc::new(FileStateStore::new(root)),
                    Arc::new(FileEventLog::new(root)),
                ),
                None => (
                    Arc::new(InMemoryStateStore::new()),
                    Arc::new(InMemoryEventLog::new()),
                ),
            };
        let event_log = self.event_sourced.then_some(event_log);
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(TypeRegistry::new()));
        LocalRuntime::new(
            self.config,
            Some(state_store),
            event_log,
            registry,
            EventStreamHub::new(self.stream_buffer),
        )
    }
}
