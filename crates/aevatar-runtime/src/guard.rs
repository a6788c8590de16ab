//! Scope discipline for state and config writes.
//!
//! Every agent owns one [`MutationGuard`]. Writes are legal only while a
//! [`ScopeHandle`] is alive; handles nest, and dropping an inner handle leaves
//! the outer scope in force. Because an agent is driven by exactly one flow
//! at a time, the guard never needs to be global or thread-local: handling on
//! another agent uses another guard.

use std::marker::PhantomData;
use std::sync::Arc;

use aevatar_protocol::{KernelError, KernelResult};
use parking_lot::Mutex;
use tracing::debug;

/// Accessors that may read outside a scope without being flagged.
pub const READ_ALLOW_LIST: &[&str] = &["state", "description", "version", "id"];

/// Why a scope was opened. Both kinds grant the same rights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// One envelope's full handling, including the loads and saves it triggers.
    Handler,
    /// Agent activation.
    Initialization,
}

#[derive(Debug, Clone, Default)]
pub struct MutationGuard {
    scopes: Arc<Mutex<Vec<ScopeKind>>>,
}

impl MutationGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_scope(&self, kind: ScopeKind) -> ScopeHandle {
        self.scopes.lock().push(kind);
        ScopeHandle {
            scopes: Arc::clone(&self.scopes),
            kind,
        }
    }

    pub fn is_modifiable(&self) -> bool {
        !self.scopes.lock().is_empty()
    }

    /// Innermost open scope, if any.
    pub fn current_scope(&self) -> Option<ScopeKind> {
        self.scopes.lock().last().copied()
    }

    pub fn ensure_modifiable(&self, operation: &str) -> KernelResult<()> {
        if self.is_modifiable() {
            return Ok(());
        }
        Err(KernelError::PreconditionViolation(format!(
            "{operation} called outside a handler or initialization scope"
        )))
    }

    /// Flags reads outside a scope in debug builds. Never fails.
    pub fn observe_read(&self, accessor: &str) {
        if cfg!(debug_assertions) && !READ_ALLOW_LIST.contains(&accessor) && !self.is_modifiable()
        {
            debug!(accessor, "read outside mutation scope");
        }
    }
}

/// Keeps a scope open until dropped.
#[derive(Debug)]
#[must_use = "the scope closes as soon as the handle is dropped"]
pub struct ScopeHandle {
    scopes: Arc<Mutex<Vec<ScopeKind>>>,
    kind: ScopeKind,
}

impl ScopeHandle {
    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    /// Compile-time proof of an open scope for internal write paths.
    pub fn permit(&self) -> MutationPermit<'_> {
        MutationPermit {
            _scope: PhantomData,
        }
    }
}

impl Drop for ScopeHandle {
    fn drop(&mut self) {
        self.scopes.lock().pop();
    }
}

/// Borrowed from a live [`ScopeHandle`]; cannot be created any other way.
#[derive(Debug, Clone, Copy)]
pub struct MutationPermit<'a> {
    _scope: PhantomData<&'a ScopeHandle>,
}
