//! Error types for the agent kernel.

use thiserror::Error;

/// Errors that can occur in kernel operations.
///
/// Routing skips and decode mismatches are deliberately absent: they degrade
/// to log entries and observer callbacks instead of failing the caller.
#[derive(Debug, Error)]
pub enum KernelError {
    /// State or config touched outside a mutation scope, or direct state
    /// assignment after event sourcing produced a committed version.
    #[error("precondition violation: {0}")]
    PreconditionViolation(String),
    #[error("version conflict: expected base {expected}, store is at {actual}")]
    VersionConflict { expected: u64, actual: u64 },
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
    #[error("operation cancelled: {0}")]
    Cancelled(String),
}

impl KernelError {
    /// Whether the error came from the durable store (conflicts included).
    pub fn is_persistence(&self) -> bool {
        matches!(
            self,
            Self::Persistence(_) | Self::VersionConflict { .. }
        )
    }
}

impl From<serde_json::Error> for KernelError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

/// Convenience result type for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;
