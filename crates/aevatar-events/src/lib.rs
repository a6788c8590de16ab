//! Reference adapters for the kernel's storage and observability ports.

mod file;
mod hub;
mod memory;

pub use file::{FileEventLog, FileStateStore};
pub use hub::EventStreamHub;
pub use memory::{InMemoryEventLog, InMemoryStateStore};
