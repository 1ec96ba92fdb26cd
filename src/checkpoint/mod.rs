//! Checkpoint persistence: one append-only, gap-free log per task.

pub mod file;
pub mod memory;
pub mod store;

pub use file::FileCheckpointStore;
pub use memory::MemoryCheckpointStore;
pub use store::{Checkpoint, CheckpointStore};
