//! Storage layer for atomic file operations.

mod atomic_json;
mod atomic_write;
mod config_storage;

pub use atomic_json::{AtomicJsonError, AtomicJsonFile};
pub use config_storage::{ConfigStorage, ConfigStorageError};
