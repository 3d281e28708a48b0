//! Concrete boundaries for PupilHub: HTTP transport, file-backed store,
//! config file loading and platform paths.

pub mod json_file_store;
pub mod paths;
pub mod reqwest_transport;
pub mod storage;

pub use crate::json_file_store::JsonFileStore;
pub use crate::paths::HubPaths;
pub use crate::reqwest_transport::ReqwestTransport;
pub use crate::storage::{AtomicJsonFile, ConfigStorage};
