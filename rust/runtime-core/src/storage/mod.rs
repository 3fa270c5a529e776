// rust/runtime-core/src/storage/mod.rs

//! Storage abstraction for checkpoint files.
//!
//! # Example
//!
//! ```no_run
//! use synctrain_core::config::StorageConfig;
//! use synctrain_core::storage::{LocalStorage, StorageBackend};
//! use std::path::Path;
//!
//! let config = StorageConfig::default();
//! let storage = LocalStorage::new(&config).unwrap();
//!
//! storage.write_all(Path::new("jobs/LATEST"), b"7").unwrap();
//! let content = storage.read_all(Path::new("jobs/LATEST")).unwrap();
//! assert_eq!(content, b"7");
//! ```

mod local;
mod traits;

pub use local::LocalStorage;
pub use traits::{ObjectMeta, StorageBackend, StorageReader, StorageWriter};
