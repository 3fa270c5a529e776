// rust/runtime-core/src/checkpoint/mod.rs

//! Checkpoint system for saving and loading training state.
//!
//! - Generational publishing with an atomically replaced `LATEST` pointer
//! - Compression (none, lz4, zstd) and XXHash64 integrity verification
//! - Fallback to older generations when the newest is corrupt
//! - Lease-aware garbage collection
//!
//! # Example
//!
//! ```no_run
//! use synctrain_core::checkpoint::CheckpointStore;
//! use synctrain_core::config::{CheckpointConfig, StorageConfig};
//! use synctrain_core::state::{Parameters, TrainingState};
//! use synctrain_core::storage::LocalStorage;
//! use std::sync::Arc;
//!
//! let storage = Arc::new(LocalStorage::new(&StorageConfig::default()).unwrap());
//! let store = CheckpointStore::new(storage, &CheckpointConfig::default()).unwrap();
//!
//! let generation = store.publish(&TrainingState::initial(Parameters::new())).unwrap();
//! let loaded = store.load_latest().unwrap().unwrap();
//! assert_eq!(loaded.generation, generation);
//! ```

mod format;
mod store;

pub use format::{decode_checkpoint, decode_header, encode_checkpoint, CheckpointHeader, Compression};
pub use store::{Checkpoint, CheckpointStore, ReadLease};
