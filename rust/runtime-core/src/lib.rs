// rust/runtime-core/src/lib.rs

//! Synchronous Training Runtime - Core Library
//!
//! This crate coordinates synchronous data-parallel training across a static
//! set of workers: cluster membership, disjoint dataset sharding, collective
//! gradient aggregation, generational checkpoints, failure detection and
//! pause/resume.

pub mod checkpoint;
pub mod cluster;
pub mod collective;
pub mod config;
pub mod dataset;
pub mod error;
pub mod monitor;
pub mod retry;
pub mod runtime;
pub mod shutdown;
pub mod state;
pub mod storage;
pub mod trainer;

// Re-export commonly used types for convenience
pub use config::RuntimeConfig;
pub use error::{Result, RuntimeError};
pub use storage::{LocalStorage, ObjectMeta, StorageBackend, StorageReader, StorageWriter};

pub use checkpoint::{Checkpoint, CheckpointStore};
pub use cluster::ClusterDescriptor;
pub use collective::{CollectiveChannel, LocalMesh, ReduceOp, TcpTransport, Transport};
pub use dataset::{Dataset, EpochPlan, ShardAssignment, ShardPolicy, VecDataset};
pub use monitor::{ClusterHealth, FailureMonitor};
pub use runtime::Runtime;
pub use state::{Gradients, Optimizer, Parameters, Sgd, Tensor, TrainingState};
pub use trainer::{CoordinatorStatus, Phase, StepOutput, TrainingCoordinator, TrainingStep, TrainingSummary};
