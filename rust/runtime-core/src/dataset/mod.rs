// rust/runtime-core/src/dataset/mod.rs

//! Dataset access and per-worker sharding.
//!
//! # Example
//!
//! ```
//! use synctrain_core::dataset::{Dataset, EpochPlan, ShardPolicy, ShardingOptions, VecDataset};
//!
//! let dataset = VecDataset::new((0..10).collect::<Vec<u32>>());
//! let options = ShardingOptions {
//!     policy: ShardPolicy::DropRemainder,
//!     global_batch_size: 4,
//!     shuffle: false,
//!     seed: 0,
//! };
//!
//! // worker 1 of 2
//! let plan = EpochPlan::for_worker(dataset.cardinality(), 2, 1, &options, 0).unwrap();
//! assert_eq!(plan.steps(), 2);
//! let batch = dataset.batch(plan.batch_indices(0).unwrap()).unwrap();
//! assert_eq!(batch, vec![1, 3]);
//! ```

mod sharding;
mod traits;

pub use sharding::{EpochPlan, ShardAssignment, ShardPolicy, ShardingOptions};
pub use traits::{Dataset, VecDataset};
