// rust/runtime-core/src/dataset/sharding.rs

//! Static strided partitioning of a dataset across workers.
//!
//! Worker `i` of `k` consumes positions `i, i + k, i + 2k, ...` of the epoch
//! order. The epoch order is either the identity or a shuffle seeded by
//! `(seed, epoch)`, computed identically on every worker, so the shuffle
//! changes which element sits at a position but never who owns the
//! position. Assignments are recomputed from scratch at every epoch
//! boundary and after every resume; they depend on nothing but the
//! cardinality, the cluster size and the options.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::cluster::ClusterDescriptor;
use crate::error::{Result, RuntimeError};

/// What to do with positions that do not divide evenly among workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardPolicy {
    /// Every position is assigned exactly once; counts may differ by one.
    Exact,
    /// The last `n mod k` positions are dropped on every worker so all
    /// workers get `n / k` positions.
    DropRemainder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardingOptions {
    pub policy: ShardPolicy,
    /// Elements per step across the whole cluster.
    pub global_batch_size: usize,
    pub shuffle: bool,
    pub seed: u64,
}

/// Positions of the epoch order owned by one worker:
/// `offset + worker_index + j * stride` for `j < count`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardAssignment {
    pub offset: usize,
    pub stride: usize,
    pub count: usize,
    worker_index: usize,
    dropped: usize,
}

impl ShardAssignment {
    pub fn for_worker(
        cardinality: usize,
        worker_count: usize,
        worker_index: usize,
        policy: ShardPolicy,
    ) -> Result<Self> {
        if worker_count == 0 {
            return Err(RuntimeError::config("worker count must be greater than 0"));
        }
        if worker_index >= worker_count {
            return Err(RuntimeError::config(format!(
                "worker index {worker_index} out of range for {worker_count} workers"
            )));
        }

        let (count, dropped) = match policy {
            ShardPolicy::Exact => {
                let count = if cardinality > worker_index {
                    (cardinality - worker_index).div_ceil(worker_count)
                } else {
                    0
                };
                (count, 0)
            }
            ShardPolicy::DropRemainder => {
                (cardinality / worker_count, cardinality % worker_count)
            }
        };

        Ok(Self {
            offset: 0,
            stride: worker_count,
            count,
            worker_index,
            dropped,
        })
    }

    pub fn new(
        cardinality: usize,
        descriptor: &ClusterDescriptor,
        policy: ShardPolicy,
    ) -> Result<Self> {
        Self::for_worker(
            cardinality,
            descriptor.worker_count(),
            descriptor.local_index(),
            policy,
        )
    }

    /// Assigned positions, ascending.
    pub fn positions(&self) -> impl Iterator<Item = usize> {
        let start = self.offset + self.worker_index;
        let stride = self.stride;
        (0..self.count).map(move |j| start + j * stride)
    }

    /// Positions at the end of the order that no worker consumes.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn worker_index(&self) -> usize {
        self.worker_index
    }
}

// Seeds for consecutive epochs must not collide for nearby base seeds.
fn epoch_seed(seed: u64, epoch: u64) -> u64 {
    seed ^ epoch.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// One worker's batches for one epoch.
#[derive(Debug, Clone)]
pub struct EpochPlan {
    epoch: u64,
    assignment: ShardAssignment,
    batch_size: usize,
    steps: u64,
    indices: Vec<usize>,
}

impl EpochPlan {
    /// Builds the plan for `epoch` from the local worker's point of view.
    ///
    /// # Errors
    ///
    /// `Config` if the global batch is zero or not divisible by the worker
    /// count, if `Exact` is requested for a cardinality that does not divide
    /// evenly (workers would disagree on the step count), or if the epoch
    /// would have no steps.
    pub fn new(
        cardinality: usize,
        descriptor: &ClusterDescriptor,
        options: &ShardingOptions,
        epoch: u64,
    ) -> Result<Self> {
        Self::for_worker(
            cardinality,
            descriptor.worker_count(),
            descriptor.local_index(),
            options,
            epoch,
        )
    }

    pub fn for_worker(
        cardinality: usize,
        worker_count: usize,
        worker_index: usize,
        options: &ShardingOptions,
        epoch: u64,
    ) -> Result<Self> {
        let assignment =
            ShardAssignment::for_worker(cardinality, worker_count, worker_index, options.policy)?;

        let global = options.global_batch_size;
        if global == 0 || global % worker_count != 0 {
            return Err(RuntimeError::config(format!(
                "global batch size {global} must be a positive multiple of the worker count {worker_count}"
            )));
        }
        if options.policy == ShardPolicy::Exact && cardinality % worker_count != 0 {
            return Err(RuntimeError::config(format!(
                "exact sharding of {cardinality} elements over {worker_count} workers would give \
                 workers different step counts; enable drop_remainder"
            )));
        }

        let batch_size = global / worker_count;
        let steps = match options.policy {
            ShardPolicy::DropRemainder => assignment.count / batch_size,
            ShardPolicy::Exact => assignment.count.div_ceil(batch_size),
        };
        if steps == 0 {
            return Err(RuntimeError::config(format!(
                "an epoch of {cardinality} elements has no complete step of global batch {global}"
            )));
        }

        let mut order: Vec<usize> = (0..cardinality).collect();
        if options.shuffle {
            let mut rng = StdRng::seed_from_u64(epoch_seed(options.seed, epoch));
            order.shuffle(&mut rng);
        }

        let consumed = match options.policy {
            ShardPolicy::DropRemainder => steps * batch_size,
            ShardPolicy::Exact => assignment.count,
        };
        let indices: Vec<usize> = assignment
            .positions()
            .take(consumed)
            .map(|p| order[p])
            .collect();

        Ok(Self {
            epoch,
            assignment,
            batch_size,
            steps: steps as u64,
            indices,
        })
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Steps in this epoch; identical on every worker.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Per-worker batch size.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn assignment(&self) -> &ShardAssignment {
        &self.assignment
    }

    /// Every dataset index this worker consumes in the epoch, in order.
    pub fn local_indices(&self) -> &[usize] {
        &self.indices
    }

    /// Dataset indices of the batch for `step_in_epoch`.
    pub fn batch_indices(&self, step_in_epoch: u64) -> Result<&[usize]> {
        if step_in_epoch >= self.steps {
            return Err(RuntimeError::dataset(format!(
                "step {step_in_epoch} out of range for an epoch of {} steps",
                self.steps
            )));
        }
        let start = step_in_epoch as usize * self.batch_size;
        let end = (start + self.batch_size).min(self.indices.len());
        Ok(&self.indices[start..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn options(policy: ShardPolicy, global_batch_size: usize, shuffle: bool) -> ShardingOptions {
        ShardingOptions {
            policy,
            global_batch_size,
            shuffle,
            seed: 7,
        }
    }

    #[test]
    fn test_exact_counts() {
        // n = 10, k = 3: workers get 4, 3, 3
        let counts: Vec<usize> = (0..3)
            .map(|i| ShardAssignment::for_worker(10, 3, i, ShardPolicy::Exact).unwrap().count)
            .collect();
        assert_eq!(counts, vec![4, 3, 3]);

        // fewer elements than workers
        let counts: Vec<usize> = (0..4)
            .map(|i| ShardAssignment::for_worker(2, 4, i, ShardPolicy::Exact).unwrap().count)
            .collect();
        assert_eq!(counts, vec![1, 1, 0, 0]);
    }

    #[test]
    fn test_drop_remainder_counts() {
        for i in 0..3 {
            let a = ShardAssignment::for_worker(11, 3, i, ShardPolicy::DropRemainder).unwrap();
            assert_eq!(a.count, 3);
            assert_eq!(a.dropped(), 2);
            assert!(a.positions().all(|p| p < 9));
        }
    }

    #[test]
    fn test_positions_are_strided() {
        let a = ShardAssignment::for_worker(10, 3, 1, ShardPolicy::Exact).unwrap();
        assert_eq!(a.positions().collect::<Vec<_>>(), vec![1, 4, 7]);
        assert_eq!(a.offset, 0);
        assert_eq!(a.stride, 3);
        assert_eq!(a.worker_index(), 1);
    }

    #[test]
    fn test_invalid_worker() {
        assert!(ShardAssignment::for_worker(10, 0, 0, ShardPolicy::Exact).is_err());
        assert!(ShardAssignment::for_worker(10, 2, 2, ShardPolicy::Exact).is_err());
    }

    #[test]
    fn test_plan_partition_is_disjoint() {
        for shuffle in [false, true] {
            let opts = options(ShardPolicy::DropRemainder, 6, shuffle);
            let mut seen = BTreeSet::new();
            for i in 0..3 {
                let plan = EpochPlan::for_worker(20, 3, i, &opts, 2).unwrap();
                assert_eq!(plan.steps(), 3);
                for &idx in plan.local_indices() {
                    assert!(seen.insert(idx), "index {idx} assigned twice");
                }
            }
            assert_eq!(seen.len(), 18);
        }
    }

    #[test]
    fn test_shuffle_is_identical_across_workers_and_varies_by_epoch() {
        let opts = options(ShardPolicy::DropRemainder, 4, true);
        let epoch0: Vec<Vec<usize>> = (0..2)
            .map(|i| EpochPlan::for_worker(64, 2, i, &opts, 0).unwrap().local_indices().to_vec())
            .collect();
        let again: Vec<usize> = EpochPlan::for_worker(64, 2, 0, &opts, 0)
            .unwrap()
            .local_indices()
            .to_vec();
        assert_eq!(epoch0[0], again);

        let epoch1 = EpochPlan::for_worker(64, 2, 0, &opts, 1).unwrap();
        assert_ne!(epoch0[0], epoch1.local_indices());

        let identity = EpochPlan::for_worker(64, 2, 0, &options(ShardPolicy::DropRemainder, 4, false), 0)
            .unwrap();
        assert_eq!(identity.local_indices()[..4], [0, 2, 4, 6]);
    }

    #[test]
    fn test_batches_cover_local_indices() {
        let opts = options(ShardPolicy::DropRemainder, 4, false);
        let plan = EpochPlan::for_worker(10, 2, 1, &opts, 0).unwrap();

        assert_eq!(plan.batch_size(), 2);
        assert_eq!(plan.batch_indices(0).unwrap(), &[1, 3]);
        assert_eq!(plan.batch_indices(1).unwrap(), &[5, 7]);
        assert!(plan.batch_indices(2).is_err());
    }

    #[test]
    fn test_exact_keeps_partial_trailing_batch() {
        // 12 elements over 2 workers is 6 each; per-worker batch 4 gives
        // steps of 4 then 2
        let opts = options(ShardPolicy::Exact, 8, false);
        let plan = EpochPlan::for_worker(12, 2, 0, &opts, 0).unwrap();
        assert_eq!(plan.steps(), 2);
        assert_eq!(plan.batch_indices(1).unwrap(), &[8, 10]);
        assert_eq!(plan.local_indices().len(), 6);
    }

    #[test]
    fn test_exact_with_uneven_cardinality_is_rejected() {
        let opts = options(ShardPolicy::Exact, 2, false);
        assert!(matches!(
            EpochPlan::for_worker(11, 2, 0, &opts, 0),
            Err(RuntimeError::Config { .. })
        ));
    }

    #[test]
    fn test_invalid_batch_sizes() {
        assert!(EpochPlan::for_worker(10, 2, 0, &options(ShardPolicy::DropRemainder, 0, false), 0).is_err());
        assert!(EpochPlan::for_worker(10, 2, 0, &options(ShardPolicy::DropRemainder, 3, false), 0).is_err());
        // 10 elements cannot fill one step of 12
        assert!(EpochPlan::for_worker(10, 2, 0, &options(ShardPolicy::DropRemainder, 12, false), 0).is_err());
    }
}
