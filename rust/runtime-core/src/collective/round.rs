// rust/runtime-core/src/collective/round.rs

use std::collections::BTreeMap;

use super::reduce::{reduce, ReduceOp};
use crate::error::{Result, RuntimeError};
use crate::state::Gradients;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    /// Waiting for contributions.
    Open,
    /// Every worker has contributed; the aggregate can be taken.
    Complete,
    /// The aggregate was taken.
    Closed,
    /// A participant was lost; the round will never complete.
    Aborted,
}

/// Contributions of every worker for a single step.
///
/// Keyed by worker index so iteration, and therefore reduction, happens in
/// ascending worker order. The first contribution from a worker wins;
/// duplicates caused by retries are ignored.
#[derive(Debug, Clone)]
pub struct CollectiveRound {
    step: u64,
    worker_count: usize,
    contributions: BTreeMap<usize, Gradients>,
    phase: RoundPhase,
}

impl CollectiveRound {
    pub fn new(step: u64, worker_count: usize) -> Self {
        Self {
            step,
            worker_count,
            contributions: BTreeMap::new(),
            phase: RoundPhase::Open,
        }
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn phase(&self) -> RoundPhase {
        self.phase
    }

    /// Records `value` for `worker`. Returns false if the worker already
    /// contributed or the round is no longer open.
    pub fn contribute(&mut self, worker: usize, value: Gradients) -> bool {
        if self.phase != RoundPhase::Open || worker >= self.worker_count {
            return false;
        }
        if self.contributions.contains_key(&worker) {
            return false;
        }
        self.contributions.insert(worker, value);
        if self.contributions.len() == self.worker_count {
            self.phase = RoundPhase::Complete;
        }
        true
    }

    pub fn contribution(&self, worker: usize) -> Option<&Gradients> {
        self.contributions.get(&worker)
    }

    pub fn is_complete(&self) -> bool {
        self.phase == RoundPhase::Complete
    }

    /// Workers that have not contributed yet, ascending.
    pub fn missing(&self) -> Vec<usize> {
        (0..self.worker_count)
            .filter(|w| !self.contributions.contains_key(w))
            .collect()
    }

    pub fn abort(&mut self) {
        if matches!(self.phase, RoundPhase::Open | RoundPhase::Complete) {
            self.phase = RoundPhase::Aborted;
        }
    }

    /// Reduces all contributions and closes the round.
    pub fn take_aggregate(&mut self, op: ReduceOp) -> Result<Gradients> {
        if self.phase != RoundPhase::Complete {
            return Err(RuntimeError::collective(format!(
                "round for step {} is {:?}, not complete",
                self.step, self.phase
            )));
        }
        let aggregate = reduce(op, self.contributions.iter().map(|(w, g)| (*w, g)))?;
        self.phase = RoundPhase::Closed;
        Ok(aggregate)
    }
}
