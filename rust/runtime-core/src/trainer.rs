// rust/runtime-core/src/trainer.rs

//! Synchronous training loop.
//!
//! One [`TrainingCoordinator`] runs per worker. Every step it takes this
//! worker's batch from the epoch plan, computes gradients through the
//! [`TrainingStep`] callback, all-reduces them over the collective channel
//! and applies the aggregate. When a peer is lost the loop pauses until the
//! cluster is whole again, then every worker resumes from the latest
//! published checkpoint, so replicas never diverge.
//!
//! Progress is published on a watch channel; see [`CoordinatorStatus`].

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;

use crate::checkpoint::CheckpointStore;
use crate::cluster::ClusterDescriptor;
use crate::collective::CollectiveChannel;
use crate::config::RuntimeConfig;
use crate::dataset::{Dataset, EpochPlan, ShardingOptions};
use crate::error::{Result, RuntimeError};
use crate::monitor::FailureMonitor;
use crate::state::{Gradients, Optimizer, Parameters, Sgd, TrainingState};

/// Result of one local gradient computation.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub gradients: Gradients,
    pub loss: f32,
}

/// Model numerics supplied by the caller.
pub trait TrainingStep<T>: Send + Sync {
    /// Parameters for a cold start. Must be identical on every worker.
    fn initial_parameters(&self) -> Result<Parameters>;

    /// Gradients of the loss over `batch` at `parameters`.
    fn compute_gradients(&self, parameters: &Parameters, batch: &[T]) -> Result<StepOutput>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Resuming,
    Running,
    /// Waiting for lost peers to come back.
    Paused { lost: Vec<usize> },
    Checkpointing,
    Terminated,
}

/// Where a worker resumed: the checkpoint generation it loaded, or `None`
/// for a cold start, and the step it continued from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumePoint {
    pub generation: Option<u64>,
    pub step: u64,
}

#[derive(Debug, Clone)]
pub struct CoordinatorStatus {
    pub phase: Phase,
    /// Completed steps.
    pub step: u64,
    pub epoch: u64,
    pub lost_peers: Vec<usize>,
    pub paused_since: Option<Instant>,
    pub last_checkpoint: Option<u64>,
    pub last_resume: Option<ResumePoint>,
    pub pauses: u64,
    pub resyncs: u64,
    /// Collective timeline; moves forward on every resume.
    pub timeline: u64,
    pub last_loss: Option<f32>,
}

impl Default for CoordinatorStatus {
    fn default() -> Self {
        Self {
            phase: Phase::Initializing,
            step: 0,
            epoch: 0,
            lost_peers: Vec::new(),
            paused_since: None,
            last_checkpoint: None,
            last_resume: None,
            pauses: 0,
            resyncs: 0,
            timeline: 0,
            last_loss: None,
        }
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub final_state: TrainingState,
    pub last_resume: Option<ResumePoint>,
    pub last_checkpoint: Option<u64>,
    pub pauses: u64,
    pub resyncs: u64,
    pub last_loss: Option<f32>,
}

pub struct TrainingCoordinator<D: Dataset, S> {
    descriptor: Arc<ClusterDescriptor>,
    config: RuntimeConfig,
    dataset: Arc<D>,
    step_fn: S,
    optimizer: Box<dyn Optimizer>,
    channel: CollectiveChannel,
    monitor: Arc<FailureMonitor>,
    store: Arc<CheckpointStore>,
    status: watch::Sender<CoordinatorStatus>,
    last_published_step: Option<u64>,
}

impl<D, S> TrainingCoordinator<D, S>
where
    D: Dataset + 'static,
    S: TrainingStep<D::Item>,
{
    /// Creates a coordinator that applies updates with SGD at the
    /// configured learning rate.
    pub fn new(
        descriptor: Arc<ClusterDescriptor>,
        config: RuntimeConfig,
        dataset: Arc<D>,
        step_fn: S,
        channel: CollectiveChannel,
        monitor: Arc<FailureMonitor>,
        store: Arc<CheckpointStore>,
    ) -> Self {
        let optimizer = Box::new(Sgd::new(config.training.learning_rate));
        let (status, _) = watch::channel(CoordinatorStatus::default());
        Self {
            descriptor,
            config,
            dataset,
            step_fn,
            optimizer,
            channel,
            monitor,
            store,
            status,
            last_published_step: None,
        }
    }

    pub fn with_optimizer(mut self, optimizer: Box<dyn Optimizer>) -> Self {
        self.optimizer = optimizer;
        self
    }

    /// Subscribes to status updates.
    pub fn status(&self) -> watch::Receiver<CoordinatorStatus> {
        self.status.subscribe()
    }

    /// Runs training to completion.
    ///
    /// A worker whose collective round fails with `PeerLost`, or with
    /// `Timeout` once retries are exhausted, pauses until the cluster is
    /// whole and then reloads the latest checkpoint. Reloading moves its
    /// collective channel to a new timeline. Peers still on the old timeline
    /// fail their next round with `StepSkew` when they see its contribution
    /// and reload the same checkpoint, so a failure noticed by one worker
    /// resynchronizes all of them before any further step completes.
    ///
    /// # Errors
    ///
    /// * `Config` when the dataset cannot be partitioned as configured.
    /// * `ClusterUnavailable` when peers stay away longer than the
    ///   configured maximum pause.
    /// * Storage, dataset and callback errors, which are not retried.
    pub async fn run(mut self) -> Result<TrainingSummary> {
        let result = self.run_inner().await;
        if let Err(e) = &result {
            tracing::error!(
                worker = self.descriptor.local_index(),
                error = %e,
                "Training terminated with an error"
            );
        }
        self.set_phase(Phase::Terminated);
        result
    }

    async fn run_inner(&mut self) -> Result<TrainingSummary> {
        let sharding = self.config.training.sharding();
        let cardinality = self.dataset.cardinality();
        let mut plan = EpochPlan::new(cardinality, &self.descriptor, &sharding, 0)?;
        let steps_per_epoch = plan.steps();
        let total_steps = self.total_steps(steps_per_epoch);
        let max_pause = self.config.monitor.max_pause();

        tracing::info!(
            worker = self.descriptor.local_index(),
            workers = self.descriptor.worker_count(),
            chief = self.descriptor.is_chief(),
            cardinality,
            steps_per_epoch,
            total_steps,
            "Starting training"
        );

        self.set_phase(Phase::Initializing);
        self.monitor.wait_all_live(max_pause).await?;

        let mut state = self.resume(steps_per_epoch).await?;

        while state.step < total_steps {
            match self.run_step(&mut state, &mut plan, &sharding, steps_per_epoch).await {
                Ok(()) => {
                    if self.descriptor.is_chief()
                        && state.step % self.config.checkpoint.publish_every_steps == 0
                    {
                        self.publish(&state).await;
                    }
                }
                Err(e @ (RuntimeError::PeerLost { .. } | RuntimeError::Timeout { .. })) => {
                    self.pause(&state, &e);
                    self.monitor.wait_all_live(max_pause).await?;
                    tracing::info!(step = state.step, "Cluster whole again");
                    state = self.resume(steps_per_epoch).await?;
                }
                Err(e @ RuntimeError::StepSkew { .. }) => {
                    tracing::warn!(step = state.step, error = %e, "Resynchronizing from the latest checkpoint");
                    self.status.send_modify(|s| s.resyncs += 1);
                    state = self.resume(steps_per_epoch).await?;
                }
                Err(e) => return Err(e),
            }
        }

        if self.descriptor.is_chief() && self.last_published_step != Some(state.step) {
            self.publish(&state).await;
        }

        let status = self.status.borrow().clone();
        tracing::info!(
            worker = self.descriptor.local_index(),
            step = state.step,
            epoch = state.epoch,
            pauses = status.pauses,
            resyncs = status.resyncs,
            "Training complete"
        );

        Ok(TrainingSummary {
            final_state: state,
            last_resume: status.last_resume,
            last_checkpoint: status.last_checkpoint,
            pauses: status.pauses,
            resyncs: status.resyncs,
            last_loss: status.last_loss,
        })
    }

    fn total_steps(&self, steps_per_epoch: u64) -> u64 {
        let by_epochs = self.config.training.max_epochs.saturating_mul(steps_per_epoch);
        match self.config.training.max_steps {
            Some(max_steps) => by_epochs.min(max_steps),
            None => by_epochs,
        }
    }

    async fn run_step(
        &mut self,
        state: &mut TrainingState,
        plan: &mut EpochPlan,
        sharding: &ShardingOptions,
        steps_per_epoch: u64,
    ) -> Result<()> {
        let epoch = state.step / steps_per_epoch;
        if plan.epoch() != epoch {
            *plan = EpochPlan::new(self.dataset.cardinality(), &self.descriptor, sharding, epoch)?;
            tracing::debug!(epoch, "Planned new epoch");
        }

        let indices = plan.batch_indices(state.step % steps_per_epoch)?;
        let batch = self.dataset.batch(indices)?;
        let output = self.step_fn.compute_gradients(&state.parameters, &batch)?;

        let aggregate = self.contribute_with_retry(state.step, output.gradients).await?;
        self.optimizer.apply(&mut state.parameters, &aggregate)?;

        state.step += 1;
        state.epoch = state.step / steps_per_epoch;
        self.monitor.set_local_step(state.step);

        let (step, epoch) = (state.step, state.epoch);
        self.status.send_modify(|s| {
            s.step = step;
            s.epoch = epoch;
            s.last_loss = Some(output.loss);
        });
        Ok(())
    }

    async fn contribute_with_retry(&mut self, step: u64, gradients: Gradients) -> Result<Gradients> {
        let max_retries = self.config.collective.max_retries;
        let mut attempt = 0u32;

        loop {
            match self.channel.contribute(step, gradients.clone()).await {
                Err(RuntimeError::Timeout { missing, .. }) if attempt < max_retries => {
                    attempt += 1;
                    tracing::warn!(step, attempt, max_retries, ?missing, "Retrying collective round");
                }
                other => return other,
            }
        }
    }

    /// Loads the latest checkpoint, or cold-starts, and clears collective
    /// state for the resumed step.
    async fn resume(&mut self, steps_per_epoch: u64) -> Result<TrainingState> {
        self.set_phase(Phase::Resuming);

        let store = Arc::clone(&self.store);
        let loaded = tokio::task::spawn_blocking(move || store.load_latest())
            .await
            .map_err(|e| RuntimeError::checkpoint(format!("checkpoint load task failed: {e}")))??;

        let (mut state, resume) = match loaded {
            Some(checkpoint) => {
                tracing::info!(
                    generation = checkpoint.generation,
                    step = checkpoint.state.step,
                    "Resuming from checkpoint"
                );
                let step = checkpoint.state.step;
                (
                    checkpoint.state,
                    ResumePoint {
                        generation: Some(checkpoint.generation),
                        step,
                    },
                )
            }
            None => {
                tracing::info!("No checkpoint published; cold start");
                let parameters = self.step_fn.initial_parameters()?;
                (
                    TrainingState::initial(parameters),
                    ResumePoint {
                        generation: None,
                        step: 0,
                    },
                )
            }
        };

        state.epoch = state.step / steps_per_epoch;
        if resume.generation.is_some() {
            self.last_published_step = Some(state.step);
        }
        let timeline = self.channel.reset(state.step);
        self.monitor.set_local_step(state.step);

        let (step, epoch) = (state.step, state.epoch);
        self.status.send_modify(|s| {
            s.step = step;
            s.epoch = epoch;
            s.timeline = timeline;
            s.last_resume = Some(resume);
            s.lost_peers.clear();
            s.paused_since = None;
        });
        self.set_phase(Phase::Running);
        Ok(state)
    }

    fn pause(&mut self, state: &TrainingState, cause: &RuntimeError) {
        let lost = match cause {
            RuntimeError::PeerLost { peer, .. } => {
                let mut lost = self.monitor.health().unavailable();
                if !lost.contains(peer) {
                    lost.push(*peer);
                    lost.sort_unstable();
                }
                lost
            }
            _ => self.monitor.health().unavailable(),
        };

        tracing::warn!(step = state.step, ?lost, error = %cause, "Training paused");
        self.status.send_modify(|s| {
            s.lost_peers = lost.clone();
            s.paused_since = Some(Instant::now());
            s.pauses += 1;
        });
        self.set_phase(Phase::Paused { lost });
    }

    /// Publishes `state` and prunes old generations. Failures are logged;
    /// the previous generation stays authoritative.
    async fn publish(&mut self, state: &TrainingState) {
        self.set_phase(Phase::Checkpointing);

        let store = Arc::clone(&self.store);
        let snapshot = state.clone();
        let keep = self.config.checkpoint.keep_generations;
        let published = tokio::task::spawn_blocking(move || {
            let generation = store.publish(&snapshot)?;
            if let Err(e) = store.garbage_collect(keep) {
                tracing::warn!(generation, error = %e, "Checkpoint garbage collection failed");
            }
            Ok::<_, RuntimeError>(generation)
        })
        .await
        .map_err(|e| RuntimeError::checkpoint(format!("checkpoint publish task failed: {e}")))
        .and_then(|published| published);

        match published {
            Ok(generation) => {
                self.last_published_step = Some(state.step);
                self.status.send_modify(|s| s.last_checkpoint = Some(generation));
            }
            Err(e) => {
                tracing::warn!(
                    step = state.step,
                    error = %e,
                    "Checkpoint publish failed; previous generation stays authoritative"
                );
            }
        }

        self.set_phase(Phase::Running);
    }

    fn set_phase(&self, phase: Phase) {
        let changed = self.status.send_if_modified(|s| {
            if s.phase == phase {
                false
            } else {
                s.phase = phase.clone();
                true
            }
        });
        if changed {
            tracing::info!(worker = self.descriptor.local_index(), phase = ?phase, "Coordinator phase changed");
        }
    }
}
