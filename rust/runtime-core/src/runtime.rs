// rust/runtime-core/src/runtime.rs

//! Per-worker wiring.
//!
//! This module provides the `Runtime` struct that ties together the
//! components of one worker: transport, failure monitor with its background
//! tasks, collective channel, and checkpoint store.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use synctrain_core::cluster::{ClusterDescriptor, CLUSTER_SPEC_ENV};
//! use synctrain_core::RuntimeConfig;
//! use synctrain_core::Runtime;
//!
//! # async fn demo() -> synctrain_core::Result<()> {
//! let config = RuntimeConfig::from_file("worker.toml")?.with_env_overrides();
//! let descriptor = Arc::new(ClusterDescriptor::from_env(CLUSTER_SPEC_ENV)?);
//!
//! let mut runtime = Runtime::start_tcp(config, descriptor).await?;
//! // let coordinator = runtime.coordinator(dataset, step_fn)?;
//! // let summary = coordinator.run().await?;
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::checkpoint::CheckpointStore;
use crate::cluster::ClusterDescriptor;
use crate::collective::{CollectiveChannel, EventReceiver, LocalMesh, TcpTransport, Transport};
use crate::config::RuntimeConfig;
use crate::dataset::Dataset;
use crate::error::{Result, RuntimeError};
use crate::monitor::{spawn_router, spawn_sweeper, FailureMonitor, HeartbeatTask};
use crate::retry::RetryConfig;
use crate::storage::{LocalStorage, StorageBackend};
use crate::trainer::{TrainingCoordinator, TrainingStep};

/// The components of one worker.
///
/// The `Runtime` owns the background tasks and provides:
/// - The failure monitor and checkpoint store
/// - A training coordinator wired to all of them (once)
/// - Orderly shutdown
pub struct Runtime {
    config: RuntimeConfig,
    descriptor: Arc<ClusterDescriptor>,
    monitor: Arc<FailureMonitor>,
    store: Arc<CheckpointStore>,
    channel: Option<CollectiveChannel>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Starts a worker that talks to its peers over TCP.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the storage
    /// backend cannot be initialized, or the local address cannot be bound.
    pub async fn start_tcp(config: RuntimeConfig, descriptor: Arc<ClusterDescriptor>) -> Result<Self> {
        config.validate()?;

        let monitor = Arc::new(FailureMonitor::new(
            Arc::clone(&descriptor),
            &config.monitor,
            Uuid::new_v4(),
        ));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (transport, events) = TcpTransport::bind(
            Arc::clone(&descriptor),
            monitor.origin(),
            monitor.step_counter(),
            RetryConfig::from(&config.monitor),
            shutdown_rx,
        )
        .await?;

        Self::start(config, monitor, transport, events, shutdown)
    }

    /// Starts worker `descriptor.local_index()` on an in-process mesh.
    /// `events` is that endpoint's receiver.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the mesh does not
    /// match the cluster, or the storage backend cannot be initialized.
    pub fn start_local(
        config: RuntimeConfig,
        descriptor: Arc<ClusterDescriptor>,
        mesh: &LocalMesh,
        events: EventReceiver,
    ) -> Result<Self> {
        config.validate()?;
        if mesh.worker_count() != descriptor.worker_count() {
            return Err(RuntimeError::config(format!(
                "mesh of {} endpoints cannot host a cluster of {} workers",
                mesh.worker_count(),
                descriptor.worker_count()
            )));
        }

        let monitor = Arc::new(FailureMonitor::new(
            Arc::clone(&descriptor),
            &config.monitor,
            Uuid::new_v4(),
        ));
        let transport = mesh.transport(descriptor.local_index())?;
        let (shutdown, _) = watch::channel(false);
        Self::start(config, monitor, transport, events, shutdown)
    }

    fn start(
        config: RuntimeConfig,
        monitor: Arc<FailureMonitor>,
        transport: Arc<dyn Transport>,
        events: EventReceiver,
        shutdown: watch::Sender<bool>,
    ) -> Result<Self> {
        let descriptor = Arc::clone(monitor.descriptor());
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalStorage::new(&config.storage)?);
        let store = Arc::new(CheckpointStore::new(storage, &config.checkpoint)?);

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let channel = CollectiveChannel::new(
            Arc::clone(&transport),
            monitor.origin(),
            inbox_rx,
            monitor.subscribe(),
            &config.collective,
        );

        let interval = config.monitor.heartbeat_interval();
        let tasks = vec![
            spawn_router(events, Arc::clone(&monitor), inbox_tx, shutdown.subscribe()),
            HeartbeatTask::new(Arc::clone(&monitor), transport, interval, shutdown.subscribe()).spawn(),
            spawn_sweeper(Arc::clone(&monitor), interval, shutdown.subscribe()),
        ];

        tracing::info!(
            worker = descriptor.local_index(),
            workers = descriptor.worker_count(),
            incarnation = %monitor.origin().incarnation,
            checkpoint_root = %store.root().display(),
            "Worker runtime started"
        );

        Ok(Self {
            config,
            descriptor,
            monitor,
            store,
            channel: Some(channel),
            shutdown,
            tasks,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn descriptor(&self) -> &Arc<ClusterDescriptor> {
        &self.descriptor
    }

    pub fn monitor(&self) -> &Arc<FailureMonitor> {
        &self.monitor
    }

    pub fn store(&self) -> &Arc<CheckpointStore> {
        &self.store
    }

    /// Builds the training coordinator. Can only be called once, since the
    /// coordinator takes over the collective channel.
    ///
    /// # Errors
    ///
    /// Returns `Config` when a coordinator was already built.
    pub fn coordinator<D, S>(&mut self, dataset: Arc<D>, step_fn: S) -> Result<TrainingCoordinator<D, S>>
    where
        D: Dataset + 'static,
        S: TrainingStep<D::Item>,
    {
        let channel = self
            .channel
            .take()
            .ok_or_else(|| RuntimeError::config("the training coordinator was already created"))?;
        Ok(TrainingCoordinator::new(
            Arc::clone(&self.descriptor),
            self.config.clone(),
            dataset,
            step_fn,
            channel,
            Arc::clone(&self.monitor),
            Arc::clone(&self.store),
        ))
    }

    /// Stops heartbeats, sweeps, event routing and, for TCP, all peer
    /// links, and waits for the tasks to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task failed during shutdown");
            }
        }
        tracing::info!(worker = self.descriptor.local_index(), "Worker runtime stopped");
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::dataset::VecDataset;
    use crate::state::{Gradients, Parameters, Tensor};
    use crate::trainer::StepOutput;
    use tempfile::TempDir;

    struct Constant;

    impl TrainingStep<f32> for Constant {
        fn initial_parameters(&self) -> Result<Parameters> {
            let mut p = Parameters::new();
            p.insert("w".to_string(), Tensor::scalar(1.0));
            Ok(p)
        }

        fn compute_gradients(&self, _parameters: &Parameters, batch: &[f32]) -> Result<StepOutput> {
            let mut gradients = Gradients::new();
            gradients.insert("w".to_string(), Tensor::scalar(batch.iter().sum()));
            Ok(StepOutput { gradients, loss: 0.0 })
        }
    }

    fn test_config(dir: &TempDir) -> RuntimeConfig {
        let mut config = RuntimeConfig::default();
        config.storage = StorageConfig {
            base_path: dir.path().to_path_buf(),
            ..Default::default()
        };
        config.monitor.heartbeat_interval_ms = 10;
        config.monitor.peer_timeout_ms = 500;
        config.monitor.max_pause_ms = 5_000;
        config.collective.timeout_ms = 2_000;
        config.training.global_batch_size = 2;
        config
    }

    fn descriptor(index: usize) -> Arc<ClusterDescriptor> {
        let workers = vec!["127.0.0.1:7200".to_string(), "127.0.0.1:7201".to_string()];
        Arc::new(ClusterDescriptor::new(workers, index).unwrap())
    }

    #[tokio::test]
    async fn test_coordinator_can_only_be_built_once() {
        let dir = TempDir::new().unwrap();
        let (mesh, mut receivers) = LocalMesh::new(2);
        let events = receivers.remove(0);
        let mut runtime = Runtime::start_local(test_config(&dir), descriptor(0), &mesh, events).unwrap();

        let dataset = Arc::new(VecDataset::new(vec![1.0f32; 4]));
        assert!(runtime.coordinator(Arc::clone(&dataset), Constant).is_ok());
        assert!(matches!(
            runtime.coordinator(dataset, Constant),
            Err(RuntimeError::Config { .. })
        ));
        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_mesh_size_must_match_cluster() {
        let dir = TempDir::new().unwrap();
        let (mesh, mut receivers) = LocalMesh::new(3);
        let err = Runtime::start_local(test_config(&dir), descriptor(0), &mesh, receivers.remove(0));
        assert!(matches!(err, Err(RuntimeError::Config { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_two_local_workers_train_in_lockstep() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (mesh, receivers) = LocalMesh::new(2);

        let mut runtimes = Vec::new();
        let mut runs = Vec::new();
        for (i, events) in receivers.into_iter().enumerate() {
            let mut runtime = Runtime::start_local(config.clone(), descriptor(i), &mesh, events).unwrap();
            let dataset = Arc::new(VecDataset::new((0..8).map(|x| x as f32).collect::<Vec<_>>()));
            let coordinator = runtime.coordinator(dataset, Constant).unwrap();
            runs.push(tokio::spawn(coordinator.run()));
            runtimes.push(runtime);
        }

        let mut states = Vec::new();
        for run in runs {
            states.push(run.await.unwrap().unwrap().final_state);
        }
        assert_eq!(states[0], states[1]);
        assert_eq!(states[0].step, 4);

        for runtime in runtimes {
            runtime.shutdown().await;
        }
    }
}
