//! Synchronous Training Worker
//!
//! Runs one worker of a static cluster. Every worker of the cluster runs
//! this binary with the same cluster spec and its own task index.
//!
//! # Usage
//!
//! ```bash
//! # Cluster spec from a file
//! synctrain-worker --cluster-spec cluster.json --config worker.toml
//!
//! # Cluster spec from the environment
//! SYNCTRAIN_CLUSTER_SPEC='{"cluster":{"worker":["a:7000","b:7000"]},"task":{"type":"worker","index":0}}' \
//!     synctrain-worker
//! ```

mod demo;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use synctrain_core::cluster::{ClusterDescriptor, CLUSTER_SPEC_ENV};
use synctrain_core::{Result, Runtime, RuntimeConfig};

/// Synchronous training worker
#[derive(Parser, Debug)]
#[command(name = "synctrain-worker")]
#[command(about = "Worker process for synchronous multi-worker training")]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Cluster spec file (JSON); defaults to the SYNCTRAIN_CLUSTER_SPEC variable
    #[arg(long)]
    cluster_spec: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Number of elements in the synthetic demo dataset
    #[arg(long, default_value = "4096")]
    dataset_size: usize,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Worker failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::default(),
    }
    .with_env_overrides();
    config.validate()?;

    let descriptor = match &args.cluster_spec {
        Some(path) => ClusterDescriptor::from_file(path)?,
        None => ClusterDescriptor::from_env(CLUSTER_SPEC_ENV)?,
    };

    tracing::info!("Starting synctrain worker");
    tracing::info!("  Worker: {} of {}", descriptor.local_index(), descriptor.worker_count());
    tracing::info!("  Address: {}", descriptor.local_address());
    tracing::info!("  Dataset size: {}", args.dataset_size);
    tracing::info!("  Global batch size: {}", config.training.global_batch_size);

    let mut runtime = Runtime::start_tcp(config, Arc::new(descriptor)).await?;
    let dataset = Arc::new(demo::synthetic_dataset(args.dataset_size));
    let coordinator = runtime.coordinator(dataset, demo::SyntheticRegression)?;

    let outcome = tokio::select! {
        result = coordinator.run() => Some(result),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted; shutting down worker...");
            None
        }
    };

    runtime.shutdown().await;

    match outcome {
        Some(Ok(summary)) => {
            let parameters = &summary.final_state.parameters;
            tracing::info!(
                step = summary.final_state.step,
                epoch = summary.final_state.epoch,
                pauses = summary.pauses,
                resyncs = summary.resyncs,
                loss = ?summary.last_loss,
                w = ?parameters.get("w").map(|t| t.data[0]),
                b = ?parameters.get("b").map(|t| t.data[0]),
                "Training finished"
            );
            Ok(())
        }
        Some(Err(e)) => Err(e),
        None => Ok(()),
    }
}
