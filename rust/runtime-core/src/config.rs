// rust/runtime-core/src/config.rs

//! Configuration management for the training coordination core.
//!
//! Configuration is parsed from TOML files, optionally overridden from
//! `SYNCTRAIN_*` environment variables, and validated before any component
//! is constructed. The cluster layout itself is not part of this file; it
//! comes from a separate cluster specification (see [`crate::cluster`]).

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::collective::ReduceOp;
use crate::dataset::{ShardPolicy, ShardingOptions};
use crate::error::{Result, RuntimeError};

// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub storage: StorageConfig,
    pub checkpoint: CheckpointConfig,
    pub collective: CollectiveConfig,
    pub monitor: MonitorConfig,
    pub training: TrainingConfig,
}

// Storage configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    // Base path for all storage operations.
    pub base_path: PathBuf,
    // Buffer size in bytes for I/O operations.
    pub buffer_size: usize,
    // Whether to use memory-mapped I/O for large reads.
    pub use_mmap: bool,
    // File size threshold (bytes) above which to use mmap.
    pub mmap_threshold: u64,
}

// Checkpoint configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    // Directory for storing checkpoints, relative to the storage base path.
    pub checkpoint_dir: PathBuf,
    // Logical job name; every generation of a job lives under this key.
    pub job_name: String,
    // Compression algorithm: "none", "lz4", or "zstd".
    pub compression: String,
    // Compression level (algorithm-specific).
    pub compression_level: i32,
    // Number of published generations kept by garbage collection.
    pub keep_generations: usize,
    // The chief publishes a checkpoint every N completed steps.
    pub publish_every_steps: u64,
    // Read leases older than this are treated as left behind by a crashed
    // reader and no longer protect their generation from collection.
    pub lease_ttl_secs: u64,
}

/// Collective channel options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectiveConfig {
    /// Reduction applied to contributed gradients.
    pub reduce_op: ReduceOp,
    /// How long one `contribute` call waits for all peers.
    pub timeout_ms: u64,
    /// Retries of the same step after a timeout before pausing.
    pub max_retries: u32,
}

/// Failure monitor options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Interval between heartbeats sent to every peer.
    pub heartbeat_interval_ms: u64,
    /// Silence after which a live peer is considered lost.
    pub peer_timeout_ms: u64,
    /// Longest time the cluster may stay paused (or wait for startup)
    /// before `ClusterUnavailable` is raised.
    pub max_pause_ms: u64,
}

/// Training loop options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Elements per step across the whole cluster.
    pub global_batch_size: usize,
    /// Drop the remainder instead of requiring an exact partition.
    pub drop_remainder: bool,
    /// Reshuffle the epoch order at every epoch boundary.
    pub shuffle: bool,
    /// Seed shared by every worker for the epoch shuffle.
    pub seed: u64,
    /// Number of epochs to train.
    pub max_epochs: u64,
    /// Optional cap on the total step count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u64>,
    /// Learning rate used by the SGD update.
    pub learning_rate: f32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./data"),
            buffer_size: 64 * 1024, // 64 KB
            use_mmap: true,
            mmap_threshold: 1024 * 1024, // 1 MB
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: PathBuf::from("checkpoints"),
            job_name: "default".to_string(),
            compression: "lz4".to_string(),
            compression_level: 1,
            keep_generations: 3,
            publish_every_steps: 100,
            lease_ttl_secs: 600,
        }
    }
}

impl Default for CollectiveConfig {
    fn default() -> Self {
        Self {
            reduce_op: ReduceOp::Mean,
            timeout_ms: 30_000,
            max_retries: 3,
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1_000,
            peer_timeout_ms: 10_000,
            max_pause_ms: 600_000,
        }
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            global_batch_size: 32,
            drop_remainder: true,
            shuffle: false,
            seed: 0,
            max_epochs: 1,
            max_steps: None,
            learning_rate: 0.01,
        }
    }
}

impl CollectiveConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl MonitorConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn max_pause(&self) -> Duration {
        Duration::from_millis(self.max_pause_ms)
    }
}

impl TrainingConfig {
    /// Sharding options derived from the training section.
    pub fn sharding(&self) -> ShardingOptions {
        ShardingOptions {
            policy: if self.drop_remainder {
                ShardPolicy::DropRemainder
            } else {
                ShardPolicy::Exact
            },
            global_batch_size: self.global_batch_size,
            shuffle: self.shuffle,
            seed: self.seed,
        }
    }
}

impl FromStr for RuntimeConfig {
    type Err = RuntimeError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| RuntimeError::config_with_source("failed to parse TOML config", e))
    }
}

impl RuntimeConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RuntimeError::storage_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `SYNCTRAIN_` and use
    // underscores to separate nested fields, e.g.
    // `SYNCTRAIN_CHECKPOINT_JOB_NAME` overrides `checkpoint.job_name`.
    // Values that fail to parse are ignored.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Storage overrides
        if let Ok(val) = std::env::var("SYNCTRAIN_STORAGE_BASE_PATH") {
            self.storage.base_path = PathBuf::from(val);
        }
        override_parsed("SYNCTRAIN_STORAGE_BUFFER_SIZE", &mut self.storage.buffer_size);
        override_parsed("SYNCTRAIN_STORAGE_USE_MMAP", &mut self.storage.use_mmap);
        override_parsed("SYNCTRAIN_STORAGE_MMAP_THRESHOLD", &mut self.storage.mmap_threshold);

        // Checkpoint overrides
        if let Ok(val) = std::env::var("SYNCTRAIN_CHECKPOINT_DIR") {
            self.checkpoint.checkpoint_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("SYNCTRAIN_CHECKPOINT_JOB_NAME") {
            self.checkpoint.job_name = val;
        }
        if let Ok(val) = std::env::var("SYNCTRAIN_CHECKPOINT_COMPRESSION") {
            self.checkpoint.compression = val;
        }
        override_parsed(
            "SYNCTRAIN_CHECKPOINT_COMPRESSION_LEVEL",
            &mut self.checkpoint.compression_level,
        );
        override_parsed(
            "SYNCTRAIN_CHECKPOINT_KEEP_GENERATIONS",
            &mut self.checkpoint.keep_generations,
        );
        override_parsed(
            "SYNCTRAIN_CHECKPOINT_PUBLISH_EVERY_STEPS",
            &mut self.checkpoint.publish_every_steps,
        );
        override_parsed(
            "SYNCTRAIN_CHECKPOINT_LEASE_TTL_SECS",
            &mut self.checkpoint.lease_ttl_secs,
        );

        // Collective overrides
        if let Ok(val) = std::env::var("SYNCTRAIN_COLLECTIVE_REDUCE_OP") {
            match val.to_lowercase().as_str() {
                "sum" => self.collective.reduce_op = ReduceOp::Sum,
                "mean" => self.collective.reduce_op = ReduceOp::Mean,
                _ => {} // ignore invalid values
            }
        }
        override_parsed("SYNCTRAIN_COLLECTIVE_TIMEOUT_MS", &mut self.collective.timeout_ms);
        override_parsed("SYNCTRAIN_COLLECTIVE_MAX_RETRIES", &mut self.collective.max_retries);

        // Monitor overrides
        override_parsed(
            "SYNCTRAIN_MONITOR_HEARTBEAT_INTERVAL_MS",
            &mut self.monitor.heartbeat_interval_ms,
        );
        override_parsed("SYNCTRAIN_MONITOR_PEER_TIMEOUT_MS", &mut self.monitor.peer_timeout_ms);
        override_parsed("SYNCTRAIN_MONITOR_MAX_PAUSE_MS", &mut self.monitor.max_pause_ms);

        // Training overrides
        override_parsed(
            "SYNCTRAIN_TRAINING_GLOBAL_BATCH_SIZE",
            &mut self.training.global_batch_size,
        );
        override_parsed("SYNCTRAIN_TRAINING_DROP_REMAINDER", &mut self.training.drop_remainder);
        override_parsed("SYNCTRAIN_TRAINING_SHUFFLE", &mut self.training.shuffle);
        override_parsed("SYNCTRAIN_TRAINING_SEED", &mut self.training.seed);
        override_parsed("SYNCTRAIN_TRAINING_MAX_EPOCHS", &mut self.training.max_epochs);
        override_parsed("SYNCTRAIN_TRAINING_LEARNING_RATE", &mut self.training.learning_rate);
        if let Ok(val) = std::env::var("SYNCTRAIN_TRAINING_MAX_STEPS") {
            if let Ok(v) = val.parse() {
                self.training.max_steps = Some(v);
            }
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        // Storage validation
        if self.storage.buffer_size == 0 {
            return Err(RuntimeError::config(
                "storage.buffer_size must be greater than 0",
            ));
        }

        // Checkpoint validation
        let valid_compression = ["none", "lz4", "zstd"];
        if !valid_compression.contains(&self.checkpoint.compression.as_str()) {
            return Err(RuntimeError::config(format!(
                "checkpoint.compression must be one of: {}",
                valid_compression.join(", ")
            )));
        }
        if self.checkpoint.job_name.is_empty() {
            return Err(RuntimeError::config("checkpoint.job_name must not be empty"));
        }
        if self.checkpoint.job_name.contains(['/', '\\']) {
            return Err(RuntimeError::config(
                "checkpoint.job_name must not contain path separators",
            ));
        }
        if self.checkpoint.keep_generations == 0 {
            return Err(RuntimeError::config(
                "checkpoint.keep_generations must be greater than 0",
            ));
        }
        if self.checkpoint.publish_every_steps == 0 {
            return Err(RuntimeError::config(
                "checkpoint.publish_every_steps must be greater than 0",
            ));
        }
        if self.checkpoint.lease_ttl_secs == 0 {
            return Err(RuntimeError::config(
                "checkpoint.lease_ttl_secs must be greater than 0",
            ));
        }

        // Collective validation
        if self.collective.timeout_ms == 0 {
            return Err(RuntimeError::config(
                "collective.timeout_ms must be greater than 0",
            ));
        }

        // Monitor validation
        if self.monitor.heartbeat_interval_ms == 0 {
            return Err(RuntimeError::config(
                "monitor.heartbeat_interval_ms must be greater than 0",
            ));
        }
        if self.monitor.peer_timeout_ms <= self.monitor.heartbeat_interval_ms {
            return Err(RuntimeError::config(
                "monitor.peer_timeout_ms must be greater than monitor.heartbeat_interval_ms",
            ));
        }
        if self.monitor.max_pause_ms == 0 {
            return Err(RuntimeError::config(
                "monitor.max_pause_ms must be greater than 0",
            ));
        }

        // Training validation
        if self.training.global_batch_size == 0 {
            return Err(RuntimeError::config(
                "training.global_batch_size must be greater than 0",
            ));
        }
        if !(self.training.learning_rate.is_finite() && self.training.learning_rate > 0.0) {
            return Err(RuntimeError::config(
                "training.learning_rate must be a positive finite number",
            ));
        }

        Ok(())
    }
}

fn override_parsed<T: FromStr>(var: &str, slot: &mut T) {
    if let Ok(val) = std::env::var(var) {
        if let Ok(v) = val.parse() {
            *slot = v;
        }
    }
}
