// rust/runtime-core/src/cluster.rs

//! Static cluster description.
//!
//! Every process receives the same ordered list of worker addresses and its
//! own index in that list:
//!
//! ```json
//! { "cluster": { "worker": ["10.0.0.1:7000", "10.0.0.2:7000"] },
//!   "task": { "type": "worker", "index": 0 } }
//! ```
//!
//! Worker 0 is the chief. Membership never changes for the lifetime of a
//! job; a restarted worker comes back with the same index.

use std::collections::HashSet;
use std::hash::Hasher;
use std::path::Path;

use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;

use crate::error::{Result, RuntimeError};

/// Default environment variable holding the JSON cluster spec.
pub const CLUSTER_SPEC_ENV: &str = "SYNCTRAIN_CLUSTER_SPEC";

const FINGERPRINT_SEED: u64 = 0x5359_4e43_5452_4149; // "SYNCTRAI"

/// Raw cluster configuration record, as supplied by the launcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub cluster: ClusterMembers,
    pub task: TaskSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMembers {
    pub worker: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(rename = "type")]
    pub task_type: String,
    pub index: usize,
}

/// Validated, immutable view of the cluster from one worker's perspective.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterDescriptor {
    workers: Vec<String>,
    local_index: usize,
    fingerprint: u64,
}

impl ClusterDescriptor {
    /// Validates a parsed cluster spec.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the worker list is empty, contains duplicates or
    /// entries that are not `host:port`, if the task type is not `worker`,
    /// or if the task index is outside the list.
    pub fn from_spec(spec: ClusterSpec) -> Result<Self> {
        let ClusterSpec { cluster, task } = spec;
        let workers = cluster.worker;

        if workers.is_empty() {
            return Err(RuntimeError::config("cluster.worker must not be empty"));
        }

        let mut seen = HashSet::with_capacity(workers.len());
        for address in &workers {
            validate_address(address)?;
            if !seen.insert(address.as_str()) {
                return Err(RuntimeError::config(format!(
                    "duplicate worker address '{address}'"
                )));
            }
        }

        if task.task_type != "worker" {
            return Err(RuntimeError::config(format!(
                "unsupported task type '{}', expected 'worker'",
                task.task_type
            )));
        }
        if task.index >= workers.len() {
            return Err(RuntimeError::config(format!(
                "task index {} is outside the worker list of {} addresses",
                task.index,
                workers.len()
            )));
        }

        let fingerprint = fingerprint_of(&workers);
        Ok(Self {
            workers,
            local_index: task.index,
            fingerprint,
        })
    }

    /// Parses and validates a JSON cluster spec.
    pub fn from_json(json: &str) -> Result<Self> {
        let spec: ClusterSpec = serde_json::from_str(json)
            .map_err(|e| RuntimeError::config_with_source("failed to parse cluster spec", e))?;
        Self::from_spec(spec)
    }

    /// Reads a JSON cluster spec from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            RuntimeError::storage_with_source(path, "failed to read cluster spec", e)
        })?;
        Self::from_json(&content)
    }

    /// Reads a JSON cluster spec from an environment variable.
    pub fn from_env(var: &str) -> Result<Self> {
        let json = std::env::var(var).map_err(|e| {
            RuntimeError::config_with_source(format!("cluster spec variable {var} is not set"), e)
        })?;
        Self::from_json(&json)
    }

    /// Convenience constructor for in-process clusters and tests.
    pub fn new(workers: Vec<String>, local_index: usize) -> Result<Self> {
        Self::from_spec(ClusterSpec {
            cluster: ClusterMembers { worker: workers },
            task: TaskSpec {
                task_type: "worker".to_string(),
                index: local_index,
            },
        })
    }

    /// Same cluster, seen from another worker.
    pub fn with_local_index(&self, local_index: usize) -> Result<Self> {
        Self::new(self.workers.clone(), local_index)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn local_index(&self) -> usize {
        self.local_index
    }

    pub fn is_chief(&self) -> bool {
        self.local_index == 0
    }

    pub fn local_address(&self) -> &str {
        &self.workers[self.local_index]
    }

    pub fn address(&self, index: usize) -> Option<&str> {
        self.workers.get(index).map(String::as_str)
    }

    pub fn addresses(&self) -> &[String] {
        &self.workers
    }

    /// Every worker index except the local one, ascending.
    pub fn peers(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.workers.len()).filter(move |&i| i != self.local_index)
    }

    /// Hash of the ordered address list. Two workers agree on membership
    /// iff their fingerprints match.
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }
}

fn validate_address(address: &str) -> Result<()> {
    let malformed = || RuntimeError::config(format!("worker address '{address}' is not host:port"));

    let (host, port) = address.rsplit_once(':').ok_or_else(malformed)?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(malformed());
    }
    match port.parse::<u16>() {
        Ok(p) if p != 0 => Ok(()),
        _ => Err(malformed()),
    }
}

fn fingerprint_of(workers: &[String]) -> u64 {
    let mut hasher = XxHash64::with_seed(FINGERPRINT_SEED);
    for address in workers {
        hasher.write(address.as_bytes());
        // separator so ["ab", "c"] and ["a", "bc"] differ
        hasher.write_u8(0);
    }
    hasher.finish()
}
