// rust/runtime-core/src/checkpoint/store.rs

//! Generational checkpoint store.
//!
//! Layout under `<checkpoint_dir>/<job_name>/`:
//!
//! ```text
//! LATEST                         decimal id of the newest published generation
//! gen-00000000000000000007/      one directory per generation
//!     state.ckpt
//! .gen-00000000000000000008.tmp/ generation still being written
//! .lease-00000000000000000007-<uuid>
//!                                a reader is loading generation 7
//! ```
//!
//! A generation becomes visible only when `LATEST` is atomically replaced
//! to name it. Directories above `LATEST` are leftovers of a publish that
//! crashed between the directory rename and the pointer update; they are
//! never read and are removed by the next publish.
//!
//! Lease markers live next to the generations so that garbage collection
//! on the chief sees readers in every worker process. A marker holds its
//! creation time in milliseconds; markers older than the configured TTL
//! belong to readers that died and are removed.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use super::format::{decode_checkpoint, encode_checkpoint, CheckpointHeader, Compression};
use crate::config::CheckpointConfig;
use crate::error::{Result, RuntimeError};
use crate::state::TrainingState;
use crate::storage::StorageBackend;

const LATEST: &str = "LATEST";
const LATEST_TMP: &str = "LATEST.tmp";
const STATE_FILE: &str = "state.ckpt";
const GEN_PREFIX: &str = "gen-";
const LEASE_PREFIX: &str = ".lease-";
// Rescans of `LATEST` when generations vanish during a load.
const LOAD_ATTEMPTS: usize = 3;

/// A loaded, verified checkpoint.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub generation: u64,
    pub header: CheckpointHeader,
    pub state: TrainingState,
}

/// Read lease on a generation, visible to every process sharing the store.
/// Garbage collection will not delete a leased generation. Released on drop.
pub struct ReadLease {
    storage: Arc<dyn StorageBackend>,
    marker: PathBuf,
    generation: u64,
}

impl ReadLease {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for ReadLease {
    fn drop(&mut self) {
        if let Err(e) = self.storage.delete(&self.marker) {
            tracing::warn!(
                generation = self.generation,
                marker = %self.marker.display(),
                error = %e,
                "Failed to release checkpoint read lease"
            );
        }
    }
}

/// Publishes and loads training-state checkpoints as numbered generations.
///
/// Only the chief publishes; any worker may load. All methods do blocking
/// I/O and should be called from `spawn_blocking` inside async code.
pub struct CheckpointStore {
    storage: Arc<dyn StorageBackend>,
    root: PathBuf,
    job_name: String,
    compression: Compression,
    compression_level: i32,
    lease_ttl: Duration,
}

fn gen_dir_name(generation: u64) -> String {
    format!("{GEN_PREFIX}{generation:020}")
}

fn tmp_dir_name(generation: u64) -> String {
    format!(".{GEN_PREFIX}{generation:020}.tmp")
}

fn parse_gen_dir(name: &str) -> Option<u64> {
    let digits = name.strip_prefix(GEN_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

fn lease_name(generation: u64, holder: Uuid) -> String {
    format!("{LEASE_PREFIX}{generation:020}-{holder}")
}

fn parse_lease_name(name: &str) -> Option<u64> {
    let rest = name.strip_prefix(LEASE_PREFIX)?;
    let (digits, holder) = rest.split_once('-')?;
    if digits.len() != 20 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Uuid::parse_str(holder).ok()?;
    digits.parse().ok()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

impl CheckpointStore {
    /// Creates a store rooted at `<checkpoint_dir>/<job_name>` on `storage`.
    ///
    /// # Errors
    ///
    /// Returns `Config` for an unknown compression algorithm, or a storage
    /// error if the job directory cannot be created.
    pub fn new(storage: Arc<dyn StorageBackend>, config: &CheckpointConfig) -> Result<Self> {
        let compression: Compression = config.compression.parse()?;
        let root = config.checkpoint_dir.join(&config.job_name);
        storage.create_dir_all(&root)?;

        Ok(Self {
            storage,
            root,
            job_name: config.job_name.clone(),
            compression,
            compression_level: config.compression_level,
            lease_ttl: Duration::from_secs(config.lease_ttl_secs),
        })
    }

    /// Job directory, relative to the storage base.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn state_path(&self, generation: u64) -> PathBuf {
        self.root.join(gen_dir_name(generation)).join(STATE_FILE)
    }

    /// Generation named by `LATEST`, or `None` if nothing was published.
    pub fn latest_generation(&self) -> Result<Option<u64>> {
        let path = self.root.join(LATEST);
        if !self.storage.exists(&path)? {
            return Ok(None);
        }
        let bytes = self.storage.read_all(&path)?;
        let text = String::from_utf8_lossy(&bytes);
        text.trim().parse::<u64>().map(Some).map_err(|e| {
            RuntimeError::checkpoint_with_source(
                format!("unreadable {LATEST} pointer in {}", self.root.display()),
                e,
            )
        })
    }

    // Every complete generation directory, published or not, ascending.
    fn generation_dirs(&self) -> Result<Vec<u64>> {
        let mut gens: Vec<u64> = self
            .storage
            .list(&self.root)?
            .iter()
            .filter_map(|name| parse_gen_dir(name))
            .collect();
        gens.sort_unstable();
        Ok(gens)
    }

    /// Published generations (those at or below `LATEST`), ascending.
    pub fn list_generations(&self) -> Result<Vec<u64>> {
        let Some(latest) = self.latest_generation()? else {
            return Ok(Vec::new());
        };
        let mut gens = self.generation_dirs()?;
        gens.retain(|&g| g <= latest);
        Ok(gens)
    }

    /// Takes a read lease on `generation` by writing a marker file.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the marker cannot be written.
    pub fn lease(&self, generation: u64) -> Result<ReadLease> {
        let marker = self.root.join(lease_name(generation, Uuid::new_v4()));
        self.storage
            .write_all(&marker, now_millis().to_string().as_bytes())?;
        Ok(ReadLease {
            storage: Arc::clone(&self.storage),
            marker,
            generation,
        })
    }

    /// Generations held by an unexpired read lease from any process,
    /// ascending.
    pub fn leased_generations(&self) -> Result<Vec<u64>> {
        Ok(self.live_leases(false)?.into_iter().collect())
    }

    // Scans the lease markers. Expired ones are removed when `reap` is set.
    fn live_leases(&self, reap: bool) -> Result<BTreeSet<u64>> {
        let now = now_millis();
        let ttl = self.lease_ttl.as_millis() as u64;
        let mut live = BTreeSet::new();

        for name in self.storage.list(&self.root)? {
            let Some(generation) = parse_lease_name(&name) else {
                continue;
            };
            let marker = self.root.join(&name);
            let Some(taken_at) = self.lease_taken_at(&marker)? else {
                // released while we were looking
                continue;
            };

            if now.saturating_sub(taken_at) <= ttl {
                live.insert(generation);
            } else if reap {
                tracing::warn!(
                    job = %self.job_name,
                    generation,
                    marker = %name,
                    "Removing expired checkpoint read lease"
                );
                if let Err(e) = self.storage.delete(&marker) {
                    if self.storage.exists(&marker)? {
                        return Err(e);
                    }
                }
            }
        }
        Ok(live)
    }

    // Creation time of a lease marker in milliseconds, falling back to the
    // file's modification time when the contents are unreadable. `None` if
    // the marker no longer exists.
    fn lease_taken_at(&self, marker: &Path) -> Result<Option<u64>> {
        if let Ok(bytes) = self.storage.read_all(marker) {
            if let Ok(ms) = String::from_utf8_lossy(&bytes).trim().parse::<u64>() {
                return Ok(Some(ms));
            }
        }
        if !self.storage.exists(marker)? {
            return Ok(None);
        }
        let modified = self
            .storage
            .metadata(marker)?
            .modified
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or_else(now_millis, |d| d.as_millis() as u64);
        Ok(Some(modified))
    }

    // Removes debris of publishes that never reached the pointer update.
    fn remove_unpublished(&self, latest: Option<u64>) -> Result<()> {
        for name in self.storage.list(&self.root)? {
            let stale = if name == LATEST_TMP {
                true
            } else if name.starts_with(&format!(".{GEN_PREFIX}")) && name.ends_with(".tmp") {
                true
            } else if let Some(gen) = parse_gen_dir(&name) {
                latest.map_or(true, |l| gen > l)
            } else {
                false
            };

            if stale {
                tracing::warn!(
                    job = %self.job_name,
                    entry = %name,
                    "Removing leftover of an interrupted checkpoint publish"
                );
                self.storage.delete(&self.root.join(&name))?;
            }
        }
        Ok(())
    }

    /// Publishes `state` as a new generation and returns its id.
    ///
    /// The previous generation stays authoritative until the final pointer
    /// rename succeeds; an error at any earlier point leaves readers
    /// unaffected.
    pub fn publish(&self, state: &TrainingState) -> Result<u64> {
        let latest = self.latest_generation()?;
        self.remove_unpublished(latest)?;

        let generation = latest.map_or(1, |g| g + 1);

        let mut metadata = BTreeMap::new();
        metadata.insert("job".to_string(), self.job_name.clone());
        let bytes = encode_checkpoint(
            generation,
            state,
            self.compression,
            self.compression_level,
            metadata,
        )?;

        let tmp_dir = self.root.join(tmp_dir_name(generation));
        self.storage.create_dir_all(&tmp_dir)?;
        self.storage.write_all(&tmp_dir.join(STATE_FILE), &bytes)?;
        self.storage
            .rename(&tmp_dir, &self.root.join(gen_dir_name(generation)))?;

        let latest_tmp = self.root.join(LATEST_TMP);
        self.storage
            .write_all(&latest_tmp, generation.to_string().as_bytes())?;
        self.storage.rename(&latest_tmp, &self.root.join(LATEST))?;

        tracing::info!(
            job = %self.job_name,
            generation,
            step = state.step,
            epoch = state.epoch,
            bytes = bytes.len(),
            "Published checkpoint"
        );
        Ok(generation)
    }

    /// Loads and verifies one generation under a read lease.
    ///
    /// # Errors
    ///
    /// `CheckpointCorrupt` if the file fails verification; a storage error
    /// if it cannot be read.
    pub fn load_generation(&self, generation: u64) -> Result<Checkpoint> {
        let _lease = self.lease(generation)?;
        self.read_generation(generation)
    }

    fn read_generation(&self, generation: u64) -> Result<Checkpoint> {
        let bytes = self.storage.read_all(&self.state_path(generation))?;
        let (header, state) = decode_checkpoint(generation, &bytes)?;
        Ok(Checkpoint {
            generation,
            header,
            state,
        })
    }

    /// Loads the newest readable published generation.
    ///
    /// Corrupt, unreadable or missing generations are logged and skipped in
    /// favour of older ones. If generations disappeared during the scan,
    /// `LATEST` is read again, since the newest generation is never
    /// collected. Returns `None` when nothing is published or nothing
    /// published is readable.
    pub fn load_latest(&self) -> Result<Option<Checkpoint>> {
        let mut latest = None;

        for attempt in 1..=LOAD_ATTEMPTS {
            let Some(current) = self.latest_generation()? else {
                tracing::info!(job = %self.job_name, "No published checkpoint found");
                return Ok(None);
            };
            latest = Some(current);

            let mut candidates = self.generation_dirs()?;
            candidates.retain(|&g| g <= current);

            let mut vanished = false;
            for &generation in candidates.iter().rev() {
                let lease = self.lease(generation)?;
                match self.read_generation(generation) {
                    Ok(checkpoint) => {
                        drop(lease);
                        if generation != current {
                            tracing::warn!(
                                job = %self.job_name,
                                generation,
                                latest = current,
                                "Resuming from an older checkpoint generation"
                            );
                        }
                        tracing::info!(
                            job = %self.job_name,
                            generation,
                            step = checkpoint.state.step,
                            "Loaded checkpoint"
                        );
                        return Ok(Some(checkpoint));
                    }
                    Err(e) => {
                        drop(lease);
                        if self.storage.exists(&self.state_path(generation))? {
                            tracing::warn!(
                                job = %self.job_name,
                                generation,
                                error = %e,
                                "Skipping unreadable checkpoint generation"
                            );
                        } else {
                            vanished = true;
                            tracing::warn!(
                                job = %self.job_name,
                                generation,
                                "Checkpoint generation has no state file; skipping"
                            );
                        }
                    }
                }
            }

            if !vanished {
                break;
            }
            tracing::warn!(
                job = %self.job_name,
                attempt,
                "Checkpoint generations disappeared while loading; rescanning"
            );
        }

        tracing::warn!(
            job = %self.job_name,
            latest = ?latest,
            "No readable checkpoint generation; starting cold"
        );
        Ok(None)
    }

    /// Deletes all but the newest `keep` published generations.
    ///
    /// Generations under an unexpired lease from any process, and the one
    /// named by `LATEST`, are never deleted. Expired lease markers are
    /// removed. Returns the deleted generations, ascending.
    pub fn garbage_collect(&self, keep: usize) -> Result<Vec<u64>> {
        if keep == 0 {
            return Err(RuntimeError::config(
                "garbage_collect must keep at least one generation",
            ));
        }

        let Some(latest) = self.latest_generation()? else {
            return Ok(Vec::new());
        };
        let published = self.list_generations()?;
        if published.len() <= keep {
            return Ok(Vec::new());
        }

        let leased = self.live_leases(true)?;
        let cutoff = published.len() - keep;
        let mut deleted = Vec::new();

        for &generation in &published[..cutoff] {
            if generation == latest {
                continue;
            }
            if leased.contains(&generation) {
                tracing::debug!(
                    job = %self.job_name,
                    generation,
                    "Keeping leased checkpoint generation"
                );
                continue;
            }
            self.storage
                .delete(&self.root.join(gen_dir_name(generation)))?;
            deleted.push(generation);
        }

        if !deleted.is_empty() {
            tracing::info!(
                job = %self.job_name,
                deleted = ?deleted,
                kept = keep,
                "Garbage collected checkpoint generations"
            );
        }
        Ok(deleted)
    }
}
