//! Checkpoint publication, torn writes and garbage collection through the
//! public API, including stores in separate processes sharing one directory.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tempfile::TempDir;

use synctrain_core::checkpoint::CheckpointStore;
use synctrain_core::config::{CheckpointConfig, StorageConfig};
use synctrain_core::state::{Parameters, Tensor, TrainingState};
use synctrain_core::storage::{
    LocalStorage, ObjectMeta, StorageBackend, StorageReader, StorageWriter,
};
use synctrain_core::{Result, RuntimeError};

fn state(step: u64) -> TrainingState {
    let mut parameters = Parameters::new();
    parameters.insert("w".to_string(), Tensor::vector(vec![step as f32, -(step as f32)]));
    parameters.insert("b".to_string(), Tensor::scalar(0.5));
    TrainingState {
        step,
        epoch: step / 3,
        parameters,
    }
}

fn local(dir: &TempDir) -> Arc<LocalStorage> {
    let config = StorageConfig {
        base_path: dir.path().to_path_buf(),
        ..Default::default()
    };
    Arc::new(LocalStorage::new(&config).unwrap())
}

fn checkpoint_config(compression: &str) -> CheckpointConfig {
    CheckpointConfig {
        compression: compression.to_string(),
        job_name: "integration".to_string(),
        ..Default::default()
    }
}

/// Local storage whose rename onto `LATEST` fails while armed, like a
/// crash between writing the pointer and publishing it.
struct TornLatest {
    inner: Arc<LocalStorage>,
    armed: AtomicBool,
}

impl StorageBackend for TornLatest {
    fn exists(&self, path: &Path) -> Result<bool> {
        self.inner.exists(path)
    }

    fn metadata(&self, path: &Path) -> Result<ObjectMeta> {
        self.inner.metadata(path)
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>> {
        self.inner.open_read(path)
    }

    fn open_write(&self, path: &Path) -> Result<Box<dyn StorageWriter>> {
        self.inner.open_write(path)
    }

    fn delete(&self, path: &Path) -> Result<()> {
        self.inner.delete(path)
    }

    fn list(&self, prefix: &Path) -> Result<Vec<String>> {
        self.inner.list(prefix)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        if self.armed.load(Ordering::SeqCst) && to.file_name().is_some_and(|n| n == "LATEST") {
            return Err(RuntimeError::storage(to, "simulated crash before pointer rename"));
        }
        self.inner.rename(from, to)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        self.inner.create_dir_all(path)
    }
}

/// Local storage where a chief publishes generation 2 and deletes
/// generation 1 just as the first read of generation 1 starts.
struct CollectedMidRead {
    inner: Arc<LocalStorage>,
    chief: CheckpointStore,
    fired: AtomicBool,
}

impl StorageBackend for CollectedMidRead {
    fn exists(&self, path: &Path) -> Result<bool> {
        self.inner.exists(path)
    }

    fn metadata(&self, path: &Path) -> Result<ObjectMeta> {
        self.inner.metadata(path)
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>> {
        if path.ends_with("gen-00000000000000000001/state.ckpt") && !self.fired.swap(true, Ordering::SeqCst) {
            self.chief.publish(&state(4))?;
            if let Some(dir) = path.parent() {
                self.inner.delete(dir)?;
            }
        }
        self.inner.open_read(path)
    }

    fn open_write(&self, path: &Path) -> Result<Box<dyn StorageWriter>> {
        self.inner.open_write(path)
    }

    fn delete(&self, path: &Path) -> Result<()> {
        self.inner.delete(path)
    }

    fn list(&self, prefix: &Path) -> Result<Vec<String>> {
        self.inner.list(prefix)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.inner.rename(from, to)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        self.inner.create_dir_all(path)
    }
}

#[test]
fn test_round_trip_with_every_compression() {
    for compression in ["none", "lz4", "zstd"] {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(local(&dir), &checkpoint_config(compression)).unwrap();

        let generation = store.publish(&state(12)).unwrap();
        let loaded = store.load_latest().unwrap().unwrap();
        assert_eq!(loaded.generation, generation);
        assert_eq!(loaded.state, state(12), "compression {compression}");
        assert_eq!(loaded.header.step, 12);
    }
}

#[test]
fn test_torn_publish_keeps_previous_generation() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(TornLatest {
        inner: local(&dir),
        armed: AtomicBool::new(false),
    });
    let store = CheckpointStore::new(storage.clone(), &checkpoint_config("lz4")).unwrap();

    assert_eq!(store.publish(&state(2)).unwrap(), 1);

    storage.armed.store(true, Ordering::SeqCst);
    assert!(store.publish(&state(4)).is_err());

    // readers still see generation 1, even from a fresh store
    let fresh = CheckpointStore::new(local(&dir), &checkpoint_config("lz4")).unwrap();
    let loaded = fresh.load_latest().unwrap().unwrap();
    assert_eq!(loaded.generation, 1);
    assert_eq!(loaded.state, state(2));
    assert_eq!(fresh.list_generations().unwrap(), vec![1]);

    // the next publish cleans up and reuses the id
    storage.armed.store(false, Ordering::SeqCst);
    assert_eq!(store.publish(&state(4)).unwrap(), 2);
    assert_eq!(fresh.load_latest().unwrap().unwrap().state, state(4));
}

#[test]
fn test_publish_every_two_steps_then_gc_keeps_newest() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(local(&dir), &checkpoint_config("zstd")).unwrap();

    let mut published = Vec::new();
    for step in 1..=4u64 {
        if step % 2 == 0 {
            published.push(store.publish(&state(step)).unwrap());
        }
    }
    assert_eq!(published, vec![1, 2]);

    let deleted = store.garbage_collect(1).unwrap();
    assert_eq!(deleted, vec![1]);
    assert_eq!(store.list_generations().unwrap(), vec![2]);

    let fresh = CheckpointStore::new(local(&dir), &checkpoint_config("zstd")).unwrap();
    let loaded = fresh.load_latest().unwrap().unwrap();
    assert_eq!(loaded.generation, 2);
    assert_eq!(loaded.state.step, 4);

    assert!(matches!(store.garbage_collect(0), Err(RuntimeError::Config { .. })));
}

#[test]
fn test_corrupt_newest_falls_back_to_older_generation() {
    let dir = TempDir::new().unwrap();
    let store = CheckpointStore::new(local(&dir), &checkpoint_config("lz4")).unwrap();
    store.publish(&state(2)).unwrap();
    store.publish(&state(4)).unwrap();

    let newest = dir
        .path()
        .join("checkpoints")
        .join("integration")
        .join(format!("gen-{:020}", 2))
        .join("state.ckpt");
    let mut bytes = std::fs::read(&newest).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    std::fs::write(&newest, bytes).unwrap();

    let loaded = store.load_latest().unwrap().unwrap();
    assert_eq!(loaded.generation, 1);
    assert_eq!(loaded.state, state(2));
}

#[test]
fn test_lease_from_another_store_blocks_collection() {
    let dir = TempDir::new().unwrap();
    let chief = CheckpointStore::new(local(&dir), &checkpoint_config("lz4")).unwrap();
    let reader = CheckpointStore::new(local(&dir), &checkpoint_config("lz4")).unwrap();
    assert_eq!(chief.publish(&state(2)).unwrap(), 1);

    let lease = reader.lease(1).unwrap();
    assert_eq!(chief.publish(&state(4)).unwrap(), 2);
    assert_eq!(chief.leased_generations().unwrap(), vec![1]);
    assert!(chief.garbage_collect(1).unwrap().is_empty());
    assert_eq!(reader.load_generation(1).unwrap().state, state(2));

    drop(lease);
    assert_eq!(chief.garbage_collect(1).unwrap(), vec![1]);
    let loaded = reader.load_latest().unwrap().unwrap();
    assert_eq!(loaded.generation, 2);
    assert_eq!(loaded.state, state(4));
}

#[test]
fn test_generation_collected_during_load_rescans_latest() {
    let dir = TempDir::new().unwrap();
    let inner = local(&dir);
    let chief = CheckpointStore::new(inner.clone(), &checkpoint_config("lz4")).unwrap();
    chief.publish(&state(2)).unwrap();

    let storage = Arc::new(CollectedMidRead {
        inner,
        chief,
        fired: AtomicBool::new(false),
    });
    let reader = CheckpointStore::new(storage.clone(), &checkpoint_config("lz4")).unwrap();

    // generation 1 vanishes mid-read; the reader must not cold start
    let loaded = reader.load_latest().unwrap().unwrap();
    assert!(storage.fired.load(Ordering::SeqCst));
    assert_eq!(loaded.generation, 2);
    assert_eq!(loaded.state, state(4));
    assert!(reader.leased_generations().unwrap().is_empty());
}
