// rust/runtime-core/src/storage/traits.rs

//! Blocking storage interface used by the checkpoint store.
//!
//! The checkpoint store only needs a handful of filesystem-like primitives.
//! Publishing correctness rests on two of them: `StorageWriter::finish`
//! must make the bytes durable, and `rename` must be atomic for both files
//! and directories.

use std::io::{Read, Seek, Write};
use std::path::Path;

use crate::error::{Result, RuntimeError};

/// Metadata about a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Size of the object in bytes.
    pub size: u64,
    /// Last modification time, if available.
    pub modified: Option<std::time::SystemTime>,
    /// Whether this object is a directory.
    pub is_dir: bool,
}

/// A handle for reading a stored object.
pub trait StorageReader: Read + Seek + Send {
    /// Total size of the object in bytes.
    fn size(&self) -> u64;

    /// Reads `length` bytes starting at `start`.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the range is out of bounds.
    fn read_range(&mut self, start: u64, length: usize) -> Result<Vec<u8>>;
}

/// A handle for writing a stored object.
pub trait StorageWriter: Write + Send {
    /// Flushes and syncs the object. The writer is consumed.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush or sync fails.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Storage backend trait.
///
/// Object-safe; the checkpoint store holds it as `Arc<dyn StorageBackend>`
/// so tests can wrap a real backend and inject failures.
pub trait StorageBackend: Send + Sync {
    /// Checks if an object exists at the given path.
    fn exists(&self, path: &Path) -> Result<bool>;

    /// Retrieves metadata for an object.
    fn metadata(&self, path: &Path) -> Result<ObjectMeta>;

    /// Opens an object for reading.
    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>>;

    /// Opens an object for writing, truncating any existing content.
    /// Parent directories are created as needed.
    fn open_write(&self, path: &Path) -> Result<Box<dyn StorageWriter>>;

    /// Deletes a file, or a directory with everything below it.
    fn delete(&self, path: &Path) -> Result<()>;

    /// Lists the entry names directly under `prefix`, sorted.
    /// A missing directory lists as empty.
    fn list(&self, prefix: &Path) -> Result<Vec<String>>;

    /// Atomically renames a file or directory, replacing a file at `to`.
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Creates a directory and all parent directories.
    fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Reads a whole object into memory.
    fn read_all(&self, path: &Path) -> Result<Vec<u8>> {
        let mut reader = self.open_read(path)?;
        let mut buf = Vec::with_capacity(reader.size() as usize);
        reader
            .read_to_end(&mut buf)
            .map_err(|e| RuntimeError::storage_with_source(path, "failed to read object", e))?;
        Ok(buf)
    }

    /// Writes a whole object and syncs it.
    fn write_all(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut writer = self.open_write(path)?;
        writer
            .write_all(data)
            .map_err(|e| RuntimeError::storage_with_source(path, "failed to write object", e))?;
        writer.finish()
    }
}
