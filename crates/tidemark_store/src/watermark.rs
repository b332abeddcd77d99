//! Watermark capability: the persisted "last local sync time" per scope.

use crate::error::{StoreError, StoreResult};
use fs2::FileExt;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Persists one integer watermark per sync scope.
///
/// # Invariants
///
/// - `get` returns 0 for a scope that was never set
/// - `set` is durable when it returns `Ok`
pub trait WatermarkStore: Send + Sync {
    /// Reads the watermark for `scope`.
    fn get(&self, scope: &str) -> StoreResult<i64>;

    /// Overwrites the watermark for `scope`.
    fn set(&self, scope: &str, value: i64) -> StoreResult<()>;
}

/// An in-memory watermark store.
#[derive(Debug, Default)]
pub struct MemoryWatermarkStore {
    values: RwLock<HashMap<String, i64>>,
}

impl MemoryWatermarkStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store with one scope pre-set.
    #[must_use]
    pub fn with_value(scope: impl Into<String>, value: i64) -> Self {
        let store = Self::new();
        store.values.write().insert(scope.into(), value);
        store
    }
}

impl WatermarkStore for MemoryWatermarkStore {
    fn get(&self, scope: &str) -> StoreResult<i64> {
        Ok(self.values.read().get(scope).copied().unwrap_or(0))
    }

    fn set(&self, scope: &str, value: i64) -> StoreResult<()> {
        self.values.write().insert(scope.to_string(), value);
        Ok(())
    }
}

/// A watermark store backed by a JSON file.
///
/// ```text
/// <path>        # {"scope": watermark, ...}
/// <path>.lock   # advisory lock, held while the store is open
/// <path>.tmp    # scratch file for atomic replacement
/// ```
///
/// Every `set` rewrites the whole map to the scratch file, fsyncs it and
/// renames it over `<path>`, so a crash leaves either the old or the new map.
#[derive(Debug)]
pub struct FileWatermarkStore {
    path: PathBuf,
    values: RwLock<BTreeMap<String, i64>>,
    _lock_file: File,
}

impl FileWatermarkStore {
    /// Opens or creates the store at `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Locked`] if another handle holds the lock, or an
    /// I/O or serialization error if the existing file cannot be read.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let lock_path = sibling(path, "lock");
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked(lock_path.display().to_string()));
        }

        let values = match fs::read(path) {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: path.to_path_buf(),
            values: RwLock::new(values),
            _lock_file: lock_file,
        })
    }

    /// Returns the path of the watermark file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, values: &BTreeMap<String, i64>) -> StoreResult<()> {
        let temp_path = sibling(&self.path, "tmp");

        let data = serde_json::to_vec_pretty(values)?;
        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &self.path)?;
        sync_parent(&self.path)
    }
}

impl WatermarkStore for FileWatermarkStore {
    fn get(&self, scope: &str) -> StoreResult<i64> {
        Ok(self.values.read().get(scope).copied().unwrap_or(0))
    }

    fn set(&self, scope: &str, value: i64) -> StoreResult<()> {
        let mut values = self.values.write();
        let previous = values.insert(scope.to_string(), value);

        if let Err(e) = self.persist(&values) {
            match previous {
                Some(old) => values.insert(scope.to_string(), old),
                None => values.remove(scope),
            };
            return Err(e);
        }

        tracing::debug!(scope, value, path = %self.path.display(), "watermark persisted");
        Ok(())
    }
}

fn sibling(path: &Path, extension: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

#[cfg(unix)]
fn sync_parent(path: &Path) -> StoreResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> StoreResult<()> {
    // NTFS journals the rename; directory handles cannot be fsynced.
    Ok(())
}
