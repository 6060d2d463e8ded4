//! Content-addressed cache store.
//!
//! Persists every snapshot an instruction produces, keyed by the fingerprint
//! of what produced it.
//!
//! # Layout
//!
//! ```text
//! store/
//! ├── blobs/sha256/<2>/<digest>   # file contents
//! ├── snapshots/<id>.json         # snapshot trees
//! ├── keys/<key>.json             # cache key -> snapshot id
//! ├── tmp/                        # staging area for atomic writes
//! └── .lock
//! ```
//!
//! Every write is staged under `tmp/` and renamed into place. A key record is
//! never overwritten: the first writer wins and later writers adopt its
//! snapshot.

pub mod blobs;
pub mod key;
pub mod lock;

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, trace};

use crate::consts::KEY_RECORD_VERSION;
use crate::snapshot::{Snapshot, SnapshotId};
use crate::util::hash::{ContentHash, DirHashError};

pub use blobs::BlobStore;
pub use key::{CacheKey, InputDigest, KeyInputs};
pub use lock::{LockMode, StoreLock, StoreLockError};

#[derive(Debug, Error)]
pub enum CacheStoreError {
  #[error("I/O error at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to serialize store record: {0}")]
  Serialize(#[source] serde_json::Error),

  #[error("cache key {key} points at missing snapshot {snapshot}")]
  Corrupt { key: CacheKey, snapshot: SnapshotId },

  #[error("snapshot not found: {0}")]
  SnapshotNotFound(SnapshotId),

  #[error("invalid snapshot id '{0}': expected 64 lowercase hex characters")]
  InvalidSnapshotId(SnapshotId),

  #[error("blob not found: {0}")]
  BlobNotFound(ContentHash),

  #[error("unsupported key record version {version} in {path}")]
  UnsupportedVersion { path: PathBuf, version: u32 },

  #[error(transparent)]
  Hash(DirHashError),

  #[error(transparent)]
  Lock(#[from] StoreLockError),
}

pub(crate) fn io_error(path: &Path) -> impl FnOnce(io::Error) -> CacheStoreError + use<> {
  let path = path.to_path_buf();
  move |source| CacheStoreError::Io { path, source }
}

/// On-disk record mapping a cache key to its snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
  pub version: u32,
  pub snapshot: SnapshotId,
  pub created_at: u64,
  /// Human readable origin, e.g. `app[3] run bundle install`.
  #[serde(default)]
  pub description: String,
}

type KeyLocks = HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>;

/// Exclusive claim on a cache key within this process.
///
/// The key's mutex is dropped from the store once nobody holds or waits on it.
#[derive(Debug)]
pub struct KeyGuard<'a> {
  store: &'a CacheStore,
  key: CacheKey,
  guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
  fn drop(&mut self) {
    drop(self.guard.take());
    let mut locks = self.store.key_locks.lock().unwrap_or_else(|e| e.into_inner());
    if locks.get(&self.key).is_some_and(|mutex| Arc::strong_count(mutex) == 1) {
      locks.remove(&self.key);
    }
  }
}

/// Safe for concurrent use; share it behind an `Arc`.
#[derive(Debug)]
pub struct CacheStore {
  root: PathBuf,
  blobs: BlobStore,
  key_locks: Mutex<KeyLocks>,
  _lock: Option<StoreLock>,
}

impl CacheStore {
  /// Open (creating if needed) the store rooted at `root`.
  pub fn open(root: impl Into<PathBuf>) -> Result<Self, CacheStoreError> {
    let root = root.into();
    for dir in ["blobs/sha256", "snapshots", "keys", "tmp"] {
      let path = root.join(dir);
      fs::create_dir_all(&path).map_err(io_error(&path))?;
    }
    let blobs = BlobStore::new(&root);
    Ok(Self {
      root,
      blobs,
      key_locks: Mutex::new(HashMap::new()),
      _lock: None,
    })
  }

  /// Open the store and hold a shared process lock on it for its lifetime.
  pub fn open_locked(root: impl Into<PathBuf>, command: &str) -> Result<Self, CacheStoreError> {
    let root = root.into();
    let lock = StoreLock::acquire(&root, LockMode::Shared, command)?;
    let mut store = Self::open(root)?;
    store._lock = Some(lock);
    Ok(store)
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn blobs(&self) -> &BlobStore {
    &self.blobs
  }

  fn key_path(&self, key: &CacheKey) -> PathBuf {
    self.root.join("keys").join(format!("{}.json", key.0))
  }

  fn snapshot_path(&self, id: &SnapshotId) -> PathBuf {
    self.root.join("snapshots").join(format!("{}.json", id.0))
  }

  fn tmp_dir(&self) -> PathBuf {
    self.root.join("tmp")
  }

  /// Serialize in-process executions of the same key.
  ///
  /// Callers look the key up again once the guard is held; a concurrent
  /// holder may have stored it in the meantime.
  pub async fn lock_key(&self, key: &CacheKey) -> KeyGuard<'_> {
    let mutex = {
      let mut locks = self.key_locks.lock().unwrap_or_else(|e| e.into_inner());
      locks.entry(key.clone()).or_default().clone()
    };
    KeyGuard {
      store: self,
      key: key.clone(),
      guard: Some(mutex.lock_owned().await),
    }
  }

  /// Resolve a key to its snapshot id.
  pub fn lookup(&self, key: &CacheKey) -> Result<Option<SnapshotId>, CacheStoreError> {
    let Some(record) = self.read_key_record(key)? else {
      trace!(key = %key.short(), "cache miss");
      return Ok(None);
    };
    if !self.snapshot_path(&record.snapshot).is_file() {
      return Err(CacheStoreError::Corrupt {
        key: key.clone(),
        snapshot: record.snapshot,
      });
    }
    trace!(key = %key.short(), snapshot = %record.snapshot.short(), "cache hit");
    Ok(Some(record.snapshot))
  }

  pub fn read_key_record(&self, key: &CacheKey) -> Result<Option<KeyRecord>, CacheStoreError> {
    let path = self.key_path(key);
    let content = match fs::read_to_string(&path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(source) => return Err(CacheStoreError::Io { path, source }),
    };
    let record: KeyRecord = serde_json::from_str(&content).map_err(|source| CacheStoreError::Parse {
      path: path.clone(),
      source,
    })?;
    if record.version != KEY_RECORD_VERSION {
      return Err(CacheStoreError::UnsupportedVersion {
        path,
        version: record.version,
      });
    }
    Ok(Some(record))
  }

  /// Persist `snapshot` under `key`.
  pub fn store(&self, key: &CacheKey, snapshot: &Snapshot) -> Result<SnapshotId, CacheStoreError> {
    self.store_described(key, snapshot, "")
  }

  /// Persist `snapshot` under `key`, recording where it came from.
  ///
  /// If another writer already recorded the key, its snapshot id is returned
  /// and ours is not linked.
  pub fn store_described(
    &self,
    key: &CacheKey,
    snapshot: &Snapshot,
    description: &str,
  ) -> Result<SnapshotId, CacheStoreError> {
    let id = self.put_snapshot(snapshot)?;

    let record = KeyRecord {
      version: KEY_RECORD_VERSION,
      snapshot: id.clone(),
      created_at: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
      description: description.to_string(),
    };
    let content = serde_json::to_vec_pretty(&record).map_err(CacheStoreError::Serialize)?;
    let staged = self.stage(&content)?;

    let path = self.key_path(key);
    match staged.persist_noclobber(&path) {
      Ok(_) => {
        debug!(key = %key.short(), snapshot = %id.short(), "stored cache key");
        Ok(id)
      }
      Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
        let winner = self
          .read_key_record(key)?
          .ok_or_else(|| CacheStoreError::Io {
            path: path.clone(),
            source: io::Error::new(io::ErrorKind::NotFound, "key record vanished"),
          })?
          .snapshot;
        debug!(key = %key.short(), snapshot = %winner.short(), "cache key already stored by another writer");
        Ok(winner)
      }
      Err(e) => Err(CacheStoreError::Io { path, source: e.error }),
    }
  }

  /// Write a snapshot tree if it is not already present.
  pub fn put_snapshot(&self, snapshot: &Snapshot) -> Result<SnapshotId, CacheStoreError> {
    let id = snapshot.id().map_err(CacheStoreError::Serialize)?;
    let path = self.snapshot_path(&id);
    if path.is_file() {
      return Ok(id);
    }
    let content = serde_json::to_vec(snapshot).map_err(CacheStoreError::Serialize)?;
    let staged = self.stage(&content)?;
    staged
      .persist(&path)
      .map_err(|e| CacheStoreError::Io { path, source: e.error })?;
    Ok(id)
  }

  pub fn load_snapshot(&self, id: &SnapshotId) -> Result<Snapshot, CacheStoreError> {
    if !id.is_well_formed() {
      return Err(CacheStoreError::InvalidSnapshotId(id.clone()));
    }
    let path = self.snapshot_path(id);
    let content = fs::read(&path).map_err(|e| {
      if e.kind() == io::ErrorKind::NotFound {
        CacheStoreError::SnapshotNotFound(id.clone())
      } else {
        CacheStoreError::Io {
          path: path.clone(),
          source: e,
        }
      }
    })?;
    serde_json::from_slice(&content).map_err(|source| CacheStoreError::Parse { path, source })
  }

  fn stage(&self, content: &[u8]) -> Result<NamedTempFile, CacheStoreError> {
    let tmp = self.tmp_dir();
    let mut staged = NamedTempFile::new_in(&tmp).map_err(io_error(&tmp))?;
    staged.write_all(content).map_err(io_error(&tmp))?;
    staged.as_file().sync_all().map_err(io_error(&tmp))?;
    Ok(staged)
  }
}
