//! Moving snapshots between the store and real directories.
//!
//! [`materialize`] writes a tree out (for commands and exports); [`capture`]
//! reads a directory back into a tree, pulling file contents into the blob
//! area. Ownership is never applied on disk; it only lives in the tree.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::store::{BlobStore, CacheStoreError};

use super::config::ImageConfig;
use super::types::{Entry, EntryKind, Snapshot, Subtree};

#[derive(Debug, Error)]
pub enum FsError {
  #[error("failed to {action} {path}: {source}")]
  Io {
    action: &'static str,
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to walk {path}: {message}")]
  Walk { path: PathBuf, message: String },

  #[error("path is not valid UTF-8: {0}")]
  NonUtf8(PathBuf),

  #[error(transparent)]
  Store(#[from] CacheStoreError),
}

fn io_err(action: &'static str, path: &Path) -> impl FnOnce(io::Error) -> FsError + use<> {
  let path = path.to_path_buf();
  move |source| FsError::Io { action, path, source }
}

/// Mode a tree entry has on disk once materialized.
///
/// Directories always keep owner `rwx` so the scratch tree stays writable
/// and removable.
pub fn materialized_mode(entry: &Entry) -> u32 {
  match entry.kind {
    EntryKind::Dir => (entry.mode & 0o7777) | 0o700,
    _ => entry.mode & 0o7777,
  }
}

/// Write `snapshot` below `dir`, which must exist.
pub fn materialize(snapshot: &Snapshot, blobs: &BlobStore, dir: &Path) -> Result<(), FsError> {
  for (path, entry) in snapshot.entries() {
    write_entry(blobs, &dir.join(path), entry)?;
  }
  Ok(())
}

fn write_entry(blobs: &BlobStore, target: &Path, entry: &Entry) -> Result<(), FsError> {
  match &entry.kind {
    EntryKind::Dir => {
      fs::create_dir_all(target).map_err(io_err("create directory", target))?;
      set_mode(target, materialized_mode(entry))?;
    }
    EntryKind::File { digest, .. } => {
      let source = blobs.path(digest);
      if !source.is_file() {
        return Err(CacheStoreError::BlobNotFound(digest.clone()).into());
      }
      fs::copy(&source, target).map_err(io_err("write file", target))?;
      set_mode(target, materialized_mode(entry))?;
    }
    EntryKind::Symlink { target: link } => {
      make_symlink(link, target)?;
    }
  }
  Ok(())
}

/// Read the directory tree at `dir` into a snapshot.
///
/// With a `parent`, entries whose kind, content and on-disk mode are
/// unchanged keep the parent's entry (and so its ownership); anything new or
/// changed is owned by 0:0.
pub fn capture(dir: &Path, blobs: &BlobStore, parent: Option<&Snapshot>) -> Result<Snapshot, FsError> {
  let mut snapshot = Snapshot::empty();
  for (rel, captured) in walk(dir, blobs)? {
    let entry = match parent.and_then(|p| p.get(&rel)) {
      Some(prev) if unchanged(prev, &captured) => prev.clone(),
      _ => captured,
    };
    snapshot.insert(&rel, entry);
  }
  Ok(snapshot)
}

/// Capture a single file or directory as a detached subtree owned by 0:0.
pub fn capture_subtree(path: &Path, blobs: &BlobStore) -> Result<Subtree, FsError> {
  let meta = fs::symlink_metadata(path).map_err(io_err("stat", path))?;
  let root = read_entry(path, &meta, blobs)?.ok_or_else(|| FsError::Io {
    action: "capture",
    path: path.to_path_buf(),
    source: io::Error::new(io::ErrorKind::Unsupported, "unsupported file type"),
  })?;
  let children = if root.is_dir() {
    walk(path, blobs)?.into_iter().collect()
  } else {
    Default::default()
  };
  Ok(Subtree { root, children })
}

fn walk(dir: &Path, blobs: &BlobStore) -> Result<Vec<(String, Entry)>, FsError> {
  let mut out = Vec::new();
  for item in WalkDir::new(dir)
    .min_depth(1)
    .follow_links(false)
    .sort_by_file_name()
  {
    let item = item.map_err(|e| FsError::Walk {
      path: dir.to_path_buf(),
      message: e.to_string(),
    })?;
    let rel = item
      .path()
      .strip_prefix(dir)
      .map_err(|_| FsError::NonUtf8(item.path().to_path_buf()))?;
    let rel = rel
      .components()
      .map(|c| c.as_os_str().to_str())
      .collect::<Option<Vec<_>>>()
      .ok_or_else(|| FsError::NonUtf8(item.path().to_path_buf()))?
      .join("/");
    let meta = item.metadata().map_err(|e| FsError::Walk {
      path: item.path().to_path_buf(),
      message: e.to_string(),
    })?;
    match read_entry(item.path(), &meta, blobs)? {
      Some(entry) => out.push((rel, entry)),
      None => warn!(path = %item.path().display(), "skipping special file"),
    }
  }
  Ok(out)
}

fn read_entry(path: &Path, meta: &fs::Metadata, blobs: &BlobStore) -> Result<Option<Entry>, FsError> {
  let ft = meta.file_type();
  let entry = if ft.is_symlink() {
    let target = fs::read_link(path).map_err(io_err("read symlink", path))?;
    let target = target.to_str().ok_or_else(|| FsError::NonUtf8(target.clone()))?;
    Entry::symlink(target)
  } else if ft.is_dir() {
    Entry::dir(mode_of(meta, true), 0, 0)
  } else if ft.is_file() {
    let (digest, size) = blobs.insert_file(path)?;
    Entry::file(digest, size, mode_of(meta, false))
  } else {
    return Ok(None);
  };
  Ok(Some(entry))
}

fn unchanged(prev: &Entry, captured: &Entry) -> bool {
  match (&prev.kind, &captured.kind) {
    (EntryKind::Symlink { .. }, EntryKind::Symlink { .. }) => prev.kind == captured.kind,
    _ => prev.kind == captured.kind && materialized_mode(prev) == captured.mode,
  }
}

/// Write `snapshot` to `dir/rootfs` and its config to `dir/config.json`.
pub fn export(snapshot: &Snapshot, config: &ImageConfig, blobs: &BlobStore, dir: &Path) -> Result<(), FsError> {
  let rootfs = dir.join("rootfs");
  if rootfs.exists() {
    fs::remove_dir_all(&rootfs).map_err(io_err("clear", &rootfs))?;
  }
  fs::create_dir_all(&rootfs).map_err(io_err("create directory", &rootfs))?;
  materialize(snapshot, blobs, &rootfs)?;

  let config_path = dir.join("config.json");
  let content = serde_json::to_vec_pretty(config).map_err(|e| FsError::Io {
    action: "serialize",
    path: config_path.clone(),
    source: io::Error::other(e),
  })?;
  fs::write(&config_path, content).map_err(io_err("write", &config_path))?;

  debug!(dir = %dir.display(), entries = snapshot.len(), "exported snapshot");
  Ok(())
}

#[cfg(unix)]
fn mode_of(meta: &fs::Metadata, _is_dir: bool) -> u32 {
  use std::os::unix::fs::PermissionsExt;
  meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_of(meta: &fs::Metadata, is_dir: bool) -> u32 {
  use crate::consts::{DEFAULT_DIR_MODE, DEFAULT_FILE_MODE};
  match (is_dir, meta.permissions().readonly()) {
    (true, _) => DEFAULT_DIR_MODE,
    (false, true) => 0o444,
    (false, false) => DEFAULT_FILE_MODE,
  }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), FsError> {
  use std::os::unix::fs::PermissionsExt;
  fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(io_err("set mode on", path))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), FsError> {
  Ok(())
}

#[cfg(unix)]
fn make_symlink(link: &str, at: &Path) -> Result<(), FsError> {
  std::os::unix::fs::symlink(link, at).map_err(io_err("create symlink", at))
}

#[cfg(not(unix))]
fn make_symlink(link: &str, at: &Path) -> Result<(), FsError> {
  warn!(path = %at.display(), target = %link, "symlinks are not materialized on this platform");
  Ok(())
}
