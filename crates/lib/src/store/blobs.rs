//! Content-addressed file contents: `blobs/sha256/<2>/<digest>`.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::util::hash::{ContentHash, hash_bytes, hash_file};

use super::{CacheStoreError, io_error};

#[derive(Debug, Clone)]
pub struct BlobStore {
  base: PathBuf,
  tmp: PathBuf,
}

impl BlobStore {
  pub(crate) fn new(root: &Path) -> Self {
    Self {
      base: root.join("blobs").join("sha256"),
      tmp: root.join("tmp"),
    }
  }

  pub fn path(&self, digest: &ContentHash) -> PathBuf {
    let prefix = &digest.0[..digest.0.len().min(2)];
    self.base.join(prefix).join(&digest.0)
  }

  pub fn contains(&self, digest: &ContentHash) -> bool {
    self.path(digest).is_file()
  }

  /// Copy a file into the blob area, returning its digest and size.
  pub fn insert_file(&self, source: &Path) -> Result<(ContentHash, u64), CacheStoreError> {
    let digest = hash_file(source).map_err(CacheStoreError::Hash)?;
    let size = fs::metadata(source).map_err(io_error(source))?.len();
    if !self.contains(&digest) {
      let staged = NamedTempFile::new_in(&self.tmp).map_err(io_error(&self.tmp))?;
      fs::copy(source, staged.path()).map_err(io_error(source))?;
      self.persist(staged, &digest)?;
    }
    Ok((digest, size))
  }

  pub fn insert_bytes(&self, data: &[u8]) -> Result<ContentHash, CacheStoreError> {
    let digest = hash_bytes(data);
    if !self.contains(&digest) {
      let mut staged = NamedTempFile::new_in(&self.tmp).map_err(io_error(&self.tmp))?;
      staged.write_all(data).map_err(io_error(staged.path()))?;
      self.persist(staged, &digest)?;
    }
    Ok(digest)
  }

  pub fn read(&self, digest: &ContentHash) -> Result<Vec<u8>, CacheStoreError> {
    let path = self.path(digest);
    fs::read(&path).map_err(|e| {
      if e.kind() == std::io::ErrorKind::NotFound {
        CacheStoreError::BlobNotFound(digest.clone())
      } else {
        CacheStoreError::Io { path, source: e }
      }
    })
  }

  // Identical content under an identical name, so a concurrent rename is harmless.
  fn persist(&self, staged: NamedTempFile, digest: &ContentHash) -> Result<(), CacheStoreError> {
    let dest = self.path(digest);
    if let Some(parent) = dest.parent() {
      fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    staged
      .persist(&dest)
      .map_err(|e| CacheStoreError::Io { path: dest, source: e.error })?;
    Ok(())
  }
}
