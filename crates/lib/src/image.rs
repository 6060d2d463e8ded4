//! Base images: the root snapshots stages without a stage parent start from.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::consts::SCRATCH_IMAGE;
use crate::platform::Platform;
use crate::snapshot::{FsError, ImageConfig, Snapshot, capture};
use crate::store::BlobStore;

#[derive(Debug, Error)]
pub enum ImageError {
  #[error("base image not found: {reference} (searched {searched})")]
  NotFound { reference: String, searched: PathBuf },

  #[error("invalid image config {path}: {source}")]
  Config {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to read image config {path}: {source}")]
  ReadConfig {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to load base image {reference}: {source}")]
  Capture {
    reference: String,
    #[source]
    source: FsError,
  },
}

/// A resolved base image.
#[derive(Debug, Clone, Default)]
pub struct BaseImage {
  pub snapshot: Snapshot,
  pub config: ImageConfig,
}

/// Supplies root snapshots for image parents.
///
/// Implementations may block; the scheduler calls them off the async runtime.
pub trait BaseImageProvider: Send + Sync {
  fn resolve(&self, reference: &str, target: &Platform, blobs: &BlobStore) -> Result<BaseImage, ImageError>;
}

/// Only knows `scratch`, the empty image.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScratchProvider;

impl BaseImageProvider for ScratchProvider {
  fn resolve(&self, reference: &str, _target: &Platform, _blobs: &BlobStore) -> Result<BaseImage, ImageError> {
    if reference == SCRATCH_IMAGE {
      return Ok(BaseImage::default());
    }
    Err(ImageError::NotFound {
      reference: reference.to_string(),
      searched: PathBuf::new(),
    })
  }
}

/// Images unpacked under a directory, in the same layout `export` writes.
///
/// ```text
/// <root>/<name>/                      # reference with ':' and '/' mapped to '_'
/// ├── <arch-os>/rootfs, config.json   # platform specific, preferred
/// ├── rootfs/
/// └── config.json                     # optional
/// ```
///
/// `scratch` resolves without touching the directory.
#[derive(Debug, Clone)]
pub struct DirectoryProvider {
  root: PathBuf,
}

impl DirectoryProvider {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn image_dir(&self, reference: &str, target: &Platform) -> Option<PathBuf> {
    let name: String = reference
      .chars()
      .map(|c| if matches!(c, ':' | '/' | '@') { '_' } else { c })
      .collect();
    let base = self.root.join(name);
    [base.join(target.triple()), base]
      .into_iter()
      .find(|dir| dir.join("rootfs").is_dir())
  }
}

impl BaseImageProvider for DirectoryProvider {
  fn resolve(&self, reference: &str, target: &Platform, blobs: &BlobStore) -> Result<BaseImage, ImageError> {
    if reference == SCRATCH_IMAGE {
      return Ok(BaseImage::default());
    }

    let dir = self.image_dir(reference, target).ok_or_else(|| ImageError::NotFound {
      reference: reference.to_string(),
      searched: self.root.clone(),
    })?;

    let snapshot = capture(&dir.join("rootfs"), blobs, None).map_err(|source| ImageError::Capture {
      reference: reference.to_string(),
      source,
    })?;

    let config_path = dir.join("config.json");
    let config = match fs::read(&config_path) {
      Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| ImageError::Config {
        path: config_path.clone(),
        source,
      })?,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => ImageConfig::default(),
      Err(source) => {
        return Err(ImageError::ReadConfig {
          path: config_path,
          source,
        });
      }
    };

    debug!(image = %reference, dir = %dir.display(), entries = snapshot.len(), "loaded base image");
    Ok(BaseImage { snapshot, config })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::platform::{Arch, Os};
  use crate::store::CacheStore;
  use tempfile::TempDir;

  fn linux() -> Platform {
    Platform::new(Arch::X86_64, Os::Linux)
  }

  #[test]
  fn scratch_is_empty() {
    let temp = TempDir::new().unwrap();
    let store = CacheStore::open(temp.path()).unwrap();
    let image = ScratchProvider.resolve("scratch", &linux(), store.blobs()).unwrap();
    assert!(image.snapshot.is_empty());
    assert_eq!(image.config, ImageConfig::default());
  }

  #[test]
  fn scratch_provider_rejects_other_images() {
    let temp = TempDir::new().unwrap();
    let store = CacheStore::open(temp.path()).unwrap();
    let err = ScratchProvider.resolve("debian:bookworm", &linux(), store.blobs()).unwrap_err();
    assert!(matches!(err, ImageError::NotFound { .. }));
  }

  #[test]
  fn directory_provider_loads_rootfs_and_config() {
    let temp = TempDir::new().unwrap();
    let store = CacheStore::open(temp.path().join("store")).unwrap();
    let images = temp.path().join("images");
    let image_dir = images.join("ruby_3.3-slim");
    fs::create_dir_all(image_dir.join("rootfs/etc")).unwrap();
    fs::write(image_dir.join("rootfs/etc/passwd"), "root:x:0:0:root:/root:/bin/sh\n").unwrap();
    fs::write(image_dir.join("config.json"), r#"{"env":{"LANG":"C.UTF-8"}}"#).unwrap();

    let provider = DirectoryProvider::new(&images);
    let image = provider.resolve("ruby:3.3-slim", &linux(), store.blobs()).unwrap();

    assert!(image.snapshot.contains("etc/passwd"));
    assert_eq!(image.config.env["LANG"], "C.UTF-8");
  }

  #[test]
  fn directory_provider_prefers_platform_specific_rootfs() {
    let temp = TempDir::new().unwrap();
    let store = CacheStore::open(temp.path().join("store")).unwrap();
    let images = temp.path().join("images");
    fs::create_dir_all(images.join("alpine/rootfs/generic")).unwrap();
    fs::create_dir_all(images.join("alpine/x86_64-linux/rootfs/amd64")).unwrap();

    let image = DirectoryProvider::new(&images)
      .resolve("alpine", &linux(), store.blobs())
      .unwrap();

    assert!(image.snapshot.contains("amd64"));
    assert!(!image.snapshot.contains("generic"));
  }

  #[test]
  fn directory_provider_missing_image() {
    let temp = TempDir::new().unwrap();
    let store = CacheStore::open(temp.path().join("store")).unwrap();
    let err = DirectoryProvider::new(temp.path())
      .resolve("nope", &linux(), store.blobs())
      .unwrap_err();
    assert!(matches!(err, ImageError::NotFound { reference, .. } if reference == "nope"));
  }
}
