//! Types for stage and build execution.
//!
//! Errors come in three tiers: an [`ExecuteError`] is the cause of a single
//! failed instruction, a [`StageError`] is what a stage task returns, and a
//! [`BuildError`] aborts the whole build.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::graph::{ExpandError, GraphError};
use crate::image::ImageError;
use crate::snapshot::{FsError, ImageConfig, SnapshotId};
use crate::store::CacheStoreError;
use crate::util::hash::{DirHashError, HashError};

/// Why a single instruction failed.
#[derive(Debug, Error)]
pub enum ExecuteError {
  #[error("expansion failed: {0}")]
  Expand(#[from] ExpandError),

  #[error("command failed with exit code {code:?}: {cmd}")]
  CmdFailed { cmd: String, code: Option<i32> },

  #[error("failed to spawn {shell} inside the stage rootfs: {source}")]
  Spawn {
    shell: String,
    #[source]
    source: std::io::Error,
  },

  #[error("cannot confine commands to their rootfs on this host ({0})")]
  Unconfined(super::sandbox::SandboxMode),

  #[error("bind mount source not found: {0}")]
  MountNotFound(PathBuf),

  #[error("failed to hash bind mount: {0}")]
  MountHash(#[from] DirHashError),

  #[error("failed to hash instruction inputs: {0}")]
  Hash(#[from] HashError),

  #[error(transparent)]
  Copy(#[from] CopyError),

  #[error(transparent)]
  Fs(#[from] FsError),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("background task failed: {0}")]
  Join(#[from] tokio::task::JoinError),

  #[error("cancelled")]
  Cancelled,
}

/// Failures of the artifact copier.
#[derive(Debug, Error)]
pub enum CopyError {
  #[error("source stage '{0}' has no completed output")]
  SourceStageNotExecuted(String),

  #[error("path not found in {source_name}: {path}")]
  PathNotFound { source_name: String, path: String },

  #[error("cannot copy into {0}: an ancestor is not a directory")]
  NotADirectory(String),

  #[error("unknown owner '{0}': not numeric and not found in /etc/passwd or /etc/group")]
  UnknownOwner(String),
}

/// The first failing instruction of a stage.
#[derive(Debug, Error)]
#[error("stage '{stage}' instruction {index} ({op}) failed: {cause}")]
pub struct InstructionError {
  pub stage: String,
  pub index: usize,
  pub op: &'static str,
  #[source]
  pub cause: ExecuteError,
}

/// Outcome of a stage task that did not produce an output.
#[derive(Debug, Error)]
pub enum StageError {
  #[error(transparent)]
  Instruction(#[from] InstructionError),

  #[error("stage '{stage}': cannot resolve base image: {source}")]
  BaseImage {
    stage: String,
    #[source]
    source: ImageError,
  },

  #[error("stage '{stage}' task panicked")]
  Panicked { stage: String },

  #[error("stage '{stage}' started before its parent '{parent}' was built")]
  ParentNotBuilt { stage: String, parent: String },

  /// Aborts the build.
  #[error(transparent)]
  Store(#[from] CacheStoreError),

  #[error("cancelled")]
  Cancelled,
}

/// Why a requested output is not available.
#[derive(Debug, Clone, Error)]
pub enum OutputError {
  #[error("stage '{stage}' failed")]
  Failed {
    stage: String,
    #[source]
    cause: Arc<StageError>,
  },

  /// A dependency failed or was itself skipped; `root` is the original failure.
  #[error("stage '{stage}' skipped: dependency '{dependency}' did not complete")]
  Skipped {
    stage: String,
    dependency: String,
    #[source]
    root: Arc<StageError>,
  },
}

impl OutputError {
  /// The failure every skip traces back to.
  pub fn root(&self) -> &Arc<StageError> {
    match self {
      OutputError::Failed { cause, .. } => cause,
      OutputError::Skipped { root, .. } => root,
    }
  }
}

/// Fatal build errors. No report is produced.
#[derive(Debug, Error)]
pub enum BuildError {
  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error(transparent)]
  Store(#[from] CacheStoreError),

  #[error("build cancelled")]
  Cancelled,
}

/// Final snapshot and metadata of a completed stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageOutput {
  pub snapshot: SnapshotId,
  pub config: ImageConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StageStatus {
  /// Completed; `misses` instructions actually ran.
  Built { hits: usize, misses: usize },
  Failed { error: String },
  Skipped { dependency: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
  pub name: String,
  #[serde(flatten)]
  pub status: StageStatus,
}

/// Result of a build that was not aborted.
#[derive(Debug, Default)]
pub struct BuildReport {
  /// Every requested output, in request order.
  pub outputs: Vec<(String, Result<StageOutput, OutputError>)>,
  /// Every stage in the plan, in declaration order.
  pub stages: Vec<StageReport>,
  /// Stage names per wave.
  pub waves: Vec<Vec<String>>,
}

impl BuildReport {
  pub fn is_success(&self) -> bool {
    self.outputs.iter().all(|(_, r)| r.is_ok())
  }

  pub fn output(&self, name: &str) -> Option<&Result<StageOutput, OutputError>> {
    self.outputs.iter().find(|(n, _)| n == name).map(|(_, r)| r)
  }

  pub fn status(&self, name: &str) -> Option<&StageStatus> {
    self.stages.iter().find(|s| s.name == name).map(|s| &s.status)
  }

  /// Stages that completed, whether from cache or by running.
  pub fn built(&self) -> impl Iterator<Item = &str> {
    self
      .stages
      .iter()
      .filter(|s| matches!(s.status, StageStatus::Built { .. }))
      .map(|s| s.name.as_str())
  }

  pub fn cache_hits(&self) -> usize {
    self.count(|hits, _| hits)
  }

  pub fn cache_misses(&self) -> usize {
    self.count(|_, misses| misses)
  }

  fn count(&self, pick: impl Fn(usize, usize) -> usize) -> usize {
    self
      .stages
      .iter()
      .map(|s| match s.status {
        StageStatus::Built { hits, misses } => pick(hits, misses),
        _ => 0,
      })
      .sum()
  }
}

/// Configuration for build execution.
#[derive(Debug, Clone)]
pub struct ExecuteConfig {
  /// Maximum number of stages to execute in parallel.
  pub parallelism: usize,

  /// Shell for `run` commands. `None` means `/bin/sh`.
  pub shell: Option<String>,
}

impl Default for ExecuteConfig {
  fn default() -> Self {
    Self {
      parallelism: num_cpus(),
      shell: None,
    }
  }
}

/// Get the number of CPUs for default parallelism.
fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}
