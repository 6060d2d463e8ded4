//! Build file loading.
//!
//! A build file (`strata.json`) declares stages in order. Stage parents and
//! copy sources must name stages declared earlier in the file.
//!
//! # Format
//!
//! ```json
//! {
//!   "version": 1,
//!   "stages": [
//!     {
//!       "name": "base",
//!       "from": { "image": "ruby:3.3-slim" },
//!       "params": [{ "name": "BUNDLE_WITHOUT", "default": "development" }],
//!       "instructions": [
//!         { "op": "set-env", "vars": { "BUNDLE_PATH": "/usr/local/bundle" } },
//!         { "op": "run", "command": "bundle install",
//!           "mounts": [{ "source": "Gemfile", "target": "/src/Gemfile" }] }
//!       ]
//!     },
//!     {
//!       "name": "app",
//!       "from": { "image": "scratch" },
//!       "instructions": [
//!         { "op": "copy", "from": { "stage": "base" }, "src": "/usr/local/bundle", "dest": "/usr/local/bundle" }
//!       ]
//!     }
//!   ]
//! }
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::{GraphError, Instruction, ParamDecl, ParentRef, StageGraph};

/// Current build file format version.
pub const BUILD_FILE_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum BuildFileError {
  #[error("failed to read build file {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse build file {path}: {source}")]
  Parse {
    path: PathBuf,
    #[source]
    source: serde_json::Error,
  },

  #[error("unsupported build file version {0}, expected {BUILD_FILE_VERSION}")]
  UnsupportedVersion(u32),

  #[error("stage '{stage}': {source}")]
  Graph {
    stage: String,
    #[source]
    source: GraphError,
  },
}

/// Parsed build file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildFile {
  #[serde(default = "default_version")]
  pub version: u32,
  pub stages: Vec<StageDecl>,
}

fn default_version() -> u32 {
  BUILD_FILE_VERSION
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageDecl {
  pub name: String,
  pub from: ParentRef,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub params: Vec<ParamDecl>,
  #[serde(default)]
  pub instructions: Vec<Instruction>,
}

impl BuildFile {
  pub fn load(path: &Path) -> Result<Self, BuildFileError> {
    let content = fs::read_to_string(path).map_err(|source| BuildFileError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    Self::parse(&content).map_err(|e| match e {
      BuildFileError::Parse { source, .. } => BuildFileError::Parse {
        path: path.to_path_buf(),
        source,
      },
      other => other,
    })
  }

  pub fn parse(content: &str) -> Result<Self, BuildFileError> {
    let file: BuildFile = serde_json::from_str(content).map_err(|source| BuildFileError::Parse {
      path: PathBuf::new(),
      source,
    })?;

    if file.version != BUILD_FILE_VERSION {
      return Err(BuildFileError::UnsupportedVersion(file.version));
    }
    Ok(file)
  }

  /// Declare every stage in file order.
  ///
  /// Forward parent references fail here; copy references are left for
  /// [`StageGraph::validate`].
  pub fn to_graph(&self) -> Result<StageGraph, BuildFileError> {
    let mut graph = StageGraph::new();
    for decl in &self.stages {
      let graph_err = |source| BuildFileError::Graph {
        stage: decl.name.clone(),
        source,
      };
      let handle = graph
        .declare_stage(decl.name.clone(), decl.from.clone(), decl.params.clone())
        .map_err(graph_err)?;
      for instruction in &decl.instructions {
        graph.add_instruction(handle, instruction.clone()).map_err(graph_err)?;
      }
    }
    Ok(graph)
  }
}
