mod build;
mod info;
mod inspect;
mod plan;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use strata_lib::buildfile::BuildFile;
use strata_lib::consts::BUILD_FILE_NAME;
use strata_lib::graph::StageGraph;

pub use build::{BuildArgs, cmd_build};
pub use info::cmd_info;
pub use inspect::cmd_inspect;
pub use plan::cmd_plan;

/// Load a build file and declare its stages.
fn load_graph(file: Option<&Path>) -> Result<(PathBuf, StageGraph)> {
  let path = file.map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from(BUILD_FILE_NAME));
  let build_file = BuildFile::load(&path).with_context(|| format!("Failed to load build file: {}", path.display()))?;
  let graph = build_file
    .to_graph()
    .with_context(|| format!("Invalid build file: {}", path.display()))?;
  Ok((path, graph))
}

/// Parse a `KEY=VALUE` pair.
fn parse_key_val(s: &str) -> Result<(String, String), String> {
  match s.split_once('=') {
    Some((key, _)) if key.is_empty() => Err(format!("empty key in '{}'", s)),
    Some((key, value)) => Ok((key.to_string(), value.to_string())),
    None => Err(format!("expected KEY=VALUE, got '{}'", s)),
  }
}
