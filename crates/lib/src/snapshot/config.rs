use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::graph::{Instruction, Protocol};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExposedPort {
  pub port: u16,
  pub protocol: Protocol,
}

impl fmt::Display for ExposedPort {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.port, self.protocol)
  }
}

/// Metadata carried alongside a stage's snapshot.
///
/// Not part of the snapshot identity: metadata instructions leave the tree
/// untouched and only change this.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
  #[serde(default)]
  pub env: BTreeMap<String, String>,
  #[serde(default)]
  pub exposed_ports: BTreeSet<ExposedPort>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub entrypoint: Option<Vec<String>>,
}

impl ImageConfig {
  /// Fold an (already expanded) instruction into the config. Last write wins.
  pub fn apply(&mut self, instruction: &Instruction) {
    match instruction {
      Instruction::SetEnv { vars } => {
        self.env.extend(vars.iter().map(|(k, v)| (k.clone(), v.clone())));
      }
      Instruction::Expose { port, protocol } => {
        self.exposed_ports.insert(ExposedPort {
          port: *port,
          protocol: *protocol,
        });
      }
      Instruction::Entrypoint { argv } => {
        self.entrypoint = Some(argv.clone());
      }
      Instruction::Run { .. } | Instruction::Copy { .. } | Instruction::Arg { .. } => {}
    }
  }
}
