use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::expand::{ExpandError, Lookup, expand};

/// Index of a stage inside its [`StageGraph`](super::StageGraph).
///
/// Handles are only meaningful for the graph that issued them. Ordering
/// follows declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StageHandle(pub(crate) usize);

impl StageHandle {
  pub fn index(&self) -> usize {
    self.0
  }
}

/// Parent reference as written by the graph author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParentRef {
  /// A base image supplied by a [`BaseImageProvider`](crate::image::BaseImageProvider).
  Image(String),
  /// A previously declared stage, by name.
  Stage(String),
}

/// Parent of a declared stage, with stage references already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageParent {
  Image(String),
  Stage(StageHandle),
}

/// A build parameter declaration (`name` with an optional default).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamDecl {
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub default: Option<String>,
}

impl ParamDecl {
  pub fn new(name: impl Into<String>, default: Option<&str>) -> Self {
    Self {
      name: name.into(),
      default: default.map(str::to_string),
    }
  }
}

/// A named node of the build graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
  pub name: String,
  pub parent: StageParent,
  /// Parameters declared together with the stage, visible from its first instruction.
  pub params: Vec<ParamDecl>,
  pub instructions: Vec<Instruction>,
}

impl Stage {
  pub fn parent_stage(&self) -> Option<StageHandle> {
    match self.parent {
      StageParent::Stage(handle) => Some(handle),
      StageParent::Image(_) => None,
    }
  }

  /// Names of stages referenced by copy instructions, in instruction order.
  pub fn copy_sources(&self) -> impl Iterator<Item = (usize, &str)> {
    self.instructions.iter().enumerate().filter_map(|(idx, ins)| match ins {
      Instruction::Copy {
        from: CopySource::Stage(name),
        ..
      } => Some((idx, name.as_str())),
      _ => None,
    })
  }
}

/// Where a copy instruction reads from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CopySource {
  /// The local build context directory.
  #[default]
  Context,
  /// The final snapshot of another stage.
  Stage(String),
}

/// A read-only input exposed to a single `run` instruction and never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BindMount {
  /// Path relative to the build context.
  pub source: String,
  /// Path inside the stage filesystem.
  pub target: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
  #[default]
  Tcp,
  Udp,
}

impl fmt::Display for Protocol {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Protocol::Tcp => write!(f, "tcp"),
      Protocol::Udp => write!(f, "udp"),
    }
  }
}

/// One step of a stage.
///
/// Instructions are pure given their inputs: the parent snapshot, their own
/// (expanded) fields and any declared external inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Instruction {
  SetEnv {
    vars: BTreeMap<String, String>,
  },
  Run {
    command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    mounts: Vec<BindMount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    workdir: Option<String>,
  },
  Copy {
    #[serde(default)]
    from: CopySource,
    src: String,
    dest: String,
    /// `user:group`, numeric or resolved through the stage's `/etc/passwd` and `/etc/group`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    owner: Option<String>,
  },
  Expose {
    port: u16,
    #[serde(default)]
    protocol: Protocol,
  },
  Entrypoint {
    argv: Vec<String>,
  },
  Arg {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    default: Option<String>,
  },
}

impl Instruction {
  pub fn run(command: impl Into<String>) -> Self {
    Instruction::Run {
      command: command.into(),
      mounts: Vec::new(),
      workdir: None,
    }
  }

  pub fn copy_from(stage: impl Into<String>, src: impl Into<String>, dest: impl Into<String>) -> Self {
    Instruction::Copy {
      from: CopySource::Stage(stage.into()),
      src: src.into(),
      dest: dest.into(),
      owner: None,
    }
  }

  pub fn set_env(key: impl Into<String>, value: impl Into<String>) -> Self {
    Instruction::SetEnv {
      vars: BTreeMap::from([(key.into(), value.into())]),
    }
  }

  /// Short label used in logs and key records.
  pub fn op(&self) -> &'static str {
    match self {
      Instruction::SetEnv { .. } => "set-env",
      Instruction::Run { .. } => "run",
      Instruction::Copy { .. } => "copy",
      Instruction::Expose { .. } => "expose",
      Instruction::Entrypoint { .. } => "entrypoint",
      Instruction::Arg { .. } => "arg",
    }
  }

  /// Whether the instruction only touches image metadata, never the filesystem.
  pub fn is_metadata(&self) -> bool {
    matches!(
      self,
      Instruction::SetEnv { .. } | Instruction::Expose { .. } | Instruction::Entrypoint { .. } | Instruction::Arg { .. }
    )
  }

  /// Return the normalized form: every expandable field has `${NAME}` references substituted.
  ///
  /// `run` commands are left untouched; the shell sees parameters and environment
  /// as real variables.
  pub fn expand(&self, vars: &impl Lookup) -> Result<Instruction, ExpandError> {
    Ok(match self {
      Instruction::SetEnv { vars: env } => Instruction::SetEnv {
        vars: env
          .iter()
          .map(|(k, v)| Ok((k.clone(), expand(v, vars)?)))
          .collect::<Result<_, ExpandError>>()?,
      },
      Instruction::Run {
        command,
        mounts,
        workdir,
      } => Instruction::Run {
        command: command.clone(),
        mounts: mounts
          .iter()
          .map(|m| {
            Ok(BindMount {
              source: expand(&m.source, vars)?,
              target: expand(&m.target, vars)?,
            })
          })
          .collect::<Result<_, ExpandError>>()?,
        workdir: workdir.as_deref().map(|w| expand(w, vars)).transpose()?,
      },
      Instruction::Copy { from, src, dest, owner } => Instruction::Copy {
        from: from.clone(),
        src: expand(src, vars)?,
        dest: expand(dest, vars)?,
        owner: owner.as_deref().map(|o| expand(o, vars)).transpose()?,
      },
      Instruction::Entrypoint { argv } => Instruction::Entrypoint {
        argv: argv.iter().map(|a| expand(a, vars)).collect::<Result<_, _>>()?,
      },
      Instruction::Expose { .. } | Instruction::Arg { .. } => self.clone(),
    })
  }
}

impl fmt::Display for Instruction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Instruction::SetEnv { vars } => {
        let pairs: Vec<String> = vars.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        write!(f, "set-env {}", pairs.join(" "))
      }
      Instruction::Run { command, .. } => write!(f, "run {}", command),
      Instruction::Copy { from, src, dest, .. } => match from {
        CopySource::Context => write!(f, "copy {} {}", src, dest),
        CopySource::Stage(stage) => write!(f, "copy --from={} {} {}", stage, src, dest),
      },
      Instruction::Expose { port, protocol } => write!(f, "expose {}/{}", port, protocol),
      Instruction::Entrypoint { argv } => write!(f, "entrypoint {:?}", argv),
      Instruction::Arg { name, default } => match default {
        Some(d) => write!(f, "arg {}={}", name, d),
        None => write!(f, "arg {}", name),
      },
    }
  }
}
