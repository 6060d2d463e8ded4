//! Stage graph construction and validation.
//!
//! A graph is built append-only: every stage is declared after the stages it
//! derives from, so acyclicity follows from declaration order. Stage parents
//! are resolved when a stage is declared; copy references are checked by
//! [`StageGraph::validate`], which rejects any copy that names a stage not
//! declared strictly earlier.
//!
//! # Submodules
//!
//! - [`expand`] - `${NAME}` expansion for instruction fields
//! - [`scope`] - per-stage parameter resolution

pub mod expand;
pub mod scope;
mod types;

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;

pub use expand::{ExpandError, Layered, Lookup};
pub use scope::StageBindings;
pub use types::*;

/// Errors for a malformed graph. Always raised before anything executes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
  #[error("unknown stage: {name}")]
  UnknownStage { name: String },

  #[error("duplicate stage name: {name}")]
  DuplicateStageName { name: String },

  #[error("cyclic dependency: stage '{stage}' instruction {index} copies from '{source_stage}', which is not declared before it")]
  CyclicDependency {
    stage: String,
    index: usize,
    source_stage: String,
  },

  #[error("requested output stage was never declared: {name}")]
  UnreachableStage { name: String },

  #[error("stage handle {0} does not belong to this graph")]
  InvalidHandle(usize),
}

/// An append-only DAG of named stages.
#[derive(Debug, Clone, Default)]
pub struct StageGraph {
  stages: Vec<Stage>,
  /// First declaration of every name.
  by_name: HashMap<String, StageHandle>,
  /// Names declared more than once, reported by `validate`.
  duplicates: Vec<String>,
}

impl StageGraph {
  pub fn new() -> Self {
    Self::default()
  }

  /// Declare a stage deriving from `parent`.
  ///
  /// A stage parent must already be declared; forward references fail with
  /// `UnknownStage`.
  pub fn declare_stage(
    &mut self,
    name: impl Into<String>,
    parent: ParentRef,
    params: Vec<ParamDecl>,
  ) -> Result<StageHandle, GraphError> {
    let name = name.into();
    let parent = match parent {
      ParentRef::Image(reference) => StageParent::Image(reference),
      ParentRef::Stage(stage) => StageParent::Stage(self.resolve(&stage)?),
    };

    let handle = StageHandle(self.stages.len());
    if self.by_name.contains_key(&name) {
      self.duplicates.push(name.clone());
    } else {
      self.by_name.insert(name.clone(), handle);
    }

    self.stages.push(Stage {
      name,
      parent,
      params,
      instructions: Vec::new(),
    });

    Ok(handle)
  }

  /// Append an instruction to a stage.
  pub fn add_instruction(&mut self, handle: StageHandle, instruction: Instruction) -> Result<(), GraphError> {
    let stage = self
      .stages
      .get_mut(handle.0)
      .ok_or(GraphError::InvalidHandle(handle.0))?;
    stage.instructions.push(instruction);
    Ok(())
  }

  /// Look up a previously declared stage by name.
  pub fn resolve(&self, name: &str) -> Result<StageHandle, GraphError> {
    self
      .by_name
      .get(name)
      .copied()
      .ok_or_else(|| GraphError::UnknownStage { name: name.to_string() })
  }

  /// Check the whole graph before execution.
  pub fn validate(&self) -> Result<(), GraphError> {
    if let Some(name) = self.duplicates.first() {
      return Err(GraphError::DuplicateStageName { name: name.clone() });
    }

    for (idx, stage) in self.stages.iter().enumerate() {
      for (ins_idx, source) in stage.copy_sources() {
        let source_handle = self.resolve(source)?;
        if source_handle.0 >= idx {
          return Err(GraphError::CyclicDependency {
            stage: stage.name.clone(),
            index: ins_idx,
            source_stage: source.to_string(),
          });
        }
      }
    }

    Ok(())
  }

  pub fn stage(&self, handle: StageHandle) -> &Stage {
    &self.stages[handle.0]
  }

  pub fn name(&self, handle: StageHandle) -> &str {
    &self.stages[handle.0].name
  }

  pub fn stages(&self) -> impl Iterator<Item = (StageHandle, &Stage)> {
    self.stages.iter().enumerate().map(|(idx, s)| (StageHandle(idx), s))
  }

  pub fn len(&self) -> usize {
    self.stages.len()
  }

  pub fn is_empty(&self) -> bool {
    self.stages.is_empty()
  }

  /// The most recently declared stage, the default output of a build.
  pub fn last(&self) -> Option<StageHandle> {
    self.stages.len().checked_sub(1).map(StageHandle)
  }

  /// Direct dependencies of a stage: its parent stage and every copy source.
  ///
  /// Unknown copy sources are skipped; `validate` reports them.
  pub fn dependencies(&self, handle: StageHandle) -> BTreeSet<StageHandle> {
    let stage = self.stage(handle);
    let mut deps: BTreeSet<StageHandle> = stage.parent_stage().into_iter().collect();
    for (_, source) in stage.copy_sources() {
      if let Ok(dep) = self.resolve(source) {
        deps.insert(dep);
      }
    }
    deps
  }

  /// Every parameter name declared anywhere in the graph.
  pub fn declared_params(&self) -> BTreeSet<&str> {
    let mut names = BTreeSet::new();
    for stage in &self.stages {
      names.extend(stage.params.iter().map(|p| p.name.as_str()));
      for ins in &stage.instructions {
        if let Instruction::Arg { name, .. } = ins {
          names.insert(name.as_str());
        }
      }
    }
    names
  }
}
