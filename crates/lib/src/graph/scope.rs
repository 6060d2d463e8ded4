//! Build parameter scoping.
//!
//! Parameters form an append-only symbol table per stage. A declaration is
//! visible from the point it appears: stage-level declarations from the first
//! instruction, `arg` instructions from the instruction after them. Descendant
//! stages inherit every declaration of their ancestors and may re-declare a
//! name to change its default.

use std::collections::BTreeMap;

use super::{Instruction, ParamDecl, StageGraph, StageHandle};

/// Parameter values for one stage instantiation, resolved before it runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageBindings {
  base: BTreeMap<String, Option<String>>,
  local: Vec<(usize, String, Option<String>)>,
}

impl StageBindings {
  /// Resolve every declaration visible to `handle` against caller overrides.
  ///
  /// An override wins over a declared default. A parameter with neither is
  /// unset and expands to the empty string.
  pub fn resolve(graph: &StageGraph, handle: StageHandle, overrides: &BTreeMap<String, String>) -> Self {
    let mut chain = vec![handle];
    let mut cursor = graph.stage(handle).parent_stage();
    while let Some(parent) = cursor {
      chain.push(parent);
      cursor = graph.stage(parent).parent_stage();
    }
    chain.reverse();

    let mut bindings = StageBindings::default();
    for &ancestor in &chain[..chain.len() - 1] {
      let stage = graph.stage(ancestor);
      for decl in &stage.params {
        bindings.base.insert(decl.name.clone(), bind(decl, overrides));
      }
      for (_, decl) in arg_decls(&stage.instructions) {
        bindings.base.insert(decl.name.clone(), bind(&decl, overrides));
      }
    }

    let stage = graph.stage(handle);
    for decl in &stage.params {
      bindings.base.insert(decl.name.clone(), bind(decl, overrides));
    }
    for (idx, decl) in arg_decls(&stage.instructions) {
      let value = bind(&decl, overrides);
      bindings.local.push((idx, decl.name, value));
    }

    bindings
  }

  /// Set parameters visible to the instruction at `index`.
  pub fn visible_at(&self, index: usize) -> BTreeMap<String, String> {
    let mut visible: BTreeMap<String, Option<String>> = self.base.clone();
    for (idx, name, value) in &self.local {
      if *idx < index {
        visible.insert(name.clone(), value.clone());
      }
    }
    visible.into_iter().filter_map(|(k, v)| v.map(|v| (k, v))).collect()
  }

  /// Names visible anywhere in the stage, set or not.
  pub fn names(&self) -> impl Iterator<Item = &str> {
    self
      .base
      .keys()
      .map(String::as_str)
      .chain(self.local.iter().map(|(_, name, _)| name.as_str()))
  }
}

fn bind(decl: &ParamDecl, overrides: &BTreeMap<String, String>) -> Option<String> {
  overrides.get(&decl.name).cloned().or_else(|| decl.default.clone())
}

fn arg_decls(instructions: &[Instruction]) -> impl Iterator<Item = (usize, ParamDecl)> + '_ {
  instructions.iter().enumerate().filter_map(|(idx, ins)| match ins {
    Instruction::Arg { name, default } => Some((
      idx,
      ParamDecl {
        name: name.clone(),
        default: default.clone(),
      },
    )),
    _ => None,
  })
}
