//! Implementation of the `strata plan` command.
//!
//! Loads a build file and prints the stages a build would run, wave by wave,
//! without executing anything.

use std::path::Path;

use anyhow::{Context, Result};
use serde_json::json;

use strata_lib::execute::ExecutionPlan;
use strata_lib::graph::{StageHandle, StageParent};

use super::load_graph;
use crate::output::{OutputFormat, print_json, symbols};

pub fn cmd_plan(file: Option<&Path>, targets: &[String], output: OutputFormat) -> Result<()> {
  let (path, graph) = load_graph(file)?;
  let plan = ExecutionPlan::new(&graph, targets).with_context(|| format!("Failed to plan {}", path.display()))?;

  let describe = |handle: StageHandle| {
    let stage = graph.stage(handle);
    let parent = match &stage.parent {
      StageParent::Image(reference) => format!("image {}", reference),
      StageParent::Stage(parent) => format!("stage {}", graph.name(*parent)),
    };
    (stage.name.as_str(), parent, stage.instructions.len())
  };

  if output.is_json() {
    let waves: Vec<Vec<_>> = plan
      .waves()
      .iter()
      .map(|wave| {
        wave
          .iter()
          .map(|&h| {
            let (name, parent, instructions) = describe(h);
            json!({ "stage": name, "from": parent, "instructions": instructions })
          })
          .collect()
      })
      .collect();
    let requested: Vec<&str> = plan.requested().iter().map(|&h| graph.name(h)).collect();
    return print_json(&json!({ "requested": requested, "waves": waves }));
  }

  println!("Plan: {} stage(s) in {} wave(s)", plan.len(), plan.waves().len());
  for (idx, wave) in plan.waves().iter().enumerate() {
    println!("Wave {}:", idx + 1);
    for &handle in wave {
      let (name, parent, instructions) = describe(handle);
      println!(
        "  {} {} ({} {}, {} instruction(s))",
        symbols::INFO,
        name,
        symbols::ARROW,
        parent,
        instructions
      );
    }
  }
  Ok(())
}
