//! Execution plan for a build request.
//!
//! The plan holds the minimal set of stages needed for the requested outputs,
//! linked by parent and copy edges, and groups them into waves: every stage in
//! a wave depends only on stages in earlier waves. Waves describe the shape of
//! a build for `strata plan` and reports; the scheduler itself starts each
//! stage as soon as its own dependencies are done.

use std::collections::{BTreeMap, BTreeSet};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::graph::{GraphError, StageGraph, StageHandle};

/// Stages selected for a build, with their parallel waves.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
  /// Edges point from a dependency to its dependent.
  graph: DiGraph<StageHandle, ()>,
  nodes: BTreeMap<StageHandle, NodeIndex>,
  requested: Vec<StageHandle>,
  waves: Vec<Vec<StageHandle>>,
}

impl ExecutionPlan {
  /// Plan the stages needed for `requested` output names.
  ///
  /// The graph is validated first. An empty request means the last declared
  /// stage; a name that was never declared fails with `UnreachableStage`.
  pub fn new(stages: &StageGraph, requested: &[String]) -> Result<Self, GraphError> {
    stages.validate()?;

    let requested: Vec<StageHandle> = if requested.is_empty() {
      stages.last().into_iter().collect()
    } else {
      let mut handles = Vec::with_capacity(requested.len());
      for name in requested {
        let handle = stages
          .resolve(name)
          .map_err(|_| GraphError::UnreachableStage { name: name.clone() })?;
        if !handles.contains(&handle) {
          handles.push(handle);
        }
      }
      handles
    };

    // Transitive closure over parent and copy edges.
    let mut selected = BTreeSet::new();
    let mut pending = requested.clone();
    while let Some(handle) = pending.pop() {
      if selected.insert(handle) {
        pending.extend(stages.dependencies(handle));
      }
    }

    let mut graph = DiGraph::new();
    let mut nodes = BTreeMap::new();
    for &handle in &selected {
      nodes.insert(handle, graph.add_node(handle));
    }
    for &handle in &selected {
      for dep in stages.dependencies(handle) {
        graph.add_edge(nodes[&dep], nodes[&handle], ());
      }
    }

    let mut plan = Self {
      graph,
      nodes,
      requested,
      waves: Vec::new(),
    };
    plan.waves = plan.compute_waves(stages)?;
    Ok(plan)
  }

  /// Kahn levelling. Each wave is sorted by declaration order.
  fn compute_waves(&self, stages: &StageGraph) -> Result<Vec<Vec<StageHandle>>, GraphError> {
    let mut in_degree: BTreeMap<StageHandle, usize> = self
      .nodes
      .iter()
      .map(|(&handle, &idx)| (handle, self.graph.neighbors_directed(idx, Direction::Incoming).count()))
      .collect();

    let mut waves = Vec::new();
    while !in_degree.is_empty() {
      let ready: Vec<StageHandle> = in_degree
        .iter()
        .filter(|&(_, &deg)| deg == 0)
        .map(|(&handle, _)| handle)
        .collect();

      if ready.is_empty() {
        return Err(stalled(stages, in_degree.keys().copied().collect()));
      }

      for handle in &ready {
        in_degree.remove(handle);
        for dependent in self.graph.neighbors_directed(self.nodes[handle], Direction::Outgoing) {
          if let Some(deg) = in_degree.get_mut(&self.graph[dependent]) {
            *deg = deg.saturating_sub(1);
          }
        }
      }
      waves.push(ready);
    }

    Ok(waves)
  }

  pub fn waves(&self) -> &[Vec<StageHandle>] {
    &self.waves
  }

  /// Requested outputs in request order, duplicates removed.
  pub fn requested(&self) -> &[StageHandle] {
    &self.requested
  }

  /// Every planned stage in declaration order.
  pub fn stages(&self) -> impl Iterator<Item = StageHandle> + '_ {
    self.nodes.keys().copied()
  }

  pub fn contains(&self, handle: StageHandle) -> bool {
    self.nodes.contains_key(&handle)
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  /// Direct dependencies of a planned stage, in declaration order.
  pub fn dependencies(&self, handle: StageHandle) -> Vec<StageHandle> {
    self.neighbors(handle, Direction::Incoming)
  }

  /// Planned stages that depend directly on `handle`, in declaration order.
  pub fn dependents(&self, handle: StageHandle) -> Vec<StageHandle> {
    self.neighbors(handle, Direction::Outgoing)
  }

  fn neighbors(&self, handle: StageHandle, direction: Direction) -> Vec<StageHandle> {
    let Some(&idx) = self.nodes.get(&handle) else {
      return Vec::new();
    };
    let mut found: Vec<StageHandle> = self
      .graph
      .neighbors_directed(idx, direction)
      .map(|n| self.graph[n])
      .collect();
    found.sort();
    found.dedup();
    found
  }
}

/// Describe a wave computation that made no progress.
fn stalled(stages: &StageGraph, remaining: BTreeSet<StageHandle>) -> GraphError {
  for &handle in &remaining {
    let stage = stages.stage(handle);
    for (index, source) in stage.copy_sources() {
      if stages.resolve(source).is_ok_and(|h| remaining.contains(&h)) {
        return GraphError::CyclicDependency {
          stage: stage.name.clone(),
          index,
          source_stage: source.to_string(),
        };
      }
    }
  }
  let name = remaining
    .first()
    .map(|&h| stages.name(h).to_string())
    .unwrap_or_default();
  GraphError::CyclicDependency {
    stage: name.clone(),
    index: 0,
    source_stage: name,
  }
}
