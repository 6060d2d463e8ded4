//! Stage executor.
//!
//! Runs the instructions of one stage in order against its parent snapshot.
//! Every filesystem instruction is keyed first; a cached key is adopted
//! without side effects, a missing one is executed and stored. Metadata
//! instructions only fold into the [`ImageConfig`](crate::snapshot::ImageConfig) and leave the snapshot as
//! it was, so the config is replayed on every run and never cached.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::graph::{CopySource, Instruction, Layered, Stage, StageBindings};
use crate::platform::PlatformDescriptor;
use crate::snapshot::{FsError, Snapshot, Subtree};
use crate::store::{InputDigest, KeyInputs};
use crate::util::hash::Hashable;

use super::ExecContext;
use super::cmd::{RunSpec, mount_digest, run_command};
use super::copy::{context_source, copy, resolve_owner, stage_source};
use super::types::{CopyError, ExecuteError, InstructionError, StageError, StageOutput};

/// Everything a stage needs, resolved by the scheduler.
#[derive(Debug)]
pub struct StageInput<'a> {
  pub stage: &'a Stage,
  /// Base image or parent stage output.
  pub parent: StageOutput,
  pub platform: &'a PlatformDescriptor,
  pub bindings: &'a StageBindings,
  /// Completed outputs of copy-source stages, by name.
  pub sources: &'a HashMap<String, StageOutput>,
}

#[derive(Debug, Clone)]
pub struct StageOutcome {
  pub output: StageOutput,
  pub hits: usize,
  pub misses: usize,
}

/// Inputs gathered while keying an instruction, reused if it must run.
#[derive(Default)]
struct Prepared {
  digests: Vec<InputDigest>,
  context: Option<Subtree>,
}

pub async fn execute_stage(ctx: &ExecContext, input: StageInput<'_>) -> Result<StageOutcome, StageError> {
  let stage = input.stage;
  info!(stage = %stage.name, instructions = stage.instructions.len(), "executing stage");

  let mut snapshot_id = input.parent.snapshot;
  let mut config = input.parent.config;
  let mut tree: Option<Snapshot> = None;
  let (mut hits, mut misses) = (0, 0);

  for (index, instruction) in stage.instructions.iter().enumerate() {
    if ctx.cancel.is_cancelled() {
      return Err(StageError::Cancelled);
    }
    let fail = |cause: ExecuteError| instruction_failure(stage, index, instruction, cause);

    let params = input.bindings.visible_at(index);
    let expanded = instruction
      .expand(&Layered {
        first: &params,
        second: &config.env,
      })
      .map_err(|e| fail(e.into()))?;

    if expanded.is_metadata() {
      config.apply(&expanded);
      debug!(stage = %stage.name, index, op = expanded.op(), "applied metadata instruction");
      continue;
    }

    let mut run_env = params;
    run_env.extend(config.env.iter().map(|(k, v)| (k.clone(), v.clone())));

    let prepared = prepare_inputs(ctx, &expanded, input.sources).map_err(&fail)?;
    let key = KeyInputs::new(&snapshot_id, &expanded, &prepared.digests, input.platform, &run_env)
      .key()
      .map_err(|e| fail(e.into()))?;

    let _guard = ctx.store.lock_key(&key).await;
    if let Some(cached) = ctx.store.lookup(&key)? {
      debug!(stage = %stage.name, index, op = expanded.op(), key = %key.short(), snapshot = %cached.short(), "cache hit");
      snapshot_id = cached;
      tree = None;
      hits += 1;
      continue;
    }

    debug!(stage = %stage.name, index, op = expanded.op(), key = %key.short(), "cache miss");
    let current = match tree.take() {
      Some(tree) => tree,
      None => ctx.store.load_snapshot(&snapshot_id)?,
    };

    let produced = match &expanded {
      Instruction::Run { command, mounts, workdir } => {
        let spec = RunSpec {
          command,
          mounts,
          workdir: workdir.as_deref(),
          env: &run_env,
          platform: input.platform,
        };
        run_command(ctx, &current, spec).await
      }
      Instruction::Copy { from, src, dest, owner } => {
        apply_copy(ctx, &current, from, src, dest, owner.as_deref(), prepared, input.sources)
      }
      _ => Ok(current),
    }
    .map_err(&fail)?;

    let description = format!("{}[{}] {}", stage.name, index, expanded);
    snapshot_id = ctx.store.store_described(&key, &produced, &description)?;
    tree = Some(produced);
    misses += 1;
  }

  info!(stage = %stage.name, snapshot = %snapshot_id.short(), hits, misses, "stage complete");
  Ok(StageOutcome {
    output: StageOutput {
      snapshot: snapshot_id,
      config,
    },
    hits,
    misses,
  })
}

fn prepare_inputs(
  ctx: &ExecContext,
  instruction: &Instruction,
  sources: &HashMap<String, StageOutput>,
) -> Result<Prepared, ExecuteError> {
  let mut prepared = Prepared::default();
  match instruction {
    Instruction::Run { mounts, .. } => {
      for mount in mounts {
        prepared.digests.push(InputDigest::Mount {
          target: mount.target.clone(),
          digest: mount_digest(&ctx.context_dir, mount)?,
        });
      }
    }
    Instruction::Copy {
      from: CopySource::Context,
      src,
      ..
    } => {
      let subtree = context_source(&ctx.context_dir, src, ctx.store.blobs())?;
      let digest = subtree.compute_hash()?;
      prepared.digests.push(InputDigest::Context {
        path: src.clone(),
        digest,
      });
      prepared.context = Some(subtree);
    }
    Instruction::Copy {
      from: CopySource::Stage(name),
      ..
    } => {
      let source = sources
        .get(name)
        .ok_or_else(|| CopyError::SourceStageNotExecuted(name.clone()))?;
      prepared.digests.push(InputDigest::Stage {
        name: name.clone(),
        snapshot: source.snapshot.clone(),
      });
    }
    _ => {}
  }
  Ok(prepared)
}

#[allow(clippy::too_many_arguments)]
fn apply_copy(
  ctx: &ExecContext,
  current: &Snapshot,
  from: &CopySource,
  src: &str,
  dest: &str,
  owner: Option<&str>,
  prepared: Prepared,
  sources: &HashMap<String, StageOutput>,
) -> Result<Snapshot, ExecuteError> {
  let subtree = match (from, prepared.context) {
    (CopySource::Context, Some(subtree)) => subtree,
    (CopySource::Context, None) => context_source(&ctx.context_dir, src, ctx.store.blobs())?,
    (CopySource::Stage(name), _) => {
      let output = sources
        .get(name)
        .ok_or_else(|| CopyError::SourceStageNotExecuted(name.clone()))?;
      let snapshot = ctx.store.load_snapshot(&output.snapshot).map_err(FsError::from)?;
      stage_source(name, &snapshot, src)?
    }
  };

  let owner = owner
    .map(|spec| resolve_owner(spec, current, ctx.store.blobs()))
    .transpose()?;

  Ok(copy(&subtree, src, current, dest, owner)?)
}

fn instruction_failure(stage: &Stage, index: usize, instruction: &Instruction, cause: ExecuteError) -> StageError {
  match cause {
    ExecuteError::Cancelled => StageError::Cancelled,
    ExecuteError::Fs(FsError::Store(e)) => StageError::Store(e),
    cause => StageError::Instruction(InstructionError {
      stage: stage.name.clone(),
      index,
      op: instruction.op(),
      cause,
    }),
  }
}
