//! Build execution.
//!
//! [`build`] plans the stages needed for the requested outputs and starts
//! each one as soon as every stage it depends on has finished, bounded by
//! [`ExecuteConfig::parallelism`]. A failed stage skips everything that
//! depends on it while independent stages carry on; a cache store failure or
//! cancellation aborts the whole build.
//!
//! # Submodules
//!
//! - [`plan`] - minimal stage selection and wave computation
//! - [`stage`] - instruction-by-instruction stage execution
//! - [`cmd`] - `run` instructions in a scratch rootfs
//! - [`sandbox`] - confining commands to that rootfs
//! - [`copy`] - the artifact copier
//! - [`cancel`] - build cancellation token

pub mod cancel;
pub mod cmd;
pub mod copy;
pub mod plan;
pub mod sandbox;
pub mod stage;
pub mod types;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{Id, JoinSet};
use tracing::{debug, error, info, warn};

use crate::graph::{StageBindings, StageGraph, StageHandle, StageParent};
use crate::image::BaseImageProvider;
use crate::platform::PlatformDescriptor;
use crate::store::CacheStore;

pub use cancel::CancelToken;
pub use plan::ExecutionPlan;
pub use sandbox::SandboxMode;
pub use stage::{StageInput, StageOutcome, execute_stage};
pub use types::{
  BuildError, BuildReport, CopyError, ExecuteConfig, ExecuteError, InstructionError, OutputError, StageError,
  StageOutput, StageReport, StageStatus,
};

/// Shared state for every stage and instruction of a build.
#[derive(Clone)]
pub struct ExecContext {
  pub store: Arc<CacheStore>,
  pub images: Arc<dyn BaseImageProvider>,
  /// Build context directory: source of context copies and bind mounts.
  pub context_dir: PathBuf,
  pub config: ExecuteConfig,
  pub cancel: CancelToken,
}

impl ExecContext {
  pub fn new(store: Arc<CacheStore>, images: Arc<dyn BaseImageProvider>, context_dir: impl Into<PathBuf>) -> Self {
    Self {
      store,
      images,
      context_dir: context_dir.into(),
      config: ExecuteConfig::default(),
      cancel: CancelToken::new(),
    }
  }

  pub fn with_config(mut self, config: ExecuteConfig) -> Self {
    self.config = config;
    self
  }
}

impl std::fmt::Debug for ExecContext {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ExecContext")
      .field("store", &self.store.root())
      .field("context_dir", &self.context_dir)
      .field("config", &self.config)
      .finish_non_exhaustive()
  }
}

/// What to build.
#[derive(Debug, Clone)]
pub struct BuildRequest {
  /// Output stage names. Empty means the last declared stage.
  pub outputs: Vec<String>,
  pub platform: PlatformDescriptor,
  /// Parameter overrides. Names no stage declares are ignored.
  pub params: BTreeMap<String, String>,
}

impl BuildRequest {
  pub fn new(platform: PlatformDescriptor) -> Self {
    Self {
      outputs: Vec::new(),
      platform,
      params: BTreeMap::new(),
    }
  }
}

enum ParentInput {
  Output(StageOutput),
  Image(String),
  /// Unreachable: stages only start once their parent has been built.
  Missing(String),
}

/// Per-stage result while the build is running.
#[derive(Debug, Clone)]
enum Outcome {
  Built(StageOutcome),
  Failed(Arc<StageError>),
  Skipped { dependency: String, root: Arc<StageError> },
}

impl Outcome {
  fn root(&self) -> Option<&Arc<StageError>> {
    match self {
      Outcome::Built(_) => None,
      Outcome::Failed(root) | Outcome::Skipped { root, .. } => Some(root),
    }
  }
}

/// Build the requested outputs of `graph`.
///
/// Graph errors are raised before anything executes. Stage failures do not
/// fail the call; they show up per output in the returned [`BuildReport`].
pub async fn build(graph: &StageGraph, request: &BuildRequest, ctx: &ExecContext) -> Result<BuildReport, BuildError> {
  let plan = ExecutionPlan::new(graph, &request.outputs)?;
  info!(
    stages = plan.len(),
    waves = plan.waves().len(),
    platform = %request.platform,
    "starting build"
  );

  let declared = graph.declared_params();
  for name in request.params.keys() {
    if !declared.contains(name.as_str()) {
      debug!(param = %name, "ignoring override for undeclared parameter");
    }
  }

  let semaphore = Arc::new(Semaphore::new(ctx.config.parallelism.max(1)));
  let mut outcomes: BTreeMap<StageHandle, Outcome> = BTreeMap::new();
  let mut pending = Pending::new(&plan);
  let mut join_set = JoinSet::new();
  let mut tasks: HashMap<Id, StageHandle> = HashMap::new();

  loop {
    while let Some(handle) = pending.next_ready() {
      if ctx.cancel.is_cancelled() {
        return Err(abort(&mut join_set, BuildError::Cancelled).await);
      }
      match failed_dependency(&plan, &outcomes, handle) {
        Some((dep, root)) => {
          let dependency = graph.name(dep).to_string();
          warn!(stage = %graph.name(handle), dependency = %dependency, "skipping stage due to failed dependency");
          outcomes.insert(handle, Outcome::Skipped { dependency, root });
          pending.finish(&plan, handle);
        }
        None => {
          debug!(stage = %graph.name(handle), "dependencies complete, starting stage");
          let id = spawn_stage(&mut join_set, graph, handle, &outcomes, request, ctx, semaphore.clone());
          tasks.insert(id, handle);
        }
      }
    }

    let Some(joined) = join_set.join_next_with_id().await else {
      break;
    };
    let (id, result) = match joined {
      Ok((id, result)) => (id, result),
      Err(e) => {
        let id = e.id();
        error!(error = %e, "stage task panicked");
        let stage = tasks.get(&id).map(|&h| graph.name(h).to_string()).unwrap_or_default();
        (id, Err(StageError::Panicked { stage }))
      }
    };
    let Some(handle) = tasks.remove(&id) else {
      continue;
    };
    let name = graph.name(handle);

    match result {
      Ok(outcome) => {
        outcomes.insert(handle, Outcome::Built(outcome));
      }
      Err(StageError::Store(e)) => {
        error!(stage = %name, error = %e, "cache store failure, aborting build");
        ctx.cancel.cancel();
        return Err(abort(&mut join_set, BuildError::Store(e)).await);
      }
      Err(StageError::Cancelled) => {
        return Err(abort(&mut join_set, BuildError::Cancelled).await);
      }
      Err(e) => {
        error!(stage = %name, error = %e, "stage failed");
        outcomes.insert(handle, Outcome::Failed(Arc::new(e)));
      }
    }
    pending.finish(&plan, handle);
  }

  let report = report(graph, &plan, outcomes);
  info!(
    built = report.built().count(),
    hits = report.cache_hits(),
    misses = report.cache_misses(),
    success = report.is_success(),
    "build complete"
  );
  Ok(report)
}

/// Stages not yet started, with how many of their dependencies are unfinished.
struct Pending {
  waiting: BTreeMap<StageHandle, usize>,
  ready: BTreeSet<StageHandle>,
}

impl Pending {
  fn new(plan: &ExecutionPlan) -> Self {
    let mut waiting = BTreeMap::new();
    let mut ready = BTreeSet::new();
    for handle in plan.stages() {
      match plan.dependencies(handle).len() {
        0 => {
          ready.insert(handle);
        }
        n => {
          waiting.insert(handle, n);
        }
      }
    }
    Self { waiting, ready }
  }

  /// Earliest declared stage whose dependencies have all finished.
  fn next_ready(&mut self) -> Option<StageHandle> {
    self.ready.pop_first()
  }

  /// Record that `handle` finished, in any state, releasing its dependents.
  fn finish(&mut self, plan: &ExecutionPlan, handle: StageHandle) {
    for dependent in plan.dependents(handle) {
      if let Some(count) = self.waiting.get_mut(&dependent) {
        *count -= 1;
        if *count == 0 {
          self.waiting.remove(&dependent);
          self.ready.insert(dependent);
        }
      }
    }
  }
}

/// First dependency of `handle` that did not complete, with its root failure.
fn failed_dependency(
  plan: &ExecutionPlan,
  outcomes: &BTreeMap<StageHandle, Outcome>,
  handle: StageHandle,
) -> Option<(StageHandle, Arc<StageError>)> {
  plan
    .dependencies(handle)
    .into_iter()
    .find_map(|dep| outcomes.get(&dep)?.root().map(|root| (dep, root.clone())))
}

/// Stop every running stage and hand back `err`.
async fn abort(join_set: &mut JoinSet<Result<StageOutcome, StageError>>, err: BuildError) -> BuildError {
  join_set.abort_all();
  while join_set.join_next().await.is_some() {}
  err
}

/// Start a stage whose dependencies have all been built.
fn spawn_stage(
  join_set: &mut JoinSet<Result<StageOutcome, StageError>>,
  graph: &StageGraph,
  handle: StageHandle,
  outcomes: &BTreeMap<StageHandle, Outcome>,
  request: &BuildRequest,
  ctx: &ExecContext,
  semaphore: Arc<Semaphore>,
) -> Id {
  let stage = graph.stage(handle).clone();
  let bindings = StageBindings::resolve(graph, handle, &request.params);
  let parent = match &stage.parent {
    StageParent::Stage(parent) => match built_output(outcomes, *parent) {
      Some(output) => ParentInput::Output(output),
      None => ParentInput::Missing(graph.name(*parent).to_string()),
    },
    StageParent::Image(reference) => ParentInput::Image(reference.clone()),
  };
  let sources: HashMap<String, StageOutput> = stage
    .copy_sources()
    .filter_map(|(_, name)| {
      let source = graph.resolve(name).ok()?;
      Some((name.to_string(), built_output(outcomes, source)?))
    })
    .collect();
  let platform = request.platform;
  let ctx = ctx.clone();

  join_set
    .spawn(async move {
      let _permit = semaphore.acquire_owned().await.map_err(|_| StageError::Cancelled)?;

      let parent = match parent {
        ParentInput::Output(output) => output,
        ParentInput::Image(reference) => base_image(&ctx, &stage.name, &reference, &platform).await?,
        ParentInput::Missing(parent) => {
          return Err(StageError::ParentNotBuilt {
            stage: stage.name.clone(),
            parent,
          });
        }
      };

      let input = StageInput {
        stage: &stage,
        parent,
        platform: &platform,
        bindings: &bindings,
        sources: &sources,
      };
      execute_stage(&ctx, input).await
    })
    .id()
}

fn built_output(outcomes: &BTreeMap<StageHandle, Outcome>, handle: StageHandle) -> Option<StageOutput> {
  match outcomes.get(&handle) {
    Some(Outcome::Built(outcome)) => Some(outcome.output.clone()),
    _ => None,
  }
}

/// Resolve an image parent and store its root snapshot.
async fn base_image(
  ctx: &ExecContext,
  stage: &str,
  reference: &str,
  platform: &PlatformDescriptor,
) -> Result<StageOutput, StageError> {
  let images = ctx.images.clone();
  let store = ctx.store.clone();
  let reference = reference.to_string();
  let target = platform.target;
  let stage_name = stage.to_string();

  tokio::task::spawn_blocking(move || {
    let image = images
      .resolve(&reference, &target, store.blobs())
      .map_err(|source| StageError::BaseImage {
        stage: stage_name,
        source,
      })?;
    let snapshot = store.put_snapshot(&image.snapshot)?;
    debug!(image = %reference, snapshot = %snapshot.short(), "resolved base image");
    Ok(StageOutput {
      snapshot,
      config: image.config,
    })
  })
  .await
  .map_err(|_| StageError::Panicked {
    stage: stage.to_string(),
  })?
}

fn report(graph: &StageGraph, plan: &ExecutionPlan, mut outcomes: BTreeMap<StageHandle, Outcome>) -> BuildReport {
  let waves = plan
    .waves()
    .iter()
    .map(|wave| wave.iter().map(|&h| graph.name(h).to_string()).collect())
    .collect();

  let stages = plan
    .stages()
    .filter_map(|handle| {
      let status = match outcomes.get(&handle)? {
        Outcome::Built(o) => StageStatus::Built {
          hits: o.hits,
          misses: o.misses,
        },
        Outcome::Failed(e) => StageStatus::Failed { error: e.to_string() },
        Outcome::Skipped { dependency, .. } => StageStatus::Skipped {
          dependency: dependency.clone(),
        },
      };
      Some(StageReport {
        name: graph.name(handle).to_string(),
        status,
      })
    })
    .collect();

  let outputs = plan
    .requested()
    .iter()
    .filter_map(|&handle| {
      let stage = graph.name(handle).to_string();
      let result = match outcomes.remove(&handle)? {
        Outcome::Built(o) => Ok(o.output),
        Outcome::Failed(cause) => Err(OutputError::Failed {
          stage: stage.clone(),
          cause,
        }),
        Outcome::Skipped { dependency, root } => Err(OutputError::Skipped {
          stage: stage.clone(),
          dependency,
          root,
        }),
      };
      Some((stage, result))
    })
    .collect();

  BuildReport { outputs, stages, waves }
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use crate::graph::{Instruction, ParentRef};
  use crate::image::{BaseImage, ImageError};
  use crate::platform::Platform;
  use crate::snapshot::{Entry, Snapshot};
  use crate::store::BlobStore;
  use crate::util::testutil::{TOOLBOX, TestEnv};
  use std::sync::{Condvar, Mutex};
  use std::time::Duration;

  fn request(env: &TestEnv, outputs: &[&str]) -> BuildRequest {
    BuildRequest {
      outputs: outputs.iter().map(|s| s.to_string()).collect(),
      platform: env.platform(),
      params: BTreeMap::new(),
    }
  }

  fn from_image(graph: &mut StageGraph, name: &str, image: &str) -> StageHandle {
    graph
      .declare_stage(name, ParentRef::Image(image.into()), vec![])
      .unwrap()
  }

  fn is_empty(dir: std::path::PathBuf) -> bool {
    std::fs::read_dir(dir).map_or(true, |mut entries| entries.next().is_none())
  }

  /// Every image is a single `marker` file. Resolving `slow` blocks until
  /// `late` has been resolved, and gives up after a few seconds.
  #[derive(Default)]
  struct GatedImages {
    late_resolved: Mutex<bool>,
    signal: Condvar,
  }

  impl BaseImageProvider for GatedImages {
    fn resolve(&self, reference: &str, _target: &Platform, blobs: &BlobStore) -> Result<BaseImage, ImageError> {
      match reference {
        "late" => {
          *self.late_resolved.lock().unwrap() = true;
          self.signal.notify_all();
        }
        "slow" => {
          let resolved = self.late_resolved.lock().unwrap();
          let (resolved, _) = self
            .signal
            .wait_timeout_while(resolved, Duration::from_secs(5), |done| !*done)
            .unwrap();
          if !*resolved {
            return Err(ImageError::NotFound {
              reference: reference.to_string(),
              searched: "gate".into(),
            });
          }
        }
        _ => {}
      }
      let digest = blobs.insert_bytes(reference.as_bytes()).unwrap();
      let mut snapshot = Snapshot::empty();
      snapshot.insert("marker", Entry::file(digest, reference.len() as u64, 0o644));
      Ok(BaseImage {
        snapshot,
        config: Default::default(),
      })
    }
  }

  #[tokio::test]
  async fn empty_graph_builds_nothing() {
    let env = TestEnv::new();
    let report = build(&StageGraph::new(), &request(&env, &[]), &env.ctx).await.unwrap();
    assert!(report.is_success());
    assert!(report.outputs.is_empty());
  }

  #[tokio::test]
  async fn single_stage_builds_and_reports_output() {
    let Some(env) = TestEnv::with_toolbox() else {
      return;
    };
    let mut graph = StageGraph::new();
    let s = from_image(&mut graph, "app", TOOLBOX);
    graph.add_instruction(s, Instruction::run("echo hi > /hello")).unwrap();
    graph.add_instruction(s, Instruction::set_env("MODE", "prod")).unwrap();

    let report = build(&graph, &request(&env, &[]), &env.ctx).await.unwrap();
    let output = report.output("app").unwrap().as_ref().unwrap();
    let snapshot = env.ctx.store.load_snapshot(&output.snapshot).unwrap();

    assert_eq!(env.read(&snapshot, "hello"), "hi\n");
    assert_eq!(output.config.env["MODE"], "prod");
    assert_eq!(report.status("app"), Some(&StageStatus::Built { hits: 0, misses: 1 }));
  }

  #[tokio::test]
  async fn unknown_base_image_fails_the_stage() {
    let env = TestEnv::new();
    let mut graph = StageGraph::new();
    from_image(&mut graph, "app", "debian:bookworm");

    let report = build(&graph, &request(&env, &[]), &env.ctx).await.unwrap();
    let err = report.output("app").unwrap().as_ref().unwrap_err();
    assert!(matches!(err.root().as_ref(), StageError::BaseImage { .. }));
  }

  #[tokio::test]
  async fn failure_skips_dependents_with_root_cause() {
    let Some(env) = TestEnv::with_toolbox() else {
      return;
    };
    let mut graph = StageGraph::new();
    let base = from_image(&mut graph, "base", TOOLBOX);
    graph.add_instruction(base, Instruction::run("exit 7")).unwrap();
    graph
      .declare_stage("child", ParentRef::Stage("base".into()), vec![])
      .unwrap();

    let report = build(&graph, &request(&env, &["child"]), &env.ctx).await.unwrap();
    assert!(!report.is_success());
    assert_eq!(
      report.status("child"),
      Some(&StageStatus::Skipped {
        dependency: "base".into()
      })
    );
    match report.output("child").unwrap() {
      Err(OutputError::Skipped { root, .. }) => {
        assert!(matches!(
          root.as_ref(),
          StageError::Instruction(InstructionError { index: 0, .. })
        ));
      }
      other => panic!("unexpected {:?}", other),
    }
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
  async fn stages_start_without_waiting_for_their_wave() {
    let mut env = TestEnv::new();
    env.ctx.images = Arc::new(GatedImages::default());
    let mut graph = StageGraph::new();
    from_image(&mut graph, "slow", "slow");
    from_image(&mut graph, "fast", "fast");
    let after = from_image(&mut graph, "after-fast", "late");
    graph
      .add_instruction(after, Instruction::copy_from("fast", "/marker", "/from-fast"))
      .unwrap();

    let report = build(&graph, &request(&env, &["slow", "after-fast"]), &env.ctx)
      .await
      .unwrap();

    assert!(report.is_success(), "{:?}", report.stages);
    assert_eq!(
      report.waves,
      vec![
        vec!["slow".to_string(), "fast".to_string()],
        vec!["after-fast".to_string()]
      ]
    );
    let output = report.output("after-fast").unwrap().as_ref().unwrap();
    let snapshot = env.ctx.store.load_snapshot(&output.snapshot).unwrap();
    assert_eq!(env.read(&snapshot, "from-fast"), "fast");
  }

  #[tokio::test]
  async fn cancelled_build_is_aborted() {
    let env = TestEnv::new();
    let mut graph = StageGraph::new();
    let s = from_image(&mut graph, "app", "scratch");
    graph.add_instruction(s, Instruction::run("true")).unwrap();

    env.ctx.cancel.cancel();
    let err = build(&graph, &request(&env, &[]), &env.ctx).await.unwrap_err();
    assert!(matches!(err, BuildError::Cancelled));
  }

  #[tokio::test]
  async fn cancel_during_command_leaves_no_record() {
    let Some(env) = TestEnv::with_toolbox() else {
      return;
    };
    let mut graph = StageGraph::new();
    let s = from_image(&mut graph, "app", TOOLBOX);
    graph.add_instruction(s, Instruction::run("sleep 30")).unwrap();

    let cancel = env.ctx.cancel.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(300)).await;
      cancel.cancel();
    });

    let started = std::time::Instant::now();
    let err = build(&graph, &request(&env, &[]), &env.ctx).await.unwrap_err();
    assert!(matches!(err, BuildError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(10));

    let root = env.ctx.store.root();
    assert!(is_empty(root.join("keys")), "a key was recorded for the cancelled command");
    assert!(is_empty(root.join("tmp")), "scratch rootfs left behind");
  }

  #[tokio::test]
  #[tracing_test::traced_test]
  async fn undeclared_override_is_ignored() {
    let env = TestEnv::new();
    let mut graph = StageGraph::new();
    let s = from_image(&mut graph, "app", "scratch");
    graph.add_instruction(s, Instruction::set_env("MODE", "prod")).unwrap();

    let mut req = request(&env, &[]);
    req.params.insert("NOPE".into(), "1".into());
    let report = build(&graph, &req, &env.ctx).await.unwrap();

    assert!(report.is_success());
    assert!(logs_contain("ignoring override for undeclared parameter"));
  }
}
