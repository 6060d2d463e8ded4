//! Implementation of the `strata build` command.
//!
//! Loads a build file, runs the requested output stages against the local
//! cache store and optionally exports the results.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::Args;
use serde::Serialize;
use tracing::{info, warn};

use strata_lib::execute::{
  BuildReport, BuildRequest, ExecContext, ExecuteConfig, OutputError, StageOutput, StageReport, StageStatus, build,
};
use strata_lib::image::DirectoryProvider;
use strata_lib::platform::paths::{images_dir, store_dir};
use strata_lib::platform::{Platform, PlatformDescriptor};
use strata_lib::snapshot::export;
use strata_lib::store::CacheStore;

use super::{load_graph, parse_key_val};
use crate::output::{
  OutputFormat, format_duration, print_error, print_info, print_json, print_skipped, print_stat, print_success,
};

#[derive(Args, Debug)]
pub struct BuildArgs {
  /// Build file (default: strata.json)
  pub file: Option<PathBuf>,

  /// Output stage to build; repeatable (default: the last declared stage)
  #[arg(short = 't', long = "target")]
  pub targets: Vec<String>,

  /// Build parameter override
  #[arg(long = "arg", value_name = "KEY=VALUE", value_parser = parse_key_val)]
  pub args: Vec<(String, String)>,

  /// Platform commands run on, as arch-os or os/arch (default: host)
  #[arg(long)]
  pub platform: Option<Platform>,

  /// Platform artifacts are built for (default: --platform)
  #[arg(long)]
  pub target_platform: Option<Platform>,

  /// Build context directory (default: the build file's directory)
  #[arg(long)]
  pub context: Option<PathBuf>,

  /// Directory holding unpacked base images
  #[arg(long)]
  pub images: Option<PathBuf>,

  /// Export each built output here as rootfs/ plus config.json
  #[arg(long)]
  pub export: Option<PathBuf>,

  /// Maximum number of stages to run at once
  #[arg(short, long)]
  pub jobs: Option<usize>,

  /// Output format
  #[arg(short = 'o', long, value_enum, default_value = "text")]
  pub output: OutputFormat,
}

#[derive(Serialize)]
struct BuildSummary<'a> {
  success: bool,
  waves: &'a [Vec<String>],
  stages: &'a [StageReport],
  outputs: Vec<OutputSummary<'a>>,
  cache_hits: usize,
  cache_misses: usize,
}

#[derive(Serialize)]
struct OutputSummary<'a> {
  stage: &'a str,
  #[serde(flatten)]
  output: Option<&'a StageOutput>,
  #[serde(skip_serializing_if = "Option::is_none")]
  error: Option<String>,
}

/// Run a build. Returns whether every requested output was produced.
pub fn cmd_build(args: BuildArgs) -> Result<bool> {
  let start = Instant::now();
  let (path, graph) = load_graph(args.file.as_deref())?;

  let host = PlatformDescriptor::host().context("Unsupported host platform")?;
  let build_platform = args.platform.unwrap_or(host.build);
  let platform = PlatformDescriptor::new(build_platform, args.target_platform.unwrap_or(build_platform));

  let context_dir = match args.context {
    Some(dir) => dir,
    None => path
      .parent()
      .filter(|p| !p.as_os_str().is_empty())
      .map(Path::to_path_buf)
      .unwrap_or_else(|| PathBuf::from(".")),
  };
  let context_dir = dunce::canonicalize(&context_dir)
    .with_context(|| format!("Build context not found: {}", context_dir.display()))?;

  let store = CacheStore::open_locked(store_dir(), "build").context("Failed to open cache store")?;
  let images = DirectoryProvider::new(args.images.unwrap_or_else(images_dir));
  let mut config = ExecuteConfig::default();
  if let Some(jobs) = args.jobs {
    if jobs == 0 {
      bail!("--jobs must be at least 1");
    }
    config.parallelism = jobs;
  }
  let ctx = ExecContext::new(Arc::new(store), Arc::new(images), context_dir).with_config(config);

  let request = BuildRequest {
    outputs: args.targets,
    platform,
    params: args.args.into_iter().collect::<BTreeMap<_, _>>(),
  };

  info!(file = %path.display(), platform = %platform, cross = platform.is_cross(), "building");
  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let report = rt.block_on(async {
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        warn!("interrupted, cancelling build");
        cancel.cancel();
      }
    });
    build(&graph, &request, &ctx).await
  });
  let report = report.context("Build failed")?;

  if let Some(dir) = &args.export {
    export_outputs(&report, &ctx, dir)?;
  }

  if args.output.is_json() {
    print_json(&summary(&report))?;
  } else {
    print_report(&report);
    println!();
    print_stat("Cache hits", &report.cache_hits().to_string());
    print_stat("Cache misses", &report.cache_misses().to_string());
    print_stat("Duration", &format_duration(start.elapsed()));
  }

  Ok(report.is_success())
}

fn export_outputs(report: &BuildReport, ctx: &ExecContext, dir: &Path) -> Result<()> {
  let single = report.outputs.len() == 1;
  for (stage, result) in &report.outputs {
    let Ok(output) = result else {
      continue;
    };
    let target = if single { dir.to_path_buf() } else { dir.join(stage) };
    let snapshot = ctx
      .store
      .load_snapshot(&output.snapshot)
      .with_context(|| format!("Failed to load snapshot for {}", stage))?;
    export(&snapshot, &output.config, ctx.store.blobs(), &target)
      .with_context(|| format!("Failed to export {} to {}", stage, target.display()))?;
    info!(stage = %stage, dir = %target.display(), "exported output");
  }
  Ok(())
}

fn summary(report: &BuildReport) -> BuildSummary<'_> {
  BuildSummary {
    success: report.is_success(),
    waves: &report.waves,
    stages: &report.stages,
    outputs: report
      .outputs
      .iter()
      .map(|(stage, result)| OutputSummary {
        stage: stage.as_str(),
        output: result.as_ref().ok(),
        error: result.as_ref().err().map(describe_error),
      })
      .collect(),
    cache_hits: report.cache_hits(),
    cache_misses: report.cache_misses(),
  }
}

/// One line naming the output and the failure everything traces back to.
fn describe_error(err: &OutputError) -> String {
  match err {
    OutputError::Failed { cause, .. } => cause.to_string(),
    OutputError::Skipped { root, .. } => format!("{}: {}", err, root),
  }
}

fn print_report(report: &BuildReport) {
  for stage in &report.stages {
    match &stage.status {
      StageStatus::Built { hits, misses } => {
        print_success(&format!("{} ({} cached, {} run)", stage.name, hits, misses));
      }
      StageStatus::Failed { error } => print_error(&format!("{}: {}", stage.name, error)),
      StageStatus::Skipped { dependency } => {
        print_skipped(&format!("{}: skipped, '{}' did not complete", stage.name, dependency));
      }
    }
  }

  println!();
  for (stage, result) in &report.outputs {
    match result {
      Ok(output) => print_info(&format!("{} {}", stage, output.snapshot)),
      Err(err) => print_error(&describe_error(err)),
    }
  }
}
