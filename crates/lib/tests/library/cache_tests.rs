//! Cache behavior across builds.

use std::fs;

use strata_lib::execute::{BuildError, StageStatus, build};
use strata_lib::graph::{BindMount, Instruction, StageGraph};

use super::common::{Harness, child_stage, ran, toolbox_stage};

fn mounted_install() -> Instruction {
  Instruction::Run {
    command: "cp /src/Gemfile Gemfile.lock".into(),
    mounts: vec![BindMount {
      source: "Gemfile".into(),
      target: "/src/Gemfile".into(),
    }],
    workdir: Some("/app".into()),
  }
}

#[tokio::test]
async fn rebuild_is_all_hits() {
  let Some(h) = Harness::new() else {
    return;
  };
  let mut graph = StageGraph::new();
  toolbox_stage(
    &mut graph,
    "base",
    vec![Instruction::run("echo 1 > one"), Instruction::run("echo 2 > two")],
  );
  child_stage(&mut graph, "app", "base", vec![Instruction::run("cat one two > both")]);

  let first = h.build(&graph, &[]).await;
  assert_eq!((first.cache_hits(), first.cache_misses()), (0, 3));

  let second = h.build(&graph, &[]).await;
  assert_eq!((second.cache_hits(), second.cache_misses()), (3, 0));
  assert_eq!(ran(&second, "app"), 0);
  assert_eq!(
    first.output("app").unwrap().as_ref().unwrap(),
    second.output("app").unwrap().as_ref().unwrap()
  );
}

#[tokio::test]
async fn keys_are_stable_across_processes() {
  let Some(h) = Harness::new() else {
    return;
  };
  let mut graph = StageGraph::new();
  toolbox_stage(&mut graph, "app", vec![Instruction::run("echo hi > hi")]);

  let first = h.build(&graph, &[]).await;
  let reopened = h.reopen();
  let second = build(&graph, &h.request(&[]), &reopened).await.unwrap();

  assert_eq!(ran(&first, "app"), 1);
  assert_eq!(second.status("app"), Some(&StageStatus::Built { hits: 1, misses: 0 }));
  assert_eq!(
    first.output("app").unwrap().as_ref().unwrap().snapshot,
    second.output("app").unwrap().as_ref().unwrap().snapshot
  );
}

#[tokio::test]
async fn mount_whitespace_change_is_a_miss() {
  let Some(h) = Harness::new() else {
    return;
  };
  let mut graph = StageGraph::new();
  toolbox_stage(&mut graph, "deps", vec![mounted_install()]);

  h.write_context("Gemfile", "gem 'rails'");
  let first = h.build(&graph, &[]).await;
  assert!(first.is_success());

  h.write_context("Gemfile", "gem 'rails'\n");
  let second = h.build(&graph, &[]).await;

  assert_eq!(ran(&second, "deps"), 1);
  let tree = h.tree(second.output("deps").unwrap().as_ref().unwrap());
  assert_eq!(h.read(&tree, "app/Gemfile.lock"), "gem 'rails'\n");
  assert!(!tree.contains("src/Gemfile"), "mount must not persist");
}

#[tokio::test]
async fn unrelated_context_change_keeps_mount_key() {
  let Some(h) = Harness::new() else {
    return;
  };
  let mut graph = StageGraph::new();
  toolbox_stage(&mut graph, "deps", vec![mounted_install()]);

  h.write_context("Gemfile", "gem 'rails'\n");
  h.build(&graph, &[]).await;
  h.write_context("README.md", "changed");
  let second = h.build(&graph, &[]).await;

  assert_eq!(ran(&second, "deps"), 0);
  assert_eq!(second.cache_hits(), 1);
}

#[tokio::test]
async fn identical_concurrent_work_runs_once() {
  let Some(h) = Harness::new() else {
    return;
  };
  let mut graph = StageGraph::new();
  toolbox_stage(&mut graph, "left", vec![Instruction::run("echo same > same")]);
  toolbox_stage(&mut graph, "right", vec![Instruction::run("echo same > same")]);

  let report = h.build(&graph, &["left", "right"]).await;

  assert!(report.is_success());
  assert_eq!(ran(&report, "left") + ran(&report, "right"), 1);
  assert_eq!((report.cache_hits(), report.cache_misses()), (1, 1));
  assert_eq!(
    report.output("left").unwrap().as_ref().unwrap(),
    report.output("right").unwrap().as_ref().unwrap()
  );
}

#[tokio::test]
async fn parent_change_invalidates_descendants() {
  let Some(h) = Harness::new() else {
    return;
  };
  let mut graph = StageGraph::new();
  toolbox_stage(&mut graph, "base", vec![Instruction::run("echo v1 > version")]);
  child_stage(&mut graph, "app", "base", vec![Instruction::run("true")]);
  h.build(&graph, &[]).await;

  let mut changed = StageGraph::new();
  toolbox_stage(&mut changed, "base", vec![Instruction::run("echo v2 > version")]);
  child_stage(&mut changed, "app", "base", vec![Instruction::run("true")]);
  let report = h.build(&changed, &[]).await;

  assert_eq!(ran(&report, "app"), 1);
}

#[tokio::test]
async fn missing_snapshot_aborts_the_build() {
  let Some(h) = Harness::new() else {
    return;
  };
  let mut graph = StageGraph::new();
  toolbox_stage(&mut graph, "a", vec![Instruction::run("echo a > a")]);
  toolbox_stage(&mut graph, "b", vec![Instruction::run("echo b > b")]);
  h.build(&graph, &["a", "b"]).await;

  for entry in fs::read_dir(h.ctx.store.root().join("snapshots")).unwrap() {
    fs::remove_file(entry.unwrap().path()).unwrap();
  }

  let err = build(&graph, &h.request(&["a", "b"]), &h.ctx).await.unwrap_err();
  assert!(matches!(err, BuildError::Store(_)));
}
