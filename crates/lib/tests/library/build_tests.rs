//! Scheduling behavior of whole builds.

use strata_lib::execute::{BuildError, OutputError, StageError, StageStatus, build};
use strata_lib::graph::{GraphError, Instruction, StageGraph};
use strata_lib::snapshot::export;

use super::common::{Harness, child_stage, ran, toolbox_stage};

/// base -> compile -> {test, package}
fn pipeline() -> StageGraph {
  let mut graph = StageGraph::new();
  toolbox_stage(&mut graph, "base", vec![Instruction::run("mkdir -p /etc")]);
  child_stage(
    &mut graph,
    "compile",
    "base",
    vec![Instruction::run("mkdir -p /out && echo binary > /out/app")],
  );
  child_stage(&mut graph, "test", "compile", vec![Instruction::run("true")]);
  let package = toolbox_stage(&mut graph, "package", vec![]);
  graph
    .add_instruction(package, Instruction::copy_from("compile", "/out/app", "/usr/bin/app"))
    .unwrap();
  graph
}

#[tokio::test]
async fn requesting_package_never_runs_test() {
  let Some(h) = Harness::new() else {
    return;
  };
  let graph = pipeline();

  let report = h.build(&graph, &["package"]).await;

  assert!(report.is_success());
  assert!(report.status("test").is_none());
  assert_eq!(
    report.waves,
    vec![vec!["base".to_string()], vec!["compile".to_string()], vec!["package".to_string()]]
  );

  let package = report.output("package").unwrap().as_ref().unwrap();
  assert_eq!(h.read(&h.tree(package), "usr/bin/app"), "binary\n");
}

#[tokio::test]
async fn shared_base_runs_once() {
  let Some(h) = Harness::new() else {
    return;
  };
  let mut graph = StageGraph::new();
  toolbox_stage(&mut graph, "base", vec![Instruction::run("touch /base")]);
  child_stage(&mut graph, "a", "base", vec![Instruction::run("echo a > a")]);
  child_stage(&mut graph, "b", "base", vec![Instruction::run("echo b > b")]);

  let report = h.build(&graph, &["a", "b"]).await;

  assert!(report.is_success());
  assert_eq!(ran(&report, "base"), 1);
  assert_eq!(report.built().collect::<Vec<_>>(), vec!["base", "a", "b"]);
}

#[tokio::test]
async fn failing_stage_does_not_stop_independent_stage() {
  let Some(h) = Harness::new() else {
    return;
  };
  let mut graph = StageGraph::new();
  toolbox_stage(&mut graph, "x", vec![Instruction::run("exit 1")]);
  child_stage(&mut graph, "x-child", "x", vec![Instruction::run("true")]);
  toolbox_stage(&mut graph, "y", vec![Instruction::run("echo ok > ok")]);

  let report = h.build(&graph, &["x-child", "y"]).await;

  assert!(!report.is_success());
  assert!(report.output("y").unwrap().is_ok());
  assert_eq!(ran(&report, "y"), 1);
  assert_eq!(ran(&report, "x-child"), 0);
  assert!(matches!(report.status("x"), Some(StageStatus::Failed { .. })));

  let err = report.output("x-child").unwrap().as_ref().unwrap_err();
  assert!(matches!(err, OutputError::Skipped { dependency, .. } if dependency == "x"));
  match err.root().as_ref() {
    StageError::Instruction(e) => {
      assert_eq!(e.stage, "x");
      assert_eq!(e.index, 0);
    }
    other => panic!("unexpected root {:?}", other),
  }
}

#[tokio::test]
async fn skip_propagates_through_chains() {
  let Some(h) = Harness::new() else {
    return;
  };
  let mut graph = StageGraph::new();
  toolbox_stage(&mut graph, "a", vec![Instruction::run("exit 1")]);
  child_stage(&mut graph, "b", "a", vec![]);
  child_stage(&mut graph, "c", "b", vec![]);

  let report = h.build(&graph, &["c"]).await;

  assert_eq!(
    report.status("c"),
    Some(&StageStatus::Skipped {
      dependency: "b".into()
    })
  );
  let err = report.output("c").unwrap().as_ref().unwrap_err();
  assert!(matches!(err.root().as_ref(), StageError::Instruction(e) if e.stage == "a"));
}

#[tokio::test]
async fn cyclic_copy_is_rejected_before_execution() {
  let Some(h) = Harness::new() else {
    return;
  };
  let mut graph = StageGraph::new();
  // B derives from C; C copies from B.
  let c = toolbox_stage(&mut graph, "C", vec![Instruction::run("true")]);
  child_stage(&mut graph, "B", "C", vec![]);
  graph.add_instruction(c, Instruction::copy_from("B", "/x", "/y")).unwrap();

  let err = build(&graph, &h.request(&["B"]), &h.ctx).await.unwrap_err();

  assert!(matches!(err, BuildError::Graph(GraphError::CyclicDependency { .. })));
  assert!(!h.has_keys());
}

#[tokio::test]
async fn unknown_output_is_unreachable() {
  let Some(h) = Harness::new() else {
    return;
  };
  let graph = pipeline();

  let err = build(&graph, &h.request(&["deploy"]), &h.ctx).await.unwrap_err();
  assert!(matches!(
    err,
    BuildError::Graph(GraphError::UnreachableStage { name }) if name == "deploy"
  ));
}

#[tokio::test]
async fn copy_only_output_keeps_destination_files() {
  let Some(h) = Harness::new() else {
    return;
  };
  let mut graph = StageGraph::new();
  toolbox_stage(&mut graph, "assets", vec![Instruction::run("mkdir -p /public && echo css > /public/app.css")]);
  let app = toolbox_stage(
    &mut graph,
    "app",
    vec![Instruction::run("mkdir -p /srv/public && echo keep > /srv/public/robots.txt && echo cfg > /srv/config")],
  );
  graph
    .add_instruction(app, Instruction::copy_from("assets", "/public", "/srv/public"))
    .unwrap();

  let report = h.build(&graph, &["app"]).await;
  let tree = h.tree(report.output("app").unwrap().as_ref().unwrap());

  assert_eq!(h.read(&tree, "srv/public/app.css"), "css\n");
  assert_eq!(h.read(&tree, "srv/public/robots.txt"), "keep\n");
  assert_eq!(h.read(&tree, "srv/config"), "cfg\n");
}

#[tokio::test]
async fn parameters_flow_into_builds() {
  let Some(h) = Harness::new() else {
    return;
  };
  let mut graph = StageGraph::new();
  let s = toolbox_stage(&mut graph, "app", vec![]);
  graph
    .add_instruction(
      s,
      Instruction::Arg {
        name: "GREETING".into(),
        default: Some("hello".into()),
      },
    )
    .unwrap();
  graph
    .add_instruction(s, Instruction::set_env("MESSAGE", "${GREETING} world"))
    .unwrap();
  graph.add_instruction(s, Instruction::run("echo \"$MESSAGE\" > msg")).unwrap();

  let mut request = h.request(&[]);
  request.params.insert("GREETING".into(), "howdy".into());
  let report = build(&graph, &request, &h.ctx).await.unwrap();

  let output = report.output("app").unwrap().as_ref().unwrap();
  assert_eq!(output.config.env["MESSAGE"], "howdy world");
  assert_eq!(h.read(&h.tree(output), "msg"), "howdy world\n");
}

#[tokio::test]
async fn exported_output_has_rootfs_and_config() {
  let Some(h) = Harness::new() else {
    return;
  };
  let mut graph = StageGraph::new();
  toolbox_stage(
    &mut graph,
    "app",
    vec![
      Instruction::run("echo '#!/bin/sh' > /bin/start"),
      Instruction::Entrypoint {
        argv: vec!["/bin/start".into()],
      },
    ],
  );

  let report = h.build(&graph, &[]).await;
  let output = report.output("app").unwrap().as_ref().unwrap();
  let out = h.temp.path().join("export");
  export(&h.tree(output), &output.config, h.ctx.store.blobs(), &out).unwrap();

  assert_eq!(std::fs::read_to_string(out.join("rootfs/bin/start")).unwrap(), "#!/bin/sh\n");
  let config = std::fs::read_to_string(out.join("config.json")).unwrap();
  assert!(config.contains("/bin/start"));
}
