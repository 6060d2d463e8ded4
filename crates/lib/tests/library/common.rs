//! Shared helpers for library scenario tests.
//!
//! Commands run confined to their stage's rootfs, so stages that run any
//! start from a toolbox image holding the host's shell and a few coreutils.
//! Whether a command ran is read off the per-stage hit and miss counts.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use strata_lib::execute::sandbox;
use strata_lib::execute::{BuildReport, BuildRequest, ExecContext, ExecuteConfig, StageOutput, StageStatus, build};
use strata_lib::graph::{Instruction, ParentRef, StageGraph, StageHandle};
use strata_lib::image::DirectoryProvider;
use strata_lib::platform::{Arch, Os, Platform, PlatformDescriptor};
use strata_lib::snapshot::{EntryKind, Snapshot};
use strata_lib::store::CacheStore;
use tempfile::TempDir;

pub const TOOLBOX: &str = "toolbox";

const TOOLS: &[&str] = &["sh", "cat", "cp", "mkdir", "touch"];

/// Isolated store, image directory and build context per test.
pub struct Harness {
  pub temp: TempDir,
  pub ctx: ExecContext,
}

impl Harness {
  /// `None` when commands cannot be confined on this host.
  pub fn new() -> Option<Self> {
    let temp = TempDir::new().unwrap();
    fs::create_dir_all(temp.path().join("context")).unwrap();
    if !install_toolbox(&temp.path().join("images").join(TOOLBOX).join("rootfs")) {
      return None;
    }
    let ctx = Self::context_for(temp.path());
    Some(Self { temp, ctx })
  }

  /// A fresh context over the same store, as a second process would have.
  pub fn reopen(&self) -> ExecContext {
    Self::context_for(self.temp.path())
  }

  fn context_for(root: &Path) -> ExecContext {
    let store = CacheStore::open(root.join("store")).unwrap();
    let images = DirectoryProvider::new(root.join("images"));
    ExecContext::new(Arc::new(store), Arc::new(images), root.join("context")).with_config(ExecuteConfig {
      parallelism: 4,
      shell: None,
    })
  }

  pub fn write_context(&self, rel: &str, content: &str) {
    let path = self.ctx.context_dir.join(rel);
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
  }

  pub fn request(&self, outputs: &[&str]) -> BuildRequest {
    BuildRequest {
      outputs: outputs.iter().map(|s| s.to_string()).collect(),
      platform: PlatformDescriptor::native(Platform::new(Arch::X86_64, Os::Linux)),
      params: BTreeMap::new(),
    }
  }

  pub async fn build(&self, graph: &StageGraph, outputs: &[&str]) -> BuildReport {
    build(graph, &self.request(outputs), &self.ctx).await.unwrap()
  }

  pub fn tree(&self, output: &StageOutput) -> Snapshot {
    self.ctx.store.load_snapshot(&output.snapshot).unwrap()
  }

  pub fn read(&self, snapshot: &Snapshot, path: &str) -> String {
    match &snapshot.get(path).unwrap().kind {
      EntryKind::File { digest, .. } => String::from_utf8(self.ctx.store.blobs().read(digest).unwrap()).unwrap(),
      other => panic!("{} is not a file: {:?}", path, other),
    }
  }

  /// Whether anything was ever recorded in the store's key index.
  pub fn has_keys(&self) -> bool {
    fs::read_dir(self.ctx.store.root().join("keys")).is_ok_and(|mut entries| entries.next().is_some())
  }
}

/// How many of `stage`'s instructions actually ran in `report`.
pub fn ran(report: &BuildReport, stage: &str) -> usize {
  match report.status(stage) {
    Some(StageStatus::Built { misses, .. }) => *misses,
    _ => 0,
  }
}

/// A stage on top of the toolbox image.
pub fn toolbox_stage(graph: &mut StageGraph, name: &str, instructions: Vec<Instruction>) -> StageHandle {
  let handle = graph
    .declare_stage(name, ParentRef::Image(TOOLBOX.into()), vec![])
    .unwrap();
  add_all(graph, handle, instructions);
  handle
}

pub fn child_stage(graph: &mut StageGraph, name: &str, parent: &str, instructions: Vec<Instruction>) -> StageHandle {
  let handle = graph
    .declare_stage(name, ParentRef::Stage(parent.into()), vec![])
    .unwrap();
  add_all(graph, handle, instructions);
  handle
}

fn add_all(graph: &mut StageGraph, handle: StageHandle, instructions: Vec<Instruction>) {
  for ins in instructions {
    graph.add_instruction(handle, ins).unwrap();
  }
}

/// Copy host binaries plus the libraries `ldd` lists for them into `rootfs`
/// and check that a confined shell starts there.
fn install_toolbox(rootfs: &Path) -> bool {
  let bin = rootfs.join("bin");
  fs::create_dir_all(&bin).unwrap();
  for tool in TOOLS {
    let Some(host) = ["/bin", "/usr/bin"]
      .iter()
      .map(|dir| Path::new(dir).join(tool))
      .find(|path| path.is_file())
    else {
      eprintln!("skipping: host has no {tool}");
      return false;
    };
    fs::copy(&host, bin.join(tool)).unwrap();
    for lib in shared_libraries(&host) {
      let dest = rootfs.join(lib.strip_prefix("/").unwrap());
      if !dest.exists() {
        fs::create_dir_all(dest.parent().unwrap()).unwrap();
        fs::copy(&lib, &dest).unwrap();
      }
    }
  }

  match sandbox::check(rootfs, "/bin/sh") {
    Ok(()) => true,
    Err(e) => {
      eprintln!("skipping: commands cannot be confined here: {e}");
      false
    }
  }
}

fn shared_libraries(binary: &Path) -> Vec<PathBuf> {
  let Ok(output) = std::process::Command::new("ldd").arg(binary).output() else {
    return Vec::new();
  };
  String::from_utf8_lossy(&output.stdout)
    .lines()
    .filter_map(|line| line.split_whitespace().find(|word| word.starts_with('/')))
    .map(PathBuf::from)
    .filter(|path| path.is_file())
    .collect()
}
