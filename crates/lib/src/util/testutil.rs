//! Test utilities for strata-lib.
//!
//! [`TestEnv`] gives each test its own store, image directory and build
//! context under a temporary directory, plus an [`ExecContext`] wired to
//! them. Commands run confined to their rootfs, so tests that run any need
//! [`TestEnv::with_toolbox`], which installs a minimal image holding the
//! host's shell and a few coreutils.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use crate::execute::sandbox;
use crate::execute::{ExecContext, ExecuteConfig};
use crate::image::DirectoryProvider;
use crate::platform::{Arch, Os, Platform, PlatformDescriptor};
use crate::snapshot::{EntryKind, Snapshot, capture};
use crate::store::CacheStore;

/// Image reference of the toolbox installed by [`TestEnv::with_toolbox`].
pub const TOOLBOX: &str = "toolbox";

const TOOLS: &[&str] = &["sh", "cat", "cp", "ls", "mkdir", "rm", "sleep", "touch"];

pub struct TestEnv {
  temp: TempDir,
  pub ctx: ExecContext,
}

impl TestEnv {
  pub fn new() -> Self {
    let temp = TempDir::new().unwrap();
    let context = temp.path().join("context");
    let images = temp.path().join("images");
    fs::create_dir_all(&context).unwrap();
    fs::create_dir_all(&images).unwrap();
    let store = CacheStore::open(temp.path().join("store")).unwrap();

    let ctx = ExecContext::new(Arc::new(store), Arc::new(DirectoryProvider::new(images)), context).with_config(
      ExecuteConfig {
        parallelism: 4,
        shell: None,
      },
    );

    Self { temp, ctx }
  }

  /// A [`TestEnv`] whose images include [`TOOLBOX`], or `None` when commands
  /// cannot be confined on this host.
  pub fn with_toolbox() -> Option<Self> {
    let env = Self::new();
    install_toolbox(&env.toolbox_rootfs()).then_some(env)
  }

  fn toolbox_rootfs(&self) -> PathBuf {
    self.temp.path().join("images").join(TOOLBOX).join("rootfs")
  }

  /// The toolbox image as a snapshot with its blobs in the store.
  pub fn toolbox(&self) -> Snapshot {
    capture(&self.toolbox_rootfs(), self.ctx.store.blobs(), None).unwrap()
  }

  pub fn context_path(&self, rel: &str) -> PathBuf {
    self.ctx.context_dir.join(rel)
  }

  /// Write a file into the build context, creating parent directories.
  pub fn write_context(&self, rel: &str, content: &str) {
    let path = self.context_path(rel);
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
  }

  /// Fixed linux/amd64 so keys do not depend on the host.
  pub fn platform(&self) -> PlatformDescriptor {
    PlatformDescriptor::native(Platform::new(Arch::X86_64, Os::Linux))
  }

  /// Contents of a file entry in `snapshot`.
  pub fn read(&self, snapshot: &Snapshot, path: &str) -> String {
    match &snapshot.get(path).unwrap().kind {
      EntryKind::File { digest, .. } => String::from_utf8(self.ctx.store.blobs().read(digest).unwrap()).unwrap(),
      other => panic!("{} is not a file: {:?}", path, other),
    }
  }
}

/// Copy host binaries and the shared libraries `ldd` reports for them into
/// `rootfs`, then check a confined shell starts there.
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
