//! `run` instruction implementation.
//!
//! The parent snapshot is materialized into a scratch root filesystem inside
//! the store's `tmp/` area, the command runs confined to that directory as
//! its `/` (see [`sandbox`](super::sandbox)), and the resulting tree is
//! captured back into a new snapshot. Bind mounts are copied in read-only
//! for the duration of the command and never persist.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::process::{Command as StdCommand, Stdio};

use tokio::process::Command;
use tracing::{debug, info};

use crate::consts::{DEFAULT_PATH, SOURCE_DATE_EPOCH};
use crate::graph::BindMount;
use crate::platform::PlatformDescriptor;
use crate::snapshot::{Snapshot, Subtree, capture, materialize, normalize_path};
use crate::util::hash::{ContentHash, hash_directory, hash_file};

use super::ExecContext;
use super::sandbox::{SandboxMode, confine};
use super::types::ExecuteError;

/// A fully expanded `run` instruction and the environment it sees.
#[derive(Debug, Clone)]
pub struct RunSpec<'a> {
  pub command: &'a str,
  pub mounts: &'a [BindMount],
  pub workdir: Option<&'a str>,
  /// Parameters and stage environment, stage environment winning.
  pub env: &'a BTreeMap<String, String>,
  pub platform: &'a PlatformDescriptor,
}

/// Raw-byte digest of a mount source. Every byte counts, including whitespace.
pub fn mount_digest(context: &Path, mount: &BindMount) -> Result<ContentHash, ExecuteError> {
  let source = context.join(normalize_path(&mount.source));
  if source.is_dir() {
    Ok(hash_directory(&source, &[])?)
  } else if source.is_file() {
    Ok(hash_file(&source)?)
  } else {
    Err(ExecuteError::MountNotFound(source))
  }
}

/// Run a command on top of `parent` and capture the resulting snapshot.
pub async fn run_command(ctx: &ExecContext, parent: &Snapshot, spec: RunSpec<'_>) -> Result<Snapshot, ExecuteError> {
  info!(cmd = %spec.command, "executing command");

  let mode = SandboxMode::detect();
  if mode == SandboxMode::Unsupported {
    return Err(ExecuteError::Unconfined(mode));
  }

  let scratch = tempfile::Builder::new()
    .prefix("run-")
    .tempdir_in(ctx.store.root().join("tmp"))?;
  let rootfs = scratch.path().join("rootfs");
  fs::create_dir_all(&rootfs)?;

  {
    let parent = parent.clone();
    let blobs = ctx.store.blobs().clone();
    let rootfs = rootfs.clone();
    let context = ctx.context_dir.clone();
    let mounts = spec.mounts.to_vec();
    tokio::task::spawn_blocking(move || -> Result<(), ExecuteError> {
      materialize(&parent, &blobs, &rootfs)?;
      for mount in &mounts {
        place_mount(&context, &rootfs, mount)?;
      }
      Ok(())
    })
    .await??;
  }

  let working_dir = match spec.workdir.map(normalize_path) {
    Some(dir) if !dir.is_empty() => {
      fs::create_dir_all(rootfs.join(&dir))?;
      format!("/{dir}")
    }
    _ => "/".to_string(),
  };

  let (shell_cmd, shell_args) = get_shell(ctx.config.shell.as_deref());

  let mut command = StdCommand::new(&shell_cmd);
  command
    .args(&shell_args)
    .arg(spec.command)
    .env_clear()
    .env("PATH", DEFAULT_PATH)
    .env("HOME", "/root")
    .env("SOURCE_DATE_EPOCH", SOURCE_DATE_EPOCH)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

  for (key, value) in spec.platform.env_vars() {
    command.env(key, value);
  }
  for (key, value) in spec.env {
    command.env(key, value);
  }

  let spawn_err = |source| ExecuteError::Spawn {
    shell: shell_cmd.clone(),
    source,
  };
  confine(&mut command, mode, &rootfs, &working_dir).map_err(spawn_err)?;
  let mut command = Command::from(command);
  command.kill_on_drop(true);

  debug!(shell = %shell_cmd, sandbox = %mode, working_dir = %working_dir, "spawning process");

  let child = command.spawn().map_err(spawn_err)?;

  let output = tokio::select! {
    output = child.wait_with_output() => output?,
    _ = ctx.cancel.cancelled() => {
      info!(cmd = %spec.command, "command cancelled");
      return Err(ExecuteError::Cancelled);
    }
  };

  let stderr = String::from_utf8_lossy(&output.stderr);
  let stdout = String::from_utf8_lossy(&output.stdout);
  if !stdout.trim().is_empty() {
    debug!(stdout = %stdout.trim_end(), "command stdout");
  }
  if !stderr.trim().is_empty() {
    debug!(stderr = %stderr.trim_end(), "command stderr");
  }

  if !output.status.success() {
    return Err(ExecuteError::CmdFailed {
      cmd: spec.command.to_string(),
      code: output.status.code(),
    });
  }

  let parent = parent.clone();
  let blobs = ctx.store.blobs().clone();
  let mounts = spec.mounts.to_vec();
  let snapshot = tokio::task::spawn_blocking(move || -> Result<Snapshot, ExecuteError> {
    let mut captured = capture(&rootfs, &blobs, Some(&parent))?;
    for mount in &mounts {
      restore_mount_target(&mut captured, &parent, &mount.target);
    }
    Ok(captured)
  })
  .await??;

  drop(scratch);
  Ok(snapshot)
}

/// Copy a mount source to its target inside `rootfs` with read-only files.
fn place_mount(context: &Path, rootfs: &Path, mount: &BindMount) -> Result<(), ExecuteError> {
  let source = context.join(normalize_path(&mount.source));
  let target = rootfs.join(normalize_path(&mount.target));
  if !source.exists() {
    return Err(ExecuteError::MountNotFound(source));
  }

  if let Ok(meta) = target.symlink_metadata() {
    if meta.is_dir() {
      fs::remove_dir_all(&target)?;
    } else {
      fs::remove_file(&target)?;
    }
  }
  if let Some(parent) = target.parent() {
    fs::create_dir_all(parent)?;
  }

  if source.is_dir() {
    for item in walkdir::WalkDir::new(&source).follow_links(false) {
      let item = item.map_err(std::io::Error::other)?;
      let rel = item.path().strip_prefix(&source).map_err(std::io::Error::other)?;
      let dest = target.join(rel);
      let ft = item.file_type();
      if ft.is_dir() {
        fs::create_dir_all(&dest)?;
      } else if ft.is_file() {
        fs::copy(item.path(), &dest)?;
        make_read_only(&dest)?;
      } else if ft.is_symlink() {
        copy_symlink(item.path(), &dest)?;
      }
    }
  } else {
    fs::copy(&source, &target)?;
    make_read_only(&target)?;
  }
  Ok(())
}

fn make_read_only(path: &Path) -> Result<(), std::io::Error> {
  let mut perms = fs::metadata(path)?.permissions();
  perms.set_readonly(true);
  fs::set_permissions(path, perms)
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> Result<(), std::io::Error> {
  std::os::unix::fs::symlink(fs::read_link(from)?, to)
}

#[cfg(not(unix))]
fn copy_symlink(_from: &Path, _to: &Path) -> Result<(), std::io::Error> {
  Ok(())
}

/// Put the tree at a mount target back to what the parent had there.
///
/// Directories created only to hold the mount are dropped again unless the
/// command put something else inside them.
fn restore_mount_target(captured: &mut Snapshot, parent: &Snapshot, target: &str) {
  let target = normalize_path(target);
  if target.is_empty() {
    return;
  }

  captured.remove_subtree(&target);
  if let Some(original) = Subtree::extract(parent, &target) {
    captured.insert(&target, original.root);
    for (rel, entry) in original.children {
      captured.insert(&format!("{target}/{rel}"), entry);
    }
    return;
  }

  let mut ancestor = target.as_str();
  while let Some((up, _)) = ancestor.rsplit_once('/') {
    if parent.contains(up) || !captured.children(up).is_empty() {
      break;
    }
    captured.remove_subtree(up);
    ancestor = up;
  }
}

/// Get the shell command and argument for running `run` instructions.
///
/// Defaults to `/bin/sh -c` rather than `$SHELL`, which may source profiles.
fn get_shell(override_shell: Option<&str>) -> (String, Vec<String>) {
  if let Some(shell) = override_shell {
    let args = if shell.contains("powershell") || shell.contains("pwsh") {
      vec!["-NoProfile".to_string(), "-Command".to_string()]
    } else if shell.contains("cmd") {
      vec!["/C".to_string()]
    } else {
      vec!["-c".to_string()]
    };
    return (shell.to_string(), args);
  }

  ("/bin/sh".to_string(), vec!["-c".to_string()])
}
