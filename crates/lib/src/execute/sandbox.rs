//! Confining `run` commands to their snapshot.
//!
//! A command sees the materialized rootfs as `/`. When strata runs as root
//! the child simply `chroot`s before exec. Otherwise, on Linux, the child
//! first enters a fresh user and mount namespace where it is root (mapped
//! back to the invoking user) and then `chroot`s.
//!
//! Everything the child does between fork and exec is prepared up front:
//! paths and id map contents are formatted before spawning so the pre-exec
//! hook only makes syscalls.

use std::fmt;
use std::io;
use std::path::Path;
use std::process::Command;

use serde::Serialize;

/// How commands get confined on this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxMode {
  /// Running as root: plain `chroot`.
  Chroot,
  /// Unprivileged: a user and mount namespace, then `chroot`.
  UserNamespace,
  /// Commands cannot be confined here.
  Unsupported,
}

impl SandboxMode {
  #[cfg(unix)]
  pub fn detect() -> Self {
    if rustix::process::geteuid().is_root() {
      SandboxMode::Chroot
    } else if cfg!(target_os = "linux") {
      SandboxMode::UserNamespace
    } else {
      SandboxMode::Unsupported
    }
  }

  #[cfg(not(unix))]
  pub fn detect() -> Self {
    SandboxMode::Unsupported
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      SandboxMode::Chroot => "chroot",
      SandboxMode::UserNamespace => "user-namespace",
      SandboxMode::Unsupported => "unsupported",
    }
  }
}

impl fmt::Display for SandboxMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Make `command` run with `/` at `rootfs` and its working directory at
/// `workdir`, an absolute path inside the rootfs.
#[cfg(unix)]
pub fn confine(command: &mut Command, mode: SandboxMode, rootfs: &Path, workdir: &str) -> io::Result<()> {
  use std::os::unix::process::CommandExt;

  let jail = Jail::new(mode, rootfs, workdir)?;
  // SAFETY: the hook only issues raw syscalls on data owned by `jail`; it
  // neither allocates nor touches locks shared with the parent.
  unsafe {
    command.pre_exec(move || jail.enter().map_err(io::Error::from));
  }
  Ok(())
}

#[cfg(not(unix))]
pub fn confine(_command: &mut Command, _mode: SandboxMode, _rootfs: &Path, _workdir: &str) -> io::Result<()> {
  Err(io::Error::new(
    io::ErrorKind::Unsupported,
    "commands can only be confined on unix hosts",
  ))
}

#[cfg(unix)]
struct Jail {
  root: std::ffi::CString,
  workdir: std::ffi::CString,
  #[cfg(target_os = "linux")]
  ids: Option<IdMaps>,
}

#[cfg(target_os = "linux")]
struct IdMaps {
  uid: Vec<u8>,
  gid: Vec<u8>,
}

#[cfg(unix)]
impl Jail {
  fn new(mode: SandboxMode, rootfs: &Path, workdir: &str) -> io::Result<Self> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let cstring = |bytes: Vec<u8>| CString::new(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e));
    let root = cstring(rootfs.as_os_str().as_bytes().to_vec())?;
    let workdir = cstring(workdir.as_bytes().to_vec())?;

    match mode {
      SandboxMode::Chroot => Ok(Self {
        root,
        workdir,
        #[cfg(target_os = "linux")]
        ids: None,
      }),
      #[cfg(target_os = "linux")]
      SandboxMode::UserNamespace => {
        use rustix::process::{getgid, getuid};
        Ok(Self {
          root,
          workdir,
          ids: Some(IdMaps {
            uid: format!("0 {} 1", getuid().as_raw()).into_bytes(),
            gid: format!("0 {} 1", getgid().as_raw()).into_bytes(),
          }),
        })
      }
      _ => Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("cannot confine commands ({mode})"),
      )),
    }
  }

  /// Runs in the child between fork and exec.
  fn enter(&self) -> rustix::io::Result<()> {
    #[cfg(target_os = "linux")]
    if let Some(ids) = &self.ids {
      use rustix::thread::{UnshareFlags, unshare_unsafe};
      // SAFETY: no FILES flag, so descriptor tables stay shared.
      unsafe { unshare_unsafe(UnshareFlags::NEWUSER | UnshareFlags::NEWNS)? };
      // Kernels before 3.19 have no setgroups file.
      match write_proc(c"/proc/self/setgroups", b"deny") {
        Err(rustix::io::Errno::NOENT) => {}
        other => other?,
      }
      write_proc(c"/proc/self/uid_map", &ids.uid)?;
      write_proc(c"/proc/self/gid_map", &ids.gid)?;
    }
    rustix::process::chroot(self.root.as_c_str())?;
    rustix::process::chdir(self.workdir.as_c_str())
  }
}

#[cfg(target_os = "linux")]
fn write_proc(path: &std::ffi::CStr, data: &[u8]) -> rustix::io::Result<()> {
  use rustix::fs::{Mode, OFlags, open};
  let fd = open(path, OFlags::WRONLY | OFlags::CLOEXEC, Mode::empty())?;
  rustix::io::write(&fd, data)?;
  Ok(())
}

/// Run `<shell> -c :` confined to `rootfs` to see whether confinement works
/// on this host.
pub fn check(rootfs: &Path, shell: &str) -> io::Result<()> {
  let mode = SandboxMode::detect();
  let mut command = Command::new(shell);
  command
    .args(["-c", ":"])
    .env_clear()
    .stdin(std::process::Stdio::null())
    .stdout(std::process::Stdio::null())
    .stderr(std::process::Stdio::piped());
  confine(&mut command, mode, rootfs, "/")?;
  let output = command.output()?;
  if output.status.success() {
    Ok(())
  } else {
    Err(io::Error::other(format!(
      "{shell} exited with {} inside {}: {}",
      output.status,
      rootfs.display(),
      String::from_utf8_lossy(&output.stderr).trim()
    )))
  }
}
