//! Artifact copier.
//!
//! Grafts a [`Subtree`] (taken from a stage's final snapshot or captured from
//! the build context) into a destination snapshot. Everything happens on the
//! tree model; the source is never modified and entries of the destination
//! outside the copied subtree are only ever added to (missing parents).

use std::path::Path;

use crate::snapshot::{Entry, EntryKind, FsError, Snapshot, Subtree, capture_subtree, join_path, normalize_path};
use crate::store::BlobStore;

use super::types::{CopyError, ExecuteError};

/// Take `src` out of a completed stage's snapshot.
pub fn stage_source(stage: &str, snapshot: &Snapshot, src: &str) -> Result<Subtree, CopyError> {
  Subtree::extract(snapshot, src).ok_or_else(|| CopyError::PathNotFound {
    source_name: format!("stage '{stage}'"),
    path: src.to_string(),
  })
}

/// Capture `src` from the build context. Entries are owned by 0:0.
pub fn context_source(context: &Path, src: &str, blobs: &BlobStore) -> Result<Subtree, ExecuteError> {
  let path = context.join(normalize_path(src));
  if path.symlink_metadata().is_err() {
    return Err(
      CopyError::PathNotFound {
        source_name: "build context".to_string(),
        path: src.to_string(),
      }
      .into(),
    );
  }
  Ok(capture_subtree(&path, blobs)?)
}

/// Place `source` (originally at `src`) into a copy of `dest` at `dest_path`.
///
/// A directory source contributes its contents. A file source lands at
/// `dest_path`, or inside it when `dest_path` ends with `/` or names an
/// existing directory. `owner` replaces ownership of the copied entries only.
pub fn copy(
  source: &Subtree,
  src: &str,
  dest: &Snapshot,
  dest_path: &str,
  owner: Option<(u32, u32)>,
) -> Result<Snapshot, CopyError> {
  let remap = |entry: &Entry| match owner {
    Some((uid, gid)) => entry.clone().with_owner(uid, gid),
    None => entry.clone(),
  };

  let dest_norm = normalize_path(dest_path);
  let target = if source.is_dir() {
    dest_norm
  } else if dest_path.ends_with('/') || dest.is_dir(&dest_norm) {
    let name = normalize_path(src);
    let name = name.rsplit('/').next().unwrap_or_default();
    join_path(&dest_norm, name)
  } else {
    dest_norm
  };

  if target.is_empty() && !source.is_dir() {
    return Err(CopyError::NotADirectory("/".to_string()));
  }
  check_ancestors(dest, &target)?;

  let mut out = dest.clone();
  out.ensure_parents(&target);

  if !target.is_empty() {
    let existing_dir = out.get(&target).is_some_and(Entry::is_dir);
    if !(source.is_dir() && existing_dir) {
      out.remove_subtree(&target);
      out.insert(&target, remap(&source.root));
    }
  }

  for (rel, entry) in &source.children {
    let path = join_path(&target, rel);
    let merge = entry.is_dir() && out.get(&path).is_some_and(Entry::is_dir);
    if !merge {
      out.remove_subtree(&path);
    }
    out.insert(&path, remap(entry));
  }

  Ok(out)
}

fn check_ancestors(dest: &Snapshot, target: &str) -> Result<(), CopyError> {
  let mut current = String::new();
  let components: Vec<&str> = target.split('/').filter(|c| !c.is_empty()).collect();
  for component in components.iter().take(components.len().saturating_sub(1)) {
    current = join_path(&current, component);
    if let Some(entry) = dest.get(&current)
      && !entry.is_dir()
    {
      return Err(CopyError::NotADirectory(target.to_string()));
    }
  }
  Ok(())
}

/// Resolve a `user[:group]` owner against the destination's account files.
///
/// Numeric ids are taken as-is. A user without a group gets its primary
/// group from `/etc/passwd` (or its own id when numeric and unknown).
pub fn resolve_owner(spec: &str, dest: &Snapshot, blobs: &BlobStore) -> Result<(u32, u32), ExecuteError> {
  let unknown = || ExecuteError::Copy(CopyError::UnknownOwner(spec.to_string()));
  let (user, group) = match spec.split_once(':') {
    Some((u, g)) => (u, Some(g)),
    None => (spec, None),
  };

  let passwd = read_account_file(dest, "etc/passwd", blobs)?;
  let user_entry = passwd.iter().find(|f| f[0] == user || f[2] == user);

  let uid = match user.parse::<u32>() {
    Ok(uid) => uid,
    Err(_) => user_entry.and_then(|f| f[2].parse().ok()).ok_or_else(unknown)?,
  };

  let gid = match group {
    Some(group) => match group.parse::<u32>() {
      Ok(gid) => gid,
      Err(_) => read_account_file(dest, "etc/group", blobs)?
        .iter()
        .find(|f| f[0] == group)
        .and_then(|f| f[2].parse().ok())
        .ok_or_else(unknown)?,
    },
    None => user_entry
      .and_then(|f| f.get(3))
      .and_then(|id| id.parse().ok())
      .unwrap_or(uid),
  };

  Ok((uid, gid))
}

/// Colon-separated records with at least three fields; absent file is empty.
fn read_account_file(snapshot: &Snapshot, path: &str, blobs: &BlobStore) -> Result<Vec<Vec<String>>, ExecuteError> {
  let Some(entry) = snapshot.get(path) else {
    return Ok(Vec::new());
  };
  let EntryKind::File { digest, .. } = &entry.kind else {
    return Ok(Vec::new());
  };
  let bytes = blobs.read(digest).map_err(FsError::from)?;
  Ok(
    String::from_utf8_lossy(&bytes)
      .lines()
      .filter(|line| !line.trim_start().starts_with('#'))
      .map(|line| line.split(':').map(str::to_string).collect::<Vec<_>>())
      .filter(|fields| fields.len() >= 3)
      .collect(),
  )
}
