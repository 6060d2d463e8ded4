use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::consts::DEFAULT_DIR_MODE;
use crate::util::hash::{ContentHash, HashError, Hashable};

/// Identity of a snapshot: SHA-256 of its canonical JSON tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(pub String);

impl SnapshotId {
  /// Abbreviated form for log output.
  pub fn short(&self) -> &str {
    &self.0[..self.0.len().min(12)]
  }

  /// 64 lowercase hex characters, the only form the store ever writes.
  pub fn is_well_formed(&self) -> bool {
    self.0.len() == 64 && self.0.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
  }
}

impl fmt::Display for SnapshotId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl From<ContentHash> for SnapshotId {
  fn from(hash: ContentHash) -> Self {
    SnapshotId(hash.0)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EntryKind {
  File { digest: ContentHash, size: u64 },
  Dir,
  Symlink { target: String },
}

/// One node of a snapshot tree. Timestamps are not recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
  #[serde(flatten)]
  pub kind: EntryKind,
  pub mode: u32,
  pub uid: u32,
  pub gid: u32,
}

impl Entry {
  pub fn dir(mode: u32, uid: u32, gid: u32) -> Self {
    Entry {
      kind: EntryKind::Dir,
      mode,
      uid,
      gid,
    }
  }

  pub fn file(digest: ContentHash, size: u64, mode: u32) -> Self {
    Entry {
      kind: EntryKind::File { digest, size },
      mode,
      uid: 0,
      gid: 0,
    }
  }

  pub fn symlink(target: impl Into<String>) -> Self {
    Entry {
      kind: EntryKind::Symlink { target: target.into() },
      mode: 0o777,
      uid: 0,
      gid: 0,
    }
  }

  pub fn is_dir(&self) -> bool {
    matches!(self.kind, EntryKind::Dir)
  }

  pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
    self.uid = uid;
    self.gid = gid;
    self
  }

  /// Short type label: `file`, `dir` or `symlink`.
  pub fn type_name(&self) -> &'static str {
    match self.kind {
      EntryKind::File { .. } => "file",
      EntryKind::Dir => "dir",
      EntryKind::Symlink { .. } => "symlink",
    }
  }
}

/// An immutable filesystem tree.
///
/// Keys are normalized relative paths (`usr/bin/ruby`); the root directory is
/// implicit. File contents live in the store's blob area, so a snapshot is
/// pure metadata and cheap to clone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
  entries: BTreeMap<String, Entry>,
}

impl Hashable for Snapshot {}

impl Snapshot {
  pub fn empty() -> Self {
    Self::default()
  }

  pub fn id(&self) -> Result<SnapshotId, HashError> {
    self.compute_hash().map(SnapshotId::from)
  }

  pub fn get(&self, path: &str) -> Option<&Entry> {
    self.entries.get(&normalize_path(path))
  }

  pub fn contains(&self, path: &str) -> bool {
    let path = normalize_path(path);
    path.is_empty() || self.entries.contains_key(&path)
  }

  /// Whether `path` names a directory. The root always does.
  pub fn is_dir(&self, path: &str) -> bool {
    let path = normalize_path(path);
    path.is_empty() || self.entries.get(&path).is_some_and(Entry::is_dir)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub fn entries(&self) -> impl Iterator<Item = (&str, &Entry)> {
    self.entries.iter().map(|(p, e)| (p.as_str(), e))
  }

  /// Insert or replace a single entry. Parents are not created.
  pub fn insert(&mut self, path: &str, entry: Entry) {
    let path = normalize_path(path);
    if !path.is_empty() {
      self.entries.insert(path, entry);
    }
  }

  /// Entries strictly below `path`, keyed relative to it.
  pub fn children(&self, path: &str) -> Vec<(String, &Entry)> {
    let path = normalize_path(path);
    if path.is_empty() {
      return self.entries.iter().map(|(p, e)| (p.clone(), e)).collect();
    }
    let prefix = format!("{path}/");
    self
      .entries
      .range(prefix.clone()..)
      .take_while(|(p, _)| p.starts_with(&prefix))
      .map(|(p, e)| (p[prefix.len()..].to_string(), e))
      .collect()
  }

  /// Remove `path` and everything below it.
  pub fn remove_subtree(&mut self, path: &str) -> Vec<(String, Entry)> {
    let path = normalize_path(path);
    let mut removed = Vec::new();
    if let Some(entry) = self.entries.remove(&path) {
      removed.push((path.clone(), entry));
    }
    let prefix = if path.is_empty() { String::new() } else { format!("{path}/") };
    let doomed: Vec<String> = self
      .entries
      .range(prefix.clone()..)
      .take_while(|(p, _)| p.starts_with(&prefix))
      .map(|(p, _)| p.clone())
      .collect();
    for key in doomed {
      if let Some(entry) = self.entries.remove(&key) {
        removed.push((key, entry));
      }
    }
    removed
  }

  /// Create every missing ancestor directory of `path` (0o755, 0:0).
  ///
  /// Returns the directories that were created, outermost first.
  pub fn ensure_parents(&mut self, path: &str) -> Vec<String> {
    let path = normalize_path(path);
    let mut created = Vec::new();
    let mut current = String::new();
    let components: Vec<&str> = path.split('/').collect();
    for component in components.iter().take(components.len().saturating_sub(1)) {
      if !current.is_empty() {
        current.push('/');
      }
      current.push_str(component);
      if !self.entries.contains_key(&current) {
        self.entries.insert(current.clone(), Entry::dir(DEFAULT_DIR_MODE, 0, 0));
        created.push(current.clone());
      }
    }
    created
  }
}

/// A detached subtree: the entry at some path plus everything below it.
///
/// Produced from a stage snapshot or from the build context and grafted into
/// another snapshot by the artifact copier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subtree {
  pub root: Entry,
  /// Descendants keyed relative to the subtree root.
  pub children: BTreeMap<String, Entry>,
}

impl Hashable for Subtree {}

impl Subtree {
  /// Extract the subtree at `path`, or `None` if nothing lives there.
  pub fn extract(snapshot: &Snapshot, path: &str) -> Option<Self> {
    let path = normalize_path(path);
    let root = if path.is_empty() {
      Entry::dir(DEFAULT_DIR_MODE, 0, 0)
    } else {
      snapshot.entries.get(&path)?.clone()
    };
    let children = if root.is_dir() {
      snapshot
        .children(&path)
        .into_iter()
        .map(|(p, e)| (p, e.clone()))
        .collect()
    } else {
      BTreeMap::new()
    };
    Some(Subtree { root, children })
  }

  pub fn is_dir(&self) -> bool {
    self.root.is_dir()
  }
}

/// Lexically normalize a snapshot path.
///
/// Leading `/`, empty components and `.` are dropped; `..` never climbs above
/// the root. The root itself normalizes to the empty string.
pub fn normalize_path(path: &str) -> String {
  let mut parts: Vec<&str> = Vec::new();
  for component in path.split('/') {
    match component {
      "" | "." => {}
      ".." => {
        parts.pop();
      }
      other => parts.push(other),
    }
  }
  parts.join("/")
}

/// Join a normalized base and a relative child path.
pub fn join_path(base: &str, child: &str) -> String {
  match (base.is_empty(), child.is_empty()) {
    (true, _) => child.to_string(),
    (false, true) => base.to_string(),
    (false, false) => format!("{base}/{child}"),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::util::hash::hash_bytes;

  fn sample() -> Snapshot {
    let mut snap = Snapshot::empty();
    snap.insert("usr", Entry::dir(0o755, 0, 0));
    snap.insert("usr/bin", Entry::dir(0o755, 0, 0));
    snap.insert("usr/bin/ruby", Entry::file(hash_bytes(b"ruby"), 4, 0o755));
    snap.insert("usr/lib", Entry::dir(0o755, 0, 0));
    snap.insert("usrx", Entry::file(hash_bytes(b"x"), 1, 0o644));
    snap
  }

  #[test]
  fn normalize_handles_dots_and_slashes() {
    assert_eq!(normalize_path("/usr//local/./bin/"), "usr/local/bin");
    assert_eq!(normalize_path("../../etc/passwd"), "etc/passwd");
    assert_eq!(normalize_path("/"), "");
    assert_eq!(normalize_path("a/b/../c"), "a/c");
  }

  #[test]
  fn id_is_stable_and_content_sensitive() {
    let a = sample();
    let b = sample();
    assert_eq!(a.id().unwrap(), b.id().unwrap());

    let mut c = sample();
    c.insert("usr/bin/ruby", Entry::file(hash_bytes(b"ruby"), 4, 0o700));
    assert_ne!(a.id().unwrap(), c.id().unwrap());
  }

  #[test]
  fn ownership_changes_identity() {
    let a = sample();
    let mut b = sample();
    b.insert("usr/lib", Entry::dir(0o755, 991, 991));
    assert_ne!(a.id().unwrap(), b.id().unwrap());
  }

  #[test]
  fn children_do_not_leak_sibling_prefixes() {
    let snap = sample();
    let names: Vec<String> = snap.children("usr").into_iter().map(|(p, _)| p).collect();
    assert_eq!(names, vec!["bin", "bin/ruby", "lib"]);
  }

  #[test]
  fn remove_subtree_is_exact() {
    let mut snap = sample();
    let removed = snap.remove_subtree("/usr/bin");
    assert_eq!(removed.len(), 2);
    assert!(snap.contains("usr/lib"));
    assert!(snap.contains("usrx"));
    assert!(!snap.contains("usr/bin/ruby"));
  }

  #[test]
  fn ensure_parents_creates_missing_dirs_only() {
    let mut snap = sample();
    let created = snap.ensure_parents("usr/share/doc/ruby/README");
    assert_eq!(created, vec!["usr/share", "usr/share/doc", "usr/share/doc/ruby"]);
    assert_eq!(snap.get("usr/share").unwrap(), &Entry::dir(0o755, 0, 0));
  }

  #[test]
  fn extract_subtree_relative_keys() {
    let snap = sample();
    let sub = Subtree::extract(&snap, "/usr/bin").unwrap();
    assert!(sub.is_dir());
    assert_eq!(sub.children.keys().collect::<Vec<_>>(), vec!["ruby"]);

    let file = Subtree::extract(&snap, "usr/bin/ruby").unwrap();
    assert!(!file.is_dir());
    assert!(file.children.is_empty());

    assert!(Subtree::extract(&snap, "opt").is_none());
  }

  #[test]
  fn root_is_a_directory() {
    let snap = Snapshot::empty();
    assert!(snap.is_dir("/"));
    assert!(snap.contains(""));
  }
}
