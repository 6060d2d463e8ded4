//! Cache key derivation.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::consts::CACHE_KEY_VERSION;
use crate::graph::Instruction;
use crate::platform::PlatformDescriptor;
use crate::snapshot::SnapshotId;
use crate::util::hash::{ContentHash, HashError, Hashable};

/// Fingerprint of one instruction execution. Equal keys are interchangeable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(pub String);

impl CacheKey {
  pub fn short(&self) -> &str {
    &self.0[..self.0.len().min(12)]
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl From<ContentHash> for CacheKey {
  fn from(hash: ContentHash) -> Self {
    CacheKey(hash.0)
  }
}

/// Digest of an input the instruction reads from outside its parent snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum InputDigest {
  /// Raw-byte SHA-256 of a bind mount source (file or directory tree).
  Mount { target: String, digest: ContentHash },
  /// Digest of a captured build-context subtree.
  Context { path: String, digest: ContentHash },
  /// Final snapshot of a copy-source stage.
  Stage { name: String, snapshot: SnapshotId },
}

/// Everything that determines an instruction's output.
///
/// Serialized field order and `BTreeMap` ordering make the JSON canonical.
#[derive(Debug, Serialize)]
pub struct KeyInputs<'a> {
  version: u32,
  parent: &'a SnapshotId,
  instruction: &'a Instruction,
  inputs: &'a [InputDigest],
  platform: &'a PlatformDescriptor,
  #[serde(skip_serializing_if = "Option::is_none")]
  env: Option<&'a BTreeMap<String, String>>,
}

impl Hashable for KeyInputs<'_> {}

impl<'a> KeyInputs<'a> {
  /// `env` is the parameter and stage environment a command would see. It
  /// only joins the key for `run`; other instructions are already expanded.
  pub fn new(
    parent: &'a SnapshotId,
    instruction: &'a Instruction,
    inputs: &'a [InputDigest],
    platform: &'a PlatformDescriptor,
    env: &'a BTreeMap<String, String>,
  ) -> Self {
    let env = matches!(instruction, Instruction::Run { .. }).then_some(env);
    Self {
      version: CACHE_KEY_VERSION,
      parent,
      instruction,
      inputs,
      platform,
      env,
    }
  }

  pub fn key(&self) -> Result<CacheKey, HashError> {
    self.compute_hash().map(CacheKey::from)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::platform::{Arch, Os, Platform};
  use crate::util::hash::hash_bytes;

  fn platform() -> PlatformDescriptor {
    PlatformDescriptor::native(Platform::new(Arch::X86_64, Os::Linux))
  }

  fn parent() -> SnapshotId {
    SnapshotId("a".repeat(64))
  }

  #[test]
  fn key_is_deterministic() {
    let ins = Instruction::run("bundle install");
    let params = BTreeMap::from([("RUBY_VERSION".to_string(), "3.3".to_string())]);
    let (p, plat) = (parent(), platform());

    let a = KeyInputs::new(&p, &ins, &[], &plat, &params).key().unwrap();
    let b = KeyInputs::new(&p, &ins, &[], &plat, &params.clone()).key().unwrap();
    assert_eq!(a, b);
    assert_eq!(a.0.len(), 64);
  }

  #[test]
  fn env_only_affects_run() {
    let (p, plat) = (parent(), platform());
    let one = BTreeMap::from([("X".to_string(), "1".to_string())]);
    let two = BTreeMap::from([("X".to_string(), "2".to_string())]);

    let run = Instruction::run("make");
    assert_ne!(
      KeyInputs::new(&p, &run, &[], &plat, &one).key().unwrap(),
      KeyInputs::new(&p, &run, &[], &plat, &two).key().unwrap()
    );

    let env = Instruction::set_env("A", "b");
    assert_eq!(
      KeyInputs::new(&p, &env, &[], &plat, &one).key().unwrap(),
      KeyInputs::new(&p, &env, &[], &plat, &two).key().unwrap()
    );
  }

  #[test]
  fn platform_and_inputs_join_the_key() {
    let p = parent();
    let ins = Instruction::run("make");
    let none = BTreeMap::new();
    let amd = platform();
    let arm = PlatformDescriptor::new(
      Platform::new(Arch::X86_64, Os::Linux),
      Platform::new(Arch::Aarch64, Os::Linux),
    );

    let base = KeyInputs::new(&p, &ins, &[], &amd, &none).key().unwrap();
    assert_ne!(base, KeyInputs::new(&p, &ins, &[], &arm, &none).key().unwrap());

    let mount = [InputDigest::Mount {
      target: "/src/Gemfile".into(),
      digest: hash_bytes(b"gem 'rails'\n"),
    }];
    assert_ne!(base, KeyInputs::new(&p, &ins, &mount, &amd, &none).key().unwrap());
  }
}
