//! Host and target platform identification.
//!
//! Every cache key is scoped by a [`PlatformDescriptor`] so artifacts produced
//! for one target never satisfy a lookup made for another.

pub mod arch;
pub mod os;
pub mod paths;

use std::fmt;
use std::str::FromStr;

pub use arch::Arch;
pub use os::Os;
use serde::{Deserialize, Serialize};

/// Platform identifier combining architecture and OS (e.g., "aarch64-darwin")
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Platform {
  pub arch: Arch,
  pub os: Os,
}

impl Platform {
  /// Create a new platform identifier
  pub fn new(arch: Arch, os: Os) -> Self {
    Self { arch, os }
  }

  /// Detect the current platform at runtime
  ///
  /// Returns `None` if the OS or architecture is not supported
  pub fn current() -> Option<Self> {
    Some(Self {
      arch: Arch::current()?,
      os: Os::current()?,
    })
  }

  /// Returns the platform triple string (e.g., "aarch64-darwin")
  pub fn triple(&self) -> String {
    format!("{}-{}", self.arch, self.os)
  }

  /// Returns the container-ecosystem form (e.g., "linux/arm64")
  pub fn oci(&self) -> String {
    format!("{}/{}", self.os, self.arch.oci_name())
  }
}

impl fmt::Display for Platform {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.triple())
  }
}

impl FromStr for Platform {
  type Err = String;

  /// Accepts both `arch-os` triples and `os/arch` pairs.
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    if let Some((os, arch)) = s.split_once('/') {
      return Ok(Self::new(arch.parse()?, os.parse()?));
    }
    match s.split_once('-') {
      Some((arch, os)) => Ok(Self::new(arch.parse()?, os.parse()?)),
      None => Err(format!("invalid platform '{}': expected arch-os or os/arch", s)),
    }
  }
}

impl TryFrom<String> for Platform {
  type Error = String;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    value.parse()
  }
}

impl From<Platform> for String {
  fn from(platform: Platform) -> Self {
    platform.triple()
  }
}

/// Returns the platform triple for the current system (e.g., "aarch64-darwin")
///
/// Returns `None` if the current platform is not supported
pub fn platform_triple() -> Option<String> {
  Platform::current().map(|p| p.triple())
}

/// The (build, target) pair a build runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlatformDescriptor {
  /// Platform the commands execute on.
  pub build: Platform,
  /// Platform the produced artifacts are meant for.
  pub target: Platform,
}

impl PlatformDescriptor {
  pub fn new(build: Platform, target: Platform) -> Self {
    Self { build, target }
  }

  /// Build and target both set to `platform`.
  pub fn native(platform: Platform) -> Self {
    Self::new(platform, platform)
  }

  /// Native descriptor for the host, if the host is supported.
  pub fn host() -> Option<Self> {
    Platform::current().map(Self::native)
  }

  pub fn is_cross(&self) -> bool {
    self.build != self.target
  }

  /// Variables exposed to `run` commands describing the platforms.
  pub fn env_vars(&self) -> Vec<(&'static str, String)> {
    vec![
      ("BUILDPLATFORM", self.build.oci()),
      ("BUILDOS", self.build.os.to_string()),
      ("BUILDARCH", self.build.arch.oci_name().to_string()),
      ("TARGETPLATFORM", self.target.oci()),
      ("TARGETOS", self.target.os.to_string()),
      ("TARGETARCH", self.target.arch.oci_name().to_string()),
    ]
  }
}

impl fmt::Display for PlatformDescriptor {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_cross() {
      write!(f, "{} -> {}", self.build, self.target)
    } else {
      write!(f, "{}", self.build)
    }
  }
}
