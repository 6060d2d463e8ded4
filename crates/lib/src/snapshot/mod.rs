//! Filesystem snapshots.
//!
//! A snapshot is an immutable, content-addressed tree of entries. The tree is
//! pure metadata; file contents are blobs in the [`CacheStore`](crate::store::CacheStore).

mod config;
mod fs;
mod types;

pub use config::{ExposedPort, ImageConfig};
pub use fs::{FsError, capture, capture_subtree, export, materialize, materialized_mode};
pub use types::{Entry, EntryKind, Snapshot, SnapshotId, Subtree, join_path, normalize_path};
