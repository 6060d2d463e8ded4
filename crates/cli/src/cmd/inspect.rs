//! Implementation of the `strata inspect` command.

use anyhow::{Context, Result};

use strata_lib::platform::paths::store_dir;
use strata_lib::snapshot::{EntryKind, SnapshotId};
use strata_lib::store::CacheStore;

use crate::output::{OutputFormat, format_bytes, format_mode, print_json, print_stat};

pub fn cmd_inspect(id: &str, output: OutputFormat) -> Result<()> {
  let store = CacheStore::open_locked(store_dir(), "inspect").context("Failed to open cache store")?;
  let id = SnapshotId(id.to_string());
  let snapshot = store
    .load_snapshot(&id)
    .with_context(|| format!("Failed to load snapshot {}", id))?;

  if output.is_json() {
    return print_json(&snapshot);
  }

  let mut total: u64 = 0;
  for (path, entry) in snapshot.entries() {
    let (kind, detail) = match &entry.kind {
      EntryKind::Dir => ('d', String::new()),
      EntryKind::File { size, .. } => {
        total += *size;
        ('-', format_bytes(*size))
      }
      EntryKind::Symlink { target } => ('l', format!("-> {}", target)),
    };
    println!(
      "{}{} {:>5}:{:<5} {:>9} /{}",
      kind,
      format_mode(entry.mode),
      entry.uid,
      entry.gid,
      detail,
      path
    );
  }
  println!();
  print_stat("Snapshot", &id.0);
  print_stat("Entries", &snapshot.len().to_string());
  print_stat("File data", &format_bytes(total));
  Ok(())
}
