//! strata-lib: layered build graph orchestration.
//!
//! A build is a DAG of named stages. Each stage starts from a base image or
//! another stage's result and applies an ordered list of instructions, each of
//! which produces a new filesystem snapshot:
//! - `graph`: stages, instructions, parameter scoping and validation
//! - `store`: content-addressed cache of snapshots keyed by instruction inputs
//! - `execute`: planning, parallel scheduling and per-stage execution
//! - `snapshot`: the snapshot tree model plus materialize/capture/export
//! - `buildfile`: the JSON build file format
//! - `image`: base image providers

pub mod buildfile;
pub mod consts;
pub mod execute;
pub mod graph;
pub mod image;
pub mod platform;
pub mod snapshot;
pub mod store;
pub mod util;
