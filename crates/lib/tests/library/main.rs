//! Library scenario tests: whole builds against a scratch store.

#![cfg(unix)]

mod build_tests;
mod cache_tests;
mod common;
