//! Shared test utilities for the kvs crates.
//!
//! This crate provides common test helpers to reduce boilerplate across test modules:
//!
//! - [`TestDir`] - Managed temporary directory with path helpers
//! - [`CrashInjector`] - Deterministic crash points for commit-sequence tests
//! - [`strategies`] - Proptest generators for key-value workloads

#![deny(unsafe_code)]
// Test utilities are allowed to use unwrap for simplicity
#![cfg_attr(test, allow(clippy::disallowed_methods))]

mod test_dir;
pub use test_dir::{STORE_FILE_NAME, TestDir};

mod crash_injector;
pub use crash_injector::{CrashInjector, CrashPoint};

pub mod strategies;
pub use strategies::KvOp;
