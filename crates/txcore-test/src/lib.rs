//! # txcore-test
//!
//! Integration tests for txcore.
//!
//! This crate contains:
//! - End-to-end transaction scenarios
//! - Deadlock resolution under the background detector
//! - WAL durability across restarts
//! - Randomised lock contention workloads

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Test utilities and helpers
pub mod utils;

pub use utils::{users, wait_until, TestCore};
