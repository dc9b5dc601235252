//! # txcore-common
//!
//! Common types, errors, and configuration for the txcore transaction core.
//!
//! This crate provides the foundational types and abstractions used across
//! all txcore components. It includes:
//!
//! - **Types**: Core identifiers (`TxnId`, `Lsn`, `RowKey`), logical
//!   timestamps and isolation levels
//! - **Errors**: Stable `ErrorCode`s and configuration errors
//! - **Config**: Serde configuration sections for every component
//! - **Constants**: System-wide constants and defaults
//!
//! ## Example
//!
//! ```rust
//! use txcore_common::types::{IsolationLevel, RowKey, TableId, TxnId};
//!
//! let txn = TxnId::new(1);
//! let key = RowKey::new(TableId::new(3), 42);
//! assert!(txn.is_valid());
//! assert_eq!(IsolationLevel::default(), IsolationLevel::ReadCommitted);
//! assert_eq!(key.row, 42);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod constants;
pub mod error;
pub mod types;

// Re-export commonly used items at the crate root
pub use constants::*;
pub use error::{ConfigError, ConfigResult, ErrorCode};
pub use types::{IsolationLevel, Lsn, RowKey, TableId, Timestamp, TxnId, WallTime};
