//! Type definitions for txcore.
//!
//! This module contains all core type definitions used across the core.

mod ids;
mod isolation;
mod timestamps;

pub use ids::{Lsn, RowKey, TableId, TxnId};
pub use isolation::{IsolationLevel, ParseIsolationError};
pub use timestamps::{Timestamp, WallTime};
