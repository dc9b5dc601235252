//! Configuration for txcore.
//!
//! This module provides configuration structures for all core components.

mod core;

pub use self::core::{
    CoreConfig, DeadlockConfig, LockConfig, MvccConfig, SyncPolicy, TxnConfig, WalConfig,
};
