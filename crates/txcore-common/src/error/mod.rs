//! Error handling shared by txcore components.
//!
//! Each component crate defines its own `thiserror` enum; they all map onto
//! the stable numeric [`ErrorCode`]s defined here so status consumers can
//! categorise failures without knowing the component types.

mod codes;

pub use codes::{ConfigError, ErrorCode};

/// Result type alias for configuration handling.
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;
