//! # Warden Utilities
//!
//! Shared helpers for the Warden workspace. For now that is logging: a
//! `tracing` subscriber configured from the environment, used by every
//! binary in the workspace. Libraries only emit events.

pub mod logging;

pub use logging::{init_logging, init_logging_with, LogConfig, LogFormat, LogLevel, LoggingError, LoggingGuard};
pub use tracing::{debug, error, info, trace, warn};
