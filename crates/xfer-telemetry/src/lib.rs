#![allow(clippy::uninlined_format_args)]

//! Logging for the transfer manager and node daemons
//!
//! A thin layer over `tracing-subscriber`: pick a level, a format and a
//! destination, then call [`init_logging`] once at process start. Component
//! crates only use the `tracing` macros.

pub mod logging;

pub use logging::*;

use thiserror::Error;

/// Telemetry error types
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Initialization error
    #[error("Initialization error: {0}")]
    Init(String),

    /// Logging error
    #[error("Logging error: {0}")]
    Logging(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for telemetry operations
pub type Result<T> = std::result::Result<T, TelemetryError>;
