//! Custom error types for the application.
//!
//! This module defines the primary error type, `MotionError`, used across the crate.
//! Using the `thiserror` crate, it gives a single, consistent way to report failures
//! ranging from configuration problems to link-level trouble with a sensor device.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment` while parsing or merging configuration
//!   sources (defaults, TOML file, environment).
//! - **`Configuration`**: Semantic errors in an otherwise well-formed configuration,
//!   caught by `AppConfig::validate`.
//! - **`Link`**: Transport failures talking to a device. These are transient by nature;
//!   the connection manager retries them and only surfaces the message upward.
//! - **`NotConnected`**: A command was issued to a device whose link is not up.
//! - **`DuplicateDevice` / `UnknownDevice` / `InvalidAddress`**: Registry bookkeeping
//!   errors, reported back to whoever requested the add or remove.
//! - **`InvalidCommand`**: A command body that cannot be framed into a 16-byte packet.
//! - **`FeatureNotEnabled`**: Functionality compiled out via feature flags.
//!
//! Hardware capability traits (see `hardware::link`) return `anyhow::Result` so
//! drivers can attach context freely; the conversion to `MotionError::Link` happens
//! at the connection-manager boundary.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, MotionError>;

/// Errors surfaced by the crate's public API.
#[derive(Error, Debug)]
pub enum MotionError {
    /// Parsing or merging configuration sources failed
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration is well formed but invalid
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Local I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport-level failure talking to a device
    #[error("Link error: {0}")]
    Link(String),

    /// Command for a device without a live link
    #[error("Device '{0}' is not connected")]
    NotConnected(String),

    /// Address is already registered
    #[error("Address {0} already added.")]
    DuplicateDevice(String),

    /// Address is not registered
    #[error("Unknown device '{0}'")]
    UnknownDevice(String),

    /// Blank device address
    #[error("Address cannot be empty.")]
    InvalidAddress,

    /// Command body cannot be framed
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// `start` called twice
    #[error("'{0}' is already running")]
    AlreadyRunning(String),

    /// Operation on a component that was closed
    #[error("'{0}' has been closed")]
    Closed(String),

    /// The filter orchestrator has shut down
    #[error("Filter orchestrator is not running")]
    OrchestratorStopped,

    /// Functionality compiled out
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl MotionError {
    /// Whether the failure is expected to clear up on its own (retry is sensible).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Link(_) | Self::NotConnected(_))
    }
}

impl From<anyhow::Error> for MotionError {
    fn from(value: anyhow::Error) -> Self {
        // `{:#}` keeps the context chain on one line
        MotionError::Link(format!("{value:#}"))
    }
}
