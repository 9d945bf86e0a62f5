//! Custom error types for the rig.
//!
//! `RigError` is the single error type of the library. It follows the rig's
//! failure taxonomy:
//!
//! - **Frame errors** (checksum mismatch, short read) never reach this type. The
//!   codecs return `None` and the device workers record "unknown" for that field.
//! - **Link errors** are `std::io::Error`s that stay inside a device worker cycle.
//!   They only show up here when a port cannot be opened at all (`Serial`, `Io`).
//! - **Configuration errors** (`Config`, `Configuration`, `Csv`, `Json`) surface
//!   through the task ledger as an "exception" record.
//! - **Orchestration errors** (`InvalidState`, `Camera`, ...) are logged at the
//!   tick boundary and the transition is retried on the next tick.
//!
//! Binaries wrap this in `anyhow` at the top level.

use thiserror::Error;

/// Convenience alias for results using the rig error type.
pub type AppResult<T> = std::result::Result<T, RigError>;

#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum RigError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "instrument_serial")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    #[error("Invalid state for '{operation}': {state}")]
    InvalidState { operation: String, state: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Curve fit failed: {0}")]
    Fit(String),

    #[error("Camera error: {0}")]
    Camera(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),
}

impl RigError {
    /// Shorthand for [`RigError::InvalidState`].
    pub fn invalid_state(operation: &str, state: impl std::fmt::Display) -> Self {
        RigError::InvalidState {
            operation: operation.to_string(),
            state: state.to_string(),
        }
    }
}
