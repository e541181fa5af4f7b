//! Error types and lifecycle outcomes for radiowatch-core.
//!
//! Argument and lookup failures surface as [`Error`]; benign lifecycle
//! mismatches (`start` while running, `stop` while stopped) are reported as
//! dedicated outcome values so callers can treat them as idempotent.  The
//! watchdog minimum-timeout violation is a programmer error and panics
//! instead of returning any of these.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using the library's [`Error`] type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for radiowatch-core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// An argument failed validation; no side effects were performed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The engine has not been initialized (or was cleaned up).
    #[error("engine is not initialized")]
    NotInitialized,

    /// The engine was already initialized.
    #[error("engine is already initialized")]
    AlreadyInitialized,

    /// The named entry or handle does not exist in the registry.
    #[error("not found: {0}")]
    NotFound(String),

    /// The named entry is already registered.
    #[error("already exists: {0}")]
    Exists(String),

    /// Allocation failed while creating an entry.  Unreachable under the
    /// default global allocator, which aborts on exhaustion; kept for hosts
    /// with fallible allocation wrappers.
    #[error("out of memory")]
    OutOfMemory,
}

impl Error {
    /// Shorthand for an [`Error::InvalidArgument`] with a formatted message.
    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}

/// Outcome of a `start` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    /// The engine transitioned Stopped → Running.
    Started,
    /// The engine was already running; nothing changed.
    AlreadyRunning,
}

/// Outcome of a `stop` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// The engine transitioned Running → Stopped and drained its tick.
    Stopped,
    /// The engine was not running; nothing changed.
    AlreadyStopped,
}
