//! Error types for Scrivener
//!
//! This module defines all error types used throughout the crate,
//! using `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Main error type for Scrivener operations
///
/// This enum encompasses all errors that can surface from the turn
/// coordinator, the quota ledger, the session store, and the
/// persistence layer. The first six variants are the recoverable
/// turn-level failures; the session is always left in its last-good
/// state when one of them is returned.
#[derive(Error, Debug)]
pub enum ScrivenerError {
    /// The user is banned and may not issue turns
    #[error("user is banned")]
    Banned,

    /// The user's monthly request quota is exhausted
    #[error("monthly quota exceeded: {used}/{limit}")]
    QuotaExceeded {
        /// Requests already counted in the current window
        used: u32,
        /// The configured monthly ceiling
        limit: u32,
    },

    /// The instruction is not legal in the session's current phase
    #[error("instruction not valid in phase {phase}")]
    InvalidState {
        /// Name of the phase the session was in
        phase: String,
    },

    /// A collaborator (planner or renderer) failed to apply the turn
    #[error("mutation failed: {detail}")]
    MutationFailed {
        /// Underlying collaborator error detail
        detail: String,
    },

    /// An external collaborator call exceeded its bounded duration
    #[error("collaborator call timed out after {seconds}s")]
    Timeout {
        /// The configured timeout that elapsed
        seconds: u64,
    },

    /// A stale session version was detected on compare-and-swap
    #[error("concurrent modification detected: expected version {expected}, found {found}")]
    ConcurrencyConflict {
        /// Version the writer expected to replace
        expected: u64,
        /// Version actually present in the store
        found: u64,
    },

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Persistence errors (database operations)
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias for Scrivener operations
///
/// Uses `anyhow::Error` as the error type, allowing rich context and
/// easy propagation; typed `ScrivenerError` values are wrapped where a
/// caller needs to distinguish kinds.
pub type Result<T> = anyhow::Result<T>;
