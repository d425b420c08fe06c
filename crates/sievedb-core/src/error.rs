//! Error types for `SieveDB`.
//!
//! A single error enum covers formula planning, evaluation, the result cache
//! and configuration. Error codes follow the pattern `SIEVE-XXX`.

use thiserror::Error;

/// Result type alias for `SieveDB` operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in `SieveDB` operations.
///
/// Errors are `Clone` so that a failed shared computation can hand the same
/// failure to every thread that waited for it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Formula built or cloned with the wrong number of children (SIEVE-001).
    #[error("[SIEVE-001] Formula '{formula}' expects {expected} children, got {actual}")]
    Arity {
        /// Formula kind name.
        formula: &'static str,
        /// Human readable arity, e.g. `exactly 1` or `at least 1`.
        expected: String,
        /// Number of children supplied.
        actual: usize,
    },

    /// Estimation or evaluation lacks the context it needs (SIEVE-002).
    #[error("[SIEVE-002] Planning error: {0}")]
    Planning(String),

    /// A shared cached computation failed or was abandoned (SIEVE-003).
    #[error("[SIEVE-003] Cached computation of formula {hash:#018x} failed: {reason}")]
    CacheComputation {
        /// Structural hash of the formula being computed.
        hash: u64,
        /// Failure reason reported by the computing thread.
        reason: String,
    },

    /// A cache reevaluation cycle failed (SIEVE-004).
    #[error("[SIEVE-004] Cache reevaluation failed: {0}")]
    Reevaluation(String),

    /// Configuration error (SIEVE-005).
    #[error("[SIEVE-005] Configuration error: {0}")]
    Config(String),

    /// Serialization error (SIEVE-006).
    #[error("[SIEVE-006] Serialization error: {0}")]
    Serialization(String),

    /// Bitmap built from invalid input (SIEVE-007).
    #[error("[SIEVE-007] Invalid bitmap: {0}")]
    InvalidBitmap(String),

    /// Internal error (SIEVE-008).
    ///
    /// Indicates a broken internal invariant. Please report if encountered.
    #[error("[SIEVE-008] Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the error code (e.g., "SIEVE-001").
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Arity { .. } => "SIEVE-001",
            Self::Planning(_) => "SIEVE-002",
            Self::CacheComputation { .. } => "SIEVE-003",
            Self::Reevaluation(_) => "SIEVE-004",
            Self::Config(_) => "SIEVE-005",
            Self::Serialization(_) => "SIEVE-006",
            Self::InvalidBitmap(_) => "SIEVE-007",
            Self::Internal(_) => "SIEVE-008",
        }
    }

    /// Returns true if this error is recoverable.
    ///
    /// A failed shared computation or reevaluation cycle can simply be
    /// retried; a malformed formula tree or a broken invariant cannot.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::Arity { .. } | Self::Planning(_) | Self::Internal(_)
        )
    }
}

impl From<crate::config::ConfigError> for Error {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
