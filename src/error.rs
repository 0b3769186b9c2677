//! Error types for the Warden policy-synchronization core

use std::io;
use thiserror::Error;

/// Result type alias for Warden operations
pub type Result<T> = std::result::Result<T, WardenError>;

/// Main error type for Warden
#[derive(Error, Debug)]
pub enum WardenError {
    /// Configuration errors (invalid or missing required fields)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Authentication setup errors
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Operation requires a cloned working copy
    #[error("Repository has not been cloned yet")]
    NotCloned,

    /// Git operation failures (transient: remote unreachable, fetch rejected)
    #[error("Git error: {0}")]
    Git(String),

    /// Operation exceeded its deadline
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Policy reload rejected by the validation callback
    #[error("Policy validation failed: {0}")]
    Validation(String),

    /// Rollback to a known revision failed
    #[error("Rollback failed: {0}")]
    Rollback(String),

    /// Rollback or post-rollback reload failed; no automated remedy remains
    #[error("Unrecoverable: {0}")]
    Unrecoverable(String),

    /// Watcher lifecycle errors (started twice, stopped while not running)
    #[error("Watcher error: {0}")]
    Watcher(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl WardenError {
    /// Whether this error leaves no room for automated recovery.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, WardenError::Unrecoverable(_))
    }
}
