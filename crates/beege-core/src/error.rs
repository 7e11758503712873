//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A peer address failed validation
    #[error("Invalid address '{value}': {reason}")]
    InvalidAddress { value: String, reason: String },

    /// Role name not recognised
    #[error("Unknown role: {0} (expected 'controller' or 'docker')")]
    UnknownRole(String),
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
