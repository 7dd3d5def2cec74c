//! Error types for Kairos Core.
//!
//! This module defines all error types used throughout the library.
//!
//! Policy-evaluation outcomes (satisfied / unsatisfied constraints) are
//! data carried by [`crate::analysis::AnalysisResult`], not errors. Only
//! verification failures and infrastructure faults travel through
//! [`KairosError`].

use thiserror::Error;

/// Result type alias for Kairos operations.
pub type Result<T> = std::result::Result<T, KairosError>;

/// Main error type for Kairos Core operations.
#[derive(Error, Debug)]
pub enum KairosError {
    /// ACL denial, an attempt to execute a join that requires approval,
    /// or an entity hidden from the subject.
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Property parse failure, out-of-range value, or missing required
    /// input. Carries the property name.
    #[error("Invalid input for '{property}': {reason}")]
    InvalidInput {
        /// Name of the offending input property.
        property: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// One or more constraints evaluated to false.
    #[error("Unsatisfied constraints: {}", .0.join(", "))]
    ConstraintUnsatisfied(Vec<String>),

    /// A constraint threw while evaluating (e.g., expression error).
    #[error("Constraint evaluation failed: {}", .0.join("; "))]
    ConstraintFailed(Vec<String>),

    /// IdP or resource lookup missed (membership vanished, group deleted).
    #[error("Not found: {0}")]
    NotFound(String),

    /// The entity to create already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Optimistic concurrency exhausted on an IAM policy update.
    #[error("Conflicting concurrent update: {0}")]
    Conflict(String),

    /// I/O error talking to a collaborator, underlying cause preserved.
    #[error("Transport error: {0}")]
    Transport(#[source] anyhow::Error),

    /// Deferral token signature or parse failure.
    #[error("Token verification failed: {0}")]
    TokenVerification(String),

    /// Policy document or policy tree is structurally invalid.
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    /// Requested operation is not supported by the target policy.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl KairosError {
    /// Convenience constructor for [`KairosError::InvalidInput`].
    pub fn invalid_input(property: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            property: property.into(),
            reason: reason.into(),
        }
    }

    /// Wraps an arbitrary collaborator failure as a transport error.
    pub fn transport(err: impl Into<anyhow::Error>) -> Self {
        Self::Transport(err.into())
    }

    /// True for errors a caller may reasonably retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Transport(_))
    }

    /// Message suitable for the API boundary.
    ///
    /// `AccessDenied` and `NotFound` collapse to the same text so callers
    /// cannot probe for the existence of hidden entities.
    pub fn to_public_message(&self) -> String {
        match self {
            Self::AccessDenied(_) | Self::NotFound(_) => {
                "resource does not exist or access is denied".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for KairosError {
    fn from(err: std::io::Error) -> Self {
        KairosError::Transport(err.into())
    }
}

impl From<std::env::VarError> for KairosError {
    fn from(err: std::env::VarError) -> Self {
        KairosError::Configuration(err.to_string())
    }
}
