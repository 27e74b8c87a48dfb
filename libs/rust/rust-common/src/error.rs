//! Error type shared by the storage and runtime plumbing.
//!
//! `PlatformError` covers failures that are not specific to the Kubernetes
//! API: the host's storage backend and background task failures.

use crate::retry::Retryable;
use thiserror::Error;

/// Failure of the host platform underneath the engine.
///
/// Callers use [`PlatformError::is_retryable`] to tell a sealed or briefly
/// unreachable backend apart from a request that will never succeed.
#[derive(Error, Debug)]
pub enum PlatformError {
    /// Storage backend is sealed or unreachable
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    /// Storage did not answer in time
    #[error("Storage timed out: {0}")]
    Timeout(String),

    /// Key does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage refused the write, e.g. a read-only replica
    #[error("Write rejected for '{key}': {reason}")]
    Rejected { key: String, reason: String },

    /// Background task panicked or was cancelled
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PlatformError {
    /// Check if this error is retryable.
    ///
    /// # Examples
    ///
    /// ```
    /// use rust_common::PlatformError;
    ///
    /// assert!(PlatformError::unavailable("storage sealed").is_retryable());
    /// assert!(!PlatformError::NotFound("config".to_string()).is_retryable());
    /// ```
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }

    #[must_use]
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    #[must_use]
    pub fn rejected(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            key: key.into(),
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl Retryable for PlatformError {
    fn is_retryable(&self) -> bool {
        Self::is_retryable(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_storage_errors_retry() {
        assert!(PlatformError::unavailable("sealed").is_retryable());
        assert!(PlatformError::Timeout("get config".to_string()).is_retryable());
        assert!(!PlatformError::rejected("config", "read-only").is_retryable());
        assert!(!PlatformError::internal("join").is_retryable());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            PlatformError::unavailable("sealed").to_string(),
            "Storage unavailable: sealed"
        );
        assert_eq!(
            PlatformError::rejected("role/dev", "read-only").to_string(),
            "Write rejected for 'role/dev': read-only"
        );
    }
}
