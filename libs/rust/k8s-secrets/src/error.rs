//! Engine error types using thiserror 2.0.
//!
//! Every failure keeps enough context to tell a missing role apart from a
//! failed external call, and partial failures carry the list of resources
//! that may have been left behind.

use crate::kube::KubeError;
use rust_common::{PlatformError, Retryable};
use thiserror::Error;

/// Errors surfaced by the secrets engine.
#[derive(Error, Debug)]
pub enum SecretsEngineError {
    /// Role definition rejected
    #[error("Invalid role: {0}")]
    InvalidRole(String),

    /// Root configuration rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No root configuration has been written
    #[error("Configuration is empty")]
    ConfigNotFound,

    /// Role does not exist
    #[error("Role '{0}' does not exist")]
    RoleNotFound(String),

    /// Service account or token secret could not be created
    #[error("Failed to provision identity '{resource}': {reason}")]
    IdentityProvisioningFailed {
        resource: String,
        reason: String,
        #[source]
        source: Option<KubeError>,
    },

    /// Certificate signing request was not signed
    #[error("Failed to sign certificate for '{subject}': {reason}")]
    CertificateSigningFailed {
        subject: String,
        reason: String,
        #[source]
        source: Option<KubeError>,
    },

    /// A cluster role or binding could not be created
    #[error("Failed to {operation} '{resource}': {source}")]
    BindingProvisioningFailed {
        operation: &'static str,
        resource: String,
        #[source]
        source: KubeError,
    },

    /// Lease payload is missing a required key
    #[error("Lease payload is missing '{0}'")]
    MissingLeaseField(String),

    /// Lease payload key holds malformed JSON
    #[error("Lease payload field '{key}' is malformed: {source}")]
    CorruptLeaseField {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// A delete call failed for a reason other than absence
    #[error("Failed to {operation} '{resource}': {source}")]
    ExternalDeletionFailed {
        operation: &'static str,
        resource: String,
        #[source]
        source: KubeError,
    },

    /// A read or list call against the cluster failed
    #[error("Failed to {operation}: {source}")]
    ExternalCallFailed {
        operation: &'static str,
        #[source]
        source: KubeError,
    },

    /// Rotation found nothing granted to the current root subject
    #[error("No bindings found for subject '{0}'")]
    NoBindingsForSubject(String),

    /// Root credential carries no usable subject
    #[error("Unable to determine root subject: {0}")]
    RootSubjectUnresolvable(String),

    /// Issuance failed and the cleanup of the partial result failed too
    #[error("{cause}; rollback also failed: {rollback}; orphaned resources: {orphaned:?}")]
    RollbackFailed {
        #[source]
        cause: Box<SecretsEngineError>,
        rollback: Box<SecretsEngineError>,
        orphaned: Vec<String>,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Storage backend error
    #[error(transparent)]
    Storage(#[from] PlatformError),
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, SecretsEngineError>;

impl SecretsEngineError {
    /// Whether repeating the same request may succeed.
    ///
    /// Deletion failures are always worth retrying since revocation tolerates
    /// resources that are already gone.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ExternalDeletionFailed { .. } => true,
            Self::IdentityProvisioningFailed { source, .. }
            | Self::CertificateSigningFailed { source, .. } => {
                source.as_ref().is_some_and(KubeError::is_retryable)
            }
            Self::BindingProvisioningFailed { source, .. }
            | Self::ExternalCallFailed { source, .. } => source.is_retryable(),
            Self::RollbackFailed { cause, .. } => cause.is_retryable(),
            Self::Storage(err) => err.is_retryable(),
            _ => false,
        }
    }

    /// Whether the failure means an entity does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::ConfigNotFound | Self::RoleNotFound(_) => true,
            Self::ExternalDeletionFailed { source, .. }
            | Self::BindingProvisioningFailed { source, .. }
            | Self::ExternalCallFailed { source, .. } => source.is_not_found(),
            Self::Storage(PlatformError::NotFound(_)) => true,
            _ => false,
        }
    }

    /// Create an invalid role error.
    #[must_use]
    pub fn invalid_role(msg: impl Into<String>) -> Self {
        Self::InvalidRole(msg.into())
    }

    /// Create an invalid config error.
    #[must_use]
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }
}

impl Retryable for SecretsEngineError {
    fn is_retryable(&self) -> bool {
        Self::is_retryable(self)
    }
}
