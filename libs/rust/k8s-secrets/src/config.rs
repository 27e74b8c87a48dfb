//! Root connection configuration.
//!
//! The root credential is what the engine itself uses to create and delete
//! identities and bindings. Exactly one form is accepted: a bearer token, or
//! a client certificate with its key.

use crate::error::{EngineResult, SecretsEngineError};
use crate::kube::{ConnectionProfile, ProfileCredential};
use crate::serde_helpers::{duration_secs, option_secret};
use crate::storage::{self, Storage};
use crate::tls;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;

/// Storage key of the root configuration.
pub const CONFIG_KEY: &str = "config";

/// Namespace for service accounts when a role does not name one.
pub const DEFAULT_SERVICE_ACCOUNT_NAMESPACE: &str = "kube-system";

/// Stored root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootConfig {
    /// API server URL
    pub host: String,
    /// PEM CA bundle of the API server
    pub ca_cert: String,
    /// Bearer token credential
    #[serde(default, with = "option_secret")]
    pub token: Option<SecretString>,
    /// Client certificate credential, PEM
    #[serde(default)]
    pub client_cert: Option<String>,
    /// Key for `client_cert`, PEM
    #[serde(default, with = "option_secret")]
    pub client_key: Option<SecretString>,
    /// Namespace for service accounts when the role leaves it empty
    #[serde(rename = "default_serviceaccount_namespace")]
    pub default_service_account_namespace: String,
    /// Lease TTL when neither request nor role sets one
    #[serde(with = "duration_secs", default)]
    pub default_ttl: Duration,
    /// Lease max TTL when the role sets none
    #[serde(with = "duration_secs", default)]
    pub default_max_ttl: Duration,
}

impl RootConfig {
    /// Create a configuration without a credential.
    #[must_use]
    pub fn new(host: impl Into<String>, ca_cert: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ca_cert: ca_cert.into(),
            token: None,
            client_cert: None,
            client_key: None,
            default_service_account_namespace: DEFAULT_SERVICE_ACCOUNT_NAMESPACE.to_string(),
            default_ttl: Duration::ZERO,
            default_max_ttl: Duration::ZERO,
        }
    }

    /// Authenticate with a bearer token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(SecretString::from(token.into()));
        self
    }

    /// Authenticate with a client certificate, replacing any token.
    #[must_use]
    pub fn with_client_certificate(mut self, cert: impl Into<String>, key: SecretString) -> Self {
        self.token = None;
        self.client_cert = Some(cert.into());
        self.client_key = Some(key);
        self
    }

    /// Set the default service account namespace.
    #[must_use]
    pub fn with_default_service_account_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.default_service_account_namespace = namespace.into();
        self
    }

    /// Set default lease TTLs.
    #[must_use]
    pub const fn with_default_ttls(mut self, ttl: Duration, max_ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self.default_max_ttl = max_ttl;
        self
    }

    fn has_token(&self) -> bool {
        self.token
            .as_ref()
            .is_some_and(|t| !t.expose_secret().is_empty())
    }

    fn has_client_cert(&self) -> bool {
        self.client_cert.as_ref().is_some_and(|c| !c.is_empty())
    }

    fn has_client_key(&self) -> bool {
        self.client_key
            .as_ref()
            .is_some_and(|k| !k.expose_secret().is_empty())
    }

    /// Check the configuration before it is stored.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsEngineError::InvalidConfig`] naming the first problem.
    pub fn validate(&self) -> EngineResult<()> {
        let token = self.has_token();
        let cert = self.has_client_cert();
        let key = self.has_client_key();

        if !token && !cert && !key {
            return Err(SecretsEngineError::invalid_config("no credentials provided"));
        }
        if token && (cert || key) {
            return Err(SecretsEngineError::invalid_config(
                "either token or certificates must be provided",
            ));
        }
        if cert != key {
            return Err(SecretsEngineError::invalid_config(
                "client_cert and client_key must be provided together",
            ));
        }
        if self.ca_cert.trim().is_empty() {
            return Err(SecretsEngineError::invalid_config("ca_cert can not be empty"));
        }
        if self.host.trim().is_empty() {
            return Err(SecretsEngineError::invalid_config("host can not be empty"));
        }
        if !self.default_max_ttl.is_zero() && self.default_ttl > self.default_max_ttl {
            return Err(SecretsEngineError::invalid_config(
                "default_ttl cannot be greater than default_max_ttl",
            ));
        }
        Ok(())
    }

    /// Connection profile built from the stored credential.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsEngineError::InvalidConfig`] when no complete
    /// credential is present.
    pub fn profile(&self) -> EngineResult<ConnectionProfile> {
        let credential = match (&self.token, &self.client_cert, &self.client_key) {
            (Some(token), _, _) if self.has_token() => {
                ProfileCredential::BearerToken(token.clone())
            }
            (_, Some(certificate), Some(key)) if self.has_client_cert() && self.has_client_key() => {
                ProfileCredential::ClientCertificate {
                    certificate: certificate.clone(),
                    key: key.clone(),
                }
            }
            _ => return Err(SecretsEngineError::invalid_config("no credentials provided")),
        };

        Ok(ConnectionProfile {
            host: self.host.clone(),
            ca_cert: self.ca_cert.clone(),
            credential,
        })
    }

    /// Name the cluster knows the root credential by.
    ///
    /// For a token this is the service account name from its claims; for a
    /// certificate it is the subject CN.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsEngineError::RootSubjectUnresolvable`] if neither can
    /// be read.
    pub fn subject_name(&self) -> EngineResult<String> {
        let resolved = if let Some(token) = self.token.as_ref().filter(|_| self.has_token()) {
            tls::service_account_from_token(token.expose_secret())
        } else if let Some(cert) = self.client_cert.as_ref().filter(|_| self.has_client_cert()) {
            tls::certificate_common_name(cert)
        } else {
            return Err(SecretsEngineError::RootSubjectUnresolvable(
                "no credentials configured".to_string(),
            ));
        };
        resolved.map_err(|e| SecretsEngineError::RootSubjectUnresolvable(e.to_string()))
    }

    /// Readable view of the configuration, without the token or key.
    #[must_use]
    pub fn to_response_data(&self) -> Value {
        json!({
            "host": self.host,
            "ca_cert": self.ca_cert,
            "client_cert": self.client_cert.clone().unwrap_or_default(),
            "default_serviceaccount_namespace": self.default_service_account_namespace,
            "default_ttl": self.default_ttl.as_secs(),
            "default_max_ttl": self.default_max_ttl.as_secs(),
        })
    }
}

/// Load the stored configuration.
///
/// # Errors
///
/// Returns [`SecretsEngineError::ConfigNotFound`] when nothing is stored.
pub async fn get_config(storage: &dyn Storage) -> EngineResult<RootConfig> {
    storage::get_json(storage, CONFIG_KEY)
        .await?
        .ok_or(SecretsEngineError::ConfigNotFound)
}

/// Validate and store a configuration.
///
/// # Errors
///
/// Returns validation or storage errors.
pub async fn put_config(storage: &dyn Storage, config: &RootConfig) -> EngineResult<()> {
    config.validate()?;
    storage::put_json(storage, CONFIG_KEY, config).await
}

/// Remove the stored configuration.
///
/// # Errors
///
/// Returns storage errors.
pub async fn delete_config(storage: &dyn Storage) -> EngineResult<()> {
    storage.delete(CONFIG_KEY).await?;
    Ok(())
}
