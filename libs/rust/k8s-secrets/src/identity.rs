//! Ephemeral identity provisioning.
//!
//! Token roles get a fresh service account whose bound token secret is polled
//! until the token controller fills it. Certificate roles get a new key pair
//! and a CSR signed by the cluster's client-auth signer.

use crate::error::{EngineResult, SecretsEngineError};
use crate::kube::{
    ConnectionProfile, CreateServiceAccount, KubeError, KubernetesApi, ServiceAccountHandle,
    CertificateRequestHandle, SignCertificateRequest, Subject, TokenSecretHandle,
    service_account_subject, user_subject,
};
use crate::lease::ProvisionedResourceSet;
use crate::resolver::ResolvedRole;
use crate::role::{CredentialType, MIN_CERTIFICATE_TTL};
use crate::settings::EngineSettings;
use crate::tls;
use rust_common::RetryPolicy;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const MAX_EXPIRATION_SECONDS: u32 = 2_147_483_647;
const MAX_SUBJECT_PREFIX: usize = 200;

/// The principal an issuance grants access to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Identity {
    /// Service account, optionally with its token secret
    ServiceAccount {
        name: String,
        namespace: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token_secret: Option<String>,
    },
    /// Certificate user; exists only as a name in bindings
    User { name: String },
}

impl Identity {
    /// Name the identity is known by in bindings.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::ServiceAccount { name, .. } | Self::User { name } => name,
        }
    }

    /// Binding subject for this identity.
    #[must_use]
    pub fn subject(&self) -> Subject {
        match self {
            Self::ServiceAccount {
                name, namespace, ..
            } => service_account_subject(name, namespace),
            Self::User { name } => user_subject(name),
        }
    }

    /// Whether revocation has cluster objects to delete for this identity.
    #[must_use]
    pub const fn owns_objects(&self) -> bool {
        matches!(self, Self::ServiceAccount { .. })
    }

    pub(crate) fn service_account(&self) -> Option<ServiceAccountHandle> {
        match self {
            Self::ServiceAccount {
                name, namespace, ..
            } => Some(ServiceAccountHandle {
                name: name.clone(),
                namespace: namespace.clone(),
            }),
            Self::User { .. } => None,
        }
    }

    pub(crate) fn token_secret(&self) -> Option<TokenSecretHandle> {
        match self {
            Self::ServiceAccount {
                namespace,
                token_secret: Some(secret),
                ..
            } => Some(TokenSecretHandle {
                name: secret.clone(),
                namespace: namespace.clone(),
            }),
            _ => None,
        }
    }

    pub(crate) fn describe(&self) -> Vec<String> {
        match self {
            Self::ServiceAccount {
                name,
                namespace,
                token_secret,
            } => {
                let mut out = vec![format!("ServiceAccount {namespace}/{name}")];
                if let Some(secret) = token_secret {
                    out.push(format!("Secret {namespace}/{secret}"));
                }
                out
            }
            Self::User { .. } => Vec::new(),
        }
    }
}

/// Credential material handed to the caller.
#[derive(Debug, Clone)]
pub enum IssuedCredential {
    /// Service account bearer token and the cluster CA it was issued with
    Token { token: SecretString, ca_cert: String },
    /// Signed client certificate and its private key, PEM
    Certificate(SignedCertificate),
}

/// A signed client certificate.
#[derive(Debug, Clone)]
pub struct SignedCertificate {
    pub subject: String,
    pub certificate_pem: String,
    pub private_key_pem: SecretString,
}

/// Certificate subject derived from the requester's display name.
///
/// The result is a valid DNS subdomain: every dot-separated label starts and
/// ends with an alphanumeric character.
#[must_use]
pub fn certificate_subject(display_name: &str, fallback: &str) -> String {
    let mut base = dns_labels(display_name, MAX_SUBJECT_PREFIX);
    if base.is_empty() {
        base = dns_labels(fallback, MAX_SUBJECT_PREFIX);
    }
    let suffix = tls::random_suffix(6);
    if base.is_empty() {
        return suffix;
    }
    format!("{base}-{suffix}")
}

/// Lowercase `raw`, replace disallowed characters with `-`, collapse runs of
/// separators and drop leading or trailing ones from each label.
fn dns_labels(raw: &str, limit: usize) -> String {
    let mapped: String = raw
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();

    let joined = mapped
        .split('.')
        .map(|label| {
            label
                .split('-')
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join("-")
        })
        .filter(|label| !label.is_empty())
        .collect::<Vec<_>>()
        .join(".");

    let truncated: String = joined.chars().take(limit).collect();
    truncated
        .trim_end_matches(|c| c == '-' || c == '.')
        .to_string()
}

fn expiration_hint(lifetime: Option<Duration>) -> Option<u32> {
    lifetime.filter(|d| *d >= MIN_CERTIFICATE_TTL).map(|d| {
        u32::try_from(d.as_secs()).map_or(MAX_EXPIRATION_SECONDS, |s| {
            s.min(MAX_EXPIRATION_SECONDS)
        })
    })
}

/// Creates identities against one cluster connection.
pub struct IdentityProvisioner<'a> {
    api: &'a dyn KubernetesApi,
    profile: &'a ConnectionProfile,
    settings: &'a EngineSettings,
}

impl<'a> IdentityProvisioner<'a> {
    #[must_use]
    pub fn new(
        api: &'a dyn KubernetesApi,
        profile: &'a ConnectionProfile,
        settings: &'a EngineSettings,
    ) -> Self {
        Self {
            api,
            profile,
            settings,
        }
    }

    /// Provision the identity a resolved role calls for.
    ///
    /// Objects are recorded in `set` as soon as they exist, so a failure
    /// later in the sequence still leaves them discoverable for cleanup.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsEngineError::IdentityProvisioningFailed`] or
    /// [`SecretsEngineError::CertificateSigningFailed`].
    pub async fn provision(
        &self,
        resolved: &ResolvedRole,
        display_name: &str,
        set: &mut ProvisionedResourceSet,
    ) -> EngineResult<IssuedCredential> {
        match resolved.credential_type {
            CredentialType::Token => {
                self.provision_service_account(&resolved.service_account_namespace, set)
                    .await
            }
            CredentialType::Certificate => {
                let subject =
                    certificate_subject(display_name, &self.settings.resource_name_prefix);
                set.identity = Some(Identity::User {
                    name: subject.clone(),
                });
                let signed = self.sign_certificate(&subject, Some(resolved.ttl)).await?;
                Ok(IssuedCredential::Certificate(signed))
            }
        }
    }

    /// Create a service account and wait for its token.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsEngineError::IdentityProvisioningFailed`] if a create
    /// call fails or the token is not populated within the wait budget.
    #[instrument(skip(self, set))]
    pub async fn provision_service_account(
        &self,
        namespace: &str,
        set: &mut ProvisionedResourceSet,
    ) -> EngineResult<IssuedCredential> {
        let failed = |resource: String, reason: &str, source: Option<KubeError>| {
            SecretsEngineError::IdentityProvisioningFailed {
                resource,
                reason: reason.to_string(),
                source,
            }
        };

        let account = self
            .api
            .create_service_account(
                self.profile,
                CreateServiceAccount {
                    namespace: namespace.to_string(),
                    generate_name: self.settings.resource_name_prefix.clone(),
                },
            )
            .await
            .map_err(|e| failed(namespace.to_string(), "create service account", Some(e)))?;
        let resource = format!("{}/{}", account.namespace, account.name);
        set.identity = Some(Identity::ServiceAccount {
            name: account.name.clone(),
            namespace: account.namespace.clone(),
            token_secret: None,
        });
        debug!(account = %resource, "service account created");

        let secret = self
            .api
            .create_token_secret(self.profile, &account)
            .await
            .map_err(|e| failed(resource.clone(), "create token secret", Some(e)))?;
        if let Some(Identity::ServiceAccount { token_secret, .. }) = set.identity.as_mut() {
            *token_secret = Some(secret.name.clone());
        }

        let data = RetryPolicy::new(self.settings.token_wait.clone())
            .poll(|| self.api.read_token_secret(self.profile, &secret))
            .await
            .map_err(|e| failed(resource.clone(), "read token secret", Some(e)))?
            .ok_or_else(|| {
                failed(
                    resource.clone(),
                    "token was not populated within the wait budget",
                    None,
                )
            })?;

        info!(account = %resource, "service account token issued");
        Ok(IssuedCredential::Token {
            token: data.token,
            ca_cert: data.ca_cert,
        })
    }

    /// Generate a key, have a CSR for `subject` signed, and clean up the CSR.
    ///
    /// `lifetime` is passed to the signer only when it is at least the
    /// signer's minimum.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsEngineError::CertificateSigningFailed`] if the request
    /// cannot be built, created or approved, or no certificate is issued in
    /// time. The CSR object is deleted in every case once it was created.
    #[instrument(skip(self))]
    pub async fn sign_certificate(
        &self,
        subject: &str,
        lifetime: Option<Duration>,
    ) -> EngineResult<SignedCertificate> {
        let failed = |reason: String, source: Option<KubeError>| {
            SecretsEngineError::CertificateSigningFailed {
                subject: subject.to_string(),
                reason,
                source,
            }
        };

        let generated =
            tls::generate_key_and_request(subject).map_err(|e| failed(e.to_string(), None))?;

        let request = self
            .api
            .create_certificate_request(
                self.profile,
                SignCertificateRequest {
                    name: subject.to_string(),
                    csr_pem: generated.csr_pem.clone(),
                    expiration_seconds: expiration_hint(lifetime),
                },
            )
            .await
            .map_err(|e| failed("create certificate request".to_string(), Some(e)))?;

        let issued = self.await_signature(&request).await;
        self.discard_request(&request).await;

        let certificate_pem = issued
            .map_err(|(reason, e)| failed(reason.to_string(), Some(e)))?
            .ok_or_else(|| failed("signer returned no certificate".to_string(), None))?;

        info!(subject, "client certificate issued");
        Ok(SignedCertificate {
            subject: subject.to_string(),
            certificate_pem,
            private_key_pem: SecretString::from(generated.private_key_pem.to_string()),
        })
    }

    /// Approve `request` and wait for the signer to issue the certificate.
    async fn await_signature(
        &self,
        request: &CertificateRequestHandle,
    ) -> Result<Option<String>, (&'static str, KubeError)> {
        self.api
            .approve_certificate_request(self.profile, request)
            .await
            .map_err(|e| ("approve certificate request", e))?;

        RetryPolicy::new(self.settings.certificate_wait.clone())
            .poll(|| self.api.read_signed_certificate(self.profile, request))
            .await
            .map_err(|e| ("read certificate request", e))
    }

    /// Delete a CSR once it has served its purpose, whatever the outcome.
    async fn discard_request(&self, request: &CertificateRequestHandle) {
        if let Err(e) = self
            .api
            .delete_certificate_request(self.profile, request)
            .await
        {
            if !e.is_not_found() {
                warn!(request = %request.name, error = %e, "failed to delete certificate request");
            }
        }
    }
}
