//! Credential issuance.
//!
//! Issuance either returns a lease covering everything it created, or leaves
//! nothing behind: any failure revokes the partial resource set before the
//! error is returned, and a dropped (cancelled) issuance hands its partial
//! set to a background revocation.

use crate::binding::BindingProvisioner;
use crate::config::RootConfig;
use crate::error::{EngineResult, SecretsEngineError};
use crate::identity::{Identity, IdentityProvisioner, IssuedCredential};
use crate::kube::{ConnectionProfile, KubernetesApi};
use crate::kubeconfig::{self, KubeconfigParams};
use crate::lease::{Lease, ProvisionedResourceSet};
use crate::resolver::{self, ResolvedRole};
use crate::revoke::spawn_revocation;
use crate::role::RoleSpec;
use crate::settings::EngineSettings;
use crate::tls::base64_encode;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};
use zeroize::Zeroizing;

/// Caller-facing credential fields.
#[derive(Debug, Clone)]
pub struct CredentialData {
    /// Service account token, for token roles
    pub token: Option<SecretString>,
    /// Base64 of the certificate PEM, for certificate roles
    pub user_cert: Option<String>,
    /// Base64 of the private key PEM, for certificate roles
    pub user_key: Option<SecretString>,
    pub host: String,
    pub ca_cert: String,
    pub kube_config: SecretString,
}

impl CredentialData {
    /// Response body for the credential holder. Contains secrets.
    #[must_use]
    pub fn to_response_data(&self) -> Value {
        json!({
            "token": self.token.as_ref().map(|t| t.expose_secret().to_string()).unwrap_or_default(),
            "user_cert": self.user_cert.clone().unwrap_or_default(),
            "user_key": self.user_key.as_ref().map(|k| k.expose_secret().to_string()).unwrap_or_default(),
            "host": self.host,
            "ca_cert": self.ca_cert,
            "kube_config": self.kube_config.expose_secret(),
        })
    }
}

/// Result of a successful issuance.
#[derive(Debug, Clone)]
pub struct IssuedCredentials {
    pub data: CredentialData,
    pub lease: Lease,
}

/// Revokes a partial resource set if dropped while still armed.
struct PartialIssuance {
    api: Arc<dyn KubernetesApi>,
    profile: ConnectionProfile,
    set: ProvisionedResourceSet,
    armed: bool,
}

impl PartialIssuance {
    fn new(api: Arc<dyn KubernetesApi>, profile: ConnectionProfile) -> Self {
        Self {
            api,
            profile,
            set: ProvisionedResourceSet::default(),
            armed: true,
        }
    }

    fn disarm(mut self) -> ProvisionedResourceSet {
        self.armed = false;
        std::mem::take(&mut self.set)
    }
}

impl Drop for PartialIssuance {
    fn drop(&mut self) {
        if !self.armed || self.set.is_empty() {
            return;
        }
        let set = std::mem::take(&mut self.set);
        warn!(orphaned = ?set.describe(), "issuance abandoned, revoking partial resources");

        if tokio::runtime::Handle::try_current().is_ok() {
            let _detached = spawn_revocation(Arc::clone(&self.api), self.profile.clone(), set);
        } else {
            error!(orphaned = ?set.describe(), "no runtime to revoke abandoned issuance");
        }
    }
}

/// Issues credentials for a role against the root configuration.
pub struct CredentialIssuer<'a> {
    api: &'a Arc<dyn KubernetesApi>,
    settings: &'a EngineSettings,
}

impl<'a> CredentialIssuer<'a> {
    #[must_use]
    pub fn new(api: &'a Arc<dyn KubernetesApi>, settings: &'a EngineSettings) -> Self {
        Self { api, settings }
    }

    /// Provision an identity and its bindings, and return the credential
    /// with a lease recording every created object.
    ///
    /// # Errors
    ///
    /// Returns the provisioning error after the partial set was revoked, or
    /// [`SecretsEngineError::RollbackFailed`] if that revocation failed too.
    #[instrument(skip(self, role, config), fields(credential_type = role.credential_type.as_str()))]
    pub async fn issue(
        &self,
        role: &RoleSpec,
        config: &RootConfig,
        requested_ttl: Option<Duration>,
        display_name: &str,
    ) -> EngineResult<IssuedCredentials> {
        let resolved =
            resolver::resolve(role, config, requested_ttl, self.settings.system_max_ttl)?;
        let profile = config.profile()?;

        let mut partial = PartialIssuance::new(Arc::clone(self.api), profile.clone());
        let outcome = self
            .provision(&resolved, &profile, display_name, &mut partial.set)
            .await;
        let set = partial.disarm();

        let assembled =
            outcome.and_then(|credential| self.assemble(config, &resolved, &set, credential));
        match assembled {
            Ok(issued) => {
                info!(
                    ttl_secs = issued.lease.ttl.as_secs(),
                    expires_at = %issued.lease.expires_at(),
                    objects = set.describe().len(),
                    "credentials issued"
                );
                Ok(issued)
            }
            Err(cause) => Err(self.roll_back(profile, set, cause).await),
        }
    }

    async fn provision(
        &self,
        resolved: &ResolvedRole,
        profile: &ConnectionProfile,
        display_name: &str,
        set: &mut ProvisionedResourceSet,
    ) -> EngineResult<IssuedCredential> {
        let api = self.api.as_ref();
        let credential = IdentityProvisioner::new(api, profile, self.settings)
            .provision(resolved, display_name, set)
            .await?;

        let Some(subject) = set.identity.as_ref().map(Identity::subject) else {
            return Err(SecretsEngineError::IdentityProvisioningFailed {
                resource: display_name.to_string(),
                reason: "no identity was recorded".to_string(),
                source: None,
            });
        };

        BindingProvisioner::new(api, profile, &self.settings.resource_name_prefix)
            .provision(&resolved.binding_rules, &subject, set)
            .await?;
        Ok(credential)
    }

    fn assemble(
        &self,
        config: &RootConfig,
        resolved: &ResolvedRole,
        set: &ProvisionedResourceSet,
        credential: IssuedCredential,
    ) -> EngineResult<IssuedCredentials> {
        let user = set.identity.as_ref().map(Identity::name);
        let mut params = KubeconfigParams {
            server: &config.host,
            ca_cert: &config.ca_cert,
            namespace: &self.settings.context_namespace,
            user,
            ..KubeconfigParams::default()
        };

        let data = match &credential {
            IssuedCredential::Token { token, .. } => {
                params.token = Some(token.expose_secret());
                CredentialData {
                    token: Some(token.clone()),
                    user_cert: None,
                    user_key: None,
                    host: config.host.clone(),
                    ca_cert: config.ca_cert.clone(),
                    kube_config: SecretString::from(kubeconfig::render(&params)),
                }
            }
            IssuedCredential::Certificate(signed) => {
                let cert = base64_encode(&signed.certificate_pem);
                let key = Zeroizing::new(base64_encode(signed.private_key_pem.expose_secret()));
                params.client_certificate_data = Some(&cert);
                params.client_key_data = Some(key.as_str());
                let kube_config = kubeconfig::render(&params);
                CredentialData {
                    token: None,
                    user_cert: Some(cert.clone()),
                    user_key: Some(SecretString::from(key.to_string())),
                    host: config.host.clone(),
                    ca_cert: config.ca_cert.clone(),
                    kube_config: SecretString::from(kube_config),
                }
            }
        };

        Ok(IssuedCredentials {
            data,
            lease: Lease::new(set, resolved.ttl, resolved.max_ttl)?,
        })
    }

    async fn roll_back(
        &self,
        profile: ConnectionProfile,
        set: ProvisionedResourceSet,
        cause: SecretsEngineError,
    ) -> SecretsEngineError {
        if set.is_empty() {
            return cause;
        }
        let orphaned = set.describe();
        warn!(error = %cause, objects = orphaned.len(), "issuance failed, revoking partial resources");

        match spawn_revocation(Arc::clone(self.api), profile, set).await {
            Ok(Ok(_)) => cause,
            Ok(Err(rollback)) => {
                error!(orphaned = ?orphaned, error = %rollback, "rollback of partial issuance failed");
                SecretsEngineError::RollbackFailed {
                    cause: Box::new(cause),
                    rollback: Box::new(rollback),
                    orphaned,
                }
            }
            Err(join) => SecretsEngineError::RollbackFailed {
                cause: Box::new(cause),
                rollback: Box::new(rust_common::PlatformError::internal(join.to_string()).into()),
                orphaned,
            },
        }
    }
}
