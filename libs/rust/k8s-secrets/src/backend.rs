//! Engine facade used by the mount's request handlers.

use crate::config::{self, RootConfig};
use crate::error::{EngineResult, SecretsEngineError};
use crate::issuance::{CredentialIssuer, IssuedCredentials};
use crate::kube::KubernetesApi;
use crate::lease::{self, LeasePayload};
use crate::revoke::{RevocationReport, spawn_revocation};
use crate::role::{self, RoleSpec, RoleUpdate};
use crate::rotation::{RootRotation, RotationOutcome};
use crate::settings::EngineSettings;
use crate::storage::Storage;
use rust_common::PlatformError;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, instrument};

/// Dynamic Kubernetes credential engine.
///
/// Issuance and revocation run concurrently. Configuration writes and root
/// rotations are serialized through one lock.
pub struct SecretsBackend {
    api: Arc<dyn KubernetesApi>,
    storage: Arc<dyn Storage>,
    settings: EngineSettings,
    config_lock: Mutex<()>,
}

impl SecretsBackend {
    /// Create an engine over a cluster capability and a store.
    #[must_use]
    pub fn new(
        api: Arc<dyn KubernetesApi>,
        storage: Arc<dyn Storage>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            api,
            storage,
            settings,
            config_lock: Mutex::new(()),
        }
    }

    /// Engine settings.
    #[must_use]
    pub const fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Validate and store the root configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsEngineError::InvalidConfig`] or storage errors.
    #[instrument(skip(self, config), fields(host = %config.host))]
    pub async fn write_config(&self, config: RootConfig) -> EngineResult<()> {
        let _guard = self.config_lock.lock().await;
        config::put_config(self.storage.as_ref(), &config).await?;
        self.api.invalidate_cache().await;
        info!("root configuration written");
        Ok(())
    }

    /// Read the root configuration without its secrets.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsEngineError::ConfigNotFound`] or storage errors.
    pub async fn read_config(&self) -> EngineResult<Value> {
        Ok(config::get_config(self.storage.as_ref())
            .await?
            .to_response_data())
    }

    /// Remove the root configuration.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn delete_config(&self) -> EngineResult<()> {
        let _guard = self.config_lock.lock().await;
        config::delete_config(self.storage.as_ref()).await?;
        self.api.invalidate_cache().await;
        Ok(())
    }

    /// Create or partially update a role.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsEngineError::InvalidRole`] or storage errors.
    #[instrument(skip(self, update))]
    pub async fn write_role(&self, name: &str, update: RoleUpdate) -> EngineResult<()> {
        role::validate_role_name(name)?;
        let existing = role::get_role(self.storage.as_ref(), name)
            .await?
            .unwrap_or_default();
        let updated = update.apply(existing)?;
        role::put_role(self.storage.as_ref(), name, &updated).await?;
        info!(credential_type = updated.credential_type.as_str(), "role written");
        Ok(())
    }

    /// Read a role.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsEngineError::RoleNotFound`] or storage errors.
    pub async fn read_role(&self, name: &str) -> EngineResult<Value> {
        self.load_role(name).await?.to_response_data()
    }

    /// List role names.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn list_roles(&self) -> EngineResult<Vec<String>> {
        role::list_roles(self.storage.as_ref()).await
    }

    /// Delete a role. Leases issued from it are unaffected.
    ///
    /// # Errors
    ///
    /// Returns storage errors.
    pub async fn delete_role(&self, name: &str) -> EngineResult<()> {
        role::delete_role(self.storage.as_ref(), name).await
    }

    async fn load_role(&self, name: &str) -> EngineResult<RoleSpec> {
        role::get_role(self.storage.as_ref(), name)
            .await?
            .ok_or_else(|| SecretsEngineError::RoleNotFound(name.to_string()))
    }

    /// Issue credentials for `role_name`.
    ///
    /// A zero or absent `requested_ttl` falls back to the role and
    /// configuration defaults.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsEngineError::RoleNotFound`],
    /// [`SecretsEngineError::ConfigNotFound`], or any issuance error.
    #[instrument(skip(self))]
    pub async fn issue_credentials(
        &self,
        role_name: &str,
        requested_ttl: Option<Duration>,
        display_name: &str,
    ) -> EngineResult<IssuedCredentials> {
        let role = self.load_role(role_name).await?;
        let config = config::get_config(self.storage.as_ref()).await?;
        CredentialIssuer::new(&self.api, &self.settings)
            .issue(&role, &config, requested_ttl, display_name)
            .await
    }

    /// Revoke everything recorded in a lease payload.
    ///
    /// Runs on its own task, so dropping the returned future does not stop
    /// the revocation.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsEngineError::MissingLeaseField`] or
    /// [`SecretsEngineError::CorruptLeaseField`] for an unreadable payload,
    /// and [`SecretsEngineError::ExternalDeletionFailed`] for a failed delete.
    #[instrument(skip(self, payload))]
    pub async fn revoke(&self, payload: &LeasePayload) -> EngineResult<RevocationReport> {
        let set = lease::decode(payload)?;
        let profile = config::get_config(self.storage.as_ref())
            .await?
            .profile()?;

        spawn_revocation(Arc::clone(&self.api), profile, set)
            .await
            .map_err(|e| PlatformError::internal(format!("revocation task failed: {e}")))?
    }

    /// Rotate the root credential.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsEngineError::NoBindingsForSubject`] when the current
    /// root has nothing to carry forward, or the first failing step's error.
    pub async fn rotate_root(&self) -> EngineResult<RotationOutcome> {
        let _guard = self.config_lock.lock().await;
        RootRotation::new(self.api.as_ref(), self.storage.as_ref(), &self.settings)
            .run()
            .await
    }
}
