//! Root credential rotation.
//!
//! The steps run in a fixed order: identify the current subject, discover
//! its bindings, mint a certificate for a new subject, replicate the
//! bindings to it, commit the new credential, and finally retire the old
//! bindings. Until commit the stored credential stays valid and authorized;
//! after commit the new one is. A crash at any point leaves at most unused
//! bindings behind, never an unauthorized root.
//!
//! The caller must serialize rotations with each other and with
//! configuration writes.

use crate::config::{self, RootConfig};
use crate::error::{EngineResult, SecretsEngineError};
use crate::identity::{IdentityProvisioner, SignedCertificate};
use crate::kube::{
    ClusterRoleBindingHandle, ConnectionProfile, CreateClusterRoleBinding, CreateRoleBinding,
    KubernetesApi, RoleBindingHandle, Subject, SubjectBindings, user_subject,
};
use crate::settings::EngineSettings;
use crate::storage::Storage;
use crate::tls::random_suffix;
use tracing::{info, instrument, warn};

/// What rotation found before changing anything.
#[derive(Debug, Clone)]
pub struct RotationPlan {
    /// Configuration in force when the rotation started
    pub current: RootConfig,
    /// Subject the current credential authenticates as
    pub old_subject: String,
    /// Bindings naming the old subject
    pub bindings: SubjectBindings,
}

/// Bindings created for the new subject.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicatedBindings {
    pub cluster_role_bindings: Vec<ClusterRoleBindingHandle>,
    pub role_bindings: Vec<RoleBindingHandle>,
}

impl ReplicatedBindings {
    #[must_use]
    pub fn len(&self) -> usize {
        self.cluster_role_bindings.len() + self.role_bindings.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Summary of a completed rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationOutcome {
    pub old_subject: String,
    pub new_subject: String,
    /// Bindings copied to the new subject
    pub replicated: usize,
    /// Old bindings deleted
    pub retired: usize,
    /// Old bindings that could not be deleted
    pub leftover: Vec<String>,
}

/// Runs the rotation steps against one cluster and one store.
pub struct RootRotation<'a> {
    api: &'a dyn KubernetesApi,
    storage: &'a dyn Storage,
    settings: &'a EngineSettings,
}

impl<'a> RootRotation<'a> {
    #[must_use]
    pub fn new(
        api: &'a dyn KubernetesApi,
        storage: &'a dyn Storage,
        settings: &'a EngineSettings,
    ) -> Self {
        Self {
            api,
            storage,
            settings,
        }
    }

    /// Run every step in order.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error. Failures before commit leave
    /// the stored configuration untouched.
    #[instrument(skip(self))]
    pub async fn run(&self) -> EngineResult<RotationOutcome> {
        let plan = self.plan().await?;
        let minted = self.mint(&plan).await?;
        let replicated = self.replicate(&plan, &minted).await?;

        let committed = match self.commit(&plan, &minted).await {
            Ok(committed) => committed,
            Err(e) => {
                self.discard(&plan, &replicated).await;
                return Err(e);
            }
        };

        let (retired, leftover) = self.retire(&committed, &plan).await?;
        info!(
            old_subject = %plan.old_subject,
            new_subject = %minted.subject,
            retired,
            "root credential rotated"
        );
        Ok(RotationOutcome {
            old_subject: plan.old_subject,
            new_subject: minted.subject,
            replicated: replicated.len(),
            retired,
            leftover,
        })
    }

    /// Identify the current subject and discover its bindings.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsEngineError::ConfigNotFound`],
    /// [`SecretsEngineError::RootSubjectUnresolvable`], or
    /// [`SecretsEngineError::NoBindingsForSubject`] when there is nothing to
    /// carry forward.
    pub async fn plan(&self) -> EngineResult<RotationPlan> {
        let current = config::get_config(self.storage).await?;
        let old_subject = current.subject_name()?;
        let profile = current.profile()?;

        let bindings = self
            .api
            .list_bindings_for_subject(&profile, &old_subject)
            .await
            .map_err(|source| SecretsEngineError::ExternalCallFailed {
                operation: "list bindings for subject",
                source,
            })?;

        if bindings.is_empty() {
            return Err(SecretsEngineError::NoBindingsForSubject(old_subject));
        }

        info!(subject = %old_subject, bindings = bindings.len(), "discovered root bindings");
        Ok(RotationPlan {
            current,
            old_subject,
            bindings,
        })
    }

    /// Mint a certificate for a fresh subject.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsEngineError::CertificateSigningFailed`].
    pub async fn mint(&self, plan: &RotationPlan) -> EngineResult<SignedCertificate> {
        let profile = plan.current.profile()?;
        let subject = format!("{}{}", self.settings.resource_name_prefix, random_suffix(6));
        IdentityProvisioner::new(self.api, &profile, self.settings)
            .sign_certificate(&subject, None)
            .await
    }

    /// Copy every discovered binding to the minted subject.
    ///
    /// On failure the copies made so far are deleted again.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsEngineError::BindingProvisioningFailed`].
    pub async fn replicate(
        &self,
        plan: &RotationPlan,
        minted: &SignedCertificate,
    ) -> EngineResult<ReplicatedBindings> {
        let profile = plan.current.profile()?;
        let subject = user_subject(&minted.subject);
        let mut replicated = ReplicatedBindings::default();

        match self
            .copy_bindings(&profile, plan, &subject, &mut replicated)
            .await
        {
            Ok(()) => Ok(replicated),
            Err(e) => {
                self.discard(plan, &replicated).await;
                Err(e)
            }
        }
    }

    async fn copy_bindings(
        &self,
        profile: &ConnectionProfile,
        plan: &RotationPlan,
        subject: &Subject,
        replicated: &mut ReplicatedBindings,
    ) -> EngineResult<()> {
        let prefix = &self.settings.resource_name_prefix;

        for existing in &plan.bindings.cluster_role_bindings {
            let created = self
                .api
                .create_cluster_role_binding(
                    profile,
                    CreateClusterRoleBinding {
                        generate_name: prefix.clone(),
                        role_ref: existing.role_ref.clone(),
                        subject: subject.clone(),
                    },
                )
                .await
                .map_err(|source| SecretsEngineError::BindingProvisioningFailed {
                    operation: "replicate cluster role binding",
                    resource: existing.name.clone(),
                    source,
                })?;
            info!(from = %existing.name, to = %created.name, role = %existing.role_ref.name, "replicated cluster role binding");
            replicated.cluster_role_bindings.push(created);
        }

        for existing in &plan.bindings.role_bindings {
            let created = self
                .api
                .create_role_binding(
                    profile,
                    CreateRoleBinding {
                        generate_name: prefix.clone(),
                        namespace: existing.namespace.clone(),
                        role_ref: existing.role_ref.clone(),
                        subject: subject.clone(),
                    },
                )
                .await
                .map_err(|source| SecretsEngineError::BindingProvisioningFailed {
                    operation: "replicate role binding",
                    resource: format!("{}/{}", existing.namespace, existing.name),
                    source,
                })?;
            info!(from = %existing.name, to = %created.name, namespace = %existing.namespace, "replicated role binding");
            replicated.role_bindings.push(created);
        }
        Ok(())
    }

    /// Store the minted credential in place of the current one.
    ///
    /// Host, CA and defaults are carried over; any token is cleared.
    ///
    /// # Errors
    ///
    /// Returns storage or validation errors.
    pub async fn commit(
        &self,
        plan: &RotationPlan,
        minted: &SignedCertificate,
    ) -> EngineResult<RootConfig> {
        let committed = plan.current.clone().with_client_certificate(
            minted.certificate_pem.clone(),
            minted.private_key_pem.clone(),
        );
        config::put_config(self.storage, &committed).await?;
        self.api.invalidate_cache().await;
        info!(subject = %minted.subject, "committed rotated root credential");
        Ok(committed)
    }

    /// Delete the bindings that still name the old subject, using the new
    /// credential.
    ///
    /// Returns how many were deleted or already absent, and a description of
    /// those that could not be deleted.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsEngineError::InvalidConfig`] if `committed` has no
    /// usable credential.
    pub async fn retire(
        &self,
        committed: &RootConfig,
        plan: &RotationPlan,
    ) -> EngineResult<(usize, Vec<String>)> {
        let profile = committed.profile()?;
        let mut retired = 0;
        let mut leftover = Vec::new();

        for binding in &plan.bindings.cluster_role_bindings {
            let handle = ClusterRoleBindingHandle {
                name: binding.name.clone(),
            };
            match self.api.delete_cluster_role_binding(&profile, &handle).await {
                Ok(()) => retired += 1,
                Err(e) if e.is_not_found() => retired += 1,
                Err(e) => {
                    warn!(binding = %binding.name, error = %e, "failed to retire cluster role binding");
                    leftover.push(format!("ClusterRoleBinding {}", binding.name));
                }
            }
        }

        for binding in &plan.bindings.role_bindings {
            let handle = RoleBindingHandle {
                name: binding.name.clone(),
                namespace: binding.namespace.clone(),
            };
            match self.api.delete_role_binding(&profile, &handle).await {
                Ok(()) => retired += 1,
                Err(e) if e.is_not_found() => retired += 1,
                Err(e) => {
                    warn!(binding = %binding.name, namespace = %binding.namespace, error = %e, "failed to retire role binding");
                    leftover.push(format!("RoleBinding {}/{}", binding.namespace, binding.name));
                }
            }
        }

        Ok((retired, leftover))
    }

    /// Best-effort removal of replicated bindings after an aborted rotation.
    async fn discard(&self, plan: &RotationPlan, replicated: &ReplicatedBindings) {
        let Ok(profile) = plan.current.profile() else {
            return;
        };
        for binding in &replicated.cluster_role_bindings {
            if let Err(e) = self.api.delete_cluster_role_binding(&profile, binding).await {
                if !e.is_not_found() {
                    warn!(binding = %binding.name, error = %e, "failed to discard replicated cluster role binding");
                }
            }
        }
        for binding in &replicated.role_bindings {
            if let Err(e) = self.api.delete_role_binding(&profile, binding).await {
                if !e.is_not_found() {
                    warn!(binding = %binding.name, error = %e, "failed to discard replicated role binding");
                }
            }
        }
    }
}
