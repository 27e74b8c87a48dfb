//! Teardown of a provisioned resource set.
//!
//! Deletion order is cluster roles, cluster role bindings, role bindings,
//! then the identity. Cluster RBAC does not enforce references between roles
//! and bindings, so the order only needs to be stable. Reverse it if the
//! target ever enforces referential integrity.

use crate::error::{EngineResult, SecretsEngineError};
use crate::kube::{ConnectionProfile, KubeResult, KubernetesApi};
use crate::lease::ProvisionedResourceSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

/// Outcome of a revocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RevocationReport {
    /// Objects deleted by this run
    pub deleted: usize,
    /// Objects that were already gone
    pub already_absent: usize,
}

/// Deletes every object in a resource set.
pub struct RevocationEngine<'a> {
    api: &'a dyn KubernetesApi,
    profile: &'a ConnectionProfile,
}

impl<'a> RevocationEngine<'a> {
    #[must_use]
    pub fn new(api: &'a dyn KubernetesApi, profile: &'a ConnectionProfile) -> Self {
        Self { api, profile }
    }

    /// Delete everything in `set`, treating absent objects as deleted.
    ///
    /// Safe to repeat after a partial failure.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsEngineError::ExternalDeletionFailed`] on the first
    /// delete that fails for a reason other than absence.
    #[instrument(skip(self, set), fields(objects = set.describe().len()))]
    pub async fn revoke(&self, set: &ProvisionedResourceSet) -> EngineResult<RevocationReport> {
        let mut report = RevocationReport::default();

        for role in &set.cluster_roles {
            let outcome = self.api.delete_cluster_role(self.profile, role).await;
            record(&mut report, outcome, "delete cluster role", &role.name)?;
        }
        for binding in &set.cluster_role_bindings {
            let outcome = self
                .api
                .delete_cluster_role_binding(self.profile, binding)
                .await;
            record(&mut report, outcome, "delete cluster role binding", &binding.name)?;
        }
        for binding in &set.role_bindings {
            let outcome = self.api.delete_role_binding(self.profile, binding).await;
            let resource = format!("{}/{}", binding.namespace, binding.name);
            record(&mut report, outcome, "delete role binding", &resource)?;
        }

        if let Some(identity) = &set.identity {
            if let Some(secret) = identity.token_secret() {
                let outcome = self.api.delete_secret(self.profile, &secret).await;
                let resource = format!("{}/{}", secret.namespace, secret.name);
                record(&mut report, outcome, "delete token secret", &resource)?;
            }
            if let Some(account) = identity.service_account() {
                let outcome = self.api.delete_service_account(self.profile, &account).await;
                let resource = format!("{}/{}", account.namespace, account.name);
                record(&mut report, outcome, "delete service account", &resource)?;
            }
        }

        info!(
            deleted = report.deleted,
            already_absent = report.already_absent,
            "revocation complete"
        );
        Ok(report)
    }
}

/// Run a revocation on its own task.
///
/// The revocation keeps going even if the returned handle is dropped, so a
/// cancelled caller never interrupts cleanup halfway.
pub fn spawn_revocation(
    api: Arc<dyn KubernetesApi>,
    profile: ConnectionProfile,
    set: ProvisionedResourceSet,
) -> JoinHandle<EngineResult<RevocationReport>> {
    tokio::spawn(async move {
        RevocationEngine::new(api.as_ref(), &profile)
            .revoke(&set)
            .await
    })
}

fn record(
    report: &mut RevocationReport,
    outcome: KubeResult<()>,
    operation: &'static str,
    resource: &str,
) -> EngineResult<()> {
    match outcome {
        Ok(()) => {
            report.deleted += 1;
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            warn!(operation, resource, "already absent");
            report.already_absent += 1;
            Ok(())
        }
        Err(source) => {
            warn!(operation, resource, error = %source, "revocation step failed");
            Err(SecretsEngineError::ExternalDeletionFailed {
                operation,
                resource: resource.to_string(),
                source,
            })
        }
    }
}
