//! Binds an identity to the permissions its role grants.

use crate::error::{EngineResult, SecretsEngineError};
use crate::kube::{
    ConnectionProfile, CreateClusterRole, CreateClusterRoleBinding, CreateRoleBinding,
    KubernetesApi, Subject, cluster_role_ref,
};
use crate::lease::ProvisionedResourceSet;
use crate::role::BindingRule;
use tracing::{info, instrument};

/// Creates cluster roles and bindings for one subject.
pub struct BindingProvisioner<'a> {
    api: &'a dyn KubernetesApi,
    profile: &'a ConnectionProfile,
    name_prefix: &'a str,
}

impl<'a> BindingProvisioner<'a> {
    #[must_use]
    pub fn new(
        api: &'a dyn KubernetesApi,
        profile: &'a ConnectionProfile,
        name_prefix: &'a str,
    ) -> Self {
        Self {
            api,
            profile,
            name_prefix,
        }
    }

    /// Materialize every rule, in order, for `subject`.
    ///
    /// Rules with inline policy rules first get a dedicated cluster role. Each
    /// cluster role is then bound once cluster-wide for `["*"]`, or once per
    /// listed namespace otherwise. Every created object is appended to `set`
    /// before the next call is made; on error `set` holds exactly what exists.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsEngineError::BindingProvisioningFailed`] on the first
    /// failed create.
    #[instrument(skip(self, rules, set), fields(subject = %subject.name, rules = rules.len()))]
    pub async fn provision(
        &self,
        rules: &[BindingRule],
        subject: &Subject,
        set: &mut ProvisionedResourceSet,
    ) -> EngineResult<()> {
        for rule in rules {
            let mut role_names = rule.cluster_roles.clone();

            if !rule.rules.is_empty() {
                let role = self
                    .api
                    .create_cluster_role(
                        self.profile,
                        CreateClusterRole {
                            generate_name: self.name_prefix.to_string(),
                            rules: rule.rules.clone(),
                        },
                    )
                    .await
                    .map_err(|source| SecretsEngineError::BindingProvisioningFailed {
                        operation: "create cluster role",
                        resource: self.name_prefix.to_string(),
                        source,
                    })?;
                info!(cluster_role = %role.name, subject = %subject.name, "created cluster role");
                role_names.push(role.name.clone());
                set.cluster_roles.push(role);
            }

            for role_name in &role_names {
                if rule.is_cluster_wide() {
                    self.bind_cluster_wide(role_name, subject, set).await?;
                } else {
                    for namespace in &rule.namespaces {
                        self.bind_in_namespace(role_name, namespace, subject, set)
                            .await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn bind_cluster_wide(
        &self,
        role_name: &str,
        subject: &Subject,
        set: &mut ProvisionedResourceSet,
    ) -> EngineResult<()> {
        let binding = self
            .api
            .create_cluster_role_binding(
                self.profile,
                CreateClusterRoleBinding {
                    generate_name: self.name_prefix.to_string(),
                    role_ref: cluster_role_ref(role_name),
                    subject: subject.clone(),
                },
            )
            .await
            .map_err(|source| SecretsEngineError::BindingProvisioningFailed {
                operation: "create cluster role binding",
                resource: role_name.to_string(),
                source,
            })?;
        info!(binding = %binding.name, role = role_name, subject = %subject.name, "created cluster role binding");
        set.cluster_role_bindings.push(binding);
        Ok(())
    }

    async fn bind_in_namespace(
        &self,
        role_name: &str,
        namespace: &str,
        subject: &Subject,
        set: &mut ProvisionedResourceSet,
    ) -> EngineResult<()> {
        let binding = self
            .api
            .create_role_binding(
                self.profile,
                CreateRoleBinding {
                    generate_name: self.name_prefix.to_string(),
                    namespace: namespace.to_string(),
                    role_ref: cluster_role_ref(role_name),
                    subject: subject.clone(),
                },
            )
            .await
            .map_err(|source| SecretsEngineError::BindingProvisioningFailed {
                operation: "create role binding",
                resource: format!("{namespace}/{role_name}"),
                source,
            })?;
        info!(binding = %binding.name, role = role_name, namespace, subject = %subject.name, "created role binding");
        set.role_bindings.push(binding);
        Ok(())
    }
}
