//! Turns a stored role and a request into concrete issuance parameters.

use crate::config::RootConfig;
use crate::error::EngineResult;
use crate::kube::policy_rule;
use crate::role::{BindingRule, CredentialType, RoleSpec};
use std::time::Duration;

/// Issuance parameters after defaults and limits are applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRole {
    pub credential_type: CredentialType,
    /// Role rules, plus the built-in rule when one is enabled
    pub binding_rules: Vec<BindingRule>,
    pub service_account_namespace: String,
    pub ttl: Duration,
    pub max_ttl: Duration,
}

fn first_set(candidates: &[Duration]) -> Option<Duration> {
    candidates.iter().copied().find(|d| !d.is_zero())
}

/// Resolve the effective TTL and max TTL.
///
/// Each value falls back from request to role to configuration default to
/// `system_max`, and neither may exceed `system_max`. The TTL is clamped to
/// the max TTL. A zero duration means "not set".
#[must_use]
pub fn resolve_ttls(
    requested: Option<Duration>,
    role: &RoleSpec,
    config: &RootConfig,
    system_max: Duration,
) -> (Duration, Duration) {
    let max_ttl = first_set(&[role.max_ttl, config.default_max_ttl])
        .unwrap_or(system_max)
        .min(system_max);

    let ttl = first_set(&[
        requested.unwrap_or(Duration::ZERO),
        role.ttl,
        config.default_ttl,
    ])
    .unwrap_or(max_ttl)
    .min(max_ttl);

    (ttl, max_ttl)
}

/// Cluster-wide rule granted when `list_namespaces` or `view_nodes` is set.
#[must_use]
pub fn built_in_rule(list_namespaces: bool, view_nodes: bool) -> Option<BindingRule> {
    let mut rules = Vec::new();
    if list_namespaces {
        rules.push(policy_rule(&[""], &["namespaces"], &["list"]));
    }
    if view_nodes {
        rules.push(policy_rule(&[""], &["nodes"], &["list", "get"]));
    }

    (!rules.is_empty()).then(|| BindingRule {
        namespaces: vec!["*".to_string()],
        cluster_roles: Vec::new(),
        rules,
    })
}

/// Resolve a role for issuance.
///
/// # Errors
///
/// Returns [`crate::SecretsEngineError::InvalidRole`] if the stored role no
/// longer validates.
pub fn resolve(
    role: &RoleSpec,
    config: &RootConfig,
    requested_ttl: Option<Duration>,
    system_max: Duration,
) -> EngineResult<ResolvedRole> {
    role.validate()?;

    let (ttl, max_ttl) = resolve_ttls(requested_ttl, role, config, system_max);

    let mut binding_rules = role.binding_rules.clone();
    binding_rules.extend(built_in_rule(role.list_namespaces, role.view_nodes));

    let service_account_namespace = if role.service_account_namespace.is_empty() {
        config.default_service_account_namespace.clone()
    } else {
        role.service_account_namespace.clone()
    };

    Ok(ResolvedRole {
        credential_type: role.credential_type,
        binding_rules,
        service_account_namespace,
        ttl,
        max_ttl,
    })
}
