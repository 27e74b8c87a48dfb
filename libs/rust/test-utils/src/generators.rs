//! Shared proptest generators.
//!
//! Strategies for the engine's domain types. Everything generated here is
//! valid unless the strategy name says otherwise.

use k8s_secrets::identity::Identity;
use k8s_secrets::kube::{
    ClusterRoleBindingHandle, ClusterRoleHandle, PolicyRule, RoleBindingHandle, policy_rule,
};
use k8s_secrets::{BindingRule, CredentialType, ProvisionedResourceSet, RoleSpec};
use proptest::prelude::*;
use std::time::Duration;

/// Generate DNS-label object names.
pub fn object_name_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,20}[a-z0-9]"
}

/// Generate concrete namespace lists, never containing `*`.
pub fn namespaces_strategy() -> impl Strategy<Value = Vec<String>> {
    prop::collection::btree_set(object_name_strategy(), 1..5).prop_map(|set| set.into_iter().collect())
}

/// Generate policy rules.
pub fn policy_rule_strategy() -> impl Strategy<Value = PolicyRule> {
    (
        prop::sample::subsequence(vec!["", "apps", "batch"], 1..3),
        prop::sample::subsequence(vec!["pods", "deployments", "jobs", "configmaps"], 1..4),
        prop::sample::subsequence(vec!["get", "list", "watch", "create", "delete"], 1..5),
    )
        .prop_map(|(groups, resources, verbs)| policy_rule(&groups, &resources, &verbs))
}

/// Generate binding rules, cluster-wide about a fifth of the time.
pub fn binding_rule_strategy() -> impl Strategy<Value = BindingRule> {
    (
        prop_oneof![4 => namespaces_strategy(), 1 => Just(vec!["*".to_string()])],
        prop::collection::vec(prop::sample::select(vec!["view", "edit", "admin"]), 0..3),
        prop::collection::vec(policy_rule_strategy(), 0..3),
    )
        .prop_filter("rule needs cluster roles or inline rules", |(_, roles, rules)| {
            !roles.is_empty() || !rules.is_empty()
        })
        .prop_map(|(namespaces, roles, rules)| BindingRule {
            namespaces,
            cluster_roles: roles.into_iter().map(str::to_string).collect(),
            rules,
        })
}

/// Generate credential types.
pub fn credential_type_strategy() -> impl Strategy<Value = CredentialType> {
    prop_oneof![Just(CredentialType::Token), Just(CredentialType::Certificate)]
}

/// Generate lease durations in whole seconds, zero included.
pub fn ttl_strategy() -> impl Strategy<Value = Duration> {
    prop_oneof![
        1 => Just(Duration::ZERO),
        4 => (1u64..200_000).prop_map(Duration::from_secs),
    ]
}

/// Generate valid roles.
pub fn role_spec_strategy() -> impl Strategy<Value = RoleSpec> {
    (
        credential_type_strategy(),
        prop::collection::vec(binding_rule_strategy(), 1..4),
        any::<bool>(),
        any::<bool>(),
        600u64..7200,
        prop_oneof![Just(0u64), 7200u64..100_000],
    )
        .prop_map(
            |(credential_type, binding_rules, list_namespaces, view_nodes, ttl, max_ttl)| RoleSpec {
                credential_type,
                binding_rules,
                service_account_namespace: String::new(),
                list_namespaces,
                view_nodes,
                ttl: Duration::from_secs(ttl),
                max_ttl: Duration::from_secs(max_ttl),
            },
        )
}

/// Generate identities of either kind.
pub fn identity_strategy() -> impl Strategy<Value = Identity> {
    prop_oneof![
        (object_name_strategy(), object_name_strategy(), any::<bool>()).prop_map(
            |(name, namespace, with_secret)| Identity::ServiceAccount {
                token_secret: with_secret.then(|| format!("{name}-token")),
                name,
                namespace,
            }
        ),
        object_name_strategy().prop_map(|name| Identity::User { name }),
    ]
}

/// Generate resource sets as recorded after a successful issuance.
pub fn resource_set_strategy() -> impl Strategy<Value = ProvisionedResourceSet> {
    (
        prop::option::of(identity_strategy()),
        prop::collection::vec(object_name_strategy(), 0..3),
        prop::collection::vec(object_name_strategy(), 0..3),
        prop::collection::vec((object_name_strategy(), object_name_strategy()), 0..5),
    )
        .prop_map(|(identity, roles, crbs, rbs)| ProvisionedResourceSet {
            identity,
            cluster_roles: roles.into_iter().map(|name| ClusterRoleHandle { name }).collect(),
            cluster_role_bindings: crbs
                .into_iter()
                .map(|name| ClusterRoleBindingHandle { name })
                .collect(),
            role_bindings: rbs
                .into_iter()
                .map(|(namespace, name)| RoleBindingHandle { name, namespace })
                .collect(),
        })
}
