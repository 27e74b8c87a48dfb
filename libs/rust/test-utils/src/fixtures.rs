//! Test fixtures with sample data.

use jsonwebtoken::{EncodingKey, Header, encode};
use k8s_secrets::kube::policy_rule;
use k8s_secrets::{BindingRule, CredentialType, EngineSettings, RootConfig, RoleSpec};
use rust_common::RetryConfig;
use serde_json::json;
use std::time::Duration;

/// API server URL used by fixtures.
pub const CLUSTER_HOST: &str = "https://cluster.test:6443";

/// Service account the fixture root token authenticates as.
pub const ROOT_SERVICE_ACCOUNT: &str = "vault-root";

/// Sample CA bundle.
pub const SAMPLE_CA_PEM: &str = "-----BEGIN CERTIFICATE-----\nMIIBfake\n-----END CERTIFICATE-----\n";

/// A service account token carrying the legacy secret-based claims.
///
/// # Panics
///
/// Panics if the token cannot be encoded.
#[must_use]
pub fn service_account_token(name: &str, namespace: &str) -> String {
    let claims = json!({
        "iss": "kubernetes/serviceaccount",
        "kubernetes.io/serviceaccount/namespace": namespace,
        "kubernetes.io/serviceaccount/service-account.name": name,
        "sub": format!("system:serviceaccount:{namespace}:{name}"),
    });
    encode(&Header::default(), &claims, &EncodingKey::from_secret(b"fixture"))
        .expect("fixture token encodes")
}

/// Root configuration authenticating as [`ROOT_SERVICE_ACCOUNT`].
#[must_use]
pub fn root_config() -> RootConfig {
    RootConfig::new(CLUSTER_HOST, SAMPLE_CA_PEM)
        .with_token(service_account_token(ROOT_SERVICE_ACCOUNT, "kube-system"))
}

/// Settings that never sleep while waiting for tokens or certificates.
#[must_use]
pub fn fast_settings() -> EngineSettings {
    EngineSettings::default()
        .with_system_max_ttl(Duration::from_secs(24 * 3600))
        .with_token_wait(RetryConfig::immediate(3))
        .with_certificate_wait(RetryConfig::immediate(3))
}

/// Binding rule granting existing cluster roles in `namespaces`.
#[must_use]
pub fn cluster_role_rule(namespaces: &[&str], cluster_roles: &[&str]) -> BindingRule {
    BindingRule {
        namespaces: namespaces.iter().map(ToString::to_string).collect(),
        cluster_roles: cluster_roles.iter().map(ToString::to_string).collect(),
        rules: vec![],
    }
}

/// Binding rule with inline rules reading pods in `namespaces`.
#[must_use]
pub fn pod_reader_rule(namespaces: &[&str]) -> BindingRule {
    BindingRule {
        namespaces: namespaces.iter().map(ToString::to_string).collect(),
        cluster_roles: vec![],
        rules: vec![policy_rule(&[""], &["pods"], &["get", "list"])],
    }
}

/// Token role binding `view` in one namespace.
#[must_use]
pub fn token_role() -> RoleSpec {
    RoleSpec {
        credential_type: CredentialType::Token,
        binding_rules: vec![cluster_role_rule(&["ci"], &["view"])],
        service_account_namespace: "ci".to_string(),
        ..RoleSpec::default()
    }
}

/// Certificate role binding `view` in one namespace.
#[must_use]
pub fn certificate_role() -> RoleSpec {
    RoleSpec {
        credential_type: CredentialType::Certificate,
        binding_rules: vec![cluster_role_rule(&["ci"], &["view"])],
        ttl: Duration::from_secs(3600),
        ..RoleSpec::default()
    }
}

/// Token role with inline rules across three namespaces.
#[must_use]
pub fn fan_out_role() -> RoleSpec {
    RoleSpec {
        credential_type: CredentialType::Token,
        binding_rules: vec![pod_reader_rule(&["a", "b", "c"])],
        ..RoleSpec::default()
    }
}

/// Token role binding `edit` cluster-wide.
#[must_use]
pub fn wildcard_role() -> RoleSpec {
    RoleSpec {
        credential_type: CredentialType::Token,
        binding_rules: vec![cluster_role_rule(&["*"], &["edit"])],
        ..RoleSpec::default()
    }
}

/// Token role with `list_namespaces` enabled.
#[must_use]
pub fn list_namespaces_role() -> RoleSpec {
    RoleSpec {
        credential_type: CredentialType::Token,
        binding_rules: vec![cluster_role_rule(&["ci"], &["view"])],
        list_namespaces: true,
        ..RoleSpec::default()
    }
}
