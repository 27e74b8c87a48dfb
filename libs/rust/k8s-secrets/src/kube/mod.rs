//! Cluster API capability.
//!
//! [`KubernetesApi`] is the only way the engine touches a cluster. Every call
//! takes the [`ConnectionProfile`] to authenticate with, so the same
//! implementation serves both the configured root credential and a freshly
//! minted one during rotation.

mod cache;
mod client;

pub use cache::ClientCache;
pub use client::HttpKubernetesApi;

use async_trait::async_trait;
use rust_common::Retryable;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use k8s_openapi::api::rbac::v1::{PolicyRule, RoleRef, Subject};

/// API group of RBAC objects.
pub const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";
/// Subject kind of a service account.
pub const SERVICE_ACCOUNT_KIND: &str = "ServiceAccount";
/// Subject kind of a certificate-authenticated user.
pub const USER_KIND: &str = "User";
/// Role reference kind for cluster roles.
pub const CLUSTER_ROLE_KIND: &str = "ClusterRole";

/// Errors returned by cluster API calls.
#[derive(Error, Debug)]
pub enum KubeError {
    /// Object does not exist
    #[error("{kind} '{name}' not found")]
    NotFound { kind: String, name: String },

    /// Object already exists
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: String, name: String },

    /// Caller is not authorized
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// API server overloaded or unreachable
    #[error("Kubernetes API unavailable: {0}")]
    Unavailable(String),

    /// Any other API status
    #[error("Kubernetes API returned {status}: {message}")]
    Api { status: u16, message: String },

    /// Response body could not be interpreted
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Client could not be built from the connection profile
    #[error("Client setup failed: {0}")]
    ClientSetup(String),
}

/// Result type for cluster API calls.
pub type KubeResult<T> = Result<T, KubeError>;

impl KubeError {
    /// Create a not found error.
    #[must_use]
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Whether the object is absent.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Check if error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl Retryable for KubeError {
    fn is_retryable(&self) -> bool {
        Self::is_retryable(self)
    }
}

/// How a connection authenticates.
#[derive(Debug, Clone)]
pub enum ProfileCredential {
    /// Bearer token
    BearerToken(SecretString),
    /// Client certificate and key, PEM encoded
    ClientCertificate {
        certificate: String,
        key: SecretString,
    },
}

/// Everything needed to open an authenticated connection to a cluster.
#[derive(Debug, Clone)]
pub struct ConnectionProfile {
    /// API server URL
    pub host: String,
    /// PEM CA bundle used to verify the API server
    pub ca_cert: String,
    /// Credential presented to the API server
    pub credential: ProfileCredential,
}

impl ConnectionProfile {
    /// Whether two profiles would produce identical connections.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        use secrecy::ExposeSecret;

        self.host == other.host
            && self.ca_cert == other.ca_cert
            && match (&self.credential, &other.credential) {
                (ProfileCredential::BearerToken(a), ProfileCredential::BearerToken(b)) => {
                    a.expose_secret() == b.expose_secret()
                }
                (
                    ProfileCredential::ClientCertificate {
                        certificate: ca,
                        key: ka,
                    },
                    ProfileCredential::ClientCertificate {
                        certificate: cb,
                        key: kb,
                    },
                ) => ca == cb && ka.expose_secret() == kb.expose_secret(),
                _ => false,
            }
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| (*v).to_string()).collect()
}

/// Policy rule over `resources` in `api_groups`.
#[must_use]
pub fn policy_rule(api_groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    PolicyRule {
        api_groups: Some(strings(api_groups)),
        resources: Some(strings(resources)),
        verbs: strings(verbs),
        ..PolicyRule::default()
    }
}

/// Binding subject for a service account.
#[must_use]
pub fn service_account_subject(name: impl Into<String>, namespace: impl Into<String>) -> Subject {
    Subject {
        kind: SERVICE_ACCOUNT_KIND.to_string(),
        name: name.into(),
        namespace: Some(namespace.into()),
        api_group: None,
    }
}

/// Binding subject for a certificate-authenticated user.
#[must_use]
pub fn user_subject(name: impl Into<String>) -> Subject {
    Subject {
        kind: USER_KIND.to_string(),
        name: name.into(),
        namespace: None,
        api_group: Some(RBAC_API_GROUP.to_string()),
    }
}

/// Reference to a cluster role.
#[must_use]
pub fn cluster_role_ref(name: impl Into<String>) -> RoleRef {
    RoleRef {
        api_group: RBAC_API_GROUP.to_string(),
        kind: CLUSTER_ROLE_KIND.to_string(),
        name: name.into(),
    }
}

/// Created service account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAccountHandle {
    pub name: String,
    pub namespace: String,
}

/// Created token secret bound to a service account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSecretHandle {
    pub name: String,
    pub namespace: String,
}

/// Populated contents of a token secret.
#[derive(Debug, Clone)]
pub struct TokenSecretData {
    /// Bearer token, decoded
    pub token: SecretString,
    /// Cluster CA bundle, decoded PEM
    pub ca_cert: String,
}

/// Created cluster role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRoleHandle {
    pub name: String,
}

/// Created cluster role binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRoleBindingHandle {
    pub name: String,
}

/// Created namespaced role binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleBindingHandle {
    pub name: String,
    pub namespace: String,
}

/// Submitted certificate signing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequestHandle {
    pub name: String,
}

/// Request to create a service account.
#[derive(Debug, Clone)]
pub struct CreateServiceAccount {
    pub namespace: String,
    pub generate_name: String,
}

/// Request to create a cluster role.
#[derive(Debug, Clone)]
pub struct CreateClusterRole {
    pub generate_name: String,
    pub rules: Vec<PolicyRule>,
}

/// Request to create a namespaced role binding.
#[derive(Debug, Clone)]
pub struct CreateRoleBinding {
    pub generate_name: String,
    pub namespace: String,
    pub role_ref: RoleRef,
    pub subject: Subject,
}

/// Request to create a cluster role binding.
#[derive(Debug, Clone)]
pub struct CreateClusterRoleBinding {
    pub generate_name: String,
    pub role_ref: RoleRef,
    pub subject: Subject,
}

/// CSR to submit to the client-auth signer.
#[derive(Debug, Clone)]
pub struct SignCertificateRequest {
    /// Object name, also the certificate subject
    pub name: String,
    /// PEM encoded PKCS#10 request
    pub csr_pem: String,
    /// Requested certificate lifetime
    pub expiration_seconds: Option<u32>,
}

/// Existing cluster role binding naming a subject.
#[derive(Debug, Clone, PartialEq)]
pub struct ExistingClusterRoleBinding {
    pub name: String,
    pub role_ref: RoleRef,
    pub subjects: Vec<Subject>,
}

/// Existing namespaced role binding naming a subject.
#[derive(Debug, Clone, PartialEq)]
pub struct ExistingRoleBinding {
    pub name: String,
    pub namespace: String,
    pub role_ref: RoleRef,
    pub subjects: Vec<Subject>,
}

/// All bindings that name a given subject.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubjectBindings {
    pub cluster_role_bindings: Vec<ExistingClusterRoleBinding>,
    pub role_bindings: Vec<ExistingRoleBinding>,
}

impl SubjectBindings {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cluster_role_bindings.is_empty() && self.role_bindings.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cluster_role_bindings.len() + self.role_bindings.len()
    }
}

/// Operations the engine performs against a cluster.
///
/// Deletes report [`KubeError::NotFound`] for absent objects; callers decide
/// whether absence is acceptable.
#[async_trait]
pub trait KubernetesApi: Send + Sync {
    /// Create a service account with a generated name.
    async fn create_service_account(
        &self,
        profile: &ConnectionProfile,
        request: CreateServiceAccount,
    ) -> KubeResult<ServiceAccountHandle>;

    /// Create a long-lived token secret bound to the service account.
    async fn create_token_secret(
        &self,
        profile: &ConnectionProfile,
        account: &ServiceAccountHandle,
    ) -> KubeResult<TokenSecretHandle>;

    /// Read a token secret; `None` while the token controller has not filled it.
    async fn read_token_secret(
        &self,
        profile: &ConnectionProfile,
        secret: &TokenSecretHandle,
    ) -> KubeResult<Option<TokenSecretData>>;

    /// Delete a token secret.
    async fn delete_secret(
        &self,
        profile: &ConnectionProfile,
        secret: &TokenSecretHandle,
    ) -> KubeResult<()>;

    /// Delete a service account.
    async fn delete_service_account(
        &self,
        profile: &ConnectionProfile,
        account: &ServiceAccountHandle,
    ) -> KubeResult<()>;

    /// Create a cluster role.
    async fn create_cluster_role(
        &self,
        profile: &ConnectionProfile,
        request: CreateClusterRole,
    ) -> KubeResult<ClusterRoleHandle>;

    /// Delete a cluster role.
    async fn delete_cluster_role(
        &self,
        profile: &ConnectionProfile,
        role: &ClusterRoleHandle,
    ) -> KubeResult<()>;

    /// Create a namespaced role binding.
    async fn create_role_binding(
        &self,
        profile: &ConnectionProfile,
        request: CreateRoleBinding,
    ) -> KubeResult<RoleBindingHandle>;

    /// Delete a namespaced role binding.
    async fn delete_role_binding(
        &self,
        profile: &ConnectionProfile,
        binding: &RoleBindingHandle,
    ) -> KubeResult<()>;

    /// Create a cluster role binding.
    async fn create_cluster_role_binding(
        &self,
        profile: &ConnectionProfile,
        request: CreateClusterRoleBinding,
    ) -> KubeResult<ClusterRoleBindingHandle>;

    /// Delete a cluster role binding.
    async fn delete_cluster_role_binding(
        &self,
        profile: &ConnectionProfile,
        binding: &ClusterRoleBindingHandle,
    ) -> KubeResult<()>;

    /// Create a CSR addressed to the client-auth signer.
    async fn create_certificate_request(
        &self,
        profile: &ConnectionProfile,
        request: SignCertificateRequest,
    ) -> KubeResult<CertificateRequestHandle>;

    /// Add an approval condition to a pending CSR.
    async fn approve_certificate_request(
        &self,
        profile: &ConnectionProfile,
        request: &CertificateRequestHandle,
    ) -> KubeResult<()>;

    /// Read the signed certificate PEM; `None` until the signer has issued it.
    async fn read_signed_certificate(
        &self,
        profile: &ConnectionProfile,
        request: &CertificateRequestHandle,
    ) -> KubeResult<Option<String>>;

    /// Delete a CSR object.
    async fn delete_certificate_request(
        &self,
        profile: &ConnectionProfile,
        request: &CertificateRequestHandle,
    ) -> KubeResult<()>;

    /// Find every cluster role binding and role binding naming `subject_name`.
    async fn list_bindings_for_subject(
        &self,
        profile: &ConnectionProfile,
        subject_name: &str,
    ) -> KubeResult<SubjectBindings>;

    /// Drop any connection state derived from a previous profile.
    async fn invalidate_cache(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_profile(token: &str) -> ConnectionProfile {
        ConnectionProfile {
            host: "https://cluster:6443".to_string(),
            ca_cert: "CA".to_string(),
            credential: ProfileCredential::BearerToken(SecretString::from(token)),
        }
    }

    #[test]
    fn test_policy_rule_wire_names() {
        let rule = PolicyRule {
            non_resource_urls: Some(vec!["/healthz".to_string()]),
            ..policy_rule(&[""], &["pods"], &["get"])
        };
        let json = serde_json::to_value(&rule).unwrap();
        assert_eq!(json["apiGroups"][0], "");
        assert_eq!(json["nonResourceURLs"][0], "/healthz");
        assert!(json.get("resourceNames").is_none());
    }

    #[test]
    fn test_stored_rule_without_optional_lists() {
        let rule: PolicyRule = serde_json::from_str(r#"{"verbs":["list"]}"#).unwrap();
        assert!(rule.api_groups.is_none());
        assert_eq!(rule.verbs, vec!["list"]);
    }

    #[test]
    fn test_user_subject_carries_rbac_group() {
        let subject = user_subject("alice-0a1b");
        let json = serde_json::to_value(&subject).unwrap();
        assert_eq!(json["kind"], "User");
        assert_eq!(json["apiGroup"], RBAC_API_GROUP);
        assert!(json.get("namespace").is_none());
    }

    #[test]
    fn test_cluster_role_ref() {
        let role = cluster_role_ref("view");
        assert_eq!(role.kind, CLUSTER_ROLE_KIND);
        assert_eq!(role.api_group, RBAC_API_GROUP);
    }

    #[test]
    fn test_profile_comparison() {
        assert!(token_profile("a").same_as(&token_profile("a")));
        assert!(!token_profile("a").same_as(&token_profile("b")));
    }

    #[test]
    fn test_kube_error_classification() {
        assert!(KubeError::not_found("Secret", "x").is_not_found());
        assert!(KubeError::Unavailable("busy".to_string()).is_retryable());
        assert!(!KubeError::Forbidden("no".to_string()).is_retryable());
        assert!(
            !KubeError::Api {
                status: 422,
                message: "invalid".to_string()
            }
            .is_retryable()
        );
    }
}
