//! Mock implementations for testing.
//!
//! [`FakeKubernetes`] is an in-memory cluster implementing the engine's
//! cluster capability, with knobs for slow token controllers, absent
//! signers, and injected API failures.

use async_trait::async_trait;
use k8s_secrets::kube::{
    CertificateRequestHandle, ClusterRoleBindingHandle, ClusterRoleHandle, ConnectionProfile,
    CreateClusterRole, CreateClusterRoleBinding, CreateRoleBinding, CreateServiceAccount,
    ExistingClusterRoleBinding, ExistingRoleBinding, KubeError, KubeResult, KubernetesApi,
    PolicyRule, ProfileCredential, RoleBindingHandle, RoleRef, ServiceAccountHandle,
    SignCertificateRequest, Subject, SubjectBindings, TokenSecretData, TokenSecretHandle,
    cluster_role_ref,
};
use k8s_secrets::{RootConfig, tls};
use secrecy::{ExposeSecret, SecretString};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// CA bundle the fake places in token secrets.
pub const FAKE_CLUSTER_CA: &str = "FAKE-CLUSTER-CA";

/// Operations of the cluster capability, for failure injection and call logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Create service account
    CreateServiceAccount,
    /// Create token secret
    CreateTokenSecret,
    /// Read token secret
    ReadTokenSecret,
    /// Delete secret
    DeleteSecret,
    /// Delete service account
    DeleteServiceAccount,
    /// Create cluster role
    CreateClusterRole,
    /// Delete cluster role
    DeleteClusterRole,
    /// Create role binding
    CreateRoleBinding,
    /// Delete role binding
    DeleteRoleBinding,
    /// Create cluster role binding
    CreateClusterRoleBinding,
    /// Delete cluster role binding
    DeleteClusterRoleBinding,
    /// Create a CSR
    CreateCertificateRequest,
    /// Approve a CSR
    ApproveCertificateRequest,
    /// Read a signed certificate
    ReadSignedCertificate,
    /// Delete a CSR
    DeleteCertificateRequest,
    /// List bindings naming a subject
    ListBindings,
}

#[derive(Debug, Clone)]
struct FailureRule {
    operation: Operation,
    skip: usize,
    remaining: Option<usize>,
}

/// A binding as stored by the fake.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredBinding {
    /// Referenced role
    pub role_ref: RoleRef,
    /// Bound subjects
    pub subjects: Vec<Subject>,
}

#[derive(Debug, Clone)]
struct StoredCsr {
    subject: String,
    approved: bool,
    reads: u32,
}

/// Names of every object in the fake cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    /// `namespace/name`
    pub service_accounts: BTreeSet<String>,
    /// `namespace/name`
    pub secrets: BTreeSet<String>,
    /// Cluster role names
    pub cluster_roles: BTreeSet<String>,
    /// Cluster role binding names
    pub cluster_role_bindings: BTreeSet<String>,
    /// `namespace/name`
    pub role_bindings: BTreeSet<String>,
    /// CSR names
    pub certificate_requests: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct ClusterState {
    service_accounts: BTreeSet<(String, String)>,
    secrets: BTreeMap<(String, String), u32>,
    cluster_roles: BTreeMap<String, Vec<PolicyRule>>,
    cluster_role_bindings: BTreeMap<String, StoredBinding>,
    role_bindings: BTreeMap<(String, String), StoredBinding>,
    csrs: BTreeMap<String, StoredCsr>,
    csr_expirations: Vec<Option<u32>>,
    counter: u64,
}

impl ClusterState {
    fn generate(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("{prefix}{:05x}", self.counter)
    }

    fn inventory(&self) -> Inventory {
        let ns_name = |(ns, name): &(String, String)| format!("{ns}/{name}");
        Inventory {
            service_accounts: self.service_accounts.iter().map(ns_name).collect(),
            secrets: self.secrets.keys().map(ns_name).collect(),
            cluster_roles: self.cluster_roles.keys().cloned().collect(),
            cluster_role_bindings: self.cluster_role_bindings.keys().cloned().collect(),
            role_bindings: self.role_bindings.keys().map(ns_name).collect(),
            certificate_requests: self.csrs.keys().cloned().collect(),
        }
    }

    fn names_subject(&self, subject_name: &str) -> bool {
        self.cluster_role_bindings
            .values()
            .chain(self.role_bindings.values())
            .any(|b| b.subjects.iter().any(|s| s.name == subject_name))
    }
}

/// In-memory cluster.
#[derive(Debug, Default)]
pub struct FakeKubernetes {
    state: RwLock<ClusterState>,
    failures: RwLock<Vec<FailureRule>>,
    calls: RwLock<Vec<(Operation, String)>>,
    token_delay_reads: AtomicU32,
    certificate_delay_reads: AtomicU32,
    invalidations: AtomicUsize,
}

impl FakeKubernetes {
    /// Create an empty cluster that fills tokens and signs CSRs immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty cluster behind an `Arc`.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Token secrets read as empty for the first `reads` reads.
    pub fn set_token_delay(&self, reads: u32) {
        self.token_delay_reads.store(reads, Ordering::SeqCst);
    }

    /// Token secrets are never populated.
    pub fn never_populate_tokens(&self) {
        self.set_token_delay(u32::MAX);
    }

    /// CSRs read as unsigned for the first `reads` reads.
    pub fn set_certificate_delay(&self, reads: u32) {
        self.certificate_delay_reads.store(reads, Ordering::SeqCst);
    }

    /// CSRs are never signed.
    pub fn never_sign_certificates(&self) {
        self.set_certificate_delay(u32::MAX);
    }

    /// Fail `operation` once, after it has succeeded `skip` times.
    pub async fn fail_once(&self, operation: Operation, skip: usize) {
        self.failures.write().await.push(FailureRule {
            operation,
            skip,
            remaining: Some(1),
        });
    }

    /// Fail every call to `operation`, after it has succeeded `skip` times.
    pub async fn fail_always(&self, operation: Operation, skip: usize) {
        self.failures.write().await.push(FailureRule {
            operation,
            skip,
            remaining: None,
        });
    }

    /// Remove all injected failures.
    pub async fn clear_failures(&self) {
        self.failures.write().await.clear();
    }

    /// Create a cluster role binding directly, bypassing failure injection.
    pub async fn seed_cluster_role_binding(&self, name: &str, role: &str, subject: Subject) {
        self.state.write().await.cluster_role_bindings.insert(
            name.to_string(),
            StoredBinding {
                role_ref: cluster_role_ref(role),
                subjects: vec![subject],
            },
        );
    }

    /// Create a role binding directly, bypassing failure injection.
    pub async fn seed_role_binding(&self, namespace: &str, name: &str, role: &str, subject: Subject) {
        self.state.write().await.role_bindings.insert(
            (namespace.to_string(), name.to_string()),
            StoredBinding {
                role_ref: cluster_role_ref(role),
                subjects: vec![subject],
            },
        );
    }

    /// Snapshot of every object name.
    pub async fn inventory(&self) -> Inventory {
        self.state.read().await.inventory()
    }

    /// Rules of every cluster role.
    pub async fn cluster_roles(&self) -> BTreeMap<String, Vec<PolicyRule>> {
        self.state.read().await.cluster_roles.clone()
    }

    /// Every cluster role binding.
    pub async fn cluster_role_bindings(&self) -> BTreeMap<String, StoredBinding> {
        self.state.read().await.cluster_role_bindings.clone()
    }

    /// Every role binding, keyed by namespace and name.
    pub async fn role_bindings(&self) -> BTreeMap<(String, String), StoredBinding> {
        self.state.read().await.role_bindings.clone()
    }

    /// Expiration hints of every CSR ever submitted.
    pub async fn csr_expirations(&self) -> Vec<Option<u32>> {
        self.state.read().await.csr_expirations.clone()
    }

    /// Operations performed, with the subject of the profile used.
    pub async fn calls(&self) -> Vec<(Operation, String)> {
        self.calls.read().await.clone()
    }

    /// Number of times connection state was invalidated.
    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }

    /// Whether any binding grants something to the subject of `config`.
    pub async fn authorizes(&self, config: &RootConfig) -> bool {
        match config.subject_name() {
            Ok(subject) => self.state.read().await.names_subject(&subject),
            Err(_) => false,
        }
    }

    async fn enter(&self, operation: Operation, profile: &ConnectionProfile) -> KubeResult<()> {
        self.calls
            .write()
            .await
            .push((operation, profile_subject(profile)));

        let mut failures = self.failures.write().await;
        for rule in failures.iter_mut().filter(|r| r.operation == operation) {
            if rule.skip > 0 {
                rule.skip -= 1;
                continue;
            }
            match rule.remaining.as_mut() {
                Some(0) => continue,
                Some(n) => *n -= 1,
                None => {}
            }
            return Err(KubeError::Unavailable(format!("injected failure: {operation:?}")));
        }
        Ok(())
    }
}

fn profile_subject(profile: &ConnectionProfile) -> String {
    match &profile.credential {
        ProfileCredential::BearerToken(token) => tls::service_account_from_token(token.expose_secret())
            .unwrap_or_else(|_| "<token>".to_string()),
        ProfileCredential::ClientCertificate { certificate, .. } => {
            tls::certificate_common_name(certificate).unwrap_or_else(|_| "<certificate>".to_string())
        }
    }
}

fn issue_certificate(subject: &str) -> KubeResult<String> {
    let key = rcgen::KeyPair::generate().map_err(|e| KubeError::InvalidResponse(e.to_string()))?;
    let mut params = rcgen::CertificateParams::default();
    params.distinguished_name = rcgen::DistinguishedName::new();
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, subject);
    params
        .self_signed(&key)
        .map(|cert| cert.pem())
        .map_err(|e| KubeError::InvalidResponse(e.to_string()))
}

#[async_trait]
impl KubernetesApi for FakeKubernetes {
    async fn create_service_account(
        &self,
        profile: &ConnectionProfile,
        request: CreateServiceAccount,
    ) -> KubeResult<ServiceAccountHandle> {
        self.enter(Operation::CreateServiceAccount, profile).await?;
        let mut state = self.state.write().await;
        let name = state.generate(&request.generate_name);
        state
            .service_accounts
            .insert((request.namespace.clone(), name.clone()));
        Ok(ServiceAccountHandle {
            name,
            namespace: request.namespace,
        })
    }

    async fn create_token_secret(
        &self,
        profile: &ConnectionProfile,
        account: &ServiceAccountHandle,
    ) -> KubeResult<TokenSecretHandle> {
        self.enter(Operation::CreateTokenSecret, profile).await?;
        let name = format!("{}-token", account.name);
        let mut state = self.state.write().await;
        let key = (account.namespace.clone(), name.clone());
        if state.secrets.contains_key(&key) {
            return Err(KubeError::AlreadyExists {
                kind: "Secret".to_string(),
                name,
            });
        }
        state.secrets.insert(key, 0);
        Ok(TokenSecretHandle {
            name,
            namespace: account.namespace.clone(),
        })
    }

    async fn read_token_secret(
        &self,
        profile: &ConnectionProfile,
        secret: &TokenSecretHandle,
    ) -> KubeResult<Option<TokenSecretData>> {
        self.enter(Operation::ReadTokenSecret, profile).await?;
        let delay = self.token_delay_reads.load(Ordering::SeqCst);
        let mut state = self.state.write().await;
        let reads = state
            .secrets
            .get_mut(&(secret.namespace.clone(), secret.name.clone()))
            .ok_or_else(|| KubeError::not_found("Secret", &secret.name))?;

        if *reads < delay {
            *reads += 1;
            return Ok(None);
        }
        Ok(Some(TokenSecretData {
            token: SecretString::from(format!("token-for-{}", secret.name)),
            ca_cert: FAKE_CLUSTER_CA.to_string(),
        }))
    }

    async fn delete_secret(
        &self,
        profile: &ConnectionProfile,
        secret: &TokenSecretHandle,
    ) -> KubeResult<()> {
        self.enter(Operation::DeleteSecret, profile).await?;
        self.state
            .write()
            .await
            .secrets
            .remove(&(secret.namespace.clone(), secret.name.clone()))
            .map(|_| ())
            .ok_or_else(|| KubeError::not_found("Secret", &secret.name))
    }

    async fn delete_service_account(
        &self,
        profile: &ConnectionProfile,
        account: &ServiceAccountHandle,
    ) -> KubeResult<()> {
        self.enter(Operation::DeleteServiceAccount, profile).await?;
        let removed = self
            .state
            .write()
            .await
            .service_accounts
            .remove(&(account.namespace.clone(), account.name.clone()));
        if removed {
            Ok(())
        } else {
            Err(KubeError::not_found("ServiceAccount", &account.name))
        }
    }

    async fn create_cluster_role(
        &self,
        profile: &ConnectionProfile,
        request: CreateClusterRole,
    ) -> KubeResult<ClusterRoleHandle> {
        self.enter(Operation::CreateClusterRole, profile).await?;
        let mut state = self.state.write().await;
        let name = state.generate(&request.generate_name);
        state.cluster_roles.insert(name.clone(), request.rules);
        Ok(ClusterRoleHandle { name })
    }

    async fn delete_cluster_role(
        &self,
        profile: &ConnectionProfile,
        role: &ClusterRoleHandle,
    ) -> KubeResult<()> {
        self.enter(Operation::DeleteClusterRole, profile).await?;
        self.state
            .write()
            .await
            .cluster_roles
            .remove(&role.name)
            .map(|_| ())
            .ok_or_else(|| KubeError::not_found("ClusterRole", &role.name))
    }

    async fn create_role_binding(
        &self,
        profile: &ConnectionProfile,
        request: CreateRoleBinding,
    ) -> KubeResult<RoleBindingHandle> {
        self.enter(Operation::CreateRoleBinding, profile).await?;
        let mut state = self.state.write().await;
        let name = state.generate(&request.generate_name);
        state.role_bindings.insert(
            (request.namespace.clone(), name.clone()),
            StoredBinding {
                role_ref: request.role_ref,
                subjects: vec![request.subject],
            },
        );
        Ok(RoleBindingHandle {
            name,
            namespace: request.namespace,
        })
    }

    async fn delete_role_binding(
        &self,
        profile: &ConnectionProfile,
        binding: &RoleBindingHandle,
    ) -> KubeResult<()> {
        self.enter(Operation::DeleteRoleBinding, profile).await?;
        self.state
            .write()
            .await
            .role_bindings
            .remove(&(binding.namespace.clone(), binding.name.clone()))
            .map(|_| ())
            .ok_or_else(|| KubeError::not_found("RoleBinding", &binding.name))
    }

    async fn create_cluster_role_binding(
        &self,
        profile: &ConnectionProfile,
        request: CreateClusterRoleBinding,
    ) -> KubeResult<ClusterRoleBindingHandle> {
        self.enter(Operation::CreateClusterRoleBinding, profile).await?;
        let mut state = self.state.write().await;
        let name = state.generate(&request.generate_name);
        state.cluster_role_bindings.insert(
            name.clone(),
            StoredBinding {
                role_ref: request.role_ref,
                subjects: vec![request.subject],
            },
        );
        Ok(ClusterRoleBindingHandle { name })
    }

    async fn delete_cluster_role_binding(
        &self,
        profile: &ConnectionProfile,
        binding: &ClusterRoleBindingHandle,
    ) -> KubeResult<()> {
        self.enter(Operation::DeleteClusterRoleBinding, profile).await?;
        self.state
            .write()
            .await
            .cluster_role_bindings
            .remove(&binding.name)
            .map(|_| ())
            .ok_or_else(|| KubeError::not_found("ClusterRoleBinding", &binding.name))
    }

    async fn create_certificate_request(
        &self,
        profile: &ConnectionProfile,
        request: SignCertificateRequest,
    ) -> KubeResult<CertificateRequestHandle> {
        self.enter(Operation::CreateCertificateRequest, profile).await?;
        if !request.csr_pem.contains("BEGIN CERTIFICATE REQUEST") {
            return Err(KubeError::Api {
                status: 422,
                message: "request is not a PEM certificate request".to_string(),
            });
        }
        let mut state = self.state.write().await;
        if state.csrs.contains_key(&request.name) {
            return Err(KubeError::AlreadyExists {
                kind: "CertificateSigningRequest".to_string(),
                name: request.name,
            });
        }
        state.csr_expirations.push(request.expiration_seconds);
        state.csrs.insert(
            request.name.clone(),
            StoredCsr {
                subject: request.name.clone(),
                approved: false,
                reads: 0,
            },
        );
        Ok(CertificateRequestHandle { name: request.name })
    }

    async fn approve_certificate_request(
        &self,
        profile: &ConnectionProfile,
        request: &CertificateRequestHandle,
    ) -> KubeResult<()> {
        self.enter(Operation::ApproveCertificateRequest, profile).await?;
        let mut state = self.state.write().await;
        let csr = state
            .csrs
            .get_mut(&request.name)
            .ok_or_else(|| KubeError::not_found("CertificateSigningRequest", &request.name))?;
        csr.approved = true;
        Ok(())
    }

    async fn read_signed_certificate(
        &self,
        profile: &ConnectionProfile,
        request: &CertificateRequestHandle,
    ) -> KubeResult<Option<String>> {
        self.enter(Operation::ReadSignedCertificate, profile).await?;
        let delay = self.certificate_delay_reads.load(Ordering::SeqCst);
        let subject = {
            let mut state = self.state.write().await;
            let csr = state
                .csrs
                .get_mut(&request.name)
                .ok_or_else(|| KubeError::not_found("CertificateSigningRequest", &request.name))?;
            if !csr.approved {
                return Ok(None);
            }
            if csr.reads < delay {
                csr.reads += 1;
                return Ok(None);
            }
            csr.subject.clone()
        };
        issue_certificate(&subject).map(Some)
    }

    async fn delete_certificate_request(
        &self,
        profile: &ConnectionProfile,
        request: &CertificateRequestHandle,
    ) -> KubeResult<()> {
        self.enter(Operation::DeleteCertificateRequest, profile).await?;
        self.state
            .write()
            .await
            .csrs
            .remove(&request.name)
            .map(|_| ())
            .ok_or_else(|| KubeError::not_found("CertificateSigningRequest", &request.name))
    }

    async fn list_bindings_for_subject(
        &self,
        profile: &ConnectionProfile,
        subject_name: &str,
    ) -> KubeResult<SubjectBindings> {
        self.enter(Operation::ListBindings, profile).await?;
        let state = self.state.read().await;
        let names = |b: &StoredBinding| b.subjects.iter().any(|s| s.name == subject_name);

        Ok(SubjectBindings {
            cluster_role_bindings: state
                .cluster_role_bindings
                .iter()
                .filter(|(_, b)| names(b))
                .map(|(name, b)| ExistingClusterRoleBinding {
                    name: name.clone(),
                    role_ref: b.role_ref.clone(),
                    subjects: b.subjects.clone(),
                })
                .collect(),
            role_bindings: state
                .role_bindings
                .iter()
                .filter(|(_, b)| names(b))
                .map(|((namespace, name), b)| ExistingRoleBinding {
                    name: name.clone(),
                    namespace: namespace.clone(),
                    role_ref: b.role_ref.clone(),
                    subjects: b.subjects.clone(),
                })
                .collect(),
        })
    }

    async fn invalidate_cache(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}
