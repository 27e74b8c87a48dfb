//! [`KubernetesApi`] over the typed `kube` client.

use super::{
    CertificateRequestHandle, ClientCache, ClusterRoleBindingHandle, ClusterRoleHandle,
    ConnectionProfile, CreateClusterRole, CreateClusterRoleBinding, CreateRoleBinding,
    CreateServiceAccount, ExistingClusterRoleBinding, ExistingRoleBinding, KubeError, KubeResult,
    KubernetesApi, RoleBindingHandle, ServiceAccountHandle, SignCertificateRequest, Subject,
    SubjectBindings, TokenSecretData, TokenSecretHandle,
};
use crate::settings::EngineSettings;
use ::kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition, CertificateSigningRequestSpec,
    CertificateSigningRequestStatus,
};
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rust_common::{HttpConfig, RetryConfig, RetryPolicy};
use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::{debug, instrument};

const CLIENT_AUTH_SIGNER: &str = "kubernetes.io/kube-apiserver-client";
const SERVICE_ACCOUNT_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";
const SERVICE_ACCOUNT_NAME_ANNOTATION: &str = "kubernetes.io/service-account.name";
const APPROVAL_REASON: &str = "Vault user activation";
const APPROVAL_MESSAGE: &str = "This CSR was approved by the secrets engine";

/// Cluster client speaking the Kubernetes API.
///
/// Reads, lists and deletes are retried on transient failures; creates are
/// not, since a create that timed out may still have taken effect.
pub struct HttpKubernetesApi {
    cache: ClientCache,
    retry: RetryPolicy,
}

impl HttpKubernetesApi {
    /// Create a client whose connections get the timeouts in `http`.
    #[must_use]
    pub fn new(http: HttpConfig) -> Self {
        Self {
            cache: ClientCache::new(http),
            retry: RetryPolicy::default(),
        }
    }

    /// Create a client using the transport settings of the engine.
    #[must_use]
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self::new(settings.http.clone())
    }

    /// Override the retry policy for idempotent calls.
    #[must_use]
    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = RetryPolicy::new(config);
        self
    }

    async fn client(&self, profile: &ConnectionProfile) -> KubeResult<::kube::Client> {
        self.cache.client_for(profile).await
    }

    async fn get<K>(&self, api: &Api<K>, kind: &str, name: &str) -> KubeResult<K>
    where
        K: Clone + DeserializeOwned + Debug,
    {
        self.retry
            .execute(|| async move { api.get(name).await.map_err(|e| classify(e, kind, name)) })
            .await
    }

    async fn delete<K>(&self, api: &Api<K>, kind: &str, name: &str) -> KubeResult<()>
    where
        K: Clone + DeserializeOwned + Debug,
    {
        debug!(kind, name, "deleting");
        self.retry
            .execute(|| async move {
                api.delete(name, &DeleteParams::default())
                    .await
                    .map(|_| ())
                    .map_err(|e| classify(e, kind, name))
            })
            .await
    }

    async fn list<K>(&self, api: &Api<K>, kind: &str) -> KubeResult<Vec<K>>
    where
        K: Clone + DeserializeOwned + Debug,
    {
        self.retry
            .execute(|| async move {
                api.list(&ListParams::default())
                    .await
                    .map(|list| list.items)
                    .map_err(|e| classify(e, kind, ""))
            })
            .await
    }
}

/// Map a client error onto the engine's error kinds.
fn classify(error: ::kube::Error, kind: &str, name: &str) -> KubeError {
    match error {
        ::kube::Error::Api(response) => match response.code {
            404 => KubeError::not_found(kind, name),
            409 => KubeError::AlreadyExists {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            401 | 403 => KubeError::Forbidden(response.message),
            code if code == 429 || code >= 500 => {
                KubeError::Unavailable(format!("status {code}: {}", response.message))
            }
            code => KubeError::Api {
                status: code,
                message: response.message,
            },
        },
        ::kube::Error::SerdeError(e) => KubeError::InvalidResponse(e.to_string()),
        ::kube::Error::HyperError(e) => KubeError::Unavailable(e.to_string()),
        ::kube::Error::Service(e) => KubeError::Unavailable(e.to_string()),
        other => KubeError::ClientSetup(other.to_string()),
    }
}

fn generated(generate_name: &str) -> ObjectMeta {
    ObjectMeta {
        generate_name: Some(generate_name.to_string()),
        ..ObjectMeta::default()
    }
}

fn assigned_name(metadata: ObjectMeta, kind: &str) -> KubeResult<String> {
    metadata
        .name
        .ok_or_else(|| KubeError::InvalidResponse(format!("created {kind} has no name")))
}

fn decode_field(
    data: &BTreeMap<String, ByteString>,
    key: &str,
) -> KubeResult<Option<String>> {
    let Some(ByteString(raw)) = data.get(key).filter(|v| !v.0.is_empty()) else {
        return Ok(None);
    };
    String::from_utf8(raw.clone())
        .map(Some)
        .map_err(|e| KubeError::InvalidResponse(format!("{key}: {e}")))
}

fn names_subject(subjects: Option<&Vec<Subject>>, subject_name: &str) -> bool {
    subjects.is_some_and(|subjects| subjects.iter().any(|s| s.name == subject_name))
}

#[async_trait]
impl KubernetesApi for HttpKubernetesApi {
    #[instrument(skip(self, profile, request), fields(namespace = %request.namespace))]
    async fn create_service_account(
        &self,
        profile: &ConnectionProfile,
        request: CreateServiceAccount,
    ) -> KubeResult<ServiceAccountHandle> {
        let api: Api<ServiceAccount> =
            Api::namespaced(self.client(profile).await?, &request.namespace);
        let account = ServiceAccount {
            metadata: generated(&request.generate_name),
            ..ServiceAccount::default()
        };
        let created = api
            .create(&PostParams::default(), &account)
            .await
            .map_err(|e| classify(e, "ServiceAccount", &request.generate_name))?;

        let namespace = created
            .metadata
            .namespace
            .clone()
            .unwrap_or(request.namespace);
        Ok(ServiceAccountHandle {
            name: assigned_name(created.metadata, "ServiceAccount")?,
            namespace,
        })
    }

    #[instrument(skip(self, profile), fields(account = %account.name))]
    async fn create_token_secret(
        &self,
        profile: &ConnectionProfile,
        account: &ServiceAccountHandle,
    ) -> KubeResult<TokenSecretHandle> {
        let api: Api<Secret> = Api::namespaced(self.client(profile).await?, &account.namespace);
        let name = format!("{}-token", account.name);
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(account.namespace.clone()),
                annotations: Some(BTreeMap::from([(
                    SERVICE_ACCOUNT_NAME_ANNOTATION.to_string(),
                    account.name.clone(),
                )])),
                ..ObjectMeta::default()
            },
            type_: Some(SERVICE_ACCOUNT_TOKEN_TYPE.to_string()),
            ..Secret::default()
        };
        let created = api
            .create(&PostParams::default(), &secret)
            .await
            .map_err(|e| classify(e, "Secret", &name))?;

        Ok(TokenSecretHandle {
            name: created.metadata.name.unwrap_or(name),
            namespace: account.namespace.clone(),
        })
    }

    async fn read_token_secret(
        &self,
        profile: &ConnectionProfile,
        secret: &TokenSecretHandle,
    ) -> KubeResult<Option<TokenSecretData>> {
        let api: Api<Secret> = Api::namespaced(self.client(profile).await?, &secret.namespace);
        let object = self.get(&api, "Secret", &secret.name).await?;
        let data = object.data.unwrap_or_default();

        let Some(token) = decode_field(&data, "token")? else {
            return Ok(None);
        };
        let ca_cert = decode_field(&data, "ca.crt")?.unwrap_or_default();
        Ok(Some(TokenSecretData {
            token: SecretString::from(token),
            ca_cert,
        }))
    }

    async fn delete_secret(
        &self,
        profile: &ConnectionProfile,
        secret: &TokenSecretHandle,
    ) -> KubeResult<()> {
        let api: Api<Secret> = Api::namespaced(self.client(profile).await?, &secret.namespace);
        self.delete(&api, "Secret", &secret.name).await
    }

    async fn delete_service_account(
        &self,
        profile: &ConnectionProfile,
        account: &ServiceAccountHandle,
    ) -> KubeResult<()> {
        let api: Api<ServiceAccount> =
            Api::namespaced(self.client(profile).await?, &account.namespace);
        self.delete(&api, "ServiceAccount", &account.name).await
    }

    #[instrument(skip(self, profile, request), fields(rules = request.rules.len()))]
    async fn create_cluster_role(
        &self,
        profile: &ConnectionProfile,
        request: CreateClusterRole,
    ) -> KubeResult<ClusterRoleHandle> {
        let api: Api<ClusterRole> = Api::all(self.client(profile).await?);
        let role = ClusterRole {
            metadata: generated(&request.generate_name),
            rules: Some(request.rules),
            ..ClusterRole::default()
        };
        let created = api
            .create(&PostParams::default(), &role)
            .await
            .map_err(|e| classify(e, "ClusterRole", &request.generate_name))?;

        Ok(ClusterRoleHandle {
            name: assigned_name(created.metadata, "ClusterRole")?,
        })
    }

    async fn delete_cluster_role(
        &self,
        profile: &ConnectionProfile,
        role: &ClusterRoleHandle,
    ) -> KubeResult<()> {
        let api: Api<ClusterRole> = Api::all(self.client(profile).await?);
        self.delete(&api, "ClusterRole", &role.name).await
    }

    #[instrument(skip(self, profile, request), fields(namespace = %request.namespace, role = %request.role_ref.name))]
    async fn create_role_binding(
        &self,
        profile: &ConnectionProfile,
        request: CreateRoleBinding,
    ) -> KubeResult<RoleBindingHandle> {
        let api: Api<RoleBinding> =
            Api::namespaced(self.client(profile).await?, &request.namespace);
        let binding = RoleBinding {
            metadata: generated(&request.generate_name),
            role_ref: request.role_ref,
            subjects: Some(vec![request.subject]),
        };
        let created = api
            .create(&PostParams::default(), &binding)
            .await
            .map_err(|e| classify(e, "RoleBinding", &request.generate_name))?;

        let namespace = created
            .metadata
            .namespace
            .clone()
            .unwrap_or(request.namespace);
        Ok(RoleBindingHandle {
            name: assigned_name(created.metadata, "RoleBinding")?,
            namespace,
        })
    }

    async fn delete_role_binding(
        &self,
        profile: &ConnectionProfile,
        binding: &RoleBindingHandle,
    ) -> KubeResult<()> {
        let api: Api<RoleBinding> =
            Api::namespaced(self.client(profile).await?, &binding.namespace);
        self.delete(&api, "RoleBinding", &binding.name).await
    }

    #[instrument(skip(self, profile, request), fields(role = %request.role_ref.name))]
    async fn create_cluster_role_binding(
        &self,
        profile: &ConnectionProfile,
        request: CreateClusterRoleBinding,
    ) -> KubeResult<ClusterRoleBindingHandle> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client(profile).await?);
        let binding = ClusterRoleBinding {
            metadata: generated(&request.generate_name),
            role_ref: request.role_ref,
            subjects: Some(vec![request.subject]),
        };
        let created = api
            .create(&PostParams::default(), &binding)
            .await
            .map_err(|e| classify(e, "ClusterRoleBinding", &request.generate_name))?;

        Ok(ClusterRoleBindingHandle {
            name: assigned_name(created.metadata, "ClusterRoleBinding")?,
        })
    }

    async fn delete_cluster_role_binding(
        &self,
        profile: &ConnectionProfile,
        binding: &ClusterRoleBindingHandle,
    ) -> KubeResult<()> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client(profile).await?);
        self.delete(&api, "ClusterRoleBinding", &binding.name).await
    }

    #[instrument(skip(self, profile, request), fields(name = %request.name))]
    async fn create_certificate_request(
        &self,
        profile: &ConnectionProfile,
        request: SignCertificateRequest,
    ) -> KubeResult<CertificateRequestHandle> {
        let api: Api<CertificateSigningRequest> = Api::all(self.client(profile).await?);
        let csr = CertificateSigningRequest {
            metadata: ObjectMeta {
                name: Some(request.name.clone()),
                ..ObjectMeta::default()
            },
            spec: CertificateSigningRequestSpec {
                request: ByteString(request.csr_pem.into_bytes()),
                signer_name: CLIENT_AUTH_SIGNER.to_string(),
                usages: Some(vec!["client auth".to_string()]),
                groups: Some(vec!["system:authenticated".to_string()]),
                expiration_seconds: request
                    .expiration_seconds
                    .map(|s| i32::try_from(s).unwrap_or(i32::MAX)),
                ..CertificateSigningRequestSpec::default()
            },
            status: None,
        };
        api.create(&PostParams::default(), &csr)
            .await
            .map_err(|e| classify(e, "CertificateSigningRequest", &request.name))?;

        Ok(CertificateRequestHandle { name: request.name })
    }

    #[instrument(skip(self, profile), fields(name = %request.name))]
    async fn approve_certificate_request(
        &self,
        profile: &ConnectionProfile,
        request: &CertificateRequestHandle,
    ) -> KubeResult<()> {
        let api: Api<CertificateSigningRequest> = Api::all(self.client(profile).await?);
        let status = CertificateSigningRequestStatus {
            conditions: Some(vec![CertificateSigningRequestCondition {
                type_: "Approved".to_string(),
                status: "True".to_string(),
                reason: Some(APPROVAL_REASON.to_string()),
                message: Some(APPROVAL_MESSAGE.to_string()),
                ..CertificateSigningRequestCondition::default()
            }]),
            ..CertificateSigningRequestStatus::default()
        };
        api.patch_approval(
            &request.name,
            &PatchParams::default(),
            &Patch::Merge(json!({ "status": status })),
        )
        .await
        .map_err(|e| classify(e, "CertificateSigningRequest", &request.name))?;
        Ok(())
    }

    async fn read_signed_certificate(
        &self,
        profile: &ConnectionProfile,
        request: &CertificateRequestHandle,
    ) -> KubeResult<Option<String>> {
        let api: Api<CertificateSigningRequest> = Api::all(self.client(profile).await?);
        let object = self
            .get(&api, "CertificateSigningRequest", &request.name)
            .await?;

        let Some(ByteString(raw)) = object
            .status
            .and_then(|status| status.certificate)
            .filter(|c| !c.0.is_empty())
        else {
            return Ok(None);
        };
        String::from_utf8(raw)
            .map(Some)
            .map_err(|e| KubeError::InvalidResponse(format!("certificate: {e}")))
    }

    async fn delete_certificate_request(
        &self,
        profile: &ConnectionProfile,
        request: &CertificateRequestHandle,
    ) -> KubeResult<()> {
        let api: Api<CertificateSigningRequest> = Api::all(self.client(profile).await?);
        self.delete(&api, "CertificateSigningRequest", &request.name)
            .await
    }

    #[instrument(skip(self, profile))]
    async fn list_bindings_for_subject(
        &self,
        profile: &ConnectionProfile,
        subject_name: &str,
    ) -> KubeResult<SubjectBindings> {
        let client = self.client(profile).await?;

        let cluster_api: Api<ClusterRoleBinding> = Api::all(client.clone());
        let cluster_role_bindings = self
            .list(&cluster_api, "ClusterRoleBindingList")
            .await?
            .into_iter()
            .filter(|b| names_subject(b.subjects.as_ref(), subject_name))
            .map(|b| ExistingClusterRoleBinding {
                name: b.metadata.name.unwrap_or_default(),
                role_ref: b.role_ref,
                subjects: b.subjects.unwrap_or_default(),
            })
            .collect();

        let namespaced_api: Api<RoleBinding> = Api::all(client);
        let role_bindings = self
            .list(&namespaced_api, "RoleBindingList")
            .await?
            .into_iter()
            .filter(|b| names_subject(b.subjects.as_ref(), subject_name))
            .map(|b| ExistingRoleBinding {
                name: b.metadata.name.unwrap_or_default(),
                namespace: b.metadata.namespace.unwrap_or_default(),
                role_ref: b.role_ref,
                subjects: b.subjects.unwrap_or_default(),
            })
            .collect();

        Ok(SubjectBindings {
            cluster_role_bindings,
            role_bindings,
        })
    }

    async fn invalidate_cache(&self) {
        self.cache.invalidate().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kube::ProfileCredential;
    use ::kube::core::ErrorResponse;
    use std::time::Duration;

    fn api_error(code: u16) -> ::kube::Error {
        ::kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {code}"),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn test_classify_api_statuses() {
        assert!(classify(api_error(404), "Secret", "s").is_not_found());
        assert!(matches!(
            classify(api_error(409), "Secret", "s"),
            KubeError::AlreadyExists { .. }
        ));
        assert!(matches!(
            classify(api_error(403), "Secret", "s"),
            KubeError::Forbidden(_)
        ));
        assert!(classify(api_error(503), "Secret", "s").is_retryable());
        assert!(classify(api_error(429), "Secret", "s").is_retryable());
        assert!(matches!(
            classify(api_error(422), "Secret", "s"),
            KubeError::Api { status: 422, .. }
        ));
    }

    #[test]
    fn test_decode_field_skips_empty_values() {
        let data = BTreeMap::from([
            ("token".to_string(), ByteString(Vec::new())),
            ("ca.crt".to_string(), ByteString(b"CA".to_vec())),
        ]);
        assert_eq!(decode_field(&data, "token").unwrap(), None);
        assert_eq!(decode_field(&data, "ca.crt").unwrap(), Some("CA".to_string()));
    }

    #[tokio::test]
    async fn test_from_settings_applies_transport_timeouts() {
        let http = HttpConfig::default()
            .with_timeout(Duration::from_secs(12))
            .with_connect_timeout(Duration::from_secs(4));
        let api = HttpKubernetesApi::from_settings(&EngineSettings::default().with_http(http));

        let key = rcgen::KeyPair::generate().unwrap();
        let ca = rcgen::CertificateParams::default()
            .self_signed(&key)
            .unwrap()
            .pem();
        let profile = ConnectionProfile {
            host: "https://cluster:6443".to_string(),
            ca_cert: ca,
            credential: ProfileCredential::BearerToken(SecretString::from("root")),
        };

        let config = api.cache.config_for(&profile).await.unwrap();
        assert_eq!(config.read_timeout, Some(Duration::from_secs(12)));
        assert_eq!(config.connect_timeout, Some(Duration::from_secs(4)));
    }
}
