//! End-to-end tests for the k8s-secrets engine.
//!
//! Each test drives the engine facade against an in-memory cluster and
//! checks the cluster state it leaves behind.

use k8s_secrets::config::{self, RootConfig};
use k8s_secrets::kube::service_account_subject;
use k8s_secrets::lease::{KEY_IDENTITY, KEY_ROLE_BINDINGS};
use k8s_secrets::rotation::RootRotation;
use k8s_secrets::{
    EngineSettings, InMemoryStorage, RoleSpec, RoleUpdate, SecretsBackend, SecretsEngineError,
    Storage,
};
use rust_common::{RetryConfig, TracingConfig, init_tracing};
use secrecy::ExposeSecret;
use std::sync::Arc;
use std::time::Duration;
use test_utils::fixtures;
use test_utils::mocks::{FakeKubernetes, Inventory, Operation};

const HOUR: Duration = Duration::from_secs(3600);

struct Harness {
    fake: Arc<FakeKubernetes>,
    storage: Arc<InMemoryStorage>,
    backend: SecretsBackend,
}

impl Harness {
    async fn new() -> Self {
        Self::with_settings(fixtures::fast_settings()).await
    }

    async fn with_settings(settings: EngineSettings) -> Self {
        init_tracing(&TracingConfig::from_env().with_directive("k8s_secrets=debug"));
        let fake = FakeKubernetes::shared();
        let storage = Arc::new(InMemoryStorage::new());
        let backend = SecretsBackend::new(fake.clone(), storage.clone(), settings);
        backend.write_config(fixtures::root_config()).await.unwrap();
        Self {
            fake,
            storage,
            backend,
        }
    }

    async fn put_role(&self, name: &str, role: &RoleSpec) {
        self.backend.write_role(name, update_from(role)).await.unwrap();
    }

    async fn stored_config(&self) -> RootConfig {
        config::get_config(self.storage.as_ref()).await.unwrap()
    }

    async fn seed_root_bindings(&self) {
        let root = service_account_subject(fixtures::ROOT_SERVICE_ACCOUNT, "kube-system");
        self.fake
            .seed_cluster_role_binding("vault-root-admin", "cluster-admin", root.clone())
            .await;
        self.fake
            .seed_role_binding("dev", "vault-root-dev", "admin", root)
            .await;
    }
}

fn update_from(role: &RoleSpec) -> RoleUpdate {
    RoleUpdate {
        credential_type: Some(role.credential_type.as_str().to_string()),
        binding_rules: Some(serde_json::to_string(&role.binding_rules).unwrap()),
        service_account_namespace: Some(role.service_account_namespace.clone()),
        list_namespaces: Some(role.list_namespaces),
        view_nodes: Some(role.view_nodes),
        ttl: Some(role.ttl.as_secs()),
        max_ttl: Some(role.max_ttl.as_secs()),
    }
}

mod issuance {
    use super::*;

    #[tokio::test]
    async fn test_issue_then_revoke_restores_cluster() {
        let h = Harness::new().await;
        h.put_role("fan", &fixtures::fan_out_role()).await;

        let issued = h.backend.issue_credentials("fan", None, "ci-bot").await.unwrap();
        let inventory = h.fake.inventory().await;
        assert_eq!(inventory.service_accounts.len(), 1);
        assert_eq!(inventory.secrets.len(), 1);
        assert_eq!(inventory.cluster_roles.len(), 1);
        assert_eq!(inventory.role_bindings.len(), 3);
        assert!(inventory.cluster_role_bindings.is_empty());

        let report = h.backend.revoke(&issued.lease.payload).await.unwrap();
        assert_eq!(report.deleted, 6);
        assert_eq!(h.fake.inventory().await, Inventory::default());

        let again = h.backend.revoke(&issued.lease.payload).await.unwrap();
        assert_eq!(again.deleted, 0);
        assert_eq!(again.already_absent, 6);
    }

    #[tokio::test]
    async fn test_token_credentials_and_kubeconfig() {
        let h = Harness::new().await;
        h.put_role("ci", &fixtures::token_role()).await;

        let issued = h.backend.issue_credentials("ci", None, "ci-bot").await.unwrap();
        let data = issued.data.to_response_data();
        let token = data["token"].as_str().unwrap();
        assert!(token.starts_with("token-for-"));
        assert_eq!(data["user_cert"], "");
        assert_eq!(data["host"], fixtures::CLUSTER_HOST);

        let kube_config = data["kube_config"].as_str().unwrap();
        assert!(kube_config.contains(&format!("token: {token}")));
        assert!(kube_config.contains(&format!("server: {}", fixtures::CLUSTER_HOST)));
        assert!(kube_config.contains("client-key-data: ~"));

        assert_eq!(issued.lease.secret_type, "rbac");
        assert!(!issued.lease.renewable);
        let account = h.fake.inventory().await.service_accounts;
        assert!(account.iter().all(|sa| sa.starts_with("ci/vault-")));
    }

    #[tokio::test]
    async fn test_certificate_credentials() {
        let h = Harness::new().await;
        h.put_role("certs", &fixtures::certificate_role()).await;

        let issued = h
            .backend
            .issue_credentials("certs", None, "Alice")
            .await
            .unwrap();
        let data = issued.data.to_response_data();
        assert_eq!(data["token"], "");
        assert!(!data["user_cert"].as_str().unwrap().is_empty());
        assert!(!data["user_key"].as_str().unwrap().is_empty());
        assert!(data["kube_config"].as_str().unwrap().contains("token: ~"));

        let bindings = h.fake.role_bindings().await;
        let binding = bindings.values().next().unwrap();
        assert_eq!(binding.subjects[0].kind, "User");
        assert!(binding.subjects[0].name.starts_with("alice-"));
        assert!(h.fake.inventory().await.service_accounts.is_empty());

        h.backend.revoke(&issued.lease.payload).await.unwrap();
        assert_eq!(h.fake.inventory().await, Inventory::default());
    }

    #[tokio::test]
    async fn test_wildcard_binds_cluster_wide() {
        let h = Harness::new().await;
        h.put_role("wide", &fixtures::wildcard_role()).await;

        h.backend.issue_credentials("wide", None, "ops").await.unwrap();

        let inventory = h.fake.inventory().await;
        assert_eq!(inventory.cluster_role_bindings.len(), 1);
        assert!(inventory.role_bindings.is_empty());
    }

    #[tokio::test]
    async fn test_built_in_rule_is_injected() {
        let h = Harness::new().await;
        h.put_role("lister", &fixtures::list_namespaces_role()).await;

        h.backend.issue_credentials("lister", None, "ops").await.unwrap();

        let roles = h.fake.cluster_roles().await;
        assert_eq!(roles.len(), 1);
        let rules = roles.values().next().unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].resources, Some(vec!["namespaces".to_string()]));
        assert_eq!(rules[0].verbs, vec!["list".to_string()]);
        assert_eq!(h.fake.inventory().await.cluster_role_bindings.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_role() {
        let h = Harness::new().await;
        let err = h.backend.issue_credentials("nope", None, "x").await.unwrap_err();
        assert!(matches!(err, SecretsEngineError::RoleNotFound(name) if name == "nope"));
    }
}

mod ttl {
    use super::*;

    #[tokio::test]
    async fn test_zero_requested_ttl_uses_defaults() {
        let h = Harness::new().await;
        h.backend
            .write_config(fixtures::root_config().with_default_ttls(2 * HOUR, 4 * HOUR))
            .await
            .unwrap();
        h.put_role("ci", &fixtures::token_role()).await;

        for requested in [None, Some(Duration::ZERO)] {
            let issued = h.backend.issue_credentials("ci", requested, "x").await.unwrap();
            assert_eq!(issued.lease.ttl, 2 * HOUR);
            assert_eq!(issued.lease.max_ttl, 4 * HOUR);
        }
    }

    #[tokio::test]
    async fn test_requested_ttl_is_clamped() {
        let h = Harness::new().await;
        let role = RoleSpec {
            max_ttl: 3 * HOUR,
            ..fixtures::token_role()
        };
        h.put_role("ci", &role).await;

        let issued = h
            .backend
            .issue_credentials("ci", Some(10 * HOUR), "x")
            .await
            .unwrap();
        assert_eq!(issued.lease.ttl, 3 * HOUR);
        assert_eq!(issued.lease.max_ttl, 3 * HOUR);
    }

    #[tokio::test]
    async fn test_system_limit_caps_everything() {
        let settings = fixtures::fast_settings().with_system_max_ttl(HOUR);
        let h = Harness::with_settings(settings).await;
        let role = RoleSpec {
            max_ttl: 48 * HOUR,
            ..fixtures::token_role()
        };
        h.put_role("ci", &role).await;

        let issued = h.backend.issue_credentials("ci", None, "x").await.unwrap();
        assert_eq!(issued.lease.max_ttl, HOUR);
        assert_eq!(issued.lease.ttl, HOUR);
    }

    #[tokio::test]
    async fn test_certificate_role_minimum_ttl() {
        let h = Harness::new().await;
        let role = RoleSpec {
            ttl: Duration::from_secs(300),
            ..fixtures::certificate_role()
        };
        let err = h.backend.write_role("short", update_from(&role)).await.unwrap_err();
        assert!(matches!(err, SecretsEngineError::InvalidRole(_)));
        assert!(h.backend.list_roles().await.unwrap().is_empty());
    }
}

mod rollback {
    use super::*;

    #[tokio::test]
    async fn test_binding_failure_rolls_back_everything() {
        let h = Harness::new().await;
        h.put_role("fan", &fixtures::fan_out_role()).await;
        h.fake.fail_once(Operation::CreateRoleBinding, 2).await;

        let err = h.backend.issue_credentials("fan", None, "x").await.unwrap_err();

        assert!(matches!(err, SecretsEngineError::BindingProvisioningFailed { .. }));
        assert_eq!(h.fake.inventory().await, Inventory::default());
    }

    #[tokio::test]
    async fn test_token_wait_failure_rolls_back() {
        let h = Harness::new().await;
        h.put_role("ci", &fixtures::token_role()).await;
        h.fake.never_populate_tokens();

        let err = h.backend.issue_credentials("ci", None, "x").await.unwrap_err();

        assert!(matches!(err, SecretsEngineError::IdentityProvisioningFailed { .. }));
        assert_eq!(h.fake.inventory().await, Inventory::default());
    }

    #[tokio::test]
    async fn test_failed_rollback_reports_orphans() {
        let h = Harness::new().await;
        h.put_role("fan", &fixtures::fan_out_role()).await;
        h.fake.fail_once(Operation::CreateRoleBinding, 1).await;
        h.fake.fail_always(Operation::DeleteClusterRole, 0).await;

        let err = h.backend.issue_credentials("fan", None, "x").await.unwrap_err();

        let SecretsEngineError::RollbackFailed {
            cause, orphaned, ..
        } = err
        else {
            panic!("expected RollbackFailed");
        };
        assert!(matches!(*cause, SecretsEngineError::BindingProvisioningFailed { .. }));
        assert!(orphaned.iter().any(|o| o.starts_with("ClusterRole ")));
        assert_eq!(h.fake.inventory().await.cluster_roles.len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_issuance_is_cleaned_up() {
        let settings = fixtures::fast_settings().with_token_wait(
            RetryConfig::default()
                .with_max_retries(1_000)
                .with_initial_delay(Duration::from_millis(5))
                .with_max_delay(Duration::from_millis(5)),
        );
        let h = Harness::with_settings(settings).await;
        h.put_role("ci", &fixtures::token_role()).await;
        h.fake.never_populate_tokens();

        let issuance = h.backend.issue_credentials("ci", None, "x");
        assert!(tokio::time::timeout(Duration::from_millis(50), issuance).await.is_err());

        for _ in 0..200 {
            if h.fake.inventory().await == Inventory::default() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("abandoned issuance left {:?}", h.fake.inventory().await);
    }
}

mod lease_payload {
    use super::*;

    #[tokio::test]
    async fn test_missing_field_is_reported() {
        let h = Harness::new().await;
        h.put_role("ci", &fixtures::token_role()).await;
        let issued = h.backend.issue_credentials("ci", None, "x").await.unwrap();

        let mut payload = issued.lease.payload.clone();
        payload.remove(KEY_ROLE_BINDINGS);
        let err = h.backend.revoke(&payload).await.unwrap_err();
        assert!(matches!(err, SecretsEngineError::MissingLeaseField(key) if key == KEY_ROLE_BINDINGS));
        assert_ne!(h.fake.inventory().await, Inventory::default());
    }

    #[tokio::test]
    async fn test_corrupt_field_is_reported() {
        let h = Harness::new().await;
        h.put_role("ci", &fixtures::token_role()).await;
        let issued = h.backend.issue_credentials("ci", None, "x").await.unwrap();

        let mut payload = issued.lease.payload.clone();
        payload.insert(KEY_IDENTITY.to_string(), "{\"kind\":".to_string());
        let err = h.backend.revoke(&payload).await.unwrap_err();
        assert!(matches!(err, SecretsEngineError::CorruptLeaseField { key, .. } if key == KEY_IDENTITY));
    }
}

mod rotation {
    use super::*;

    #[tokio::test]
    async fn test_rotation_moves_authorization_to_new_subject() {
        let h = Harness::new().await;
        h.seed_root_bindings().await;
        let old = h.stored_config().await;
        let invalidations = h.fake.invalidations();

        let outcome = h.backend.rotate_root().await.unwrap();

        assert_eq!(outcome.old_subject, fixtures::ROOT_SERVICE_ACCOUNT);
        assert!(outcome.new_subject.starts_with("vault-"));
        assert_eq!(outcome.replicated, 2);
        assert_eq!(outcome.retired, 2);
        assert!(outcome.leftover.is_empty());

        let new = h.stored_config().await;
        assert!(new.token.is_none());
        assert!(new.client_cert.is_some());
        assert_eq!(new.host, old.host);
        assert_eq!(new.ca_cert, old.ca_cert);
        assert_eq!(new.subject_name().unwrap(), outcome.new_subject);
        assert!(h.fake.authorizes(&new).await);
        assert!(!h.fake.authorizes(&old).await);
        assert!(h.fake.invalidations() > invalidations);

        let response = h.backend.read_config().await.unwrap();
        assert!(response.get("client_key").is_none());
        assert!(response.get("token").is_none());
    }

    #[tokio::test]
    async fn test_retire_uses_new_credential() {
        let h = Harness::new().await;
        h.seed_root_bindings().await;

        let outcome = h.backend.rotate_root().await.unwrap();

        let retiring: Vec<String> = h
            .fake
            .calls()
            .await
            .into_iter()
            .filter(|(op, _)| {
                matches!(op, Operation::DeleteClusterRoleBinding | Operation::DeleteRoleBinding)
            })
            .map(|(_, subject)| subject)
            .collect();
        assert_eq!(retiring, vec![outcome.new_subject.clone(); 2]);
    }

    #[tokio::test]
    async fn test_crash_before_commit_keeps_old_root() {
        let h = Harness::new().await;
        h.seed_root_bindings().await;
        let settings = fixtures::fast_settings();
        let rotation = RootRotation::new(h.fake.as_ref(), h.storage.as_ref(), &settings);

        let plan = rotation.plan().await.unwrap();
        let minted = rotation.mint(&plan).await.unwrap();
        rotation.replicate(&plan, &minted).await.unwrap();

        let stored = h.stored_config().await;
        assert!(stored.token.is_some());
        assert!(h.fake.authorizes(&stored).await);

        let outcome = h.backend.rotate_root().await.unwrap();
        assert!(h.fake.authorizes(&h.stored_config().await).await);
        assert_ne!(outcome.new_subject, minted.subject);
    }

    #[tokio::test]
    async fn test_crash_before_retire_keeps_new_root_authorized() {
        let h = Harness::new().await;
        h.seed_root_bindings().await;
        let old = h.stored_config().await;
        let settings = fixtures::fast_settings();
        let rotation = RootRotation::new(h.fake.as_ref(), h.storage.as_ref(), &settings);

        let plan = rotation.plan().await.unwrap();
        let minted = rotation.mint(&plan).await.unwrap();
        rotation.replicate(&plan, &minted).await.unwrap();
        let committed = rotation.commit(&plan, &minted).await.unwrap();

        assert_eq!(h.stored_config().await.subject_name().unwrap(), minted.subject);
        assert!(h.fake.authorizes(&committed).await);
        assert!(h.fake.authorizes(&old).await);
    }

    #[tokio::test]
    async fn test_failed_replication_is_discarded() {
        let h = Harness::new().await;
        h.seed_root_bindings().await;
        let before = h.fake.inventory().await;
        h.fake.fail_once(Operation::CreateRoleBinding, 0).await;

        let err = h.backend.rotate_root().await.unwrap_err();

        assert!(matches!(err, SecretsEngineError::BindingProvisioningFailed { .. }));
        assert_eq!(h.fake.inventory().await, before);
        assert!(h.stored_config().await.token.is_some());
    }

    #[tokio::test]
    async fn test_root_without_bindings_is_left_alone() {
        let h = Harness::new().await;
        let before = h.stored_config().await;

        let err = h.backend.rotate_root().await.unwrap_err();

        assert!(matches!(
            err,
            SecretsEngineError::NoBindingsForSubject(ref subject) if subject == fixtures::ROOT_SERVICE_ACCOUNT
        ));
        assert!(
            !h.fake
                .calls()
                .await
                .iter()
                .any(|(op, _)| *op == Operation::CreateCertificateRequest)
        );
        let after = h.stored_config().await;
        assert_eq!(
            after.token.as_ref().map(|t| t.expose_secret().to_string()),
            before.token.as_ref().map(|t| t.expose_secret().to_string())
        );
        assert!(after.client_cert.is_none());
    }

    #[tokio::test]
    async fn test_rotation_requires_config() {
        let h = Harness::new().await;
        h.backend.delete_config().await.unwrap();
        assert!(h.storage.get(config::CONFIG_KEY).await.unwrap().is_none());

        let err = h.backend.rotate_root().await.unwrap_err();
        assert!(matches!(err, SecretsEngineError::ConfigNotFound));
    }
}
