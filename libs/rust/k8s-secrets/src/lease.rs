//! Lease payload encoding.
//!
//! The payload is the only record of what an issuance created. Each resource
//! class lives under its own key as an independent JSON document, so a
//! damaged field can be reported precisely.

use crate::error::{EngineResult, SecretsEngineError};
use crate::identity::Identity;
use crate::kube::{ClusterRoleBindingHandle, ClusterRoleHandle, RoleBindingHandle};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::time::Duration;

/// Secret type recorded on every lease.
pub const SECRET_TYPE: &str = "rbac";

pub const KEY_IDENTITY: &str = "identity";
pub const KEY_CLUSTER_ROLES: &str = "clusterroles";
pub const KEY_CLUSTER_ROLE_BINDINGS: &str = "clusterrolebindings";
pub const KEY_ROLE_BINDINGS: &str = "rolebindings";

/// Opaque private payload carried by a lease.
pub type LeasePayload = BTreeMap<String, String>;

/// Every object created for one issuance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionedResourceSet {
    /// `None` until an identity object has been created
    pub identity: Option<Identity>,
    pub cluster_roles: Vec<ClusterRoleHandle>,
    pub cluster_role_bindings: Vec<ClusterRoleBindingHandle>,
    pub role_bindings: Vec<RoleBindingHandle>,
}

impl ProvisionedResourceSet {
    /// Whether nothing needs deleting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.identity.as_ref().is_some_and(Identity::owns_objects)
            && self.cluster_roles.is_empty()
            && self.cluster_role_bindings.is_empty()
            && self.role_bindings.is_empty()
    }

    /// Human-readable list of the objects in the set.
    #[must_use]
    pub fn describe(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .cluster_roles
            .iter()
            .map(|r| format!("ClusterRole {}", r.name))
            .collect();
        out.extend(
            self.cluster_role_bindings
                .iter()
                .map(|b| format!("ClusterRoleBinding {}", b.name)),
        );
        out.extend(
            self.role_bindings
                .iter()
                .map(|b| format!("RoleBinding {}/{}", b.namespace, b.name)),
        );
        if let Some(identity) = &self.identity {
            out.extend(identity.describe());
        }
        out
    }
}

/// Lease returned with issued credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub secret_type: &'static str,
    pub ttl: Duration,
    pub max_ttl: Duration,
    pub renewable: bool,
    pub payload: LeasePayload,
    pub issued_at: DateTime<Utc>,
}

impl Lease {
    /// Non-renewable lease over `set`.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the set cannot be encoded.
    pub fn new(set: &ProvisionedResourceSet, ttl: Duration, max_ttl: Duration) -> EngineResult<Self> {
        Ok(Self {
            secret_type: SECRET_TYPE,
            ttl,
            max_ttl,
            renewable: false,
            payload: encode(set)?,
            issued_at: Utc::now(),
        })
    }

    /// Instant after which the lease can no longer be used.
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| self.issued_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

fn put<T: Serialize>(payload: &mut LeasePayload, key: &str, value: &T) -> EngineResult<()> {
    payload.insert(key.to_string(), serde_json::to_string(value)?);
    Ok(())
}

fn field<T: DeserializeOwned>(payload: &LeasePayload, key: &str) -> EngineResult<T> {
    let raw = payload
        .get(key)
        .ok_or_else(|| SecretsEngineError::MissingLeaseField(key.to_string()))?;
    serde_json::from_str(raw).map_err(|source| SecretsEngineError::CorruptLeaseField {
        key: key.to_string(),
        source,
    })
}

/// Encode a resource set into a lease payload.
///
/// # Errors
///
/// Returns a serialization error if a field cannot be encoded.
pub fn encode(set: &ProvisionedResourceSet) -> EngineResult<LeasePayload> {
    let mut payload = LeasePayload::new();
    put(&mut payload, KEY_IDENTITY, &set.identity)?;
    put(&mut payload, KEY_CLUSTER_ROLES, &set.cluster_roles)?;
    put(&mut payload, KEY_CLUSTER_ROLE_BINDINGS, &set.cluster_role_bindings)?;
    put(&mut payload, KEY_ROLE_BINDINGS, &set.role_bindings)?;
    Ok(payload)
}

/// Decode a lease payload.
///
/// # Errors
///
/// Returns [`SecretsEngineError::MissingLeaseField`] when a key is absent and
/// [`SecretsEngineError::CorruptLeaseField`] when its JSON is malformed.
pub fn decode(payload: &LeasePayload) -> EngineResult<ProvisionedResourceSet> {
    Ok(ProvisionedResourceSet {
        identity: field(payload, KEY_IDENTITY)?,
        cluster_roles: field(payload, KEY_CLUSTER_ROLES)?,
        cluster_role_bindings: field(payload, KEY_CLUSTER_ROLE_BINDINGS)?,
        role_bindings: field(payload, KEY_ROLE_BINDINGS)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ProvisionedResourceSet {
        ProvisionedResourceSet {
            identity: Some(Identity::ServiceAccount {
                name: "vault-abcde".to_string(),
                namespace: "kube-system".to_string(),
                token_secret: Some("vault-abcde-token".to_string()),
            }),
            cluster_roles: vec![ClusterRoleHandle {
                name: "vault-r1".to_string(),
            }],
            cluster_role_bindings: vec![],
            role_bindings: vec![RoleBindingHandle {
                name: "vault-rb1".to_string(),
                namespace: "dev".to_string(),
            }],
        }
    }

    #[test]
    fn test_payload_keys() {
        let payload = encode(&sample()).unwrap();
        let keys: Vec<&str> = payload.keys().map(String::as_str).collect();
        assert_eq!(
            keys,
            vec!["clusterrolebindings", "clusterroles", "identity", "rolebindings"]
        );
        assert_eq!(payload[KEY_CLUSTER_ROLE_BINDINGS], "[]");
    }

    #[test]
    fn test_decode_restores_set() {
        let set = sample();
        assert_eq!(decode(&encode(&set).unwrap()).unwrap(), set);
    }

    #[test]
    fn test_missing_field() {
        let mut payload = encode(&sample()).unwrap();
        payload.remove(KEY_ROLE_BINDINGS);
        match decode(&payload) {
            Err(SecretsEngineError::MissingLeaseField(key)) => assert_eq!(key, "rolebindings"),
            other => panic!("expected MissingLeaseField, got {other:?}"),
        }
    }

    #[test]
    fn test_corrupt_field() {
        let mut payload = encode(&sample()).unwrap();
        payload.insert(KEY_CLUSTER_ROLES.to_string(), "{not json".to_string());
        match decode(&payload) {
            Err(SecretsEngineError::CorruptLeaseField { key, .. }) => {
                assert_eq!(key, "clusterroles");
            }
            other => panic!("expected CorruptLeaseField, got {other:?}"),
        }
    }

    #[test]
    fn test_user_identity_is_not_a_deletable_object() {
        let set = ProvisionedResourceSet {
            identity: Some(Identity::User {
                name: "alice-0123456789ab".to_string(),
            }),
            ..ProvisionedResourceSet::default()
        };
        assert!(set.is_empty());
        assert!(!sample().is_empty());
    }

    #[test]
    fn test_lease_is_not_renewable() {
        let lease = Lease::new(&sample(), Duration::from_secs(60), Duration::from_secs(120)).unwrap();
        assert_eq!(lease.secret_type, "rbac");
        assert!(!lease.renewable);
        assert_eq!(lease.payload.len(), 4);
        assert_eq!((lease.expires_at() - lease.issued_at).num_seconds(), 60);
    }
}
