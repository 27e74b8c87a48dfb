//! Role definitions.
//!
//! A role names the kind of credential to issue and the permissions the
//! resulting identity is bound to, expressed as binding rules.

use crate::error::{EngineResult, SecretsEngineError};
use crate::kube::PolicyRule;
use crate::serde_helpers::duration_secs;
use crate::storage::{self, Storage};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::str::FromStr;
use std::sync::LazyLock;
use std::time::Duration;

/// Storage prefix of role records.
pub const ROLE_PREFIX: &str = "role/";

/// Shortest lifetime a certificate signer accepts.
pub const MIN_CERTIFICATE_TTL: Duration = Duration::from_secs(600);

static ROLE_NAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^\w(([\w\-.]+)?\w)?$").ok());

/// Kind of credential a role issues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialType {
    /// Service account with a bearer token
    Token,
    /// Client certificate for a user subject
    #[default]
    Certificate,
}

impl CredentialType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Token => "token",
            Self::Certificate => "certificate",
        }
    }
}

impl FromStr for CredentialType {
    type Err = SecretsEngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "token" => Ok(Self::Token),
            "certificate" => Ok(Self::Certificate),
            _ => Err(SecretsEngineError::invalid_role(
                "credential_type must be either 'certificate' or 'token'",
            )),
        }
    }
}

/// Grants a set of cluster roles, plus optional inline rules, in some namespaces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BindingRule {
    /// Target namespaces; `["*"]` means cluster-wide
    #[serde(default)]
    pub namespaces: Vec<String>,
    /// Existing cluster roles to bind
    #[serde(default)]
    pub cluster_roles: Vec<String>,
    /// Inline rules, materialized as a new cluster role
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

impl BindingRule {
    /// Whether the rule binds cluster-wide rather than per namespace.
    #[must_use]
    pub fn is_cluster_wide(&self) -> bool {
        self.namespaces.len() == 1 && self.namespaces[0] == "*"
    }

    fn validate(&self) -> EngineResult<()> {
        if self.namespaces.is_empty() {
            return Err(SecretsEngineError::invalid_role(
                "namespace list cannot be empty",
            ));
        }
        if self.namespaces.len() > 1 && self.namespaces.iter().any(|n| n == "*") {
            return Err(SecretsEngineError::invalid_role(
                "'*' must be the only namespace when present",
            ));
        }
        if self.cluster_roles.is_empty() && self.rules.is_empty() {
            return Err(SecretsEngineError::invalid_role(
                "cluster roles or policy rules must be provided",
            ));
        }
        Ok(())
    }
}

/// Stored role.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleSpec {
    pub credential_type: CredentialType,
    pub binding_rules: Vec<BindingRule>,
    #[serde(default, rename = "serviceaccount_namespace")]
    pub service_account_namespace: String,
    #[serde(default)]
    pub list_namespaces: bool,
    #[serde(default)]
    pub view_nodes: bool,
    #[serde(with = "duration_secs", default)]
    pub ttl: Duration,
    #[serde(with = "duration_secs", default)]
    pub max_ttl: Duration,
}

impl RoleSpec {
    /// Check that the role can be issued.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsEngineError::InvalidRole`] naming the first problem.
    pub fn validate(&self) -> EngineResult<()> {
        if !self.max_ttl.is_zero() && self.ttl > self.max_ttl {
            return Err(SecretsEngineError::invalid_role(
                "ttl cannot be greater than max_ttl",
            ));
        }
        if self.credential_type == CredentialType::Certificate {
            let too_short = |d: Duration| !d.is_zero() && d < MIN_CERTIFICATE_TTL;
            if too_short(self.ttl) || too_short(self.max_ttl) {
                return Err(SecretsEngineError::invalid_role(
                    "certificate type credentials cannot specify a duration less than 600 seconds",
                ));
            }
        }
        if self.binding_rules.is_empty() {
            return Err(SecretsEngineError::invalid_role(
                "binding rules list cannot be empty",
            ));
        }
        self.binding_rules.iter().try_for_each(BindingRule::validate)
    }

    /// Readable view of the role.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the binding rules cannot be encoded.
    pub fn to_response_data(&self) -> EngineResult<Value> {
        Ok(json!({
            "credential_type": self.credential_type.as_str(),
            "binding_rules": serde_json::to_string(&self.binding_rules)?,
            "serviceaccount_namespace": self.service_account_namespace,
            "list_namespaces": self.list_namespaces,
            "view_nodes": self.view_nodes,
            "ttl": self.ttl.as_secs(),
            "max_ttl": self.max_ttl.as_secs(),
        }))
    }
}

/// Partial update of a role; absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoleUpdate {
    pub credential_type: Option<String>,
    /// JSON array of binding rules
    pub binding_rules: Option<String>,
    #[serde(rename = "serviceaccount_namespace")]
    pub service_account_namespace: Option<String>,
    pub list_namespaces: Option<bool>,
    pub view_nodes: Option<bool>,
    /// Seconds
    pub ttl: Option<u64>,
    /// Seconds
    pub max_ttl: Option<u64>,
}

impl RoleUpdate {
    /// Apply the update on top of `role`.
    ///
    /// # Errors
    ///
    /// Returns [`SecretsEngineError::InvalidRole`] for an unknown credential
    /// type or unparsable binding rules.
    pub fn apply(self, mut role: RoleSpec) -> EngineResult<RoleSpec> {
        if let Some(kind) = self.credential_type {
            role.credential_type = kind.parse()?;
        }
        if let Some(raw) = self.binding_rules {
            role.binding_rules = serde_json::from_str(&raw).map_err(|e| {
                SecretsEngineError::invalid_role(format!("binding_rules is not valid JSON: {e}"))
            })?;
        }
        if let Some(namespace) = self.service_account_namespace {
            role.service_account_namespace = namespace;
        }
        if let Some(flag) = self.list_namespaces {
            role.list_namespaces = flag;
        }
        if let Some(flag) = self.view_nodes {
            role.view_nodes = flag;
        }
        if let Some(secs) = self.ttl {
            role.ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = self.max_ttl {
            role.max_ttl = Duration::from_secs(secs);
        }
        Ok(role)
    }
}

/// Check that a role name is usable as a storage key.
///
/// # Errors
///
/// Returns [`SecretsEngineError::InvalidRole`] for names that do not match.
pub fn validate_role_name(name: &str) -> EngineResult<()> {
    let valid = ROLE_NAME.as_ref().is_some_and(|re| re.is_match(name));
    if valid {
        Ok(())
    } else {
        Err(SecretsEngineError::invalid_role(format!(
            "invalid role name '{name}'"
        )))
    }
}

fn role_key(name: &str) -> String {
    format!("{ROLE_PREFIX}{name}")
}

/// Load a role.
///
/// # Errors
///
/// Returns storage or decoding errors.
pub async fn get_role(storage: &dyn Storage, name: &str) -> EngineResult<Option<RoleSpec>> {
    storage::get_json(storage, &role_key(name)).await
}

/// Validate and store a role.
///
/// # Errors
///
/// Returns validation or storage errors.
pub async fn put_role(storage: &dyn Storage, name: &str, role: &RoleSpec) -> EngineResult<()> {
    validate_role_name(name)?;
    role.validate()?;
    storage::put_json(storage, &role_key(name), role).await
}

/// Remove a role.
///
/// # Errors
///
/// Returns storage errors.
pub async fn delete_role(storage: &dyn Storage, name: &str) -> EngineResult<()> {
    storage.delete(&role_key(name)).await?;
    Ok(())
}

/// List stored role names.
///
/// # Errors
///
/// Returns storage errors.
pub async fn list_roles(storage: &dyn Storage) -> EngineResult<Vec<String>> {
    Ok(storage.list(ROLE_PREFIX).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(namespaces: &[&str], cluster_roles: &[&str]) -> BindingRule {
        BindingRule {
            namespaces: namespaces.iter().map(ToString::to_string).collect(),
            cluster_roles: cluster_roles.iter().map(ToString::to_string).collect(),
            rules: vec![],
        }
    }

    fn token_role() -> RoleSpec {
        RoleSpec {
            credential_type: CredentialType::Token,
            binding_rules: vec![rule(&["dev"], &["view"])],
            ..RoleSpec::default()
        }
    }

    fn invalid_message(role: &RoleSpec) -> String {
        match role.validate() {
            Err(SecretsEngineError::InvalidRole(msg)) => msg,
            other => panic!("expected InvalidRole, got {other:?}"),
        }
    }

    #[test]
    fn test_valid_role() {
        assert!(token_role().validate().is_ok());
    }

    #[test]
    fn test_ttl_above_max_rejected() {
        let role = RoleSpec {
            ttl: Duration::from_secs(7200),
            max_ttl: Duration::from_secs(3600),
            ..token_role()
        };
        assert_eq!(invalid_message(&role), "ttl cannot be greater than max_ttl");
    }

    #[test]
    fn test_certificate_minimum_lifetime() {
        let role = RoleSpec {
            credential_type: CredentialType::Certificate,
            ttl: Duration::from_secs(599),
            ..token_role()
        };
        assert!(invalid_message(&role).contains("600 seconds"));

        let role = RoleSpec {
            credential_type: CredentialType::Certificate,
            ttl: Duration::from_secs(600),
            ..token_role()
        };
        assert!(role.validate().is_ok());

        let role = RoleSpec {
            ttl: Duration::from_secs(30),
            ..token_role()
        };
        assert!(role.validate().is_ok());
    }

    #[test]
    fn test_binding_rule_shape() {
        let role = RoleSpec {
            binding_rules: vec![],
            ..token_role()
        };
        assert_eq!(invalid_message(&role), "binding rules list cannot be empty");

        let role = RoleSpec {
            binding_rules: vec![rule(&[], &["view"])],
            ..token_role()
        };
        assert_eq!(invalid_message(&role), "namespace list cannot be empty");

        let role = RoleSpec {
            binding_rules: vec![rule(&["dev"], &[])],
            ..token_role()
        };
        assert_eq!(
            invalid_message(&role),
            "cluster roles or policy rules must be provided"
        );

        let role = RoleSpec {
            binding_rules: vec![rule(&["*", "dev"], &["view"])],
            ..token_role()
        };
        assert!(role.validate().is_err());
    }

    #[test]
    fn test_cluster_wide_detection() {
        assert!(rule(&["*"], &["view"]).is_cluster_wide());
        assert!(!rule(&["dev", "prod"], &["view"]).is_cluster_wide());
    }

    #[test]
    fn test_update_parses_binding_rules() {
        let update = RoleUpdate {
            credential_type: Some("token".to_string()),
            binding_rules: Some(
                r#"[{"namespaces":["*"],"cluster_roles":["view"],"rules":[{"apiGroups":[""],"resources":["pods"],"verbs":["get"]}]}]"#
                    .to_string(),
            ),
            ttl: Some(3600),
            ..RoleUpdate::default()
        };
        let role = update.apply(RoleSpec::default()).unwrap();

        assert_eq!(role.credential_type, CredentialType::Token);
        assert!(role.binding_rules[0].is_cluster_wide());
        assert_eq!(
            role.binding_rules[0].rules[0].resources,
            Some(vec!["pods".to_string()])
        );
        assert_eq!(role.ttl, Duration::from_secs(3600));
    }

    #[test]
    fn test_update_keeps_unset_fields() {
        let existing = RoleSpec {
            view_nodes: true,
            ..token_role()
        };
        let role = RoleUpdate {
            list_namespaces: Some(true),
            ..RoleUpdate::default()
        }
        .apply(existing)
        .unwrap();

        assert!(role.view_nodes);
        assert!(role.list_namespaces);
        assert_eq!(role.credential_type, CredentialType::Token);
    }

    #[test]
    fn test_update_rejects_bad_input() {
        let bad_json = RoleUpdate {
            binding_rules: Some("not json".to_string()),
            ..RoleUpdate::default()
        };
        assert!(matches!(
            bad_json.apply(RoleSpec::default()),
            Err(SecretsEngineError::InvalidRole(_))
        ));

        let bad_type = RoleUpdate {
            credential_type: Some("password".to_string()),
            ..RoleUpdate::default()
        };
        assert!(bad_type.apply(RoleSpec::default()).is_err());
    }

    #[test]
    fn test_response_data() {
        let data = token_role().to_response_data().unwrap();
        assert_eq!(data["credential_type"], "token");
        let rules: Vec<BindingRule> =
            serde_json::from_str(data["binding_rules"].as_str().unwrap()).unwrap();
        assert_eq!(rules, token_role().binding_rules);
    }

    #[test]
    fn test_role_names() {
        for name in ["dev", "a", "team.dev-01", "x_y"] {
            assert!(validate_role_name(name).is_ok(), "{name}");
        }
        for name in ["", "-dev", "dev-", "a/b", "has space"] {
            assert!(validate_role_name(name).is_err(), "{name}");
        }
    }
}
