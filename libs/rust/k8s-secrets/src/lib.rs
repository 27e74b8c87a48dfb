//! Dynamic Kubernetes credential engine.
//!
//! Issues short-lived cluster credentials backed by a service account token
//! or a client certificate, binds them to the RBAC a role describes, and
//! tears every created object down again when the lease is revoked. The
//! engine's own root credential can be rotated without losing its
//! authorization.

pub mod backend;
pub mod binding;
pub mod config;
pub mod error;
pub mod identity;
pub mod issuance;
pub mod kube;
pub mod kubeconfig;
pub mod lease;
pub mod resolver;
pub mod revoke;
pub mod role;
pub mod rotation;
pub mod serde_helpers;
pub mod settings;
pub mod storage;
pub mod tls;

pub use backend::SecretsBackend;
pub use config::RootConfig;
pub use error::{EngineResult, SecretsEngineError};
pub use identity::{Identity, IssuedCredential};
pub use issuance::IssuedCredentials;
pub use crate::kube::{ConnectionProfile, HttpKubernetesApi, KubeError, KubeResult, KubernetesApi};
pub use lease::{LeasePayload, ProvisionedResourceSet};
pub use revoke::RevocationReport;
pub use role::{BindingRule, CredentialType, RoleSpec, RoleUpdate};
pub use rotation::RotationOutcome;
pub use settings::EngineSettings;
pub use storage::{InMemoryStorage, Storage};
