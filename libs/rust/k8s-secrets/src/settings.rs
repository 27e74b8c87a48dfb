//! Engine-wide settings that are not part of the stored configuration.

use rust_common::{HttpConfig, RetryConfig};
use std::time::Duration;

const DEFAULT_SYSTEM_MAX_TTL: Duration = Duration::from_secs(768 * 3600);

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Upper bound for every lease the engine hands out
    pub system_max_ttl: Duration,
    /// Wait budget for a token secret to be populated
    pub token_wait: RetryConfig,
    /// Wait budget for a CSR to be signed
    pub certificate_wait: RetryConfig,
    /// Prefix of every generated object name
    pub resource_name_prefix: String,
    /// Namespace written into issued kubeconfig contexts
    pub context_namespace: String,
    /// Base HTTP settings for cluster clients
    pub http: HttpConfig,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let system_max_ttl = std::env::var("K8S_SECRETS_MAX_LEASE_TTL")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map_or(DEFAULT_SYSTEM_MAX_TTL, Duration::from_secs);

        let wait = RetryConfig::default()
            .with_max_retries(5)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(8));

        Self {
            system_max_ttl,
            token_wait: wait.clone(),
            certificate_wait: wait,
            resource_name_prefix: "vault-".to_string(),
            context_namespace: "default".to_string(),
            http: HttpConfig::default(),
        }
    }
}

impl EngineSettings {
    /// Set the system-wide maximum lease TTL.
    #[must_use]
    pub const fn with_system_max_ttl(mut self, ttl: Duration) -> Self {
        self.system_max_ttl = ttl;
        self
    }

    /// Set the token population wait budget.
    #[must_use]
    pub fn with_token_wait(mut self, wait: RetryConfig) -> Self {
        self.token_wait = wait;
        self
    }

    /// Set the certificate signing wait budget.
    #[must_use]
    pub fn with_certificate_wait(mut self, wait: RetryConfig) -> Self {
        self.certificate_wait = wait;
        self
    }

    /// Set the generated name prefix.
    #[must_use]
    pub fn with_resource_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.resource_name_prefix = prefix.into();
        self
    }

    /// Set the HTTP client settings.
    #[must_use]
    pub fn with_http(mut self, http: HttpConfig) -> Self {
        self.http = http;
        self
    }
}
