//! Reuse of cluster clients across calls made with the same profile.

use super::{ConnectionProfile, KubeError, KubeResult, ProfileCredential};
use crate::tls::base64_encode;
use ::kube::Client;
use ::kube::config::{KubeConfigOptions, Kubeconfig};
use rust_common::HttpConfig;
use secrecy::ExposeSecret;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::debug;

const PROFILE_CONTEXT: &str = "engine-root";

struct CachedClient {
    profile: ConnectionProfile,
    client: Client,
}

/// Holds the client built for the most recently used connection profile.
///
/// A lookup with a different profile rebuilds the client. [`ClientCache::invalidate`]
/// must be called whenever the stored root configuration changes.
pub struct ClientCache {
    http: HttpConfig,
    current: RwLock<Option<CachedClient>>,
}

impl ClientCache {
    /// Create an empty cache whose clients get the timeouts in `http`.
    #[must_use]
    pub fn new(http: HttpConfig) -> Self {
        Self {
            http,
            current: RwLock::new(None),
        }
    }

    /// Return a client for `profile`, building one if needed.
    ///
    /// # Errors
    ///
    /// Returns [`KubeError::ClientSetup`] if the profile's CA bundle or client
    /// identity cannot be loaded.
    pub async fn client_for(&self, profile: &ConnectionProfile) -> KubeResult<Client> {
        {
            let current = self.current.read().await;
            if let Some(cached) = current.as_ref() {
                if cached.profile.same_as(profile) {
                    return Ok(cached.client.clone());
                }
            }
        }

        let config = self.config_for(profile).await?;
        let client =
            Client::try_from(config).map_err(|e| KubeError::ClientSetup(e.to_string()))?;
        debug!(host = %profile.host, "built cluster client");
        *self.current.write().await = Some(CachedClient {
            profile: profile.clone(),
            client: client.clone(),
        });
        Ok(client)
    }

    /// Forget the cached client.
    pub async fn invalidate(&self) {
        self.current.write().await.take();
    }

    /// Whether a client is currently cached.
    pub async fn is_populated(&self) -> bool {
        self.current.read().await.is_some()
    }

    /// Client configuration for `profile`, with this cache's timeouts applied.
    ///
    /// # Errors
    ///
    /// Returns [`KubeError::ClientSetup`] if the profile cannot be expressed
    /// as a kubeconfig.
    pub async fn config_for(&self, profile: &ConnectionProfile) -> KubeResult<::kube::Config> {
        let kubeconfig = profile_kubeconfig(profile)?;
        let mut config =
            ::kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| KubeError::ClientSetup(e.to_string()))?;
        config.connect_timeout = Some(self.http.connect_timeout);
        config.read_timeout = Some(self.http.timeout);
        Ok(config)
    }
}

/// Single-context kubeconfig that authenticates as `profile`.
fn profile_kubeconfig(profile: &ConnectionProfile) -> KubeResult<Kubeconfig> {
    let user = match &profile.credential {
        ProfileCredential::BearerToken(token) => json!({ "token": token.expose_secret() }),
        ProfileCredential::ClientCertificate { certificate, key } => json!({
            "client-certificate-data": base64_encode(certificate),
            "client-key-data": base64_encode(key.expose_secret()),
        }),
    };

    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": PROFILE_CONTEXT,
            "cluster": {
                "server": profile.host,
                "certificate-authority-data": base64_encode(&profile.ca_cert),
            },
        }],
        "users": [{ "name": PROFILE_CONTEXT, "user": user }],
        "contexts": [{
            "name": PROFILE_CONTEXT,
            "context": { "cluster": PROFILE_CONTEXT, "user": PROFILE_CONTEXT },
        }],
        "current-context": PROFILE_CONTEXT,
    }))
    .map_err(|e| KubeError::ClientSetup(format!("connection profile: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;
    use std::time::Duration;

    fn ca_pem() -> String {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::default();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "cluster-ca");
        params.self_signed(&key).unwrap().pem()
    }

    fn profile(ca: &str, token: &str) -> ConnectionProfile {
        ConnectionProfile {
            host: "https://cluster:6443".to_string(),
            ca_cert: ca.to_string(),
            credential: ProfileCredential::BearerToken(SecretString::from(token)),
        }
    }

    #[tokio::test]
    async fn test_config_carries_profile_and_timeouts() {
        let http = HttpConfig::default()
            .with_timeout(Duration::from_secs(7))
            .with_connect_timeout(Duration::from_secs(3));
        let cache = ClientCache::new(http);

        let config = cache.config_for(&profile(&ca_pem(), "t1")).await.unwrap();

        assert_eq!(config.cluster_url.host(), Some("cluster"));
        assert_eq!(config.connect_timeout, Some(Duration::from_secs(3)));
        assert_eq!(config.read_timeout, Some(Duration::from_secs(7)));
        assert_eq!(config.root_cert.map(|certs| certs.len()), Some(1));
        assert!(config.auth_info.token.is_some());
    }

    #[tokio::test]
    async fn test_certificate_profile_sets_client_identity() {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::default();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "vault-root");
        let cert = params.self_signed(&key).unwrap();
        let profile = ConnectionProfile {
            host: "https://cluster:6443".to_string(),
            ca_cert: ca_pem(),
            credential: ProfileCredential::ClientCertificate {
                certificate: cert.pem(),
                key: SecretString::from(key.serialize_pem()),
            },
        };

        let config = ClientCache::new(HttpConfig::default())
            .config_for(&profile)
            .await
            .unwrap();

        assert!(config.auth_info.token.is_none());
        assert!(config.auth_info.client_certificate_data.is_some());
        assert!(config.auth_info.client_key_data.is_some());
    }

    #[tokio::test]
    async fn test_cache_populates_and_invalidates() {
        let cache = ClientCache::new(HttpConfig::default());
        let ca = ca_pem();

        assert!(!cache.is_populated().await);
        cache.client_for(&profile(&ca, "t1")).await.unwrap();
        assert!(cache.is_populated().await);

        cache.invalidate().await;
        assert!(!cache.is_populated().await);
    }

    #[tokio::test]
    async fn test_profile_change_rebuilds() {
        let cache = ClientCache::new(HttpConfig::default());
        let ca = ca_pem();

        cache.client_for(&profile(&ca, "t1")).await.unwrap();
        cache.client_for(&profile(&ca, "t2")).await.unwrap();

        let current = cache.current.read().await;
        let cached = current.as_ref().unwrap();
        assert!(cached.profile.same_as(&profile(&ca, "t2")));
    }
}
