//! Rendering of the connection manifest handed to credential holders.

/// Placeholder for absent values.
const ABSENT: &str = "~";

/// Inputs to [`render`]. Certificate fields are expected base64 encoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct KubeconfigParams<'a> {
    pub server: &'a str,
    /// PEM CA bundle; encoded by the renderer
    pub ca_cert: &'a str,
    pub namespace: &'a str,
    pub user: Option<&'a str>,
    pub token: Option<&'a str>,
    pub client_certificate_data: Option<&'a str>,
    pub client_key_data: Option<&'a str>,
}

/// Render a single-cluster, single-user kubeconfig.
///
/// Key order and layout are fixed so tooling that reads these manifests
/// keeps working.
#[must_use]
pub fn render(params: &KubeconfigParams<'_>) -> String {
    let name = params.user.unwrap_or(ABSENT);
    let token = params.token.unwrap_or(ABSENT);
    let certificate = params.client_certificate_data.unwrap_or(ABSENT);
    let key = params.client_key_data.unwrap_or(ABSENT);
    let ca = crate::tls::base64_encode(params.ca_cert);
    let server = params.server;
    let namespace = params.namespace;

    format!(
        "---
apiVersion: v1
kind: Config
clusters:
  - cluster:
      certificate-authority-data: {ca}
      server: {server}
    name: {name}
contexts:
  - context:
      cluster: {name}
      namespace: {namespace}
      user: {name}
    name: {name}
current-context: {name}
users:
  - name: {name}
    user:
      token: {token}
      client-certificate-data: {certificate}
      client-key-data: {key}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_manifest() {
        let manifest = render(&KubeconfigParams {
            server: "https://cluster:6443",
            ca_cert: "CA",
            namespace: "default",
            user: Some("vault-abc"),
            token: Some("tok"),
            ..KubeconfigParams::default()
        });

        assert!(manifest.starts_with("---\napiVersion: v1\nkind: Config\n"));
        assert!(manifest.contains("certificate-authority-data: Q0E=\n"));
        assert!(manifest.contains("      namespace: default\n"));
        assert!(!manifest.contains(" ns:"));
        assert!(manifest.contains("current-context: vault-abc\n"));
        assert!(manifest.contains("      token: tok\n"));
        assert!(manifest.ends_with("client-key-data: ~"));
    }

    #[test]
    fn test_certificate_manifest() {
        let manifest = render(&KubeconfigParams {
            server: "https://cluster",
            ca_cert: "CA",
            namespace: "default",
            user: Some("alice-01"),
            client_certificate_data: Some("Q0VSVA=="),
            client_key_data: Some("S0VZ"),
            ..KubeconfigParams::default()
        });

        assert!(manifest.contains("      token: ~\n"));
        assert!(manifest.contains("      client-certificate-data: Q0VSVA==\n"));
        assert!(manifest.contains("      client-key-data: S0VZ"));
    }

    #[test]
    fn test_key_order() {
        let manifest = render(&KubeconfigParams::default());
        let order = [
            "certificate-authority-data",
            "server:",
            "cluster: ~",
            "namespace:",
            "user: ~",
            "current-context:",
            "token:",
            "client-certificate-data:",
            "client-key-data:",
        ];
        let positions: Vec<usize> = order
            .iter()
            .map(|k| manifest.find(k).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }
}
