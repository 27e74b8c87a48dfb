//! Key, CSR and credential subject handling.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use jsonwebtoken::{DecodingKey, Validation, decode};
use rand::RngCore;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use serde::Deserialize;
use thiserror::Error;
use x509_parser::prelude::{FromDer, X509Certificate};
use zeroize::Zeroizing;

/// Failures while producing or inspecting identity material.
#[derive(Error, Debug)]
pub enum TlsError {
    #[error("key generation failed: {0}")]
    KeyGeneration(#[from] rcgen::Error),

    #[error("invalid PEM: {0}")]
    Pem(#[from] pem::PemError),

    #[error("invalid certificate: {0}")]
    Certificate(String),

    #[error("certificate has no common name")]
    MissingCommonName,

    #[error("invalid token: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    #[error("token does not name a service account")]
    MissingServiceAccount,
}

/// A fresh private key and the CSR built from it.
pub struct KeyAndRequest {
    /// PKCS#8 private key, PEM encoded
    pub private_key_pem: Zeroizing<String>,
    /// PKCS#10 request, PEM encoded
    pub csr_pem: String,
}

/// Generate a P-256 key and a CSR whose subject CN is `common_name`.
///
/// # Errors
///
/// Returns [`TlsError::KeyGeneration`] if key generation or CSR encoding fails.
pub fn generate_key_and_request(common_name: &str) -> Result<KeyAndRequest, TlsError> {
    let key_pair = KeyPair::generate()?;
    let mut params = CertificateParams::default();
    params.distinguished_name = DistinguishedName::new();
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);

    let csr_pem = params.serialize_request(&key_pair)?.pem()?;
    Ok(KeyAndRequest {
        private_key_pem: Zeroizing::new(key_pair.serialize_pem()),
        csr_pem,
    })
}

/// Extract the subject common name from a PEM certificate.
///
/// # Errors
///
/// Fails if the PEM or DER cannot be parsed or the subject carries no CN.
pub fn certificate_common_name(certificate_pem: &str) -> Result<String, TlsError> {
    let block = pem::parse(certificate_pem)?;
    let (_, certificate) = X509Certificate::from_der(block.contents())
        .map_err(|e| TlsError::Certificate(e.to_string()))?;

    certificate
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
        .ok_or(TlsError::MissingCommonName)
}

#[derive(Deserialize)]
struct NamedRef {
    name: String,
}

#[derive(Deserialize)]
struct BoundServiceAccount {
    serviceaccount: Option<NamedRef>,
}

#[derive(Deserialize)]
struct ServiceAccountClaims {
    #[serde(rename = "kubernetes.io/serviceaccount/service-account.name")]
    legacy_name: Option<String>,
    #[serde(rename = "kubernetes.io")]
    bound: Option<BoundServiceAccount>,
    sub: Option<String>,
}

/// Read the service account name out of a bearer token's claims.
///
/// The signature is not checked: the token is our own configured credential
/// and only its subject is of interest. Both the legacy secret-based claim
/// and the bound token claim are understood, falling back to the
/// `system:serviceaccount:<ns>:<name>` subject.
///
/// # Errors
///
/// Fails if the token is not a JWT or names no service account.
pub fn service_account_from_token(token: &str) -> Result<String, TlsError> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let claims = decode::<ServiceAccountClaims>(token, &DecodingKey::from_secret(&[]), &validation)?
        .claims;

    claims
        .legacy_name
        .filter(|n| !n.is_empty())
        .or_else(|| {
            claims
                .bound
                .and_then(|b| b.serviceaccount)
                .map(|sa| sa.name)
                .filter(|n| !n.is_empty())
        })
        .or_else(|| {
            claims.sub.as_deref().and_then(|sub| {
                sub.strip_prefix("system:serviceaccount:")
                    .and_then(|rest| rest.rsplit(':').next())
                    .filter(|n| !n.is_empty())
                    .map(str::to_string)
            })
        })
        .ok_or(TlsError::MissingServiceAccount)
}

/// Random lowercase hex string of `bytes * 2` characters.
#[must_use]
pub fn random_suffix(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{b:02x}")).collect()
}

/// Standard base64 of a UTF-8 string.
#[must_use]
pub fn base64_encode(value: &str) -> String {
    STANDARD.encode(value.as_bytes())
}
