//! Certificate authority and leaf material, plus the rustls configs built on it.
//!
//! Everything here speaks PEM at the edges: authorities and leaves are
//! persisted and shipped in descriptors as PEM text, and converted to DER
//! only when a TLS config is assembled.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow, ensure};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, Ia5String, IsCa,
    KeyPair, KeyUsagePurpose, PKCS_ECDSA_P384_SHA384, SanType, SerialNumber,
};
use rustls::RootCertStore;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::server::WebPkiClientVerifier;
use time::{Duration, OffsetDateTime};
use x509_parser::prelude::{FromDer, X509Certificate};

/// Name the server leaf is always issued for and clients always verify.
///
/// Descriptors carry a host that may be an IP address or a DNS name; pinning
/// the TLS server name keeps verification independent of how it was reached.
pub const SERVER_NAME: &str = "teamserver";

/// ALPN protocol identifier negotiated on every teamserver connection.
pub const ALPN_TEAMSERVER: &[u8] = b"teamserver/1";

const CA_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 730;

/// PEM-encoded certificate and private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertKeyPair {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Which side of a mutual TLS handshake a leaf certificate authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafRole {
    Client,
    Server,
}

/// Generates a self-signed ECDSA P-384 certificate authority.
pub fn generate_ca(common_name: &str) -> Result<CertKeyPair> {
    let key = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384)
        .context("failed to generate authority key")?;

    let mut params = base_params(common_name, CA_VALIDITY_DAYS);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];

    let cert = params
        .self_signed(&key)
        .context("failed to self-sign authority certificate")?;

    Ok(CertKeyPair {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

/// Issues a leaf certificate for `common_name`, signed by `ca`.
///
/// Server leaves carry [`SERVER_NAME`] and `localhost` as DNS names; client
/// leaves carry only the subject common name.
pub fn issue_leaf(ca: &CertKeyPair, common_name: &str, role: LeafRole) -> Result<CertKeyPair> {
    let issuer_key = KeyPair::from_pem(&ca.key_pem).context("invalid authority key PEM")?;
    let issuer = CertificateParams::from_ca_cert_pem(&ca.cert_pem)
        .context("invalid authority certificate PEM")?
        .self_signed(&issuer_key)
        .context("failed to rebuild authority issuer")?;

    let key =
        KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384).context("failed to generate leaf key")?;

    let mut params = base_params(common_name, LEAF_VALIDITY_DAYS);
    params.use_authority_key_identifier_extension = true;
    params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
    match role {
        LeafRole::Client => {
            params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        }
        LeafRole::Server => {
            params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
            params.subject_alt_names = [SERVER_NAME, "localhost"]
                .into_iter()
                .map(|name| Ia5String::try_from(name).map(SanType::DnsName))
                .collect::<std::result::Result<_, _>>()
                .context("invalid server DNS name")?;
        }
    }

    let cert = params
        .signed_by(&key, &issuer, &issuer_key)
        .context("failed to sign leaf certificate")?;

    Ok(CertKeyPair {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
    })
}

fn base_params(common_name: &str, validity_days: i64) -> CertificateParams {
    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);

    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::hours(1);
    params.not_after = now + Duration::days(validity_days);

    // Positive 128-bit serial.
    let mut serial: [u8; 16] = rand::random();
    serial[0] &= 0x7F;
    params.serial_number = Some(SerialNumber::from(serial.to_vec()));
    params
}

// ── PEM inspection ──────────────────────────────────────────────────

/// Decodes the first `CERTIFICATE` block of `pem` into DER.
pub fn cert_der_from_pem(pem: &str) -> Result<Vec<u8>> {
    let (_, block) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
        .map_err(|e| anyhow!("invalid certificate PEM: {e}"))?;
    ensure!(
        block.label == "CERTIFICATE",
        "expected CERTIFICATE PEM block, got {}",
        block.label
    );
    Ok(block.contents)
}

/// Decodes a private key PEM into PKCS#8 DER.
pub fn key_der_from_pem(pem: &str) -> Result<Vec<u8>> {
    let key = KeyPair::from_pem(pem).context("invalid private key PEM")?;
    Ok(key.serialize_der())
}

fn parse_cert(der: &[u8]) -> Result<X509Certificate<'_>> {
    let (_, cert) =
        X509Certificate::from_der(der).map_err(|e| anyhow!("X.509 parse error: {e}"))?;
    Ok(cert)
}

/// Returns the subject common name of a PEM certificate.
pub fn subject_common_name(cert_pem: &str) -> Result<String> {
    let der = cert_der_from_pem(cert_pem)?;
    let cert = parse_cert(&der)?;
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("certificate has no common name"))
}

/// Returns whether the certificate carries the CA basic constraint.
pub fn is_ca_certificate(cert_pem: &str) -> Result<bool> {
    let der = cert_der_from_pem(cert_pem)?;
    Ok(parse_cert(&der)?.is_ca())
}

/// Returns whether `key_pem` is the private half of the key in `cert_pem`.
pub fn key_matches_certificate(cert_pem: &str, key_pem: &str) -> Result<bool> {
    let key = KeyPair::from_pem(key_pem).context("invalid private key PEM")?;
    let der = cert_der_from_pem(cert_pem)?;
    let cert = parse_cert(&der)?;
    Ok(cert.public_key().subject_public_key.data.as_ref() == key.public_key_raw())
}

/// Checks that `leaf_pem` was signed by the authority in `ca_cert_pem`.
pub fn verify_issued_by(leaf_pem: &str, ca_cert_pem: &str) -> Result<()> {
    let leaf_der = cert_der_from_pem(leaf_pem)?;
    let ca_der = cert_der_from_pem(ca_cert_pem)?;
    let leaf = parse_cert(&leaf_der)?;
    let ca = parse_cert(&ca_der)?;
    leaf.verify_signature(Some(ca.public_key()))
        .map_err(|e| anyhow!("signature verification failed: {e}"))
}

// ── rustls configs ──────────────────────────────────────────────────

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn root_store(ca_cert_pem: &str) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    roots
        .add(CertificateDer::from(cert_der_from_pem(ca_cert_pem)?))
        .context("failed to add authority to root store")?;
    Ok(roots)
}

fn identity(leaf: &CertKeyPair) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let chain = vec![CertificateDer::from(cert_der_from_pem(&leaf.cert_pem)?)];
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der_from_pem(&leaf.key_pem)?));
    Ok((chain, key))
}

/// Builds a TLS 1.3 server config that presents `leaf` and requires client
/// certificates chaining to the authority in `client_ca_pem`.
pub fn build_server_config(client_ca_pem: &str, leaf: &CertKeyPair) -> Result<rustls::ServerConfig> {
    let verifier =
        WebPkiClientVerifier::builder_with_provider(Arc::new(root_store(client_ca_pem)?), crypto_provider())
            .build()
            .context("failed to build client certificate verifier")?;
    let (chain, key) = identity(leaf)?;

    let mut config = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS version config")?
        .with_client_cert_verifier(verifier)
        .with_single_cert(chain, key)
        .context("server cert config")?;

    config.alpn_protocols = vec![ALPN_TEAMSERVER.to_vec()];
    Ok(config)
}

/// Builds a TLS 1.3 client config that trusts only `server_ca_pem` and
/// presents `leaf` as the client certificate.
pub fn build_client_config(server_ca_pem: &str, leaf: &CertKeyPair) -> Result<rustls::ClientConfig> {
    let (chain, key) = identity(leaf)?;

    let mut config = rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS version config")?
        .with_root_certificates(root_store(server_ca_pem)?)
        .with_client_auth_cert(chain, key)
        .context("client cert config")?;

    config.alpn_protocols = vec![ALPN_TEAMSERVER.to_vec()];
    Ok(config)
}
