//! Startup-generated self-signed certificate for the HTTPS listener.
//!
//! Clients redirected by DNS connect to the mirror believing it is the
//! real registry, and some insist on TLS. The proxy therefore serves a
//! certificate whose SANs cover `localhost`, the intercepted hostname, and
//! every non-loopback IPv4 of the host, so those clients complete the
//! handshake. Clients that pin certificates will refuse it; they are meant
//! to bypass the cache. The certificate is RSA-2048, valid for one year,
//! generated fresh at every startup, and never persisted.

use crate::error::{AppError, AppResult};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType, PKCS_RSA_SHA256};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use std::net::{IpAddr, Ipv4Addr};
use tracing::debug;

const RSA_BITS: usize = 2048;
const VALIDITY_DAYS: i64 = 365;

/// A freshly generated certificate and private key, PEM-encoded.
pub struct SelfSignedCert {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Generate the self-signed certificate.
///
/// RSA key generation takes a noticeable fraction of a second; callers on
/// the async path should wrap this in `spawn_blocking`.
pub fn generate_self_signed(
    registry_host: &str,
    extra_ips: &[Ipv4Addr],
) -> AppResult<SelfSignedCert> {
    let private_key = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_BITS)
        .map_err(|e| AppError::Internal(format!("failed to generate RSA key: {e}")))?;
    let key_pem = private_key
        .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
        .map_err(|e| AppError::Internal(format!("failed to encode RSA key: {e}")))?;
    let key_pair = KeyPair::from_pem_and_sign_algo(&key_pem, &PKCS_RSA_SHA256)
        .map_err(|e| AppError::Internal(format!("failed to load RSA key: {e}")))?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "Ollama LanCache");
    dn.push(DnType::CommonName, registry_host);
    params.distinguished_name = dn;

    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(VALIDITY_DAYS);

    params.subject_alt_names = san_entries(registry_host, extra_ips)?;
    let san_count = params.subject_alt_names.len();

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| AppError::Internal(format!("failed to self-sign certificate: {e}")))?;

    debug!(host = %registry_host, sans = san_count, "Generated self-signed certificate");
    Ok(SelfSignedCert {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
    })
}

fn san_entries(registry_host: &str, extra_ips: &[Ipv4Addr]) -> AppResult<Vec<SanType>> {
    let mut sans = Vec::new();
    for host in ["localhost", registry_host] {
        let name = host
            .try_into()
            .map_err(|e| AppError::Internal(format!("invalid SAN hostname {host}: {e}")))?;
        sans.push(SanType::DnsName(name));
    }
    sans.push(SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)));
    for ip in extra_ips {
        sans.push(SanType::IpAddress(IpAddr::V4(*ip)));
    }
    Ok(sans)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_cert_is_pem_pair() {
        let cert = generate_self_signed(
            "registry.ollama.ai",
            &[Ipv4Addr::new(192, 168, 1, 100)],
        )
        .expect("generate cert");
        assert!(cert.cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(cert.key_pem.contains("PRIVATE KEY-----"));
    }

    #[test]
    fn test_san_entries_cover_host_and_ips() {
        let sans = san_entries("registry.ollama.ai", &[Ipv4Addr::new(10, 0, 0, 2)]).unwrap();
        // localhost + registry host + loopback IP + one extra IP
        assert_eq!(sans.len(), 4);
    }
}
