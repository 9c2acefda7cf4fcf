// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Cryptographic identity of an agent — pure Rust, no OpenSSL.
//!
//! Each agent auto-generates a private CA on first boot. The CA cert is what
//! peers exchange during the peering handshake and its SHA-256 fingerprint is
//! the agent's pinnable identity; the private key never leaves this agent.
//! A leaf cert signed by the CA serves the peer-facing TLS listener and can
//! be rotated independently without re-peering.
//!
//! | Property       | CA                         | Leaf                     |
//! |----------------|----------------------------|--------------------------|
//! | Key algorithm  | ECDSA P-256                | ECDSA P-256              |
//! | Validity       | 10 years                   | 1 year                   |
//! | Constraints    | `CA:TRUE, pathlen:0`       | server + client auth     |
//!
//! The invite token lives beside the CA: a single-use ≥128-bit random hex
//! string, rotated the moment an invite consumes it.

use anyhow::Context;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use sha2::{Digest, Sha256};

/// CA validity window: 10 years.
const CA_VALIDITY_DAYS: i64 = 3650;

/// Leaf validity window: 1 year.
const LEAF_VALIDITY_DAYS: i64 = 365;

/// The agent's loaded (or freshly generated) identity material.
#[derive(Debug, Clone)]
pub struct AgentIdentity {
    pub ca_cert_pem: String,
    pub ca_key_pem: String,
    pub cert_pem: String,
    pub key_pem: String,
    /// Lowercase-hex SHA-256 over the DER encoding of the CA cert — the
    /// value operators pin during peering.
    pub fingerprint: String,
}

/// Generate a fresh CA plus a leaf cert signed by it.
pub fn generate(agent_name: &str, self_ip: &str) -> anyhow::Result<AgentIdentity> {
    let ca_key = KeyPair::generate().context("generating CA key pair")?;

    let mut ca_dn = DistinguishedName::new();
    ca_dn.push(DnType::CommonName, format!("{agent_name}-ca"));
    ca_dn.push(DnType::OrganizationName, "porpulsion");

    let mut ca_params = CertificateParams::default();
    ca_params.distinguished_name = ca_dn;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    ca_params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
    ];
    ca_params.not_before = time::OffsetDateTime::now_utc();
    ca_params.not_after = ca_params.not_before + time::Duration::days(CA_VALIDITY_DAYS);

    let ca_cert = ca_params
        .self_signed(&ca_key)
        .context("self-signing CA certificate")?;

    let ca_cert_pem = ca_cert.pem();
    let (cert_pem, key_pem) =
        issue_leaf(&ca_cert_pem, &ca_key.serialize_pem(), agent_name, self_ip)?;
    let fingerprint = fingerprint(&ca_cert_pem)?;

    Ok(AgentIdentity {
        ca_cert_pem,
        ca_key_pem: ca_key.serialize_pem(),
        cert_pem,
        key_pem,
        fingerprint,
    })
}

/// Issue a new leaf cert signed by an existing CA.
///
/// Used on first boot and whenever the agent's IP SAN changed — peers
/// connecting by bare IP must pass TLS hostname verification if they choose
/// to verify at all.
pub fn issue_leaf(
    ca_cert_pem: &str,
    ca_key_pem: &str,
    agent_name: &str,
    self_ip: &str,
) -> anyhow::Result<(String, String)> {
    let ca_key = KeyPair::from_pem(ca_key_pem).context("parsing CA key")?;
    let issuer = CertificateParams::from_ca_cert_pem(ca_cert_pem)
        .context("parsing CA cert")?
        .self_signed(&ca_key)
        .context("rebuilding CA issuer")?;

    let leaf_key = KeyPair::generate().context("generating leaf key pair")?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, agent_name);
    dn.push(DnType::OrganizationName, "porpulsion");

    let mut params = CertificateParams::new(vec![agent_name.to_string()])
        .context("building leaf cert params")?;
    params.distinguished_name = dn;
    if let Ok(ip) = self_ip.parse::<std::net::IpAddr>() {
        params.subject_alt_names.push(SanType::IpAddress(ip));
    }
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    params.not_before = time::OffsetDateTime::now_utc();
    params.not_after = params.not_before + time::Duration::days(LEAF_VALIDITY_DAYS);

    let leaf = params
        .signed_by(&leaf_key, &issuer, &ca_key)
        .context("signing leaf certificate")?;

    Ok((leaf.pem(), leaf_key.serialize_pem()))
}

/// Lowercase-hex SHA-256 fingerprint over the DER encoding of the first
/// certificate in a PEM bundle.
pub fn fingerprint(cert_pem: &str) -> anyhow::Result<String> {
    let mut reader = std::io::Cursor::new(cert_pem.as_bytes());
    let der = rustls_pemfile::certs(&mut reader)
        .next()
        .ok_or_else(|| anyhow::anyhow!("no certificate in PEM input"))?
        .context("parsing certificate")?;
    Ok(hex::encode(Sha256::digest(&der)))
}

/// Cryptographically random 256-bit invite token, hex encoded.
pub fn generate_invite_token() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// ── Unit tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_ca_and_leaf() {
        let id = generate("us-east", "10.0.0.1").unwrap();
        assert!(id.ca_cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(id.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(id.key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn fingerprint_is_lowercase_hex_sha256() {
        let id = generate("us-east", "").unwrap();
        assert_eq!(id.fingerprint.len(), 64);
        assert!(id
            .fingerprint
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn fingerprint_is_stable_for_same_cert() {
        let id = generate("us-east", "").unwrap();
        let fp1 = fingerprint(&id.ca_cert_pem).unwrap();
        let fp2 = fingerprint(&id.ca_cert_pem).unwrap();
        assert_eq!(fp1, fp2);
        assert_eq!(fp1, id.fingerprint);
    }

    #[test]
    fn two_agents_have_different_fingerprints() {
        let a = generate("a", "").unwrap();
        let b = generate("b", "").unwrap();
        assert_ne!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn leaf_can_be_reissued_from_stored_ca() {
        let id = generate("us-east", "10.0.0.1").unwrap();
        let (cert, key) = issue_leaf(&id.ca_cert_pem, &id.ca_key_pem, "us-east", "10.9.9.9")
            .unwrap();
        assert!(cert.contains("BEGIN CERTIFICATE"));
        assert!(key.contains("PRIVATE KEY"));
        // The CA fingerprint is unchanged by a leaf rotation.
        assert_eq!(fingerprint(&id.ca_cert_pem).unwrap(), id.fingerprint);
    }

    #[test]
    fn invite_token_has_128_bits_of_entropy_or_more() {
        let token = generate_invite_token();
        assert_eq!(token.len(), 64, "32 random bytes hex-encoded");
        assert_ne!(token, generate_invite_token());
    }
}
