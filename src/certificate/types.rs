//! Certificate data model.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::errors::{Error, Result};

/// Identity a certificate is issued for, e.g. `<proxy-uuid>.<service-account>.<namespace>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommonName(String);

impl CommonName {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CommonName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CommonName {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for CommonName {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Hex-encoded certificate serial number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SerialNumber(String);

impl SerialNumber {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SerialNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SerialNumber {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// PEM-encoded private key. Zeroed on drop and never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey(Vec<u8>);

impl PrivateKey {
    pub fn new(pem: impl Into<Vec<u8>>) -> Self {
        Self(pem.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey([REDACTED])")
    }
}

/// An issued certificate together with its key material and trust bundle.
///
/// `key_issuer_id` and `pub_issuer_id` record which issuers produced the
/// private key and the trust bundle. The Manager compares them against its
/// active issuers to detect entries left over from a previous root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    common_name: CommonName,
    serial_number: SerialNumber,
    expiration: DateTime<Utc>,
    cert_chain: Vec<u8>,
    private_key: PrivateKey,
    issuing_ca: Vec<u8>,
    key_issuer_id: String,
    pub_issuer_id: String,
}

impl Certificate {
    /// Build a certificate as returned by an issuer backend. Issuer tags are
    /// filled in by the Manager.
    pub fn new(
        common_name: CommonName,
        serial_number: SerialNumber,
        expiration: DateTime<Utc>,
        cert_chain: Vec<u8>,
        private_key: PrivateKey,
        issuing_ca: Vec<u8>,
    ) -> Self {
        Self {
            common_name,
            serial_number,
            expiration,
            cert_chain,
            private_key,
            issuing_ca,
            key_issuer_id: String::new(),
            pub_issuer_id: String::new(),
        }
    }

    /// Decode the leaf of a PEM certificate chain to recover its common name,
    /// serial number and expiration.
    pub fn from_pem(cert_chain: Vec<u8>, private_key: PrivateKey, issuing_ca: Vec<u8>) -> Result<Self> {
        let (_, pem) = x509_parser::pem::parse_x509_pem(&cert_chain)
            .map_err(|e| Error::validation(format!("Invalid PEM certificate: {}", e)))?;
        let x509 = pem
            .parse_x509()
            .map_err(|e| Error::validation(format!("Invalid x509 certificate: {}", e)))?;

        let common_name = x509
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(CommonName::from)
            .ok_or_else(|| Error::validation("Certificate subject has no common name"))?;
        let serial_number = SerialNumber::new(hex::encode(x509.raw_serial()));
        let timestamp = x509.validity().not_after.timestamp();
        let expiration = DateTime::from_timestamp(timestamp, 0)
            .ok_or_else(|| Error::validation(format!("Invalid certificate expiration: {}", timestamp)))?;

        Ok(Self::new(common_name, serial_number, expiration, cert_chain, private_key, issuing_ca))
    }

    pub fn common_name(&self) -> &CommonName {
        &self.common_name
    }

    pub fn serial_number(&self) -> &SerialNumber {
        &self.serial_number
    }

    pub fn expiration(&self) -> DateTime<Utc> {
        self.expiration
    }

    /// PEM certificate chain, leaf first.
    pub fn certificate_chain(&self) -> &[u8] {
        &self.cert_chain
    }

    pub fn private_key(&self) -> &PrivateKey {
        &self.private_key
    }

    /// PEM trust bundle peers should validate against.
    pub fn issuing_ca(&self) -> &[u8] {
        &self.issuing_ca
    }

    /// ID of the issuer that signed the certificate and produced its key.
    pub fn key_issuer_id(&self) -> &str {
        &self.key_issuer_id
    }

    /// ID of the issuer whose trust bundle was attached.
    pub fn pub_issuer_id(&self) -> &str {
        &self.pub_issuer_id
    }

    /// Whether the certificate was produced by exactly this issuer pair.
    pub fn issued_by(&self, signing_id: &str, validating_id: &str) -> bool {
        self.key_issuer_id == signing_id && self.pub_issuer_id == validating_id
    }

    pub(crate) fn with_trust_bundle(mut self, issuing_ca: Vec<u8>) -> Self {
        self.issuing_ca = issuing_ca;
        self
    }

    pub(crate) fn with_issuer_ids(mut self, key_issuer_id: &str, pub_issuer_id: &str) -> Self {
        self.key_issuer_id = key_issuer_id.to_string();
        self.pub_issuer_id = pub_issuer_id.to_string();
        self
    }
}

impl fmt::Display for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cert: CommonName: {}, SerialNumber: {}, Expiration: {}",
            self.common_name, self.serial_number, self.expiration
        )
    }
}
