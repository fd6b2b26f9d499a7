//! Tresor: an in-process certificate authority backed by a self-signed root.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyPair, KeyUsagePurpose,
    SanType, SerialNumber as X509Serial,
};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::certificate::{Certificate, CommonName, IssueOptions, Issuer, PrivateKey, SerialNumber};
use crate::errors::{Error, Result};

const SERIAL_NUMBER_BYTES: usize = 16;

/// Signs leaf certificates with a root generated at construction.
pub struct TresorIssuer {
    root: rcgen::Certificate,
    root_key: KeyPair,
    root_pem: Vec<u8>,
    organization: String,
}

impl fmt::Debug for TresorIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TresorIssuer")
            .field("organization", &self.organization)
            .field("root_key", &"[REDACTED]")
            .finish()
    }
}

impl TresorIssuer {
    /// Generate a new self-signed root called `common_name`.
    pub fn new_root(common_name: &str, organization: &str, validity: Duration) -> Result<Self> {
        let root_key = KeyPair::generate().map_err(rcgen_error)?;
        let mut params = CertificateParams::new(Vec::<String>::new()).map_err(rcgen_error)?;

        params.distinguished_name.push(DnType::CommonName, common_name);
        params.distinguished_name.push(DnType::CountryName, "US");
        params.distinguished_name.push(DnType::LocalityName, "CA");
        params.distinguished_name.push(DnType::OrganizationName, organization);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign, KeyUsagePurpose::DigitalSignature];
        params.serial_number = Some(X509Serial::from_slice(&random_serial()));

        let (not_before, not_after) = validity_window(Utc::now(), validity)?;
        params.not_before = not_before;
        params.not_after = not_after;

        let root = params.self_signed(&root_key).map_err(rcgen_error)?;
        let root_pem = root.pem().into_bytes();

        info!(common_name = %common_name, organization = %organization, "Created self-signed root certificate");
        Ok(Self { root, root_key, root_pem, organization: organization.to_string() })
    }

    pub fn root_pem(&self) -> &[u8] {
        &self.root_pem
    }
}

#[async_trait]
impl Issuer for TresorIssuer {
    async fn issue_certificate(&self, common_name: &CommonName, options: &IssueOptions) -> Result<Certificate> {
        let key = KeyPair::generate().map_err(rcgen_error)?;
        let mut params = CertificateParams::new(vec![common_name.to_string()]).map_err(rcgen_error)?;
        if let Some(spiffe_id) = options.spiffe_id(common_name) {
            params.subject_alt_names.push(SanType::URI(Ia5String::try_from(spiffe_id).map_err(rcgen_error)?));
        }

        params.distinguished_name.push(DnType::CommonName, common_name.as_str());
        params.distinguished_name.push(DnType::OrganizationName, self.organization.as_str());
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth, ExtendedKeyUsagePurpose::ClientAuth];

        let serial = random_serial();
        let serial_number = SerialNumber::new(hex::encode(serial));
        params.serial_number = Some(X509Serial::from_slice(&serial));

        let now = Utc::now();
        let (not_before, not_after) = validity_window(now, options.validity)?;
        params.not_before = not_before;
        params.not_after = not_after;
        let expiration = DateTime::from_timestamp(not_after.unix_timestamp(), 0)
            .ok_or_else(|| Error::internal("certificate expiration out of range"))?;

        let cert = params.signed_by(&key, &self.root, &self.root_key).map_err(rcgen_error)?;

        debug!(common_name = %common_name, serial_number = %serial_number, expiration = %expiration, "Signed certificate");
        Ok(Certificate::new(
            common_name.clone(),
            serial_number,
            expiration,
            cert.pem().into_bytes(),
            PrivateKey::new(key.serialize_pem().into_bytes()),
            self.root_pem.clone(),
        ))
    }

    async fn certificate_authority(&self) -> Result<Vec<u8>> {
        Ok(self.root_pem.clone())
    }
}

/// Positive, minimal-length DER integer so the encoded bytes equal the hex serial.
fn random_serial() -> [u8; SERIAL_NUMBER_BYTES] {
    let mut bytes = [0u8; SERIAL_NUMBER_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[0] = (bytes[0] & 0x7f) | 0x40;
    bytes
}

fn validity_window(now: DateTime<Utc>, validity: Duration) -> Result<(OffsetDateTime, OffsetDateTime)> {
    let validity = i64::try_from(validity.as_secs()).map_err(|_| Error::validation("certificate validity too large"))?;
    let not_before = OffsetDateTime::from_unix_timestamp(now.timestamp())
        .map_err(|e| Error::internal(format!("invalid certificate start time: {e}")))?;
    let not_after = OffsetDateTime::from_unix_timestamp(now.timestamp().saturating_add(validity))
        .map_err(|e| Error::validation(format!("invalid certificate validity: {e}")))?;
    Ok((not_before, not_after))
}

fn rcgen_error(error: rcgen::Error) -> Error {
    Error::backend(format!("Self-signed certificate generation failed: {error}"))
}
