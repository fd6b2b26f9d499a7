//! Vault PKI issuer.
//!
//! Certificates are generated by a Vault PKI secrets engine role. Vault does
//! not hand out the issuing CA on its own, so the trust bundle is taken from a
//! short-lived `init-cert` generated when the issuer connects.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use tracing::{debug, error, info};
use vaultrs::api::pki::requests::GenerateCertificateRequestBuilder;
use vaultrs::api::pki::responses::GenerateCertificateResponse;
use vaultrs::client::{VaultClient, VaultClientSettingsBuilder};

use crate::certificate::{Certificate, CommonName, IssueOptions, Issuer, PrivateKey, SerialNumber};
use crate::errors::{Error, Result};
use crate::mrc::VaultProviderSpec;
use crate::retry::{retry_when, RetryConfig};

const INIT_CERT_COMMON_NAME: &str = "init-cert";
const INIT_CERT_VALIDITY: Duration = Duration::from_secs(1);

pub struct VaultIssuer {
    client: VaultClient,
    address: String,
    mount: String,
    role: String,
    retry: RetryConfig,
    certificate_authority: Vec<u8>,
}

impl fmt::Debug for VaultIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultIssuer")
            .field("address", &self.address)
            .field("pki_mount", &self.mount)
            .field("pki_role", &self.role)
            .field("retry", &self.retry)
            .field("client", &"[VaultClient]")
            .finish()
    }
}

impl VaultIssuer {
    /// Connect to the Vault server named by `spec` and fetch its issuing CA.
    pub async fn connect(spec: &VaultProviderSpec, token: &str, mount: &str) -> Result<Self> {
        let address = spec.address();
        let mut settings_builder = VaultClientSettingsBuilder::default();
        settings_builder.address(&address);
        settings_builder.token(token);
        let settings = settings_builder
            .build()
            .map_err(|e| Error::config(format!("Invalid Vault configuration: {}", e)))?;
        let client = VaultClient::new(settings)
            .map_err(|e| Error::backend(format!("Failed to create Vault client: {}", e)))?;

        let mut issuer = Self {
            client,
            address,
            mount: mount.to_string(),
            role: spec.role.clone(),
            retry: RetryConfig::for_provider(),
            certificate_authority: Vec::new(),
        };

        let init_cert = issuer.generate(INIT_CERT_COMMON_NAME, INIT_CERT_VALIDITY, None).await?;
        issuer.certificate_authority = init_cert.issuing_ca.into_bytes();

        info!(
            vault_addr = %issuer.address,
            pki_mount = %issuer.mount,
            pki_role = %issuer.role,
            "Vault PKI issuer initialized"
        );
        Ok(issuer)
    }

    async fn generate(
        &self,
        common_name: &str,
        validity: Duration,
        uri_san: Option<&str>,
    ) -> Result<GenerateCertificateResponse> {
        let ttl = format!("{}s", validity.as_secs().max(1));
        let ttl = ttl.as_str();

        retry_when(&self.retry, "vault_generate_certificate", is_retryable, || async move {
            let mut opts = GenerateCertificateRequestBuilder::default();
            opts.common_name(common_name);
            opts.ttl(ttl);
            if let Some(uri_san) = uri_san {
                opts.uri_sans(uri_san);
            }

            vaultrs::pki::cert::generate(&self.client, &self.mount, &self.role, Some(&mut opts)).await.map_err(|e| {
                error!(error = %e, common_name = %common_name, vault_addr = %self.address, "Vault PKI certificate generation failed");
                Error::backend(format!("Vault PKI certificate generation failed: {}", e))
            })
        })
        .await
    }
}

#[async_trait]
impl Issuer for VaultIssuer {
    async fn issue_certificate(&self, common_name: &CommonName, options: &IssueOptions) -> Result<Certificate> {
        let spiffe_id = options.spiffe_id(common_name);
        let response = self.generate(common_name.as_str(), options.validity, spiffe_id.as_deref()).await?;

        let timestamp = response
            .expiration
            .ok_or_else(|| Error::backend("Vault PKI response missing expiration timestamp"))?;
        let expiration = DateTime::from_timestamp(timestamp as i64, 0)
            .ok_or_else(|| Error::backend(format!("Invalid expiration timestamp from Vault PKI: {}", timestamp)))?;

        debug!(common_name = %common_name, serial_number = %response.serial_number, "Issued certificate via Vault PKI");
        Ok(Certificate::new(
            common_name.clone(),
            SerialNumber::new(response.serial_number),
            expiration,
            response.certificate.into_bytes(),
            PrivateKey::new(response.private_key.into_bytes()),
            response.issuing_ca.into_bytes(),
        ))
    }

    async fn certificate_authority(&self) -> Result<Vec<u8>> {
        Ok(self.certificate_authority.clone())
    }
}

fn is_retryable(error: &Error) -> bool {
    match error {
        Error::Backend(message) => is_retryable_vault_error(message),
        other => other.is_retryable(),
    }
}

/// Whether a Vault error message describes a transient failure.
fn is_retryable_vault_error(error: &str) -> bool {
    let error = error.to_lowercase();

    let network = ["connection refused", "connection reset", "connection closed", "timed out", "timeout"];
    if network.iter().any(|pattern| error.contains(pattern)) {
        return true;
    }

    if error.contains("429") || error.contains("too many requests") {
        return true;
    }

    ["500", "502", "503", "504"].iter().any(|status| error.contains(status))
}
