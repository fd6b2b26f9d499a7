//! # Configuration Settings
//!
//! Defines the configuration structure for the meshroot certificate subsystem.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::errors::{Error, Result};
use crate::mrc::UseCase;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Certificate issuance and rotation
    #[validate(nested)]
    pub certificates: CertificateConfig,

    /// MeshRootCertificate rotation protocol
    #[validate(nested)]
    pub mrc: MrcConfig,

    /// Certificate provider backends
    #[validate(nested)]
    pub providers: ProviderConfig,

    /// Logging and metrics
    #[validate(nested)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(Error::from)?;
        self.validate_custom()
    }

    /// Cross-field rules the validator derive cannot express
    fn validate_custom(&self) -> Result<()> {
        if self.certificates.renew_before_secs >= self.certificates.service_cert_validity_secs {
            return Err(Error::validation(
                "Certificates must be renewed before they expire: renew_before_secs must be less than service_cert_validity_secs",
            ));
        }

        if self.mrc.stage_duration_secs > self.mrc.validating_wait_secs {
            return Err(Error::validation("stage_duration_secs cannot exceed validating_wait_secs"));
        }

        Ok(())
    }
}

/// Certificate issuance and rotation configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CertificateConfig {
    /// Validity of service certificates in seconds
    #[validate(range(min = 60, message = "Service certificate validity must be at least 60 seconds"))]
    pub service_cert_validity_secs: u64,

    /// Rotate certificates this long before they expire
    #[validate(range(min = 1, message = "renew_before_secs must be at least 1 second"))]
    pub renew_before_secs: u64,

    /// Upper bound of the random offset added to renew_before_secs per check
    #[validate(range(max = 3600, message = "Rotation jitter must be at most one hour"))]
    pub rotation_jitter_secs: u64,

    /// Interval between rotor passes
    #[validate(range(min = 1, max = 3600, message = "Rotor interval must be between 1 and 3600 seconds"))]
    pub rotor_interval_secs: u64,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            service_cert_validity_secs: 24 * 60 * 60,
            renew_before_secs: 30,
            rotation_jitter_secs: 5,
            rotor_interval_secs: 5,
        }
    }
}

impl CertificateConfig {
    pub fn service_cert_validity(&self) -> Duration {
        Duration::from_secs(self.service_cert_validity_secs)
    }

    pub fn renew_before(&self) -> Duration {
        Duration::from_secs(self.renew_before_secs)
    }

    pub fn rotation_jitter(&self) -> Duration {
        Duration::from_secs(self.rotation_jitter_secs)
    }

    pub fn rotor_interval(&self) -> Duration {
        Duration::from_secs(self.rotor_interval_secs)
    }
}

/// MeshRootCertificate protocol configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct MrcConfig {
    /// Namespace holding the MeshRootCertificate resources
    #[validate(length(min = 1, message = "Namespace cannot be empty"))]
    pub namespace: String,

    /// Minimum time spent in each rotation stage
    #[validate(range(min = 1, message = "Stage duration must be at least 1 second"))]
    pub stage_duration_secs: u64,

    /// Wait before reporting a validating stage, long enough for the new trust bundle to reach every proxy
    #[validate(range(min = 1, message = "Validating wait must be at least 1 second"))]
    pub validating_wait_secs: u64,

    /// Interval between full re-lists of every MeshRootCertificate
    #[validate(range(min = 1, max = 3600, message = "Resync interval must be between 1 and 3600 seconds"))]
    pub resync_interval_secs: u64,

    /// Polling interval of the reconciliation loop
    #[validate(range(min = 1, max = 3600, message = "Reconcile interval must be between 1 and 3600 seconds"))]
    pub reconcile_interval_secs: u64,

    /// How long startup waits for a valid MeshRootCertificate to configure the issuers
    #[validate(range(min = 1, max = 600, message = "Init timeout must be between 1 and 600 seconds"))]
    pub init_timeout_secs: u64,

    /// Whether this process accepts newly created Passive MeshRootCertificates
    pub leader: bool,

    /// Use cases whose component status this process reports
    #[validate(length(min = 1, message = "At least one use case must be owned"))]
    pub owned_use_cases: Vec<UseCase>,

    /// Optional YAML file of MeshRootCertificates loaded at startup
    pub seed_file: Option<PathBuf>,
}

impl Default for MrcConfig {
    fn default() -> Self {
        Self {
            namespace: "meshroot-system".to_string(),
            stage_duration_secs: 5 * 60,
            validating_wait_secs: 30 * 60,
            resync_interval_secs: 30,
            reconcile_interval_secs: 5,
            init_timeout_secs: 10,
            leader: false,
            owned_use_cases: UseCase::ALL.to_vec(),
            seed_file: None,
        }
    }
}

impl MrcConfig {
    pub fn stage_duration(&self) -> Duration {
        Duration::from_secs(self.stage_duration_secs)
    }

    pub fn validating_wait(&self) -> Duration {
        Duration::from_secs(self.validating_wait_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }
}

/// Certificate provider configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ProviderConfig {
    /// Organization written into self-signed root certificates
    #[validate(length(min = 1, message = "Organization cannot be empty"))]
    pub organization: String,

    /// Vault token used when a MeshRootCertificate does not reference one
    pub vault_token: Option<String>,

    /// Mount path of the Vault PKI secrets engine when the resource leaves it unset
    #[validate(length(min = 1, message = "Vault PKI mount cannot be empty"))]
    pub vault_pki_mount: String,

    /// Validity of self-signed roots
    #[validate(range(min = 3600, message = "Root validity must be at least one hour"))]
    pub tresor_ca_validity_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            organization: "meshroot".to_string(),
            vault_token: None,
            vault_pki_mount: "pki".to_string(),
            tresor_ca_validity_secs: 10 * 365 * 24 * 60 * 60,
        }
    }
}

impl ProviderConfig {
    pub fn tresor_ca_validity(&self) -> Duration {
        Duration::from_secs(self.tresor_ca_validity_secs)
    }
}

/// Observability configuration for logging and metrics
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error), overridden by RUST_LOG
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    /// Enable JSON structured logging
    pub json_logging: bool,

    /// Enable the Prometheus exporter
    pub enable_metrics: bool,

    /// Metrics server port (0 = disabled)
    pub metrics_port: u16,

    /// Global `service` label on exported metrics
    #[validate(length(min = 1, message = "Service name cannot be empty"))]
    pub service_name: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logging: false,
            enable_metrics: false,
            metrics_port: 9090,
            service_name: "meshroot".to_string(),
        }
    }
}

impl ObservabilityConfig {
    /// Get metrics bind address (None if disabled)
    pub fn metrics_bind_address(&self) -> Option<String> {
        if self.metrics_port == 0 {
            None
        } else {
            Some(format!("0.0.0.0:{}", self.metrics_port))
        }
    }
}
