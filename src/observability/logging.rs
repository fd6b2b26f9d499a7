//! # Structured Logging
//!
//! Subscriber setup and span macros for the certificate subsystem.
//!
//! `RUST_LOG` takes precedence over the configured level, so a single module
//! can be turned up without touching configuration:
//!
//! ```text
//! RUST_LOG=info,meshroot::mrc=debug meshroot
//! ```

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::ObservabilityConfig;
use crate::errors::{Error, Result};

/// Create a tracing span for work on a single certificate identity.
///
/// ```rust,ignore
/// let span = certificate_span!("rotate", cn);
/// ```
#[macro_export]
macro_rules! certificate_span {
    ($operation:expr, $common_name:expr) => {
        tracing::debug_span!(
            "certificate",
            operation = %$operation,
            common_name = %$common_name
        )
    };
    ($operation:expr, $common_name:expr, $($field:tt)*) => {
        tracing::debug_span!(
            "certificate",
            operation = %$operation,
            common_name = %$common_name,
            $($field)*
        )
    };
}

/// Create a tracing span for handling one MeshRootCertificate.
#[macro_export]
macro_rules! mrc_span {
    ($operation:expr, $mrc:expr) => {
        tracing::info_span!(
            "mesh_root_certificate",
            operation = %$operation,
            mrc = %$mrc,
            operation_id = %uuid::Uuid::new_v4()
        )
    };
    ($operation:expr, $mrc:expr, $($field:tt)*) => {
        tracing::info_span!(
            "mesh_root_certificate",
            operation = %$operation,
            mrc = %$mrc,
            operation_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Install the global tracing subscriber.
///
/// Returns an error instead of panicking when a subscriber is already installed.
pub fn init_logging(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| Error::config(format!("Invalid log level '{}': {}", config.log_level, e)))?;

    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.json_logging {
        registry.with(fmt::layer().json().with_current_span(true).with_target(true)).try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };

    result.map_err(|e| Error::internal(format!("Failed to install tracing subscriber: {}", e)))
}

/// Log configuration at startup
pub fn log_config_info(config: &crate::config::AppConfig) {
    tracing::info!(
        namespace = %config.mrc.namespace,
        leader = config.mrc.leader,
        owned_use_cases = ?config.mrc.owned_use_cases,
        service_cert_validity_secs = config.certificates.service_cert_validity_secs,
        renew_before_secs = config.certificates.renew_before_secs,
        metrics_enabled = %config.observability.enable_metrics,
        "meshroot certificate manager configuration"
    );
}
