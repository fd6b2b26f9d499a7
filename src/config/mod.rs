//! # Configuration Management
//!
//! Configuration is read from an optional file and from `MESHROOT__<SECTION>__<KEY>`
//! environment variables (e.g. `MESHROOT__CERTIFICATES__RENEW_BEFORE_SECS=60`),
//! environment taking precedence. Every section has defaults, so an empty
//! environment yields a working configuration.

mod settings;

pub use settings::{AppConfig, CertificateConfig, MrcConfig, ObservabilityConfig, ProviderConfig};

use std::path::Path;

use crate::errors::Result;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "MESHROOT";

impl AppConfig {
    /// Load configuration from `path` (if given) and the environment, then validate it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX).prefix_separator("__").separator("__").try_parsing(true),
        );

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        tracing::debug!(
            config_file = ?path,
            namespace = %config.mrc.namespace,
            leader = config.mrc.leader,
            "Configuration loaded"
        );

        Ok(config)
    }
}
