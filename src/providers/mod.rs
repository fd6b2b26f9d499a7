//! # Certificate Providers
//!
//! Builds the signing backend an MRC's provider spec describes.
//!
//! | Provider | Backend |
//! |---|---|
//! | `tresor` | [`TresorIssuer`], one self-signed root per secret reference |
//! | `vault` | [`VaultIssuer`] over the Vault PKI secrets engine |
//! | `certManager` | not supported here, rejected with a configuration error |

mod tresor;
mod vault;

pub use tresor::TresorIssuer;
pub use vault::VaultIssuer;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::info;

use crate::certificate::Issuer;
use crate::config::ProviderConfig;
use crate::errors::{Error, Result};
use crate::mrc::{MeshRootCertificate, ProviderSpec, SecretReference, VaultProviderSpec};
use crate::store::{IssuerFactory, IssuerWithCa};

#[derive(Debug)]
pub struct ProviderGenerator {
    config: ProviderConfig,
    /// Tresor roots by the secret they stand for
    tresor_roots: DashMap<SecretReference, Arc<TresorIssuer>>,
    vault_issuers: ConnectionCache<VaultProviderSpec, VaultIssuer>,
}

impl ProviderGenerator {
    pub fn new(config: ProviderConfig) -> Self {
        Self { config, tresor_roots: DashMap::new(), vault_issuers: ConnectionCache::new() }
    }

    fn tresor(&self, secret_ref: &SecretReference) -> Result<Arc<TresorIssuer>> {
        let entry = self.tresor_roots.entry(secret_ref.clone()).or_try_insert_with(|| {
            let common_name = match secret_ref.namespace.as_str() {
                "" => secret_ref.name.clone(),
                namespace => format!("{}.{}", secret_ref.name, namespace),
            };
            TresorIssuer::new_root(&common_name, &self.config.organization, self.config.tresor_ca_validity())
                .map(Arc::new)
        })?;
        Ok(entry.value().clone())
    }

    fn vault_token(&self, mrc: &MeshRootCertificate) -> Result<&str> {
        self.config.vault_token.as_deref().filter(|token| !token.is_empty()).ok_or_else(|| {
            Error::config(format!(
                "no Vault token configured for MeshRootCertificate '{}'; set providers.vault_token",
                mrc.name()
            ))
        })
    }
}

#[async_trait]
impl IssuerFactory for ProviderGenerator {
    async fn issuer_for(&self, mrc: &MeshRootCertificate) -> Result<IssuerWithCa> {
        let (issuer, certificate_authority): (Arc<dyn Issuer>, Vec<u8>) = match &mrc.spec.provider {
            ProviderSpec::Tresor(spec) => {
                let issuer = self.tresor(&spec.ca.secret_ref)?;
                let certificate_authority = issuer.root_pem().to_vec();
                (issuer, certificate_authority)
            }
            ProviderSpec::Vault(spec) => {
                let token = self.vault_token(mrc)?;
                let mount = self.config.vault_pki_mount.as_str();
                let issuer = self
                    .vault_issuers
                    .get_or_connect(&mrc.namespaced_name(), spec, || VaultIssuer::connect(spec, token, mount))
                    .await?;
                let certificate_authority = issuer.certificate_authority().await?;
                (issuer, certificate_authority)
            }
            ProviderSpec::CertManager(spec) => {
                return Err(Error::config(format!(
                    "cert-manager issuer '{}' ({}/{}) requires a Kubernetes API client, which is not available",
                    spec.issuer_name, spec.issuer_group, spec.issuer_kind
                )));
            }
        };

        info!(mrc = %mrc.namespaced_name(), provider = mrc.spec.provider.kind(), "Built certificate issuer for MRC");
        Ok((issuer, certificate_authority))
    }
}

/// Connected backends by MRC, rebuilt when the MRC's provider settings change.
#[derive(Debug)]
struct ConnectionCache<S, T> {
    entries: DashMap<String, (S, Arc<T>)>,
}

impl<S: PartialEq + Clone, T> ConnectionCache<S, T> {
    fn new() -> Self {
        Self { entries: DashMap::new() }
    }

    async fn get_or_connect<F, Fut>(&self, key: &str, spec: &S, connect: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let cached = self.entries.get(key).filter(|entry| &entry.0 == spec).map(|entry| entry.1.clone());
        if let Some(backend) = cached {
            return Ok(backend);
        }

        // Concurrent misses may both connect; the last one stays cached.
        let backend = Arc::new(connect().await?);
        self.entries.insert(key.to_string(), (spec.clone(), backend.clone()));
        Ok(backend)
    }
}
