//! # Certificate Manager
//!
//! Issues certificates for mesh identities, caches them, and composes trust
//! bundles from the active signing and validating issuers.
//!
//! ## Cache validity
//!
//! Every cached certificate is tagged with the IDs of the issuers that produced
//! its key (`key_issuer_id`) and its trust bundle (`pub_issuer_id`). A cached
//! entry is served only while both tags match the current issuers; after a
//! root swap the same identity is transparently reissued.
//!
//! ## Concurrency
//!
//! Issuance for different identities runs fully in parallel. Concurrent calls
//! for the same identity are collapsed: the first caller issues, the others
//! wait on a per-identity lock and then find the fresh entry in the cache.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::issuer::{ActiveIssuers, IssueOptions, IssuerHandle, IssuerRole, IssuerSnapshot};
use super::types::{Certificate, CommonName};
use crate::errors::{Error, Result};
use crate::messaging::{MessageBus, RotationAnnouncement, Subscription};
use crate::observability::MetricsRecorder;

const ROTATIONS_TOPIC: &str = "certificate_rotations";

#[derive(Debug, Clone)]
struct CachedCertificate {
    certificate: Arc<Certificate>,
    validity: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IssueMode {
    /// Serve a valid cached entry, otherwise issue and insert
    Cached,
    /// Reissue unconditionally, only replacing an entry that is still cached
    Replace,
}

/// Identity-scoped certificate issuance with a dual-issuer trust model.
#[derive(Debug)]
pub struct Manager {
    issuers: ActiveIssuers,
    cache: DashMap<CommonName, CachedCertificate>,
    in_flight: DashMap<CommonName, Arc<Mutex<()>>>,
    rotations: MessageBus<RotationAnnouncement>,
    metrics: MetricsRecorder,
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

impl Manager {
    /// Create a Manager with no issuers. Issuance fails with a configuration
    /// error until both a signing and a validating issuer are set.
    pub fn new() -> Self {
        Self {
            issuers: ActiveIssuers::new(),
            cache: DashMap::new(),
            in_flight: DashMap::new(),
            rotations: MessageBus::new(ROTATIONS_TOPIC),
            metrics: MetricsRecorder::new(),
        }
    }

    /// Create a Manager whose signing and validating issuer is `issuer`.
    pub async fn with_issuer(issuer: IssuerHandle) -> Self {
        let manager = Self::new();
        manager.set_issuer(IssuerRole::Both, issuer).await;
        manager
    }

    /// Swap the issuer in the given role. Returns whether the active issuers changed.
    pub async fn set_issuer(&self, role: IssuerRole, issuer: IssuerHandle) -> bool {
        self.issuers.set(role, issuer).await
    }

    /// Consistent view of the active issuers.
    pub async fn issuers(&self) -> Result<IssuerSnapshot> {
        self.issuers.snapshot().await
    }

    /// IDs of the active (signing, validating) issuers, whichever are set.
    pub async fn issuer_ids(&self) -> (Option<String>, Option<String>) {
        self.issuers.ids().await
    }

    /// Resolve once both issuers are configured.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        self.issuers.wait_until_ready(timeout).await
    }

    pub fn is_ready(&self) -> bool {
        self.issuers.is_ready()
    }

    /// Return the cached certificate for `common_name` if it was produced by the
    /// active issuers, otherwise issue a new one and cache it.
    pub async fn issue_certificate(&self, common_name: &CommonName, validity: Duration) -> Result<Arc<Certificate>> {
        let snapshot = self.issuers.snapshot().await?;
        if let Some(certificate) = self.cached_for(common_name, &snapshot) {
            self.metrics.record_cache_lookup(true);
            return Ok(certificate);
        }
        self.metrics.record_cache_lookup(false);

        self.issue_locked(common_name, validity, IssueMode::Cached).await
    }

    /// Cache lookup only.
    pub fn get_certificate(&self, common_name: &CommonName) -> Result<Arc<Certificate>> {
        self.cache
            .get(common_name)
            .map(|entry| entry.certificate.clone())
            .ok_or_else(|| Error::not_found("Certificate", common_name.as_str()))
    }

    /// Reissue the certificate for `common_name` with the active issuers and
    /// replace the cached entry, then announce the rotation.
    ///
    /// Fails with not-found if the identity is not cached, including when it is
    /// released while the new certificate is being issued.
    pub async fn rotate_certificate(&self, common_name: &CommonName) -> Result<Arc<Certificate>> {
        let validity = self
            .cache
            .get(common_name)
            .map(|entry| entry.validity)
            .ok_or_else(|| Error::not_found("Certificate", common_name.as_str()))?;

        self.issue_locked(common_name, validity, IssueMode::Replace).await
    }

    /// Drop the cached certificate for `common_name`. Returns whether one was cached.
    pub fn release_certificate(&self, common_name: &CommonName) -> bool {
        let released = self.cache.remove(common_name).is_some();
        debug!(common_name = %common_name, released = released, "Releasing certificate");
        self.metrics.set_cached_certificates(self.cache.len());
        released
    }

    /// Snapshot of every cached certificate.
    pub fn list_certificates(&self) -> Vec<Arc<Certificate>> {
        self.cache.iter().map(|entry| entry.value().certificate.clone()).collect()
    }

    /// Trust bundle of the root currently signing new certificates.
    pub async fn get_root_certificate(&self) -> Result<Vec<u8>> {
        Ok(self.issuers.snapshot().await?.signing.certificate_authority.clone())
    }

    /// Trust domain of the signing issuer.
    pub async fn trust_domain(&self) -> Result<String> {
        Ok(self.issuers.snapshot().await?.signing.trust_domain.clone())
    }

    /// Whether `certificate` was produced by issuers other than the active ones.
    pub async fn is_stale(&self, certificate: &Certificate) -> bool {
        match self.issuer_ids().await {
            (Some(signing), Some(validating)) => !certificate.issued_by(&signing, &validating),
            _ => false,
        }
    }

    /// Subscribe to rotation announcements.
    pub fn subscribe_rotations(&self) -> Subscription<RotationAnnouncement> {
        self.rotations.subscribe()
    }

    fn cached_for(&self, common_name: &CommonName, snapshot: &IssuerSnapshot) -> Option<Arc<Certificate>> {
        let entry = self.cache.get(common_name)?;
        if entry.certificate.issued_by(&snapshot.signing.id, &snapshot.validating.id) {
            Some(entry.certificate.clone())
        } else {
            debug!(
                common_name = %common_name,
                key_issuer_id = %entry.certificate.key_issuer_id(),
                pub_issuer_id = %entry.certificate.pub_issuer_id(),
                "Cached certificate was issued by a previous root"
            );
            None
        }
    }

    async fn issue_locked(&self, common_name: &CommonName, validity: Duration, mode: IssueMode) -> Result<Arc<Certificate>> {
        let lock = self.in_flight.entry(common_name.clone()).or_default().clone();
        let result = {
            let _guard = lock.lock().await;
            self.issue_and_store(common_name, validity, mode).await
        };
        self.in_flight.remove_if(common_name, |_, held| Arc::ptr_eq(held, &lock) && Arc::strong_count(held) <= 2);
        result
    }

    async fn issue_and_store(&self, common_name: &CommonName, validity: Duration, mode: IssueMode) -> Result<Arc<Certificate>> {
        // Issuers may have been swapped while waiting for the identity lock.
        let snapshot = self.issuers.snapshot().await?;

        if mode == IssueMode::Cached {
            if let Some(certificate) = self.cached_for(common_name, &snapshot) {
                return Ok(certificate);
            }
        }

        let certificate = Arc::new(self.synthesize(common_name, validity, &snapshot).await?);
        let entry = CachedCertificate { certificate: certificate.clone(), validity };

        let previous = match (mode, self.cache.entry(common_name.clone())) {
            (_, Entry::Occupied(mut occupied)) => Some(occupied.insert(entry)),
            (IssueMode::Cached, Entry::Vacant(vacant)) => {
                vacant.insert(entry);
                None
            }
            (IssueMode::Replace, Entry::Vacant(_)) => {
                warn!(common_name = %common_name, "Certificate was released during rotation, discarding reissued certificate");
                return Err(Error::not_found("Certificate", common_name.as_str()));
            }
        };
        self.metrics.set_cached_certificates(self.cache.len());

        if let Some(previous) = previous {
            info!(
                common_name = %common_name,
                old_serial_number = %previous.certificate.serial_number(),
                serial_number = %certificate.serial_number(),
                key_issuer_id = %certificate.key_issuer_id(),
                pub_issuer_id = %certificate.pub_issuer_id(),
                "Rotated certificate"
            );
            self.rotations.publish(RotationAnnouncement {
                common_name: common_name.clone(),
                serial_number: certificate.serial_number().clone(),
            });
        }

        Ok(certificate)
    }

    /// Sign with the signing issuer; attach the validating issuer's trust bundle
    /// when a rotation has the two roles on different roots.
    async fn synthesize(&self, common_name: &CommonName, validity: Duration, snapshot: &IssuerSnapshot) -> Result<Certificate> {
        let started = Instant::now();
        let signing = &snapshot.signing;
        let validating = &snapshot.validating;

        let options = IssueOptions::for_issuer(signing, validity);
        let certificate = signing.issuer.issue_certificate(common_name, &options).await.map_err(|e| {
            warn!(common_name = %common_name, issuer_id = %signing.id, error = %e, "Signing issuer failed to issue certificate");
            self.metrics.record_issue_error(&signing.id);
            Error::issuer(&signing.id, e)
        })?;

        let mut trust_bundle = certificate.issuing_ca().to_vec();
        if snapshot.is_split() {
            let validating_ca = validating.issuer.certificate_authority().await.map_err(|e| {
                warn!(common_name = %common_name, issuer_id = %validating.id, error = %e, "Validating issuer failed to provide its trust bundle");
                self.metrics.record_issue_error(&validating.id);
                Error::issuer(&validating.id, e)
            })?;
            trust_bundle.extend_from_slice(&validating_ca);
        }

        let certificate = certificate.with_trust_bundle(trust_bundle).with_issuer_ids(&signing.id, &validating.id);

        self.metrics.record_certificate_issued(&signing.id, started.elapsed().as_secs_f64());
        debug!(
            common_name = %common_name,
            serial_number = %certificate.serial_number(),
            expiration = %certificate.expiration(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Issued certificate"
        );

        Ok(certificate)
    }
}
