//! Issuer contract and the lock-protected holder of the active issuer pair.
//!
//! During a root rotation the Manager signs with one root (the *signing*
//! issuer) while peers are told to trust another (the *validating* issuer).
//! [`ActiveIssuers`] keeps both behind a single read/write lock: issuance
//! takes a consistent [`IssuerSnapshot`] under the read lock, the MRC state
//! machine swaps a role under the write lock.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, RwLock};
use tracing::info;

use super::types::{Certificate, CommonName};
use crate::errors::{Error, Result};

/// A signing backend: self-signed CA, Vault, cert-manager, ...
#[async_trait]
pub trait Issuer: Send + Sync + fmt::Debug {
    /// Issue a certificate and private key for `common_name`.
    async fn issue_certificate(&self, common_name: &CommonName, options: &IssueOptions) -> Result<Certificate>;

    /// PEM trust bundle of this backend's root.
    async fn certificate_authority(&self) -> Result<Vec<u8>>;
}

/// Settings for one issuance, taken from the signing issuer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueOptions {
    pub validity: Duration,
    pub trust_domain: String,
    pub spiffe_enabled: bool,
}

impl IssueOptions {
    pub fn new(validity: Duration) -> Self {
        Self { validity, trust_domain: String::new(), spiffe_enabled: false }
    }

    pub fn for_issuer(handle: &IssuerHandle, validity: Duration) -> Self {
        Self { validity, trust_domain: handle.trust_domain.clone(), spiffe_enabled: handle.spiffe_enabled }
    }

    /// SPIFFE ID to put in the URI SAN, if SPIFFE is enabled.
    ///
    /// `sa.ns.cluster.local` in trust domain `cluster.local` becomes
    /// `spiffe://cluster.local/sa/ns`.
    pub fn spiffe_id(&self, common_name: &CommonName) -> Option<String> {
        if !self.spiffe_enabled {
            return None;
        }
        let name = common_name.as_str();
        let path = name.strip_suffix(&format!(".{}", self.trust_domain)).unwrap_or(name);
        Some(format!("spiffe://{}/{}", self.trust_domain, path.replace('.', "/")))
    }
}

/// An issuer backend bound to the MeshRootCertificate that configured it.
#[derive(Debug, Clone)]
pub struct IssuerHandle {
    /// Stable identity of the root, the name of the MRC
    pub id: String,
    pub trust_domain: String,
    pub spiffe_enabled: bool,
    /// Trust bundle captured when the backend was built
    pub certificate_authority: Vec<u8>,
    pub issuer: Arc<dyn Issuer>,
}

impl IssuerHandle {
    pub fn new(id: impl Into<String>, trust_domain: impl Into<String>, certificate_authority: Vec<u8>, issuer: Arc<dyn Issuer>) -> Self {
        Self { id: id.into(), trust_domain: trust_domain.into(), spiffe_enabled: false, certificate_authority, issuer }
    }

    pub fn with_spiffe(mut self, enabled: bool) -> Self {
        self.spiffe_enabled = enabled;
        self
    }
}

/// Which of the Manager's issuer slots an MRC occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuerRole {
    Signing,
    Validating,
    Both,
}

impl IssuerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Signing => "signing",
            Self::Validating => "validating",
            Self::Both => "signing+validating",
        }
    }

    pub fn signs(&self) -> bool {
        matches!(self, Self::Signing | Self::Both)
    }

    pub fn validates(&self) -> bool {
        matches!(self, Self::Validating | Self::Both)
    }

    /// The role covering exactly the given slots, `None` for neither.
    pub fn from_slots(signing: bool, validating: bool) -> Option<Self> {
        match (signing, validating) {
            (true, true) => Some(Self::Both),
            (true, false) => Some(Self::Signing),
            (false, true) => Some(Self::Validating),
            (false, false) => None,
        }
    }
}

impl fmt::Display for IssuerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consistent view of both issuers, taken under one read lock.
#[derive(Debug, Clone)]
pub struct IssuerSnapshot {
    pub signing: Arc<IssuerHandle>,
    pub validating: Arc<IssuerHandle>,
}

impl IssuerSnapshot {
    /// Whether a rotation is in progress (the two roles point at different roots).
    pub fn is_split(&self) -> bool {
        self.signing.id != self.validating.id
    }
}

#[derive(Debug, Default)]
struct IssuerPair {
    signing: Option<Arc<IssuerHandle>>,
    validating: Option<Arc<IssuerHandle>>,
}

/// Read/write-locked holder of the signing and validating issuers.
#[derive(Debug)]
pub struct ActiveIssuers {
    pair: RwLock<IssuerPair>,
    ready: watch::Sender<bool>,
}

impl Default for ActiveIssuers {
    fn default() -> Self {
        Self::new()
    }
}

impl ActiveIssuers {
    pub fn new() -> Self {
        let (ready, _) = watch::channel(false);
        Self { pair: RwLock::new(IssuerPair::default()), ready }
    }

    /// Snapshot both issuers. Fails with a configuration error until both are set.
    pub async fn snapshot(&self) -> Result<IssuerSnapshot> {
        let pair = self.pair.read().await;
        match (&pair.signing, &pair.validating) {
            (Some(signing), Some(validating)) => {
                Ok(IssuerSnapshot { signing: signing.clone(), validating: validating.clone() })
            }
            _ => Err(Error::config("signing and validating issuers are not configured")),
        }
    }

    /// IDs of the current (signing, validating) issuers, if set.
    pub async fn ids(&self) -> (Option<String>, Option<String>) {
        let pair = self.pair.read().await;
        (pair.signing.as_ref().map(|i| i.id.clone()), pair.validating.as_ref().map(|i| i.id.clone()))
    }

    /// Place `handle` into the slots named by `role`. Returns whether anything changed;
    /// a slot already held by an issuer with the same ID is left alone.
    pub async fn set(&self, role: IssuerRole, handle: IssuerHandle) -> bool {
        let handle = Arc::new(handle);
        let mut pair = self.pair.write().await;
        let mut changed = false;

        if role.signs() && pair.signing.as_ref().map(|i| i.id.as_str()) != Some(handle.id.as_str()) {
            pair.signing = Some(handle.clone());
            changed = true;
        }
        if role.validates() && pair.validating.as_ref().map(|i| i.id.as_str()) != Some(handle.id.as_str()) {
            pair.validating = Some(handle.clone());
            changed = true;
        }

        let ready = pair.signing.is_some() && pair.validating.is_some();
        drop(pair);

        if changed {
            info!(issuer_id = %handle.id, role = %role, "Active issuer updated");
        }
        self.ready.send_if_modified(|current| {
            let modified = *current != ready;
            *current = ready;
            modified
        });

        changed
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until both issuers are set, or fail after `timeout`.
    pub async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.ready.subscribe();
        let outcome = match tokio::time::timeout(timeout, rx.wait_for(|ready| *ready)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::internal("issuer readiness channel closed")),
            Err(_) => Err(Error::timeout("waiting for signing and validating issuers", timeout.as_millis() as u64)),
        };
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct NoopIssuer;

    #[async_trait]
    impl Issuer for NoopIssuer {
        async fn issue_certificate(&self, _common_name: &CommonName, _options: &IssueOptions) -> Result<Certificate> {
            Err(Error::backend("unused"))
        }

        async fn certificate_authority(&self) -> Result<Vec<u8>> {
            Ok(vec![])
        }
    }

    fn handle(id: &str) -> IssuerHandle {
        IssuerHandle::new(id, "cluster.local", id.as_bytes().to_vec(), Arc::new(NoopIssuer))
    }

    #[tokio::test]
    async fn test_snapshot_requires_both_issuers() {
        let issuers = ActiveIssuers::new();
        assert!(matches!(issuers.snapshot().await, Err(Error::Config(_))));

        issuers.set(IssuerRole::Signing, handle("id1")).await;
        assert!(issuers.snapshot().await.is_err());
        assert!(!issuers.is_ready());

        issuers.set(IssuerRole::Validating, handle("id2")).await;
        let snapshot = issuers.snapshot().await.unwrap();
        assert_eq!(snapshot.signing.id, "id1");
        assert_eq!(snapshot.validating.id, "id2");
        assert!(snapshot.is_split());
        assert!(issuers.is_ready());
    }

    #[tokio::test]
    async fn test_setting_same_issuer_is_noop() {
        let issuers = ActiveIssuers::new();
        assert!(issuers.set(IssuerRole::Both, handle("id1")).await);
        assert!(!issuers.set(IssuerRole::Both, handle("id1")).await);
        assert!(!issuers.set(IssuerRole::Signing, handle("id1")).await);
        assert!(issuers.set(IssuerRole::Validating, handle("id2")).await);
        assert_eq!(issuers.ids().await, (Some("id1".to_string()), Some("id2".to_string())));
    }

    #[tokio::test]
    async fn test_wait_until_ready() {
        let issuers = Arc::new(ActiveIssuers::new());
        let err = issuers.wait_until_ready(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));

        let setter = issuers.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            setter.set(IssuerRole::Both, handle("id1")).await;
        });
        issuers.wait_until_ready(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_waiters_all_see_readiness() {
        let issuers = Arc::new(ActiveIssuers::new());
        let waiters: Vec<_> = (0..4)
            .map(|_| {
                let issuers = issuers.clone();
                tokio::spawn(async move { issuers.wait_until_ready(Duration::from_secs(2)).await })
            })
            .collect();

        issuers.set(IssuerRole::Signing, handle("id1")).await;
        issuers.set(IssuerRole::Validating, handle("id2")).await;
        for waiter in waiters {
            waiter.await.unwrap().unwrap();
        }
        // Already ready: returns without waiting.
        issuers.wait_until_ready(Duration::ZERO).await.unwrap();
    }

    #[test]
    fn test_role_from_slots() {
        assert_eq!(IssuerRole::from_slots(true, true), Some(IssuerRole::Both));
        assert_eq!(IssuerRole::from_slots(false, true), Some(IssuerRole::Validating));
        assert_eq!(IssuerRole::from_slots(false, false), None);
    }

    #[test]
    fn test_spiffe_id() {
        let mut options = IssueOptions::for_issuer(&handle("id1"), Duration::from_secs(60));
        let common_name = CommonName::from("bookbuyer.bookstore.cluster.local");
        assert_eq!(options.spiffe_id(&common_name), None);

        options.spiffe_enabled = true;
        assert_eq!(options.spiffe_id(&common_name).as_deref(), Some("spiffe://cluster.local/bookbuyer/bookstore"));
        assert_eq!(
            options.spiffe_id(&CommonName::from("gateway.ns")).as_deref(),
            Some("spiffe://cluster.local/gateway/ns")
        );
    }
}
