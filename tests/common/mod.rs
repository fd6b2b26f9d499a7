//! Common test utilities for all integration tests.
//!
//! Provides in-memory issuers whose trust bundle is their own name, an issuer
//! factory keyed by MRC name, and MeshRootCertificate builders.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use tokio_util::sync::CancellationToken;

use meshroot::certificate::{
    Certificate, CommonName, IssueOptions, Issuer, IssuerHandle, Manager, PrivateKey, SerialNumber,
};
use meshroot::config::MrcConfig;
use meshroot::mrc::{
    MeshRootCertificate, MeshRootCertificateSpec, MrcIntent, MrcState, MrcStateMachine, ProviderSpec,
    SecretReference, StageTimings, TresorCaSpec, TresorProviderSpec, UseCase,
};
use meshroot::retry::RetryConfig;
use meshroot::store::{IssuerFactory, IssuerWithCa, MemoryMrcClient, MrcClient};
use meshroot::{Error, Result};

pub const NAMESPACE: &str = "meshroot-system";
pub const TRUST_DOMAIN: &str = "cluster.local";
pub const HOUR: Duration = Duration::from_secs(3600);

/// Issuer whose trust bundle is its own ID.
#[derive(Debug)]
pub struct FakeIssuer {
    id: String,
    failing: DashSet<String>,
    issued: AtomicU32,
}

impl FakeIssuer {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self { id: id.to_string(), failing: DashSet::new(), issued: AtomicU32::new(0) })
    }

    /// Make issuance for `common_name` fail from now on.
    pub fn fail_for(&self, common_name: &str) {
        self.failing.insert(common_name.to_string());
    }

    pub fn issued(&self) -> u32 {
        self.issued.load(Ordering::SeqCst)
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl Issuer for FakeIssuer {
    async fn issue_certificate(&self, common_name: &CommonName, options: &IssueOptions) -> Result<Certificate> {
        if self.failing.contains(common_name.as_str()) {
            return Err(Error::backend(format!("{} refused to sign {}", self.id, common_name)));
        }
        let n = self.issued.fetch_add(1, Ordering::SeqCst);
        let validity = chrono::Duration::from_std(options.validity).map_err(|e| Error::validation(e.to_string()))?;
        Ok(Certificate::new(
            common_name.clone(),
            SerialNumber::new(format!("{}-{}", self.id, n)),
            Utc::now() + validity,
            format!("chain-{}", self.id).into_bytes(),
            PrivateKey::new(format!("key-{}", self.id).into_bytes()),
            self.id.clone().into_bytes(),
        ))
    }

    async fn certificate_authority(&self) -> Result<Vec<u8>> {
        Ok(self.id.clone().into_bytes())
    }
}

pub fn handle(issuer: &Arc<FakeIssuer>) -> IssuerHandle {
    IssuerHandle::new(issuer.id(), TRUST_DOMAIN, issuer.id().as_bytes().to_vec(), issuer.clone())
}

pub fn cn(value: &str) -> CommonName {
    CommonName::from(value)
}

/// Hands out one [`FakeIssuer`] per MRC name.
#[derive(Debug, Default)]
pub struct FakeFactory {
    issuers: DashMap<String, Arc<FakeIssuer>>,
    unreachable: DashSet<String>,
}

impl FakeFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn issuer(&self, mrc_name: &str) -> Arc<FakeIssuer> {
        self.issuers.entry(mrc_name.to_string()).or_insert_with(|| FakeIssuer::new(mrc_name)).clone()
    }

    /// Fail every attempt to build the issuer of `mrc_name`.
    pub fn make_unreachable(&self, mrc_name: &str) {
        self.unreachable.insert(mrc_name.to_string());
    }
}

#[async_trait]
impl IssuerFactory for FakeFactory {
    async fn issuer_for(&self, mrc: &MeshRootCertificate) -> Result<IssuerWithCa> {
        if self.unreachable.contains(mrc.name()) {
            return Err(Error::backend(format!("provider for '{}' is unreachable", mrc.name())));
        }
        let issuer = self.issuer(mrc.name());
        let ca = issuer.id().as_bytes().to_vec();
        Ok((issuer, ca))
    }
}

pub fn mrc(name: &str, intent: MrcIntent) -> MeshRootCertificate {
    MeshRootCertificate::new(
        name,
        NAMESPACE,
        MeshRootCertificateSpec {
            provider: ProviderSpec::Tresor(TresorProviderSpec {
                ca: TresorCaSpec { secret_ref: SecretReference { name: format!("{name}-ca"), namespace: NAMESPACE.into() } },
            }),
            trust_domain: TRUST_DOMAIN.into(),
            intent,
            spiffe_enabled: false,
        },
    )
}

pub fn mrc_in_state(name: &str, intent: MrcIntent, state: MrcState) -> MeshRootCertificate {
    let mut mrc = mrc(name, intent);
    mrc.status.state = state;
    mrc
}

/// No dwell time between stages.
pub fn instant_timings() -> StageTimings {
    StageTimings { stage_duration: Duration::ZERO, validating_wait: Duration::ZERO }
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 10,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(10),
        backoff_multiplier: 2.0,
        jitter: 0.0,
    }
}

pub fn store(factory: &Arc<FakeFactory>) -> Arc<MemoryMrcClient> {
    Arc::new(MemoryMrcClient::new(factory.clone()))
}

/// A state machine owning every use case, with instant stages.
pub fn state_machine(
    manager: &Arc<Manager>,
    client: &Arc<MemoryMrcClient>,
    leader: bool,
    cancel: &CancellationToken,
) -> MrcStateMachine {
    state_machine_owning(manager, client, leader, &UseCase::ALL, cancel)
}

/// A state machine owning only `owned`, with instant stages.
pub fn state_machine_owning(
    manager: &Arc<Manager>,
    client: &Arc<MemoryMrcClient>,
    leader: bool,
    owned: &[UseCase],
    cancel: &CancellationToken,
) -> MrcStateMachine {
    let config = MrcConfig { leader, owned_use_cases: owned.to_vec(), init_timeout_secs: 1, ..Default::default() };
    MrcStateMachine::new(manager.clone(), client.clone(), &config, cancel.clone())
        .with_timings(instant_timings())
        .with_resync_interval(Duration::from_millis(20))
        .with_retry(fast_retry())
}

/// Handle events for `name` until `done` holds for the stored MRC.
pub async fn drive_until<F>(
    machine: &MrcStateMachine,
    client: &Arc<MemoryMrcClient>,
    name: &str,
    done: F,
) -> MeshRootCertificate
where
    F: Fn(&MeshRootCertificate) -> bool,
{
    for _ in 0..100 {
        let mrc = client.get_mesh_root_certificate(name).await.unwrap();
        if done(&mrc) {
            return mrc;
        }
        // Deferred updates may race the handler; a lost race is retried next round.
        let _ = machine.handle_mrc_event(name).await;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("MRC '{name}' never reached the expected status");
}
