//! # Certificate Rotor
//!
//! Background worker that periodically walks the Manager's cache and reissues
//! certificates that are about to expire or that were issued by a root that is
//! no longer active.
//!
//! The renewal threshold gets a random offset on every check, so certificates
//! issued together do not all come up for renewal on the same tick.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument};

use crate::certificate::{Certificate, Manager};
use crate::config::CertificateConfig;
use crate::observability::MetricsRecorder;

/// Why a certificate was rotated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationReason {
    Expiring,
    IssuerChanged,
}

impl RotationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expiring => "expiring",
            Self::IssuerChanged => "issuer_changed",
        }
    }
}

/// Outcome of one rotor pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RotationSummary {
    pub checked: usize,
    pub rotated: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct Rotor {
    manager: Arc<Manager>,
    interval: Duration,
    renew_before: Duration,
    jitter: Duration,
    metrics: MetricsRecorder,
}

impl Rotor {
    pub fn new(manager: Arc<Manager>, config: &CertificateConfig) -> Self {
        Self {
            manager,
            interval: config.rotor_interval(),
            renew_before: config.renew_before(),
            jitter: config.rotation_jitter(),
            metrics: MetricsRecorder::new(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Whether `certificate` expires within the renewal window plus a random offset.
    pub fn should_rotate(&self, certificate: &Certificate) -> bool {
        let renew_before = self.renew_before + self.random_offset();
        let remaining = certificate.expiration() - Utc::now();

        // A negative remaining time means the certificate already expired.
        match remaining.to_std() {
            Ok(remaining) => remaining <= renew_before,
            Err(_) => true,
        }
    }

    fn random_offset(&self) -> Duration {
        let max_millis = self.jitter.as_millis() as u64;
        if max_millis == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..max_millis))
    }

    async fn rotation_reason(&self, certificate: &Certificate) -> Option<RotationReason> {
        if self.should_rotate(certificate) {
            Some(RotationReason::Expiring)
        } else if self.manager.is_stale(certificate).await {
            Some(RotationReason::IssuerChanged)
        } else {
            None
        }
    }

    /// Run one pass over the cache. A failure to rotate one certificate is
    /// logged and does not stop the others.
    pub async fn check_and_rotate(&self) -> RotationSummary {
        let certificates = self.manager.list_certificates();
        let mut summary = RotationSummary { checked: certificates.len(), ..Default::default() };

        for certificate in certificates {
            let Some(reason) = self.rotation_reason(&certificate).await else {
                continue;
            };

            let span = crate::certificate_span!("rotate", certificate.common_name(), reason = reason.as_str());
            match self.manager.rotate_certificate(certificate.common_name()).instrument(span).await {
                Ok(rotated) => {
                    summary.rotated += 1;
                    self.metrics.record_rotation(reason.as_str(), true);
                    debug!(
                        common_name = %certificate.common_name(),
                        old_serial_number = %certificate.serial_number(),
                        serial_number = %rotated.serial_number(),
                        reason = reason.as_str(),
                        "Certificate rotated"
                    );
                }
                Err(e) if e.is_not_found() => {
                    debug!(common_name = %certificate.common_name(), "Certificate released before rotation");
                }
                Err(e) => {
                    summary.failed += 1;
                    self.metrics.record_rotation(reason.as_str(), false);
                    error!(
                        common_name = %certificate.common_name(),
                        serial_number = %certificate.serial_number(),
                        error = %e,
                        "Error rotating certificate"
                    );
                }
            }
        }

        summary
    }

    /// Tick until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(interval_ms = self.interval.as_millis() as u64, "Certificate rotor started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Certificate rotor stopped");
                    return;
                }
                _ = ticker.tick() => {
                    let summary = self.check_and_rotate().await;
                    if summary.rotated > 0 || summary.failed > 0 {
                        info!(
                            checked = summary.checked,
                            rotated = summary.rotated,
                            failed = summary.failed,
                            "Certificate rotation pass complete"
                        );
                    }
                }
            }
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}
