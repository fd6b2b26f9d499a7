//! # Metrics Collection
//!
//! Certificate lifecycle metrics through the `metrics` facade. Without an
//! installed exporter every call is a no-op, so components record
//! unconditionally.

use std::net::SocketAddr;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{info, warn};

use crate::config::ObservabilityConfig;
use crate::errors::{Error, Result};

/// Metrics recorder handed to each component
#[derive(Debug, Clone, Default)]
pub struct MetricsRecorder;

impl MetricsRecorder {
    pub fn new() -> Self {
        Self
    }

    /// Record a certificate issued by a backend
    pub fn record_certificate_issued(&self, signing_issuer: &str, duration: f64) {
        let labels = [("issuer", signing_issuer.to_string())];
        counter!("meshroot_certificates_issued_total", &labels).increment(1);
        histogram!("meshroot_certificate_issue_duration_seconds", &labels).record(duration);
    }

    /// Record an issuance that failed
    pub fn record_issue_error(&self, issuer: &str) {
        let labels = [("issuer", issuer.to_string())];
        counter!("meshroot_certificate_issue_errors_total", &labels).increment(1);
    }

    /// Record a cache lookup outcome
    pub fn record_cache_lookup(&self, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        counter!("meshroot_certificate_cache_lookups_total", "result" => result).increment(1);
    }

    /// Record a rotation attempt
    pub fn record_rotation(&self, reason: &str, success: bool) {
        let status = if success { "success" } else { "error" };
        let labels = [("reason", reason.to_string()), ("status", status.to_string())];
        counter!("meshroot_certificate_rotations_total", &labels).increment(1);
    }

    /// Update the cached certificate gauge
    pub fn set_cached_certificates(&self, count: usize) {
        gauge!("meshroot_certificates_cached").set(count as f64);
    }

    /// Record a MeshRootCertificate state transition
    pub fn record_mrc_transition(&self, from: &str, to: &str) {
        let labels = [("from", from.to_string()), ("to", to.to_string())];
        counter!("meshroot_mrc_transitions_total", &labels).increment(1);
    }

    /// Record a component status write
    pub fn record_component_status_update(&self, use_case: &str, status: &str, deferred: bool) {
        let labels = [
            ("use_case", use_case.to_string()),
            ("status", status.to_string()),
            ("deferred", deferred.to_string()),
        ];
        counter!("meshroot_mrc_component_status_updates_total", &labels).increment(1);
    }

    /// Record a handled MeshRootCertificate event by the action taken
    pub fn record_mrc_event(&self, action: &str) {
        counter!("meshroot_mrc_events_total", "action" => action.to_string()).increment(1);
    }

    /// Describe all certificate metrics so they are exported with help text
    pub fn register_certificate_metrics(&self) {
        describe_counter!("meshroot_certificates_issued_total", "Certificates issued by a backend");
        describe_histogram!(
            "meshroot_certificate_issue_duration_seconds",
            Unit::Seconds,
            "Time spent issuing a certificate"
        );
        describe_counter!("meshroot_certificate_issue_errors_total", "Certificate issuance failures by issuer");
        describe_counter!("meshroot_certificate_cache_lookups_total", "Certificate cache lookups by result");
        describe_counter!("meshroot_certificate_rotations_total", "Certificate rotations by reason and status");
        describe_gauge!("meshroot_certificates_cached", "Certificates currently cached");
        describe_counter!("meshroot_mrc_transitions_total", "MeshRootCertificate state transitions");
        describe_counter!(
            "meshroot_mrc_component_status_updates_total",
            "MeshRootCertificate component status writes"
        );
        describe_counter!("meshroot_mrc_events_total", "MeshRootCertificate events by action taken");

        counter!("meshroot_certificate_rotations_total", "reason" => "expiring", "status" => "success").absolute(0);
        counter!("meshroot_certificate_rotations_total", "reason" => "expiring", "status" => "error").absolute(0);
        gauge!("meshroot_certificates_cached").set(0.0);
    }
}

/// Initialize the Prometheus exporter
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    if !config.enable_metrics {
        return Ok(());
    }

    let metrics_addr = match config.metrics_bind_address() {
        Some(addr) => addr,
        None => {
            warn!("Metrics disabled: no bind address configured");
            return Ok(());
        }
    };

    let socket_addr: SocketAddr = metrics_addr
        .parse()
        .map_err(|e| Error::config(format!("Invalid metrics bind address '{}': {}", metrics_addr, e)))?;

    PrometheusBuilder::new()
        .with_http_listener(socket_addr)
        .add_global_label("service", &config.service_name)
        .install()
        .map_err(|e| Error::config(format!("Failed to initialize metrics exporter: {}", e)))?;

    MetricsRecorder::new().register_certificate_metrics();

    info!(
        metrics_addr = %metrics_addr,
        service_name = %config.service_name,
        "Metrics collection initialized"
    );

    Ok(())
}
