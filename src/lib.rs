//! # Meshroot
//!
//! Certificate lifecycle management for a service mesh control plane: issues
//! and caches per-identity certificates, rotates them before they expire, and
//! rotates the mesh root itself without breaking trust between proxies.
//!
//! ## Architecture
//!
//! ```text
//! MeshRootCertificate store → MRC state machine → Manager (signing + validating issuer)
//!          ↑                         ↓                  ↓               ↑
//!   other processes        deferred status updates   cache  ←  Rotor
//! ```
//!
//! ## Core Components
//!
//! - **Manager**: issues certificates through the active signing issuer and
//!   composes trust bundles from the signing and validating roots
//! - **Rotor**: background worker that reissues expiring and stale certificates
//! - **MRC state machine**: walks MeshRootCertificates through the rotation
//!   stages, coordinating with other processes only through the resource
//! - **Providers**: self-signed (Tresor) and Vault PKI signing backends
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use meshroot::certificate::{CommonName, IssuerHandle, Manager};
//! use meshroot::providers::TresorIssuer;
//!
//! # async fn run() -> meshroot::Result<()> {
//! let root = Arc::new(TresorIssuer::new_root("mesh-root", "meshroot", Duration::from_secs(86400 * 365))?);
//! let handle = IssuerHandle::new("mesh-root", "cluster.local", root.root_pem().to_vec(), root);
//! let manager = Manager::with_issuer(handle).await;
//!
//! let cert = manager.issue_certificate(&CommonName::from("proxy-1.bookbuyer.bookstore"), Duration::from_secs(3600)).await?;
//! println!("issued {}", cert.serial_number());
//! # Ok(())
//! # }
//! ```

pub mod certificate;
pub mod config;
pub mod errors;
pub mod messaging;
pub mod mrc;
pub mod observability;
pub mod providers;
pub mod retry;
pub mod rotor;
pub mod store;

pub use config::AppConfig;
pub use errors::{Error, Result};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
