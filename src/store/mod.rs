//! # MeshRootCertificate Store
//!
//! The [`MrcClient`] contract through which the state machine reads and writes
//! MeshRootCertificate resources, and the in-process [`MemoryMrcClient`].
//!
//! Every write carries the `resource_version` the caller read. A write against
//! an older version fails with [`Error::Conflict`](crate::Error::Conflict);
//! callers re-read and retry.

mod memory;

pub use memory::MemoryMrcClient;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::certificate::Issuer;
use crate::errors::Result;
use crate::messaging::{MrcEvent, Subscription};
use crate::mrc::MeshRootCertificate;

/// A signing backend built for one MRC together with its trust bundle.
pub type IssuerWithCa = (Arc<dyn Issuer>, Vec<u8>);

// ============================================================================
// Client Trait
// ============================================================================

#[async_trait]
pub trait MrcClient: Send + Sync + fmt::Debug {
    /// Fetch the latest copy of the MRC called `name`.
    async fn get_mesh_root_certificate(&self, name: &str) -> Result<MeshRootCertificate>;

    async fn list_mesh_root_certificates(&self) -> Result<Vec<MeshRootCertificate>>;

    /// Replace spec and status.
    async fn update_mesh_root_certificate(&self, mrc: MeshRootCertificate) -> Result<MeshRootCertificate>;

    /// Replace status only; the stored spec is kept.
    async fn update_mesh_root_certificate_status(&self, mrc: MeshRootCertificate) -> Result<MeshRootCertificate>;

    /// Build the signing backend described by the MRC's provider.
    async fn get_cert_issuer_for_mrc(&self, mrc: &MeshRootCertificate) -> Result<IssuerWithCa>;

    /// Change notifications for every MRC.
    fn watch(&self) -> Subscription<MrcEvent>;
}

// ============================================================================
// Issuer Factory Trait
// ============================================================================

/// Turns an MRC provider spec into a signing backend.
#[async_trait]
pub trait IssuerFactory: Send + Sync + fmt::Debug {
    async fn issuer_for(&self, mrc: &MeshRootCertificate) -> Result<IssuerWithCa>;
}
