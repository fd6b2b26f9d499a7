//! # Certificates
//!
//! Data model, the [`Issuer`] contract implemented by provider backends, and
//! the [`Manager`] that issues and caches certificates per identity.

mod issuer;
mod manager;
mod types;

pub use issuer::{ActiveIssuers, IssueOptions, Issuer, IssuerHandle, IssuerRole, IssuerSnapshot};
pub use manager::Manager;
pub use types::{Certificate, CommonName, PrivateKey, SerialNumber};
