//! # Mesh Root Certificates
//!
//! The MeshRootCertificate (MRC) resource and the rotation protocol built on
//! it. An MRC describes one root certificate generation; moving it through
//! its stages swaps the roots the [`Manager`](crate::certificate::Manager)
//! signs with and trusts, without a window in which peers reject each other.
//!
//! ```text
//! pending -> validatingRollout -> issuingRollout -> active
//!                                                     |
//! inactive <- validatingRollback <- issuingRollback <-+
//! ```

mod conditions;
mod reconciler;
mod state_machine;
mod transitions;
mod types;

pub use conditions::{
    get_condition, implied_stage, is_condition_true, set_condition, REASON_PASSIVELY_IN_USE,
};
pub use reconciler::{components_reached, MrcReconciler, ReconcileOutcome};
pub use state_machine::{MrcAction, MrcStateMachine};
pub use transitions::{
    advance_step, catch_up_target, effective_stage, enter_state, gate_open, issuer_slots, Advance,
    DeferredStatusUpdate, StageTimings,
};
pub use types::{
    CertManagerProviderSpec, Component, ComponentStatus, ComponentStatuses, ConditionStatus, MeshRootCertificate,
    MeshRootCertificateSpec, MeshRootCertificateStatus, MrcCondition, MrcConditionType, MrcIntent, MrcState,
    ObjectMeta, ProviderSpec, SecretKeyReferenceSpec, SecretReference, TresorCaSpec, TresorProviderSpec, UseCase,
    VaultProviderSpec, VaultTokenSpec,
};
