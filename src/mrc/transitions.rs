//! Stage transitions and the deferred component status updater.
//!
//! Entering a stage happens in two steps. The stage's condition flips to
//! `True` and `transition_after` is pushed out by the stage wait right away.
//! Component statuses follow only once the wait has elapsed, written by a
//! [`DeferredStatusUpdate`] that re-checks the resource before every write.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use super::conditions::{get_condition, implied_stage, set_condition, REASON_STAGE_COMPLETED, REASON_STAGE_ENTERED};
use super::types::{
    ComponentStatus, ConditionStatus, MeshRootCertificate, MeshRootCertificateStatus, MrcConditionType, MrcIntent,
    MrcState, UseCase,
};
use crate::certificate::IssuerRole;
use crate::errors::Result;
use crate::observability::MetricsRecorder;
use crate::retry::{retry_on_conflict, RetryConfig};
use crate::store::MrcClient;

/// Dwell times between stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTimings {
    pub stage_duration: Duration,
    pub validating_wait: Duration,
}

impl StageTimings {
    /// Wait before components report `next`. Validating stages wait for the
    /// new trust bundle to reach every proxy.
    pub fn wait_for(&self, next: MrcState) -> Duration {
        match next {
            MrcState::ValidatingRollout | MrcState::ValidatingRollback => self.validating_wait,
            _ => self.stage_duration,
        }
    }
}

/// Stage the MRC is working towards: the stage its conditions declare, else its state.
pub fn effective_stage(mrc: &MeshRootCertificate) -> MrcState {
    implied_stage(&mrc.status.conditions).unwrap_or(mrc.status.state)
}

/// Whether `transition_after` allows a state change at `now`.
pub fn gate_open(status: &MeshRootCertificateStatus, now: DateTime<Utc>) -> bool {
    status.transition_after.is_none_or(|after| after <= now)
}

/// Component status the owned use cases must be moved to, if any lags behind.
pub fn catch_up_target(mrc: &MeshRootCertificate, owned: &[UseCase]) -> Option<ComponentStatus> {
    let target = effective_stage(mrc).target_component_status()?;
    let statuses = &mrc.status.component_statuses;
    owned.iter().any(|use_case| statuses.get(use_case.component()) != target).then_some(target)
}

/// The state change an MRC is ready for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Every component reports the declared stage; record it as the state
    Confirm(MrcState),
    /// The current stage is complete; start the next one
    Begin { from: MrcState, to: MrcState },
}

/// The state change the MRC is ready for, judged by the components of the
/// `owned` use cases. Components owned by other processes are theirs to report.
pub fn advance_step(mrc: &MeshRootCertificate, owned: &[UseCase]) -> Option<Advance> {
    let state = mrc.status.state;
    let declared = effective_stage(mrc);
    let reached = |target: ComponentStatus| owned_components_at(mrc, owned, target);

    if declared != state {
        let target = declared.target_component_status()?;
        return reached(target).then_some(Advance::Confirm(declared));
    }

    let next = state.successor(mrc.spec.intent)?;
    let settled = state.target_component_status().is_none_or(reached);
    settled.then_some(Advance::Begin { from: state, to: next })
}

fn owned_components_at(mrc: &MeshRootCertificate, owned: &[UseCase], target: ComponentStatus) -> bool {
    let statuses = &mrc.status.component_statuses;
    owned.iter().all(|use_case| statuses.get(use_case.component()) == target)
}

/// Precedence of an MRC's claim on the Manager's issuer slots, `None` when it
/// makes no claim. A stage in flight beats an Active root, the most recently
/// readied Active root beats older ones, and any of them beats a Pending root
/// that has not started yet. Names break ties.
fn slot_priority(mrc: &MeshRootCertificate) -> Option<(u8, Option<DateTime<Utc>>, &str)> {
    let name = mrc.name();
    match effective_stage(mrc) {
        MrcState::Inactive | MrcState::Error => None,
        MrcState::Pending if mrc.spec.intent == MrcIntent::Passive => None,
        MrcState::Pending => Some((0, None, name)),
        MrcState::Active => {
            let ready = get_condition(&mrc.status.conditions, MrcConditionType::Ready)
                .and_then(|condition| condition.last_transition_time);
            Some((1, ready, name))
        }
        _ => Some((2, None, name)),
    }
}

/// Issuer slots `mrc` should hold, given every MRC in the store.
///
/// Each MRC wants the slots of its stage's [`IssuerRole`] and loses any slot
/// an MRC with higher precedence also wants, so no two MRCs are assigned the
/// same slot.
pub fn issuer_slots(mrc: &MeshRootCertificate, all: &[MeshRootCertificate]) -> Option<IssuerRole> {
    let own = slot_priority(mrc)?;
    let wanted = effective_stage(mrc).issuer_role();
    let (mut signing, mut validating) = (wanted.signs(), wanted.validates());

    for other in all.iter().filter(|other| other.name() != mrc.name()) {
        if slot_priority(other).is_none_or(|priority| priority <= own) {
            continue;
        }
        let claimed = effective_stage(other).issuer_role();
        signing &= !claimed.signs();
        validating &= !claimed.validates();
    }
    IssuerRole::from_slots(signing, validating)
}

/// Move `mrc` into `next`: flip the stage conditions, set the state, and
/// gate the following change behind the stage wait. Returns the wait.
pub fn enter_state(mrc: &mut MeshRootCertificate, next: MrcState, now: DateTime<Utc>, timings: &StageTimings) -> Duration {
    let previous = mrc.status.state;
    let conditions = &mut mrc.status.conditions;

    if let Some(left) = previous.stage_condition() {
        set_condition(
            conditions,
            left,
            ConditionStatus::False,
            REASON_STAGE_COMPLETED,
            &format!("moved to {next}"),
            now,
        );
    }
    if let Some(entered) = next.stage_condition() {
        set_condition(
            conditions,
            entered,
            ConditionStatus::True,
            REASON_STAGE_ENTERED,
            &format!("moved from {previous}"),
            now,
        );
    }

    let wait = timings.wait_for(next);
    mrc.status.state = next;
    mrc.status.transition_after = if next.is_terminal() {
        None
    } else {
        chrono::Duration::from_std(wait).ok().map(|wait| now + wait)
    };
    wait
}

// ============================================================================
// Deferred Status Update
// ============================================================================

/// Moves the owned use cases' component statuses to a stage's target after a wait.
#[derive(Debug, Clone)]
pub struct DeferredStatusUpdate {
    client: Arc<dyn MrcClient>,
    mrc_name: String,
    stage: MrcState,
    target: ComponentStatus,
    use_cases: Vec<UseCase>,
    wait: Duration,
    retry: RetryConfig,
    metrics: MetricsRecorder,
}

impl DeferredStatusUpdate {
    /// `None` when `stage` has no component status to report.
    pub fn new(
        client: Arc<dyn MrcClient>,
        mrc_name: impl Into<String>,
        stage: MrcState,
        use_cases: Vec<UseCase>,
        wait: Duration,
    ) -> Option<Self> {
        let target = stage.target_component_status()?;
        Some(Self {
            client,
            mrc_name: mrc_name.into(),
            stage,
            target,
            use_cases,
            wait,
            retry: RetryConfig::default(),
            metrics: MetricsRecorder::new(),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn target(&self) -> ComponentStatus {
        self.target
    }

    /// Sleep for the wait, then apply. Returns how many use cases were written,
    /// zero if cancelled first.
    pub async fn run(self, cancel: CancellationToken) -> Result<usize> {
        debug!(
            mrc = %self.mrc_name,
            stage = %self.stage,
            target = %self.target,
            wait_ms = self.wait.as_millis() as u64,
            "Scheduled deferred component status update"
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(mrc = %self.mrc_name, stage = %self.stage, "Deferred component status update cancelled");
                Ok(0)
            }
            _ = tokio::time::sleep(self.wait) => self.apply().await,
        }
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        let span = crate::mrc_span!("deferred_status_update", self.mrc_name, target = %self.target);
        tokio::spawn(
            async move {
                let mrc_name = self.mrc_name.clone();
                if let Err(e) = self.run(cancel).await {
                    warn!(mrc = %mrc_name, error = %e, "Deferred component status update failed");
                }
            }
            .instrument(span),
        )
    }

    /// Write the target status for every owned use case now.
    ///
    /// Use cases are independent; the first error is returned after all were attempted.
    pub async fn apply(&self) -> Result<usize> {
        let mut updated = 0;
        let mut first_error = None;

        for use_case in &self.use_cases {
            match self.update_use_case(*use_case).await {
                Ok(true) => updated += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(mrc = %self.mrc_name, use_case = %use_case, error = %e, "Failed to update component status");
                    first_error.get_or_insert(e);
                }
            }
        }

        if updated > 0 {
            info!(mrc = %self.mrc_name, target = %self.target, updated = updated, "Updated component statuses");
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(updated),
        }
    }

    async fn update_use_case(&self, use_case: UseCase) -> Result<bool> {
        let client = &self.client;
        let name = self.mrc_name.as_str();
        let target = self.target;
        let component = use_case.component();

        let written = retry_on_conflict(&self.retry, "deferred_component_status_update", || async move {
            let mut mrc = client.get_mesh_root_certificate(name).await?;

            // The rotation may have moved on or rolled back during the wait.
            if effective_stage(&mrc).target_component_status() != Some(target) {
                debug!(mrc = %name, use_case = %use_case, "MRC no longer targets this status, skipping");
                return Ok(false);
            }
            if !mrc.status.component_statuses.set(component, target) {
                return Ok(false);
            }
            client.update_mesh_root_certificate_status(mrc).await?;
            Ok(true)
        })
        .await?;

        if written {
            self.metrics.record_component_status_update(use_case.as_str(), target.as_str(), true);
        }
        Ok(written)
    }
}
