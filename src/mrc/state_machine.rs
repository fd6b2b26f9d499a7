//! # MRC State Machine
//!
//! Drives MeshRootCertificates through the rotation protocol and keeps the
//! Manager's signing and validating issuers in line with them.
//!
//! Every process runs one state machine. Processes never talk to each other;
//! they coordinate only through the MRC resources, so each write re-reads the
//! resource, re-checks that the action still applies, and retries on
//! optimistic-concurrency conflicts.
//!
//! For each observed MRC change exactly one action is taken, in order:
//!
//! 1. Passive acceptance (leader only): check a new Passive MRC's provider
//!    and record whether it is usable.
//! 2. Component catch-up: move this process's use cases to the status the
//!    declared stage expects.
//! 3. State advance: confirm the declared stage once every component agrees,
//!    or start the next stage.
//! 4. Issuer assignment: install the MRC's issuer in the slots its stage owns.
//!
//! Steps 2 and 3 wait for `transition_after` to pass. Starting a stage
//! re-runs issuer assignment for every MRC, since the new stage may claim
//! slots from another MRC or hand them back.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use super::conditions::{
    set_condition, REASON_CERTIFICATE_ACCEPTED, REASON_ERROR_RETRIEVING_CA, REASON_NOT_ACCEPTED_ISSUING,
    REASON_NOT_ACCEPTED_VALIDATING, REASON_PASSIVE_STATE_ISSUING, REASON_PASSIVE_STATE_VALIDATING,
};
use super::transitions::{
    advance_step, catch_up_target, enter_state, gate_open, issuer_slots, Advance, DeferredStatusUpdate, StageTimings,
};
use super::types::{ComponentStatus, ConditionStatus, MeshRootCertificate, MrcConditionType, MrcIntent, MrcState, UseCase};
use crate::certificate::{IssuerHandle, IssuerRole, Manager};
use crate::config::MrcConfig;
use crate::errors::{Error, Result};
use crate::messaging::{MrcEvent, Subscription};
use crate::observability::MetricsRecorder;
use crate::retry::{retry_on_conflict, RetryConfig};
use crate::store::MrcClient;

/// What handling one MRC event did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MrcAction {
    None,
    Accepted,
    Rejected(String),
    ComponentsUpdated(ComponentStatus),
    StateConfirmed(MrcState),
    TransitionStarted { from: MrcState, to: MrcState },
    IssuerAssigned(IssuerRole),
}

impl MrcAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Accepted => "accepted",
            Self::Rejected(_) => "rejected",
            Self::ComponentsUpdated(_) => "components_updated",
            Self::StateConfirmed(_) => "state_confirmed",
            Self::TransitionStarted { .. } => "transition_started",
            Self::IssuerAssigned(_) => "issuer_assigned",
        }
    }
}

#[derive(Debug)]
pub struct MrcStateMachine {
    manager: Arc<Manager>,
    client: Arc<dyn MrcClient>,
    leader: bool,
    owned_use_cases: Vec<UseCase>,
    timings: StageTimings,
    resync_interval: Duration,
    init_timeout: Duration,
    retry: RetryConfig,
    cancel: CancellationToken,
    metrics: MetricsRecorder,
}

impl MrcStateMachine {
    pub fn new(manager: Arc<Manager>, client: Arc<dyn MrcClient>, config: &MrcConfig, cancel: CancellationToken) -> Self {
        Self {
            manager,
            client,
            leader: config.leader,
            owned_use_cases: config.owned_use_cases.clone(),
            timings: StageTimings { stage_duration: config.stage_duration(), validating_wait: config.validating_wait() },
            resync_interval: config.resync_interval(),
            init_timeout: config.init_timeout(),
            retry: RetryConfig::default(),
            cancel,
            metrics: MetricsRecorder::new(),
        }
    }

    pub fn with_timings(mut self, timings: StageTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    /// Start the event loop and wait until the MRCs have configured both issuers.
    pub async fn start(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let handle = self.clone().spawn();

        if let Err(e) = self.manager.wait_until_ready(self.init_timeout).await {
            error!(
                error = %e,
                "No signing and validating issuer was configured, make sure your MeshRootCertificate(s) are valid"
            );
            handle.abort();
            return Err(e);
        }

        info!("MRC state machine ready");
        Ok(handle)
    }

    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let events = self.client.watch();
        tokio::spawn(async move { self.run(events).await })
    }

    /// Handle change events and periodically re-list every MRC until cancelled.
    pub async fn run(&self, mut events: Subscription<MrcEvent>) {
        let mut resync = tokio::time::interval(self.resync_interval);
        resync.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(resync_interval_ms = self.resync_interval.as_millis() as u64, leader = self.leader, "MRC state machine started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("MRC state machine stopped");
                    return;
                }
                _ = resync.tick() => self.resync().await,
                event = events.recv() => match event {
                    Some(event) => {
                        debug!(mrc = %event.mrc_name, kind = ?event.kind, "Received MRC event");
                        self.handle_logged(&event.mrc_name).await;
                    }
                    None => {
                        warn!("MRC watch closed, stopping state machine");
                        return;
                    }
                },
            }
        }
    }

    /// Handle every MRC once.
    pub async fn resync(&self) {
        let resources = match self.client.list_mesh_root_certificates().await {
            Ok(resources) => resources,
            Err(e) => {
                warn!(error = %e, "Failed to list MRCs");
                return;
            }
        };
        for mrc in resources {
            self.handle_logged(mrc.name()).await;
        }
    }

    async fn handle_logged(&self, name: &str) {
        if let Err(e) = self.handle_mrc_event(name).await {
            error!(mrc = %name, error = %e, "Error handling MRC event");
        }
    }

    /// Take the single highest-priority action the MRC called `name` calls for.
    pub async fn handle_mrc_event(&self, name: &str) -> Result<MrcAction> {
        let mrc = self.client.get_mesh_root_certificate(name).await?;
        let span = crate::mrc_span!("handle_event", mrc.namespaced_name(), state = %mrc.status.state);

        let action = self.decide_and_act(&mrc).instrument(span).await?;
        self.metrics.record_mrc_event(action.as_str());
        Ok(action)
    }

    async fn decide_and_act(&self, mrc: &MeshRootCertificate) -> Result<MrcAction> {
        let name = mrc.name();

        if should_accept(self.leader, mrc) {
            return self.accept_passive(mrc).await;
        }

        if gate_open(&mrc.status, Utc::now()) {
            if let Some(target) = catch_up_target(mrc, &self.owned_use_cases) {
                return self.catch_up(name, target).await;
            }
            match advance_step(mrc, &self.owned_use_cases) {
                Some(Advance::Confirm(stage)) => return self.confirm_state(name, mrc.status.state, stage).await,
                Some(Advance::Begin { from, to }) => return self.begin_transition(name, from, to).await,
                None => {}
            }
        }

        self.assign_issuers(mrc).await
    }

    /// Start a validating rollout for a Pending MRC with Active intent.
    pub async fn to_validating_rollout(&self, name: &str) -> Result<MrcAction> {
        let mrc = self.client.get_mesh_root_certificate(name).await?;
        match advance_step(&mrc, &self.owned_use_cases) {
            Some(Advance::Begin { from, to: MrcState::ValidatingRollout }) => {
                self.begin_transition(name, from, MrcState::ValidatingRollout).await
            }
            _ => Err(Error::validation(format!(
                "MRC '{}' in state {} with intent {:?} cannot start a validating rollout",
                name, mrc.status.state, mrc.spec.intent
            ))),
        }
    }

    async fn accept_passive(&self, mrc: &MeshRootCertificate) -> Result<MrcAction> {
        let provider_error = self.client.get_cert_issuer_for_mrc(mrc).await.err().map(|e| e.to_string());
        let leader = self.leader;

        let written = self
            .write_status(mrc.name(), "accept_passive_mrc", |mrc| {
                if !should_accept(leader, mrc) {
                    return false;
                }
                let now = Utc::now();
                let conditions = &mut mrc.status.conditions;
                match &provider_error {
                    None => {
                        set_condition(conditions, MrcConditionType::Accepted, ConditionStatus::True, REASON_CERTIFICATE_ACCEPTED, "certificate accepted", now);
                        set_condition(conditions, MrcConditionType::IssuingRollout, ConditionStatus::False, REASON_PASSIVE_STATE_ISSUING, "passive intent", now);
                        set_condition(conditions, MrcConditionType::ValidatingRollout, ConditionStatus::False, REASON_PASSIVE_STATE_VALIDATING, "passive intent", now);
                        mrc.status.state = MrcState::Pending;
                    }
                    Some(message) => {
                        set_condition(conditions, MrcConditionType::Accepted, ConditionStatus::False, REASON_ERROR_RETRIEVING_CA, message, now);
                        set_condition(conditions, MrcConditionType::IssuingRollout, ConditionStatus::False, REASON_NOT_ACCEPTED_ISSUING, message, now);
                        set_condition(conditions, MrcConditionType::ValidatingRollout, ConditionStatus::False, REASON_NOT_ACCEPTED_VALIDATING, message, now);
                        mrc.status.state = MrcState::Error;
                    }
                }
                true
            })
            .await?;

        if written.is_none() {
            return Ok(MrcAction::None);
        }
        match provider_error {
            None => {
                info!(mrc = %mrc.namespaced_name(), "Accepted passive MRC");
                Ok(MrcAction::Accepted)
            }
            Some(message) => {
                warn!(mrc = %mrc.namespaced_name(), error = %message, "Rejected passive MRC, its provider is unusable");
                Ok(MrcAction::Rejected(message))
            }
        }
    }

    async fn catch_up(&self, name: &str, target: ComponentStatus) -> Result<MrcAction> {
        let owned = &self.owned_use_cases;
        let written = self
            .write_status(name, "mrc_component_catch_up", |mrc| {
                if !gate_open(&mrc.status, Utc::now()) || catch_up_target(mrc, owned) != Some(target) {
                    return false;
                }
                let statuses = &mut mrc.status.component_statuses;
                owned.iter().fold(false, |changed, use_case| statuses.set(use_case.component(), target) || changed)
            })
            .await?;

        if written.is_none() {
            return Ok(MrcAction::None);
        }
        for use_case in owned {
            self.metrics.record_component_status_update(use_case.as_str(), target.as_str(), false);
        }
        info!(mrc = %name, target = %target, "Caught up component statuses");
        Ok(MrcAction::ComponentsUpdated(target))
    }

    async fn confirm_state(&self, name: &str, from: MrcState, stage: MrcState) -> Result<MrcAction> {
        let stage_duration = chrono::Duration::from_std(self.timings.stage_duration)
            .map_err(|e| Error::config(format!("invalid stage duration: {e}")))?;
        let owned = &self.owned_use_cases;

        let written = self
            .write_status(name, "confirm_mrc_state", |mrc| {
                let now = Utc::now();
                if !gate_open(&mrc.status, now) || advance_step(mrc, owned) != Some(Advance::Confirm(stage)) {
                    return false;
                }
                mrc.status.state = stage;
                mrc.status.transition_after = if stage.is_terminal() { None } else { Some(now + stage_duration) };
                true
            })
            .await?;

        if written.is_none() {
            return Ok(MrcAction::None);
        }
        self.metrics.record_mrc_transition(from.as_str(), stage.as_str());
        info!(mrc = %name, from = %from, to = %stage, "MRC state advanced");
        Ok(MrcAction::StateConfirmed(stage))
    }

    async fn begin_transition(&self, name: &str, from: MrcState, to: MrcState) -> Result<MrcAction> {
        let timings = self.timings;
        let owned = &self.owned_use_cases;
        let written = self
            .write_status(name, "begin_mrc_transition", |mrc| {
                let now = Utc::now();
                if !gate_open(&mrc.status, now) || advance_step(mrc, owned) != Some(Advance::Begin { from, to }) {
                    return false;
                }
                enter_state(mrc, to, now, &timings);
                true
            })
            .await?;

        let Some(updated) = written else {
            return Ok(MrcAction::None);
        };
        self.metrics.record_mrc_transition(from.as_str(), to.as_str());
        info!(
            mrc = %updated.namespaced_name(),
            from = %from,
            to = %to,
            transition_after = ?updated.status.transition_after,
            "Started MRC stage"
        );

        if let Err(e) = self.reassign_issuers().await {
            warn!(mrc = %name, stage = %to, error = %e, "Failed to swap issuers for new stage");
        }

        if let Some(update) =
            DeferredStatusUpdate::new(self.client.clone(), name, to, self.owned_use_cases.clone(), self.timings.wait_for(to))
        {
            update.with_retry(self.retry.clone()).spawn(self.cancel.child_token());
        }

        Ok(MrcAction::TransitionStarted { from, to })
    }

    async fn assign_issuers(&self, mrc: &MeshRootCertificate) -> Result<MrcAction> {
        let resources = self.client.list_mesh_root_certificates().await?;
        let Some(role) = issuer_slots(mrc, &resources) else {
            return Ok(MrcAction::None);
        };
        if !self.install_issuer(mrc, role).await? {
            return Ok(MrcAction::None);
        }

        info!(mrc = %mrc.namespaced_name(), state = %mrc.status.state, role = %role, "Set certificate issuers for MRC");
        Ok(MrcAction::IssuerAssigned(role))
    }

    /// Give every MRC the issuer slots it is due. The first failure is
    /// returned after every MRC was tried.
    async fn reassign_issuers(&self) -> Result<()> {
        let resources = self.client.list_mesh_root_certificates().await?;
        let mut first_error = None;

        for mrc in &resources {
            let Some(role) = issuer_slots(mrc, &resources) else {
                continue;
            };
            match self.install_issuer(mrc, role).await {
                Ok(true) => info!(mrc = %mrc.namespaced_name(), role = %role, "Reassigned certificate issuers"),
                Ok(false) => {}
                Err(e) => {
                    warn!(mrc = %mrc.namespaced_name(), role = %role, error = %e, "Failed to reassign issuer");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Put the MRC's issuer into `role` unless the Manager already has it
    /// there. Returns whether the Manager changed.
    async fn install_issuer(&self, mrc: &MeshRootCertificate, role: IssuerRole) -> Result<bool> {
        let name = mrc.name();
        if self.holds_slots(name, role).await {
            return Ok(false);
        }

        let (issuer, certificate_authority) = self.client.get_cert_issuer_for_mrc(mrc).await?;
        let handle = IssuerHandle::new(name, mrc.spec.trust_domain.clone(), certificate_authority, issuer)
            .with_spiffe(mrc.spec.spiffe_enabled);
        Ok(self.manager.set_issuer(role, handle).await)
    }

    async fn holds_slots(&self, name: &str, role: IssuerRole) -> bool {
        let (signing, validating) = self.manager.issuer_ids().await;
        let holds_signing = !role.signs() || signing.as_deref() == Some(name);
        let holds_validating = !role.validates() || validating.as_deref() == Some(name);
        holds_signing && holds_validating
    }

    /// Re-read, re-check and write the MRC status, retrying on conflict.
    /// `mutate` returns false when the action no longer applies; nothing is written then.
    async fn write_status<F>(&self, name: &str, operation: &str, mutate: F) -> Result<Option<MeshRootCertificate>>
    where
        F: Fn(&mut MeshRootCertificate) -> bool + Send + Sync,
    {
        let client = &self.client;
        let mutate = &mutate;

        retry_on_conflict(&self.retry, operation, || async move {
            let mut mrc = client.get_mesh_root_certificate(name).await?;
            if !mutate(&mut mrc) {
                debug!(mrc = %name, operation = %operation, "MRC changed underneath, skipping write");
                return Ok(None);
            }
            client.update_mesh_root_certificate_status(mrc).await.map(Some)
        })
        .await
    }
}

/// A freshly created Passive MRC waits for the leader to check its provider.
fn should_accept(leader: bool, mrc: &MeshRootCertificate) -> bool {
    leader
        && mrc.spec.intent == MrcIntent::Passive
        && mrc.status.state == MrcState::Pending
        && mrc.status.conditions.is_empty()
}
