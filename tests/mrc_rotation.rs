//! Integration tests for the MeshRootCertificate rotation protocol.
//!
//! A single state machine owns every use case and stages have no dwell time,
//! so a rotation can be driven step by step from the test.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use common::{
    cn, drive_until, fast_retry, handle, instant_timings, mrc, mrc_in_state, state_machine, state_machine_owning, store,
    FakeFactory, FakeIssuer, HOUR,
};
use meshroot::certificate::{IssuerRole, Manager};
use meshroot::mrc::{
    components_reached, enter_state, get_condition, is_condition_true, set_condition, ComponentStatus,
    ConditionStatus, DeferredStatusUpdate, MeshRootCertificate, MrcAction, MrcConditionType, MrcIntent,
    MrcReconciler, MrcState, ReconcileOutcome, UseCase, REASON_PASSIVELY_IN_USE,
};
use meshroot::store::{MemoryMrcClient, MrcClient};
use meshroot::{Error, Result};

// ============================================================================
// State machine
// ============================================================================

#[tokio::test]
async fn test_declared_stage_is_confirmed_once_components_catch_up() {
    let factory = FakeFactory::new();
    let client = store(&factory);
    let cancel = CancellationToken::new();
    let machine = state_machine(&Arc::new(Manager::new()), &client, false, &cancel);

    let mut declared = mrc("new", MrcIntent::Active);
    set_condition(
        &mut declared.status.conditions,
        MrcConditionType::ValidatingRollout,
        ConditionStatus::True,
        "StageEntered",
        "moved from pending",
        Utc::now(),
    );
    client.create(declared).unwrap();

    let action = machine.handle_mrc_event("new").await.unwrap();
    assert_eq!(action, MrcAction::ComponentsUpdated(ComponentStatus::Validating));
    let stored = client.get_mesh_root_certificate("new").await.unwrap();
    assert_eq!(stored.status.state, MrcState::Pending);
    assert!(stored.status.component_statuses.all_equal(ComponentStatus::Validating));

    let action = machine.handle_mrc_event("new").await.unwrap();
    assert_eq!(action, MrcAction::StateConfirmed(MrcState::ValidatingRollout));
    let stored = client.get_mesh_root_certificate("new").await.unwrap();
    assert_eq!(stored.status.state, MrcState::ValidatingRollout);
    assert_eq!(stored.status.conditions.len(), 1);
    assert!(stored.status.transition_after.is_some());
    cancel.cancel();
}

#[tokio::test]
async fn test_leader_accepts_usable_passive_mrc() {
    let factory = FakeFactory::new();
    let client = store(&factory);
    let cancel = CancellationToken::new();
    let machine = state_machine(&Arc::new(Manager::new()), &client, true, &cancel);
    client.create(mrc("standby", MrcIntent::Passive)).unwrap();

    assert_eq!(machine.handle_mrc_event("standby").await.unwrap(), MrcAction::Accepted);

    let stored = client.get_mesh_root_certificate("standby").await.unwrap();
    let conditions = &stored.status.conditions;
    assert_eq!(stored.status.state, MrcState::Pending);
    assert_eq!(conditions.len(), 3);
    assert_eq!(get_condition(conditions, MrcConditionType::Accepted).unwrap().reason, "CertificateAccepted");
    assert!(is_condition_true(conditions, MrcConditionType::Accepted));
    assert!(!is_condition_true(conditions, MrcConditionType::IssuingRollout));
    assert!(!is_condition_true(conditions, MrcConditionType::ValidatingRollout));

    // Accepted passive roots wait; nothing else happens to them.
    assert_eq!(machine.handle_mrc_event("standby").await.unwrap(), MrcAction::None);
    cancel.cancel();
}

#[tokio::test]
async fn test_leader_rejects_passive_mrc_with_unreachable_provider() {
    let factory = FakeFactory::new();
    factory.make_unreachable("standby");
    let client = store(&factory);
    let cancel = CancellationToken::new();
    let machine = state_machine(&Arc::new(Manager::new()), &client, true, &cancel);
    client.create(mrc("standby", MrcIntent::Passive)).unwrap();

    match machine.handle_mrc_event("standby").await.unwrap() {
        MrcAction::Rejected(message) => assert!(message.contains("unreachable")),
        other => panic!("expected rejection, got {other:?}"),
    }

    let stored = client.get_mesh_root_certificate("standby").await.unwrap();
    assert_eq!(stored.status.state, MrcState::Error);
    let accepted = get_condition(&stored.status.conditions, MrcConditionType::Accepted).unwrap();
    assert_eq!(accepted.status, ConditionStatus::False);
    assert_eq!(accepted.reason, "ErrorRetrievingCA");

    assert_eq!(machine.handle_mrc_event("standby").await.unwrap(), MrcAction::None);
    cancel.cancel();
}

#[tokio::test]
async fn test_follower_leaves_new_passive_mrc_alone() {
    let factory = FakeFactory::new();
    let client = store(&factory);
    let cancel = CancellationToken::new();
    let machine = state_machine(&Arc::new(Manager::new()), &client, false, &cancel);
    client.create(mrc("standby", MrcIntent::Passive)).unwrap();

    assert_eq!(machine.handle_mrc_event("standby").await.unwrap(), MrcAction::None);
    let stored = client.get_mesh_root_certificate("standby").await.unwrap();
    assert!(stored.status.conditions.is_empty());
    assert_eq!(stored.metadata.resource_version, 1);
    cancel.cancel();
}

#[tokio::test]
async fn test_validating_rollout_trusts_both_roots() {
    let factory = FakeFactory::new();
    let client = store(&factory);
    let cancel = CancellationToken::new();
    let manager = Arc::new(Manager::new());
    let machine = state_machine(&manager, &client, false, &cancel);

    client.create(mrc_in_state("old", MrcIntent::Active, MrcState::Active)).unwrap();
    client.create(mrc("new", MrcIntent::Active)).unwrap();

    assert_eq!(machine.handle_mrc_event("old").await.unwrap(), MrcAction::ComponentsUpdated(ComponentStatus::Active));
    assert!(matches!(machine.handle_mrc_event("old").await.unwrap(), MrcAction::IssuerAssigned(_)));
    assert_eq!(manager.issue_certificate(&cn("sidecar.ns"), HOUR).await.unwrap().issuing_ca(), b"old");

    let err = machine.to_validating_rollout("old").await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let action = machine.to_validating_rollout("new").await.unwrap();
    assert_eq!(action, MrcAction::TransitionStarted { from: MrcState::Pending, to: MrcState::ValidatingRollout });
    assert_eq!(manager.issuer_ids().await, (Some("old".to_string()), Some("new".to_string())));

    let stored = client.get_mesh_root_certificate("new").await.unwrap();
    assert_eq!(stored.status.state, MrcState::ValidatingRollout);
    assert!(is_condition_true(&stored.status.conditions, MrcConditionType::ValidatingRollout));

    let certificate = manager.issue_certificate(&cn("sidecar.ns"), HOUR).await.unwrap();
    assert_eq!(certificate.issuing_ca(), b"oldnew");
    cancel.cancel();
}

#[tokio::test]
async fn test_rotation_promotes_new_root_and_retires_old_one() {
    let factory = FakeFactory::new();
    let client = store(&factory);
    let cancel = CancellationToken::new();
    let manager = Arc::new(Manager::new());
    let machine = state_machine(&manager, &client, false, &cancel);

    client.create(mrc_in_state("old", MrcIntent::Active, MrcState::Active)).unwrap();
    client.create(mrc("new", MrcIntent::Active)).unwrap();
    drive_until(&machine, &client, "old", |_| manager.is_ready()).await;

    let promoted = drive_until(&machine, &client, "new", |mrc| {
        mrc.status.state == MrcState::Active && mrc.status.component_statuses.all_equal(ComponentStatus::Active)
    })
    .await;
    assert!(is_condition_true(&promoted.status.conditions, MrcConditionType::Ready));
    assert!(!is_condition_true(&promoted.status.conditions, MrcConditionType::ValidatingRollout));
    assert!(!is_condition_true(&promoted.status.conditions, MrcConditionType::IssuingRollout));
    assert_eq!(manager.issuer_ids().await, (Some("new".to_string()), Some("new".to_string())));
    assert_eq!(manager.issue_certificate(&cn("sidecar.ns"), HOUR).await.unwrap().issuing_ca(), b"new");

    let mut old = client.get_mesh_root_certificate("old").await.unwrap();
    old.spec.intent = MrcIntent::Passive;
    client.update_mesh_root_certificate(old).await.unwrap();

    let retired = drive_until(&machine, &client, "old", |mrc| {
        mrc.status.state == MrcState::Inactive && mrc.status.component_statuses.all_equal(ComponentStatus::Unused)
    })
    .await;
    assert!(retired.status.transition_after.is_none());
    assert!(!is_condition_true(&retired.status.conditions, MrcConditionType::Ready));

    // The retired root hands both slots back to the promoted one.
    assert_eq!(manager.issuer_ids().await, (Some("new".to_string()), Some("new".to_string())));
    assert_eq!(manager.issue_certificate(&cn("sidecar.ns"), HOUR).await.unwrap().issuing_ca(), b"new");

    // Further events and a resync leave it that way.
    for name in ["old", "new", "old", "new"] {
        machine.handle_mrc_event(name).await.unwrap();
    }
    machine.resync().await;
    assert_eq!(manager.issuer_ids().await, (Some("new".to_string()), Some("new".to_string())));
    cancel.cancel();
}

#[tokio::test]
async fn test_issuer_assignment_repairs_slots_it_lost() {
    let factory = FakeFactory::new();
    let client = store(&factory);
    let cancel = CancellationToken::new();
    let manager = Arc::new(Manager::new());
    let machine = state_machine(&manager, &client, false, &cancel);
    client.create(mrc_in_state("root", MrcIntent::Active, MrcState::Active)).unwrap();

    drive_until(&machine, &client, "root", |_| manager.is_ready()).await;
    assert_eq!(manager.issuer_ids().await, (Some("root".to_string()), Some("root".to_string())));

    // Something else took the signing slot since the last assignment.
    manager.set_issuer(IssuerRole::Signing, handle(&FakeIssuer::new("stray"))).await;
    assert_eq!(machine.handle_mrc_event("root").await.unwrap(), MrcAction::IssuerAssigned(IssuerRole::Both));
    assert_eq!(manager.issuer_ids().await, (Some("root".to_string()), Some("root".to_string())));
    assert_eq!(machine.handle_mrc_event("root").await.unwrap(), MrcAction::None);
    cancel.cancel();
}

#[tokio::test]
async fn test_partial_owner_advances_on_its_own_components() {
    let factory = FakeFactory::new();
    let client = store(&factory);
    let cancel = CancellationToken::new();
    let machine = state_machine_owning(&Arc::new(Manager::new()), &client, false, &[UseCase::Sidecar], &cancel);

    let mut declared = mrc("new", MrcIntent::Active);
    set_condition(
        &mut declared.status.conditions,
        MrcConditionType::ValidatingRollout,
        ConditionStatus::True,
        "StageEntered",
        "moved from pending",
        Utc::now(),
    );
    client.create(declared).unwrap();

    assert_eq!(machine.handle_mrc_event("new").await.unwrap(), MrcAction::ComponentsUpdated(ComponentStatus::Validating));
    assert_eq!(machine.handle_mrc_event("new").await.unwrap(), MrcAction::StateConfirmed(MrcState::ValidatingRollout));

    let stored = client.get_mesh_root_certificate("new").await.unwrap();
    let statuses = stored.status.component_statuses;
    assert_eq!(stored.status.state, MrcState::ValidatingRollout);
    assert_eq!(statuses.sidecar, ComponentStatus::Validating);
    assert_eq!(statuses.gateway, ComponentStatus::Unknown);
    assert_eq!(statuses.webhooks, ComponentStatus::Unknown);
    cancel.cancel();
}

#[tokio::test]
async fn test_start_fails_without_a_usable_mrc() {
    let factory = FakeFactory::new();
    let client = store(&factory);
    let cancel = CancellationToken::new();
    let machine = Arc::new(state_machine(&Arc::new(Manager::new()), &client, false, &cancel));

    let err = machine.start().await.unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));
    cancel.cancel();
}

#[tokio::test]
async fn test_start_configures_issuers_from_active_mrc() {
    let factory = FakeFactory::new();
    let client = store(&factory);
    let cancel = CancellationToken::new();
    let manager = Arc::new(Manager::new());
    client.create(mrc_in_state("root", MrcIntent::Active, MrcState::Active)).unwrap();

    let machine = Arc::new(state_machine(&manager, &client, false, &cancel));
    let task = machine.start().await.unwrap();

    assert_eq!(manager.issuer_ids().await, (Some("root".to_string()), Some("root".to_string())));
    assert_eq!(manager.trust_domain().await.unwrap(), "cluster.local");

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
}

// ============================================================================
// Deferred status updates
// ============================================================================

async fn create_in_validating_rollout(client: &Arc<MemoryMrcClient>) -> MeshRootCertificate {
    let mut new = mrc("new", MrcIntent::Active);
    enter_state(&mut new, MrcState::ValidatingRollout, Utc::now(), &instant_timings());
    client.create(new).unwrap()
}

fn deferred(client: &Arc<MemoryMrcClient>, wait: Duration) -> DeferredStatusUpdate {
    DeferredStatusUpdate::new(client.clone(), "new", MrcState::ValidatingRollout, UseCase::ALL.to_vec(), wait)
        .unwrap()
        .with_retry(fast_retry())
}

#[tokio::test]
async fn test_deferred_update_reports_components_after_wait() {
    let client = store(&FakeFactory::new());
    create_in_validating_rollout(&client).await;

    let update = deferred(&client, Duration::from_millis(20));
    assert_eq!(update.target(), ComponentStatus::Validating);

    // Both webhooks share one component status.
    assert_eq!(update.run(CancellationToken::new()).await.unwrap(), 5);

    let stored = client.get_mesh_root_certificate("new").await.unwrap();
    assert!(stored.status.component_statuses.all_equal(ComponentStatus::Validating));
}

#[tokio::test]
async fn test_deferred_update_skips_when_rotation_moved_on() {
    let client = store(&FakeFactory::new());
    let mut stored = create_in_validating_rollout(&client).await;

    set_condition(
        &mut stored.status.conditions,
        MrcConditionType::IssuingRollout,
        ConditionStatus::True,
        "StageEntered",
        "moved from validatingRollout",
        Utc::now(),
    );
    client.update_mesh_root_certificate_status(stored).await.unwrap();

    assert_eq!(deferred(&client, Duration::ZERO).run(CancellationToken::new()).await.unwrap(), 0);
    let stored = client.get_mesh_root_certificate("new").await.unwrap();
    assert!(stored.status.component_statuses.all_equal(ComponentStatus::Unknown));
}

#[tokio::test]
async fn test_deferred_update_stops_when_cancelled() {
    let client = store(&FakeFactory::new());
    create_in_validating_rollout(&client).await;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let written = tokio::time::timeout(Duration::from_secs(1), deferred(&client, HOUR).run(cancel)).await.unwrap();
    assert_eq!(written.unwrap(), 0);
    assert!(DeferredStatusUpdate::new(client.clone(), "new", MrcState::Pending, UseCase::ALL.to_vec(), HOUR).is_none());
}

// ============================================================================
// Reconciler
// ============================================================================

async fn mark_passively_in_use(client: Arc<MemoryMrcClient>, mut mrc: MeshRootCertificate) -> Result<()> {
    set_condition(
        &mut mrc.status.conditions,
        MrcConditionType::Accepted,
        ConditionStatus::True,
        REASON_PASSIVELY_IN_USE,
        "all components report active",
        Utc::now(),
    );
    client.update_mesh_root_certificate_status(mrc).await.map(|_| ())
}

fn reconciler(client: &Arc<MemoryMrcClient>) -> MrcReconciler {
    MrcReconciler::new(client.clone(), Duration::from_millis(5))
}

#[tokio::test]
async fn test_reconciler_updates_once_components_are_ready() {
    let client = store(&FakeFactory::new());
    client.create(mrc_in_state("root", MrcIntent::Active, MrcState::Active)).unwrap();

    let writer = client.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        let mut mrc = writer.get_mesh_root_certificate("root").await.unwrap();
        for component in meshroot::mrc::Component::ALL {
            mrc.status.component_statuses.set(component, ComponentStatus::Active);
        }
        writer.update_mesh_root_certificate_status(mrc).await.unwrap();
    });

    let calls = AtomicU32::new(0);
    let outcome = tokio::time::timeout(
        Duration::from_secs(2),
        reconciler(&client).check_and_update(
            "root",
            components_reached(MrcState::Active, ComponentStatus::Active),
            |mrc| {
                calls.fetch_add(1, Ordering::SeqCst);
                mark_passively_in_use(client.clone(), mrc)
            },
            &CancellationToken::new(),
        ),
    )
    .await
    .unwrap();

    assert_eq!(outcome, ReconcileOutcome::Updated);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let stored = client.get_mesh_root_certificate("root").await.unwrap();
    let accepted = get_condition(&stored.status.conditions, MrcConditionType::Accepted).unwrap();
    assert_eq!(accepted.reason, REASON_PASSIVELY_IN_USE);
}

#[tokio::test]
async fn test_reconciler_aborts_when_mrc_left_expected_state() {
    let client = store(&FakeFactory::new());
    client.create(mrc_in_state("root", MrcIntent::Active, MrcState::IssuingRollout)).unwrap();

    let calls = AtomicU32::new(0);
    let outcome = reconciler(&client)
        .check_and_update(
            "root",
            components_reached(MrcState::Active, ComponentStatus::Active),
            |mrc| {
                calls.fetch_add(1, Ordering::SeqCst);
                mark_passively_in_use(client.clone(), mrc)
            },
            &CancellationToken::new(),
        )
        .await;

    assert!(matches!(outcome, ReconcileOutcome::Aborted(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    let stored = client.get_mesh_root_certificate("root").await.unwrap();
    assert_eq!(stored.metadata.resource_version, 1);
}

#[tokio::test]
async fn test_reconciler_stops_when_cancelled() {
    let client = store(&FakeFactory::new());
    client.create(mrc_in_state("root", MrcIntent::Active, MrcState::Active)).unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let outcome = tokio::time::timeout(
        Duration::from_secs(2),
        reconciler(&client).check_and_update(
            "root",
            components_reached(MrcState::Active, ComponentStatus::Active),
            |mrc| mark_passively_in_use(client.clone(), mrc),
            &cancel,
        ),
    )
    .await
    .unwrap();

    assert_eq!(outcome, ReconcileOutcome::Cancelled);
}
