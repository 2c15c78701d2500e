//! End-to-end scan scenarios against the in-memory store and a scripted camera

use entry_checkin::domain::errors::{CameraError, ResolutionError, ScanError};
use entry_checkin::domain::types::{CheckInOutcome, EventId, OperatorId, TicketId};
use entry_checkin::infra::config::Facing;
use entry_checkin::infra::Metrics;
use entry_checkin::io::{MemoryTicketStore, ScriptedCamera, StepFault};
use entry_checkin::services::camera::CaptureConstraints;
use entry_checkin::services::recorder::CheckInRecorder;
use entry_checkin::services::session::{Decision, SessionSettings};
use entry_checkin::services::{
    create_scan_session, CameraSessionManager, ResolutionPipeline, ScanSessionHandle, SessionState,
};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

struct Gate {
    handle: ScanSessionHandle,
    camera: ScriptedCamera,
    store: Arc<MemoryTicketStore>,
    metrics: Arc<Metrics>,
}

fn gate(store: Arc<MemoryTicketStore>, fallback_on_not_found: bool) -> Gate {
    let metrics = Arc::new(Metrics::new());
    let camera = ScriptedCamera::new();
    let manager = Arc::new(CameraSessionManager::new(
        Arc::new(camera.clone()),
        CaptureConstraints { facing: Facing::Rear, max_fps: 1000 },
        Duration::from_millis(500),
        64,
        metrics.clone(),
    ));
    let pipeline = Arc::new(ResolutionPipeline::new(
        store.clone(),
        Duration::from_millis(500),
        fallback_on_not_found,
        metrics.clone(),
    ));
    let settings = SessionSettings {
        operator: OperatorId::new("gate-1"),
        target: "main-entrance".to_string(),
        error_cooldown: Duration::from_secs(60),
        success_rearm: None,
    };
    let (handle, session) = create_scan_session(manager, pipeline, settings, metrics.clone());
    tokio::spawn(session.run());
    Gate { handle, camera, store, metrics }
}

async fn scanning(gate: &Gate) {
    gate.handle.open().await.unwrap();
    wait_for(&gate.handle, |s| *s == SessionState::Scanning).await;
}

async fn wait_for(
    handle: &ScanSessionHandle,
    pred: impl FnMut(&SessionState) -> bool,
) -> SessionState {
    timeout(Duration::from_secs(3), handle.wait_for_state(pred))
        .await
        .expect("state not reached")
        .expect("session closed")
}

async fn decided(handle: &ScanSessionHandle) -> Decision {
    match wait_for(handle, |s| matches!(s, SessionState::Decided(_))).await {
        SessionState::Decided(decision) => decision,
        other => panic!("unexpected state {other:?}"),
    }
}

#[tokio::test]
async fn test_first_scan_of_active_ticket_checks_in() {
    let gate = gate(Arc::new(MemoryTicketStore::with_demo_data()), false);
    scanning(&gate).await;

    gate.camera.show("PLKTK000001");
    assert_eq!(decided(&gate.handle).await, Decision::Success);
    assert_eq!(gate.store.check_in_count(&TicketId::new("tkt-0001")), 1);

    let snapshot = gate.handle.snapshot();
    let event = snapshot.last_decided.unwrap();
    assert_eq!(event.code.as_deref(), Some("PLKTK000001"));
    assert!(event.message.contains("Ada Lovelace"));
    gate.handle.close().await;
}

#[tokio::test]
async fn test_second_scan_is_already_done_without_new_record() {
    let gate = gate(Arc::new(MemoryTicketStore::with_demo_data()), false);
    scanning(&gate).await;

    gate.camera.show("PLKTK000001");
    assert_eq!(decided(&gate.handle).await, Decision::Success);

    gate.handle.rearm().await.unwrap();
    wait_for(&gate.handle, |s| *s == SessionState::Scanning).await;

    gate.camera.show("PLKTK000001");
    assert_eq!(decided(&gate.handle).await, Decision::AlreadyDone);
    assert_eq!(gate.store.check_in_count(&TicketId::new("tkt-0001")), 1);
    assert_eq!(gate.metrics.checkins_created(), 1);
    assert_eq!(gate.metrics.checkins_already(), 1);
    gate.handle.close().await;
}

#[tokio::test]
async fn test_unknown_code_is_not_found_after_every_step() {
    let gate = gate(Arc::new(MemoryTicketStore::with_demo_data()), true);
    scanning(&gate).await;

    gate.camera.show("XXXX");
    assert_eq!(
        decided(&gate.handle).await,
        Decision::Error(ScanError::Resolution(ResolutionError::NotFound))
    );
    assert!(gate.store.check_ins().is_empty());
    gate.handle.close().await;
}

#[tokio::test]
async fn test_permission_denied_skips_resolution() {
    let gate = gate(Arc::new(MemoryTicketStore::with_demo_data()), false);
    gate.camera.set_failure(Some(CameraError::PermissionDenied));

    gate.handle.open().await.unwrap();
    assert_eq!(
        decided(&gate.handle).await,
        Decision::Error(ScanError::Camera(CameraError::PermissionDenied))
    );
    assert_eq!(gate.metrics.resolutions_total(), 0);
    assert!(!gate.camera.is_live());
    gate.handle.close().await;
}

#[tokio::test]
async fn test_held_ticket_yields_one_resolution() {
    let store = Arc::new(MemoryTicketStore::with_demo_data());
    store.set_latency(Some(Duration::from_millis(100)));
    let gate = gate(store, false);
    scanning(&gate).await;

    for _ in 0..50 {
        gate.camera.show("PLKTK000002");
    }
    assert_eq!(decided(&gate.handle).await, Decision::Success);

    // Let the pump drain whatever is still queued
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(gate.metrics.resolutions_total(), 1);
    assert_eq!(gate.store.check_in_count(&TicketId::new("tkt-0002")), 1);
    gate.handle.close().await;
}

#[tokio::test]
async fn test_close_releases_camera() {
    let gate = gate(Arc::new(MemoryTicketStore::with_demo_data()), false);
    scanning(&gate).await;
    assert!(gate.camera.is_live());

    gate.handle.close().await;
    assert_eq!(gate.handle.state(), SessionState::Closed);
    assert!(!gate.camera.is_live());
    assert_eq!(gate.camera.acquisitions(), gate.camera.releases());
}

#[tokio::test]
async fn test_atomic_outage_falls_back_and_still_admits_once() {
    let store = Arc::new(MemoryTicketStore::with_demo_data());
    store.set_fault(StepFault::Atomic, true);
    let gate = gate(store, false);
    scanning(&gate).await;

    gate.camera.show("PLKTK000002");
    assert_eq!(decided(&gate.handle).await, Decision::Success);
    assert_eq!(gate.store.check_in_count(&TicketId::new("tkt-0002")), 1);
    gate.handle.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_gates_race_for_one_ticket() {
    let store = Arc::new(MemoryTicketStore::with_demo_data());
    let metrics = Arc::new(Metrics::new());
    let pipe = |fallback| {
        Arc::new(ResolutionPipeline::new(
            store.clone(),
            Duration::from_millis(500),
            fallback,
            metrics.clone(),
        ))
    };
    let (a, b) = (pipe(false), pipe(false));

    let first = tokio::spawn(async move { a.resolve("PLKTK000001", &OperatorId::new("a")).await });
    let second = tokio::spawn(async move { b.resolve("PLKTK000001", &OperatorId::new("b")).await });
    let mut outcomes =
        vec![first.await.unwrap().unwrap().outcome, second.await.unwrap().unwrap().outcome];
    outcomes.sort_by_key(|o| o.as_str());

    assert_eq!(outcomes, vec![CheckInOutcome::AlreadyCheckedIn, CheckInOutcome::Created]);
    assert_eq!(store.check_in_count(&TicketId::new("tkt-0001")), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn concurrent_records_create_exactly_once(callers in 2usize..16, pick in 0usize..3) {
        let ticket = ["tkt-0001", "tkt-0002", "tkt-0005"][pick];
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();

        let store = Arc::new(MemoryTicketStore::with_demo_data());
        let recorder = CheckInRecorder::new(store.clone(), Duration::from_secs(1));

        let outcomes: Vec<CheckInOutcome> = rt.block_on(async {
            let tasks: Vec<_> = (0..callers)
                .map(|i| {
                    let recorder = recorder.clone();
                    tokio::spawn(async move {
                        recorder
                            .record(
                                &TicketId::new(ticket),
                                Some(&EventId::new("evt-main")),
                                &OperatorId::new(format!("op-{i}")),
                            )
                            .await
                    })
                })
                .collect();
            let mut outcomes = Vec::with_capacity(tasks.len());
            for task in tasks {
                outcomes.push(task.await.unwrap().unwrap());
            }
            outcomes
        });

        let created = outcomes.iter().filter(|o| **o == CheckInOutcome::Created).count();
        prop_assert_eq!(created, 1);
        prop_assert_eq!(outcomes.len() - created, callers - 1);
        prop_assert_eq!(store.check_in_count(&TicketId::new(ticket)), 1);
    }
}
