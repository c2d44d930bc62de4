//! Admission and the background worker pool.

use labs_config::WorkerPoolConfig;
use labs_orchestrator::test_utils::TestHarness;
use labs_orchestrator::{AttendeeStatus, EntityStore, ErrorCode, TargetKind, WorkshopStatus};
use std::time::Duration;
use tokio::sync::watch;

async fn wait_for_status(h: &TestHarness, workshop_id: &str, status: WorkshopStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        let workshop = h.orchestrator.get_workshop(workshop_id).await.unwrap();
        if workshop.status == status {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "workshop stuck in {}",
            workshop.status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_repeated_submission_is_merged() {
    let h = TestHarness::new().await;
    let (workshop, attendees) = h.workshop_with(&["anna", "bob"]).await;

    let first = h.orchestrator.submit_deployment(&workshop.id).await.unwrap();
    let second = h.orchestrator.submit_deployment(&workshop.id).await.unwrap();
    assert_eq!(first.admitted.len(), 2);
    assert!(second.is_noop());
    assert_eq!(second.merged.len(), 2);

    for attendee in &attendees {
        let tasks = h
            .store
            .list_tasks_for_target(TargetKind::Attendee, &attendee.id)
            .await
            .unwrap();
        assert_eq!(tasks.len(), 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_admit_once() {
    let h = TestHarness::new().await;
    let (workshop, attendees) = h.workshop_with(&["anna"]).await;

    let mut handles = Vec::new();
    for _ in 0..6 {
        let orchestrator = h.orchestrator.clone();
        let id = workshop.id.clone();
        handles.push(tokio::spawn(async move {
            orchestrator.submit_deployment(&id).await.unwrap()
        }));
    }

    let mut admitted = 0;
    for handle in handles {
        admitted += handle.await.unwrap().admitted.len();
    }
    assert_eq!(admitted, 1);

    let tasks = h
        .store
        .list_tasks_for_target(TargetKind::Attendee, &attendees[0].id)
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_respects_queue_ceiling() {
    let h = TestHarness::new().await;
    let names = ["a1", "a2", "a3", "a4", "a5", "a6"];
    let (workshop, _) = h.workshop_with(&names).await;
    h.runner.set_apply_delay(Duration::from_millis(50));

    let pool = h.orchestrator.worker_pool(&WorkerPoolConfig {
        provisioning: 2,
        cleanup: 1,
        poll_interval_ms: 20,
    });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = pool.spawn(shutdown_rx);

    h.orchestrator.submit_deployment(&workshop.id).await.unwrap();
    wait_for_status(&h, &workshop.id, WorkshopStatus::Active).await;

    h.orchestrator.submit_cleanup(&workshop.id).await.unwrap();
    wait_for_status(&h, &workshop.id, WorkshopStatus::Deleted).await;

    shutdown_tx.send(true).unwrap();
    for handle in handles {
        handle.await.unwrap();
    }

    assert!(h.runner.max_concurrent_applies() <= 2);
    assert!(h.runner.max_concurrent_applies() >= 1);
    for attendee in h.orchestrator.list_attendees(&workshop.id).await.unwrap() {
        assert_eq!(attendee.status, AttendeeStatus::Deleted);
    }
}

#[tokio::test]
async fn test_pool_stops_on_shutdown() {
    let h = TestHarness::new().await;
    let pool = h.orchestrator.worker_pool(&WorkerPoolConfig::default());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = pool.spawn(shutdown_rx);

    shutdown_tx.send(true).unwrap();
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}

#[tokio::test]
async fn test_workshop_input_validation() {
    let h = TestHarness::new().await;
    let mut request = labs_orchestrator::test_utils::sample_new_workshop("Bad");

    request.timezone = "Mars/Olympus".into();
    let err = h.orchestrator.create_workshop(request.clone()).await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::InvalidTimezone));

    request.timezone = "Europe/Berlin".into();
    request.end = request.start;
    let err = h.orchestrator.create_workshop(request.clone()).await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::InvalidSchedule));

    let mut request = labs_orchestrator::test_utils::sample_new_workshop("Templated");
    request.template = Some("Not A Name".into());
    let err = h.orchestrator.create_workshop(request).await.unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::NamingPolicy));
}

#[tokio::test]
async fn test_attendee_identifiers_are_unique_per_workshop() {
    let h = TestHarness::new().await;
    let (workshop, _) = h.workshop_with(&["Max.Mustermann"]).await;

    let err = h
        .orchestrator
        .add_attendee(
            &workshop.id,
            labs_orchestrator::NewAttendee::new("max mustermann", "max2@example.com"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::DuplicateIdentifier));

    let err = h
        .orchestrator
        .add_attendee(
            &workshop.id,
            labs_orchestrator::NewAttendee::new("eve", "not-an-email"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(ErrorCode::InvalidInput));
}
