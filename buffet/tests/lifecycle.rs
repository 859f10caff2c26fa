//! Integration tests for the session lifecycle (create, get, destroy, release).

use std::time::Duration;

use buffet::{
    BuffetError, BuffetRuntime, DegradedReason, ProvisioningOutcome, Requester, SessionStatus,
};
use buffet_test_utils::{DEBIAN, TestRuntime, UBUNTU, owner};

// ============================================================================
// CREATE
// ============================================================================

#[tokio::test]
async fn first_session_gets_slot_zero_and_a_credential() {
    let ctx = TestRuntime::new();

    let provisioned = ctx.runtime.create(&owner("u1"), UBUNTU).await.unwrap();
    let view = &provisioned.view;

    assert_eq!(provisioned.outcome, ProvisioningOutcome::FullySucceeded);
    assert_eq!(view.public_port, 5700);
    assert_eq!(view.image_ref, UBUNTU);
    assert_eq!(view.owner_id, owner("u1"));
    assert!(view.display_credential.as_ref().unwrap().len() >= 16);
    assert_eq!(view.catalogue_metadata.as_ref().unwrap().name, "Ubuntu");
    assert_eq!(ctx.runtime.count().unwrap(), 1);

    let launches = ctx.supervisor.hypervisor_launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].ports.display_port, 5900);
    assert_eq!(launches[0].ports.display_number, 0);
    assert!(launches[0].control_socket.ends_with("qmp-0.sock"));
    assert_eq!(ctx.control.sockets(), vec![launches[0].control_socket.clone()]);

    let proxies = ctx.supervisor.proxy_launches();
    assert_eq!(proxies[0].ports.public_port, 5700);
    assert_eq!(ctx.supervisor.alive().len(), 2);
}

#[tokio::test]
async fn traffic_capture_lands_in_dated_owner_directory() {
    let ctx = TestRuntime::new();
    ctx.runtime.create(&owner("u1"), UBUNTU).await.unwrap();

    let capture = &ctx.supervisor.hypervisor_launches()[0].traffic_log;
    let logs_dir = ctx.home.path().join("logs");
    let relative = capture.strip_prefix(&logs_dir).unwrap();
    let parts: Vec<_> = relative.iter().map(|p| p.to_string_lossy()).collect();

    assert_eq!(parts.len(), 3);
    assert_eq!(parts[0], chrono::Local::now().format("%Y-%m-%d").to_string());
    assert_eq!(parts[1], "u1");
    assert!(parts[2].ends_with("-ubuntu-24.04.iso.pcap"));
}

#[tokio::test]
async fn second_create_for_same_owner_is_rejected() {
    let ctx = TestRuntime::new();
    ctx.runtime.create(&owner("u1"), UBUNTU).await.unwrap();

    let err = ctx.runtime.create(&owner("u1"), DEBIAN).await.unwrap_err();
    assert!(matches!(err, BuffetError::AlreadyHasSession(ref o) if o == "u1"));
    assert!(err.is_user_error());
    assert_eq!(ctx.supervisor.hypervisor_launches().len(), 1);
}

#[tokio::test]
async fn unknown_image_has_no_side_effects() {
    let ctx = TestRuntime::new();

    let err = ctx
        .runtime
        .create(&owner("u1"), "windows-95.iso")
        .await
        .unwrap_err();
    assert!(matches!(err, BuffetError::UnknownImage(_)));
    assert!(ctx.supervisor.hypervisor_launches().is_empty());
    assert!(ctx.runtime.list().unwrap().is_empty());
}

#[tokio::test]
async fn capacity_exhausted_when_every_slot_is_taken() {
    let ctx = TestRuntime::with_options(|o| o.max_sessions = 2);
    ctx.runtime.create(&owner("u1"), UBUNTU).await.unwrap();
    ctx.runtime.create(&owner("u2"), UBUNTU).await.unwrap();

    let err = ctx.runtime.create(&owner("u3"), UBUNTU).await.unwrap_err();
    assert!(matches!(err, BuffetError::CapacityExhausted { max: 2 }));
    assert!(err.is_retryable());

    assert_eq!(ctx.supervisor.hypervisor_launches().len(), 2);
    assert_eq!(ctx.supervisor.alive().len(), 4);
    assert_eq!(ctx.runtime.list().unwrap().len(), 2);
}

// ============================================================================
// PARTIAL FAILURES
// ============================================================================

#[tokio::test]
async fn hypervisor_launch_failure_persists_nothing() {
    let ctx = TestRuntime::new();
    ctx.supervisor.fail_hypervisor(true);

    let err = ctx.runtime.create(&owner("u1"), UBUNTU).await.unwrap_err();
    assert!(matches!(err, BuffetError::LaunchFailed(_)));
    assert!(ctx.runtime.list().unwrap().is_empty());
    assert!(ctx.control.sockets().is_empty());
    assert!(ctx.supervisor.proxy_launches().is_empty());

    // The owner is free to try again
    ctx.supervisor.fail_hypervisor(false);
    ctx.runtime.create(&owner("u1"), UBUNTU).await.unwrap();
}

#[tokio::test]
async fn proxy_failure_terminates_the_running_hypervisor() {
    let ctx = TestRuntime::new();
    ctx.supervisor.fail_proxy(true);

    let err = ctx.runtime.create(&owner("u1"), UBUNTU).await.unwrap_err();
    assert!(matches!(err, BuffetError::LaunchFailed(_)));

    assert!(ctx.supervisor.alive().is_empty());
    let terminated = ctx.supervisor.terminated();
    assert_eq!(terminated.len(), 1);
    assert_eq!(terminated[0].1, buffet::ProcessKind::Hypervisor);
    assert!(ctx.runtime.list().unwrap().is_empty());
    assert_eq!(ctx.runtime.count().unwrap(), 0);
}

#[tokio::test]
async fn control_channel_failure_degrades_instead_of_failing() {
    let ctx = TestRuntime::new();
    ctx.control.fail(true);

    let provisioned = ctx.runtime.create(&owner("u1"), UBUNTU).await.unwrap();
    assert!(matches!(
        provisioned.outcome,
        ProvisioningOutcome::SucceededDegraded(DegradedReason::ControlChannel(_))
    ));
    assert!(provisioned.view.display_credential.is_none());

    let view = ctx.runtime.get(&owner("u1")).unwrap();
    assert!(view.display_credential.is_none());
    assert_eq!(ctx.runtime.count().unwrap(), 1);
}

#[tokio::test]
async fn unsupported_credential_skips_the_control_channel() {
    let ctx = TestRuntime::new();
    ctx.supervisor.without_display_credential();

    let provisioned = ctx.runtime.create(&owner("u1"), UBUNTU).await.unwrap();
    assert_eq!(
        provisioned.outcome,
        ProvisioningOutcome::SucceededDegraded(DegradedReason::CredentialUnsupported)
    );
    assert!(provisioned.view.display_credential.is_none());
    assert!(ctx.control.sockets().is_empty());
}

// ============================================================================
// GET / LIST
// ============================================================================

#[tokio::test]
async fn get_returns_the_stored_credential() {
    let ctx = TestRuntime::new();
    let created = ctx.runtime.create(&owner("u1"), UBUNTU).await.unwrap();

    let view = ctx.runtime.get(&owner("u1")).unwrap();
    assert_eq!(view, created.view);

    assert!(matches!(
        ctx.runtime.get(&owner("u2")),
        Err(BuffetError::NotFound(_))
    ));
}

#[tokio::test]
async fn get_by_id_respects_ownership() {
    let ctx = TestRuntime::new();
    let id = ctx.runtime.create(&owner("u1"), UBUNTU).await.unwrap().view.id;

    let own = ctx
        .runtime
        .get_by_id(&Requester::user(owner("u1")), id.as_str())
        .unwrap();
    assert_eq!(own.id, id);

    assert!(matches!(
        ctx.runtime
            .get_by_id(&Requester::user(owner("u2")), id.as_str()),
        Err(BuffetError::Forbidden(_))
    ));
    assert!(
        ctx.runtime
            .get_by_id(&Requester::admin(owner("ops")), id.as_str())
            .is_ok()
    );
}

#[tokio::test]
async fn list_reports_rows_in_slot_order_without_secrets() {
    let ctx = TestRuntime::new();
    ctx.runtime.create(&owner("u1"), UBUNTU).await.unwrap();
    ctx.runtime.create(&owner("u2"), DEBIAN).await.unwrap();

    let rows = ctx.runtime.list().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!((rows[0].slot, rows[1].slot), (0, 1));
    assert_eq!(rows[1].display_port, 5901);
    assert!(rows.iter().all(|r| r.status == SessionStatus::Running));

    let json = serde_json::to_string(&rows).unwrap();
    assert!(!json.contains("credential"));
    assert!(!json.contains("pid"));
}

// ============================================================================
// DESTROY
// ============================================================================

#[tokio::test]
async fn destroy_frees_the_slot_for_the_next_owner() {
    let ctx = TestRuntime::new();
    let first = ctx.runtime.create(&owner("u1"), UBUNTU).await.unwrap();
    assert_eq!(first.view.public_port, 5700);

    ctx.runtime
        .destroy(&Requester::user(owner("u1")), first.view.id.as_str())
        .await
        .unwrap();
    assert_eq!(ctx.runtime.count().unwrap(), 0);
    assert!(ctx.supervisor.alive().is_empty());

    let second = ctx.runtime.create(&owner("u2"), UBUNTU).await.unwrap();
    assert_eq!(second.view.public_port, 5700);
}

#[tokio::test]
async fn destroy_unknown_or_malformed_id_is_not_found() {
    let ctx = TestRuntime::new();
    let requester = Requester::user(owner("u1"));

    let missing = buffet::SessionId::new();
    assert!(matches!(
        ctx.runtime.destroy(&requester, missing.as_str()).await,
        Err(BuffetError::NotFound(_))
    ));
    assert!(matches!(
        ctx.runtime.destroy(&requester, "../../etc").await,
        Err(BuffetError::NotFound(_))
    ));
    assert!(ctx.supervisor.terminated().is_empty());
}

#[tokio::test]
async fn destroying_another_owners_session_is_forbidden() {
    let ctx = TestRuntime::new();
    let id = ctx.runtime.create(&owner("u1"), UBUNTU).await.unwrap().view.id;

    let err = ctx
        .runtime
        .destroy(&Requester::user(owner("u2")), id.as_str())
        .await
        .unwrap_err();
    assert!(matches!(err, BuffetError::Forbidden(_)));
    assert_eq!(ctx.runtime.count().unwrap(), 1);
    assert!(ctx.supervisor.terminated().is_empty());

    ctx.runtime
        .destroy(&Requester::admin(owner("ops")), id.as_str())
        .await
        .unwrap();
    assert_eq!(ctx.runtime.count().unwrap(), 0);
}

#[tokio::test]
async fn destroy_tolerates_processes_that_already_died() {
    let ctx = TestRuntime::new();
    let id = ctx.runtime.create(&owner("u1"), UBUNTU).await.unwrap().view.id;
    for pid in ctx.supervisor.alive() {
        ctx.supervisor.crash(pid);
    }

    ctx.runtime
        .destroy(&Requester::user(owner("u1")), id.as_str())
        .await
        .unwrap();
    assert!(ctx.runtime.list().unwrap().is_empty());
    assert_eq!(ctx.supervisor.terminated().len(), 2);
}

#[tokio::test]
async fn destroy_removes_empty_capture_but_keeps_traffic() {
    let ctx = TestRuntime::new();
    let a = ctx.runtime.create(&owner("u1"), UBUNTU).await.unwrap().view.id;
    let b = ctx.runtime.create(&owner("u2"), UBUNTU).await.unwrap().view.id;

    let launches = ctx.supervisor.hypervisor_launches();
    let (empty, busy) = (&launches[0].traffic_log, &launches[1].traffic_log);
    for path in [empty, busy] {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    }
    std::fs::write(empty, b"").unwrap();
    std::fs::write(busy, b"\xd4\xc3\xb2\xa1").unwrap();

    ctx.runtime
        .destroy(&Requester::user(owner("u1")), a.as_str())
        .await
        .unwrap();
    ctx.runtime
        .destroy(&Requester::user(owner("u2")), b.as_str())
        .await
        .unwrap();

    assert!(!empty.exists());
    assert!(busy.exists());
}

#[tokio::test]
async fn release_owner_tears_down_whatever_the_owner_holds() {
    let ctx = TestRuntime::new();
    let id = ctx.runtime.create(&owner("u1"), UBUNTU).await.unwrap().view.id;

    assert_eq!(ctx.runtime.release_owner(&owner("u1")).await.unwrap(), Some(id));
    assert_eq!(ctx.runtime.release_owner(&owner("u1")).await.unwrap(), None);
    assert!(ctx.supervisor.alive().is_empty());
}

// ============================================================================
// ABANDONED CREATES
// ============================================================================

const LAUNCH_DELAY: Duration = Duration::from_millis(200);

/// Start a create and give up on it before the fake processes are up.
async fn abandon_create(ctx: &TestRuntime, who: &str) {
    ctx.supervisor.set_launch_delay(LAUNCH_DELAY);
    let attempt = tokio::time::timeout(
        Duration::from_millis(50),
        ctx.runtime.create(&owner(who), UBUNTU),
    )
    .await;
    assert!(attempt.is_err(), "create should still be in flight");
}

#[tokio::test]
async fn abandoned_create_still_finishes() {
    let ctx = TestRuntime::new();
    abandon_create(&ctx, "u1").await;

    let mut view = None;
    for _ in 0..40 {
        if let Ok(found) = ctx.runtime.get(&owner("u1")) {
            view = Some(found);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let view = view.expect("session should come up without its caller");
    assert_eq!(view.public_port, 5700);
    assert!(view.display_credential.is_some());
    assert_eq!(ctx.supervisor.alive().len(), 2);
    assert_eq!(ctx.runtime.list().unwrap()[0].status, SessionStatus::Running);
}

#[tokio::test]
async fn release_owner_waits_out_an_abandoned_create() {
    let ctx = TestRuntime::new();
    abandon_create(&ctx, "u1").await;
    assert_eq!(
        ctx.runtime.list().unwrap()[0].status,
        SessionStatus::Provisioning
    );

    let released = ctx.runtime.release_owner(&owner("u1")).await.unwrap();
    assert!(released.is_some());
    assert!(ctx.supervisor.alive().is_empty());
    assert!(ctx.runtime.list().unwrap().is_empty());

    ctx.supervisor.set_launch_delay(Duration::ZERO);
    ctx.runtime.create(&owner("u1"), UBUNTU).await.unwrap();
}

#[tokio::test]
async fn release_owner_after_failed_abandoned_create_finds_nothing() {
    let ctx = TestRuntime::new();
    ctx.supervisor.fail_hypervisor(true);
    abandon_create(&ctx, "u1").await;

    assert_eq!(ctx.runtime.release_owner(&owner("u1")).await.unwrap(), None);
    assert!(ctx.runtime.list().unwrap().is_empty());
    assert!(ctx.supervisor.alive().is_empty());
}

#[tokio::test]
async fn destroy_by_id_during_create_tears_down_the_result() {
    let ctx = TestRuntime::new();
    ctx.supervisor.set_launch_delay(LAUNCH_DELAY);

    let creating = {
        let runtime = ctx.runtime.clone();
        tokio::spawn(async move { runtime.create(&owner("u1"), UBUNTU).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let id = ctx.runtime.list().unwrap()[0].id.clone();
    ctx.runtime
        .destroy(&Requester::user(owner("u1")), id.as_str())
        .await
        .unwrap();

    // The caller still got its answer; the session is gone since
    assert_eq!(creating.await.unwrap().unwrap().view.id, id);
    assert!(ctx.supervisor.alive().is_empty());
    assert!(ctx.runtime.get(&owner("u1")).is_err());
}

// ============================================================================
// CATALOGUE AND HOME
// ============================================================================

#[tokio::test]
async fn reloaded_catalogue_serves_new_images() {
    let ctx = TestRuntime::new();
    assert_eq!(ctx.runtime.images().len(), 2);

    let catalogue_path = ctx.options.layout().catalogue_path();
    std::fs::write(&catalogue_path, r#"[{"iso":"fedora-41.iso","name":"Fedora"}]"#).unwrap();

    // Old snapshot until reload
    assert!(ctx.runtime.catalogue().contains(UBUNTU));
    assert_eq!(ctx.runtime.reload_catalogue().unwrap(), 1);

    ctx.runtime.create(&owner("u1"), "fedora-41.iso").await.unwrap();
    assert!(matches!(
        ctx.runtime.create(&owner("u2"), UBUNTU).await,
        Err(BuffetError::UnknownImage(_))
    ));
}

#[tokio::test]
async fn broken_catalogue_reload_keeps_previous_snapshot() {
    let ctx = TestRuntime::new();
    std::fs::write(ctx.options.layout().catalogue_path(), "{ nope").unwrap();

    assert!(matches!(
        ctx.runtime.reload_catalogue(),
        Err(BuffetError::Config(_))
    ));
    assert_eq!(ctx.runtime.images().len(), 2);
}

#[test]
fn second_runtime_on_same_home_is_refused() {
    let ctx = TestRuntime::new();

    let err = BuffetRuntime::with_supervisor(
        ctx.options.clone(),
        ctx.supervisor.clone(),
        ctx.control.clone(),
    )
    .unwrap_err();
    assert!(matches!(err, BuffetError::InvalidState(_)));
}
