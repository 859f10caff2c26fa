//! Concurrent create/destroy against a shared runtime.

use std::collections::HashSet;
use std::time::Duration;

use buffet::{BuffetError, Requester};
use buffet_test_utils::{TestRuntime, UBUNTU, owner};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_for_one_owner_yield_exactly_one_session() {
    let ctx = TestRuntime::new();
    ctx.supervisor.set_launch_delay(Duration::from_millis(20));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let runtime = ctx.runtime.clone();
            tokio::spawn(async move { runtime.create(&owner("u1"), UBUNTU).await })
        })
        .collect();

    let mut successes = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => successes += 1,
            Err(BuffetError::AlreadyHasSession(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(ctx.runtime.count().unwrap(), 1);
    assert_eq!(ctx.supervisor.alive().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_never_share_a_slot() {
    let ctx = TestRuntime::with_options(|o| o.max_sessions = 6);
    ctx.supervisor.set_launch_delay(Duration::from_millis(10));

    let tasks: Vec<_> = (0..10)
        .map(|i| {
            let runtime = ctx.runtime.clone();
            tokio::spawn(async move { runtime.create(&owner(&format!("user{i}")), UBUNTU).await })
        })
        .collect();

    let mut ports = HashSet::new();
    let mut exhausted = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(provisioned) => assert!(ports.insert(provisioned.view.public_port)),
            Err(BuffetError::CapacityExhausted { max: 6 }) => exhausted += 1,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(ports.len(), 6);
    assert_eq!(exhausted, 4);
    assert_eq!(ports, (5700..5706).collect::<HashSet<u16>>());

    // Every failed attempt left nothing running
    assert_eq!(ctx.supervisor.alive().len(), 12);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_destroy_and_sweep_both_succeed() {
    let ctx = TestRuntime::new();
    let id = ctx.runtime.create(&owner("u1"), UBUNTU).await.unwrap().view.id;

    let destroyer = {
        let runtime = ctx.runtime.clone();
        let id = id.clone();
        tokio::spawn(async move {
            runtime
                .destroy(&Requester::user(owner("u1")), id.as_str())
                .await
        })
    };
    let sweeper = {
        let runtime = ctx.runtime.clone();
        tokio::spawn(async move { runtime.sweep().await })
    };

    let destroyed = destroyer.await.unwrap();
    let swept = sweeper.await.unwrap().unwrap();

    // Whichever ran second found nothing left to do
    assert!(destroyed.is_ok() || matches!(destroyed, Err(BuffetError::NotFound(_))));
    assert!(swept <= 1);
    assert!(ctx.runtime.list().unwrap().is_empty());
    assert!(ctx.supervisor.alive().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn independent_owners_churn_without_leaks() {
    let ctx = TestRuntime::with_options(|o| o.max_sessions = 4);

    let tasks: Vec<_> = (0..4)
        .map(|i| {
            let runtime = ctx.runtime.clone();
            tokio::spawn(async move {
                let me = owner(&format!("churn{i}"));
                for _ in 0..5 {
                    let id = runtime.create(&me, UBUNTU).await?.view.id;
                    runtime.destroy(&Requester::user(me.clone()), id.as_str()).await?;
                }
                Ok::<_, BuffetError>(())
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(ctx.runtime.count().unwrap(), 0);
    assert!(ctx.supervisor.alive().is_empty());
    assert_eq!(ctx.supervisor.hypervisor_launches().len(), 20);
}
