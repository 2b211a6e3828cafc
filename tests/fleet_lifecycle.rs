mod common;

use std::sync::Arc;

use botwarden::coordination::KillSwitchPhase;
use botwarden::domain::WorkerStatus;
use botwarden::error::WardenError;
use botwarden::supervisor::{SequenceOptions, StartOptions};
use common::{config, context, eventually, worker, FakeFactory};

/// Workers start in dependency order and stop in reverse.
#[tokio::test]
async fn sequential_start_and_stop_follow_dependencies() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(FakeFactory::default());
    let ctx = context(
        config(
            dir.path(),
            vec![
                worker("trader", &["risk"], false),
                worker("risk", &["feed"], false),
                worker("feed", &[], false),
            ],
        ),
        factory.clone(),
    )
    .await;

    let started = ctx
        .supervisor
        .start_sequential(SequenceOptions::default())
        .await
        .unwrap();
    assert_eq!(started, vec!["feed", "risk", "trader"]);

    let report = ctx.supervisor.stop_all("test teardown").await;
    assert!(report.failures.is_empty());
    assert_eq!(
        factory.calls(),
        vec![
            "start:feed",
            "start:risk",
            "start:trader",
            "stop:trader",
            "stop:risk",
            "stop:feed"
        ]
    );
}

/// A non-critical failure skips only what depends on it.
#[tokio::test]
async fn non_critical_failure_skips_dependents() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(FakeFactory::default().with("risk", true));
    let ctx = context(
        config(
            dir.path(),
            vec![
                worker("feed", &[], false),
                worker("risk", &["feed"], false),
                worker("trader", &["risk"], false),
                worker("reporter", &["feed"], false),
            ],
        ),
        factory.clone(),
    )
    .await;

    let started = ctx
        .supervisor
        .start_sequential(SequenceOptions::default())
        .await
        .unwrap();
    assert_eq!(started, vec!["feed", "reporter"]);
    assert_eq!(ctx.supervisor.status_of("risk").await, Some(WorkerStatus::Error));
    assert_eq!(ctx.supervisor.status_of("trader").await, Some(WorkerStatus::Stopped));
    assert!(!factory.calls().contains(&"start:trader".to_string()));
    assert_eq!(ctx.kill_switch.phase(), KillSwitchPhase::Armed);
}

/// A critical failure rolls back what was started and halts the fleet.
#[tokio::test]
async fn critical_failure_rolls_back_and_trips_kill_switch() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(FakeFactory::default().with("risk", true));
    let ctx = context(
        config(
            dir.path(),
            vec![
                worker("feed", &[], false),
                worker("risk", &["feed"], true),
                worker("trader", &["risk"], false),
            ],
        ),
        factory.clone(),
    )
    .await;
    ctx.spawn_background().await;

    let result = ctx
        .supervisor
        .start_sequential(SequenceOptions::default())
        .await;
    assert!(matches!(
        result,
        Err(WardenError::DependencyFailure { ref worker_id }) if worker_id == "risk"
    ));
    assert_eq!(ctx.supervisor.status_of("feed").await, Some(WorkerStatus::Stopped));
    assert!(!factory.calls().contains(&"start:trader".to_string()));

    let ks = ctx.kill_switch.clone();
    assert!(eventually(|| std::future::ready(ks.phase() == KillSwitchPhase::Active)).await);

    let sup = ctx.supervisor.clone();
    assert!(
        eventually(|| {
            let sup = sup.clone();
            async move {
                sup.snapshot()
                    .await
                    .iter()
                    .all(|w| w.status == WorkerStatus::Stopped)
            }
        })
        .await
    );

    let err = ctx
        .supervisor
        .start("feed", StartOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, WardenError::KillSwitchActive { .. }));
}

/// Pause keeps the worker registered; resume brings it back to running.
#[tokio::test]
async fn pause_and_resume_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(FakeFactory::default());
    let ctx = context(config(dir.path(), vec![worker("feed", &[], false)]), factory).await;

    ctx.supervisor
        .start("feed", StartOptions::default())
        .await
        .unwrap();
    ctx.supervisor.pause("feed").await.unwrap();
    assert_eq!(ctx.supervisor.status_of("feed").await, Some(WorkerStatus::Paused));
    assert!(!ctx.monitor.is_polling("feed").await);

    ctx.supervisor.resume("feed").await.unwrap();
    assert_eq!(ctx.supervisor.status_of("feed").await, Some(WorkerStatus::Running));
    assert!(ctx.monitor.is_polling("feed").await);
}
