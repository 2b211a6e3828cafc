mod common;

use std::sync::Arc;

use botwarden::coordination::{KillSwitchPhase, SYSTEM_ACTOR};
use botwarden::domain::WorkerStatus;
use botwarden::error::WardenError;
use botwarden::supervisor::{SequenceOptions, StartOptions};
use botwarden::WardenContext;
use common::{config, context, eventually, worker, FakeFactory};

/// Repeated failed health polls on one worker halt the whole fleet.
#[tokio::test]
async fn consecutive_failures_halt_the_fleet() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(FakeFactory::default().with("feed", false).with("trader", false));
    let ctx = context(
        config(
            dir.path(),
            vec![worker("feed", &[], false), worker("trader", &["feed"], false)],
        ),
        factory.clone(),
    )
    .await;
    ctx.spawn_background().await;

    ctx.supervisor
        .start_sequential(SequenceOptions::default())
        .await
        .unwrap();
    factory.worker("trader").set_healthy(false);

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

    let state = ctx.kill_switch.state();
    assert_eq!(state.last_actor.as_deref(), Some(SYSTEM_ACTOR));
    assert!(state
        .reason
        .as_deref()
        .is_some_and(|r| r.contains("consecutive-failures")));

    let entries = ctx.audit.recent(10).await.unwrap();
    assert!(entries
        .iter()
        .any(|e| e.event_type == "activated" && e.actor == SYSTEM_ACTOR));

    assert!(matches!(
        ctx.supervisor.start("feed", StartOptions::default()).await,
        Err(WardenError::KillSwitchActive { .. })
    ));
    ctx.shutdown(|| {}).await.ok();
}

/// The third activation inside the breaker window locks the switch.
#[tokio::test]
async fn third_activation_locks_and_needs_approval() {
    let dir = tempfile::tempdir().unwrap();
    let factory = Arc::new(FakeFactory::default());
    let ctx = context(config(dir.path(), vec![worker("feed", &[], false)]), factory).await;
    let ks = &ctx.kill_switch;

    for round in 1..=2u32 {
        let state = ks.activate("manual drill", "ops").await.unwrap();
        assert_eq!(state.phase, KillSwitchPhase::Active);
        assert_eq!(state.activation_count, round);
        ks.override_switch("drill over", None, "ops").await.unwrap();
    }

    let state = ks.activate("third strike", "ops").await.unwrap();
    assert_eq!(state.phase, KillSwitchPhase::Locked);
    assert_eq!(state.activation_count, 3);

    assert!(matches!(
        ks.override_switch("please", None, "ops").await,
        Err(WardenError::ApprovalRequired(_))
    ));
    assert!(matches!(
        ks.override_switch("  ", Some("alice"), "ops").await,
        Err(WardenError::Validation(_))
    ));
    assert_eq!(ks.phase(), KillSwitchPhase::Locked);

    let state = ks
        .override_switch("postmortem reviewed", Some("alice"), "ops")
        .await
        .unwrap();
    assert_eq!(state.phase, KillSwitchPhase::Overridden);
    assert_eq!(state.approved_by.as_deref(), Some("alice"));
    assert_eq!(state.activation_count, 0);

    ctx.supervisor
        .start("feed", StartOptions::default())
        .await
        .unwrap();

    let entries = ctx.audit.recent(50).await.unwrap();
    assert!(entries.iter().any(|e| e.event_type == "locked"));
    assert_eq!(
        entries
            .iter()
            .filter(|e| e.event_type == "override_rejected")
            .count(),
        2
    );
}

/// A halted switch is still halted after the supervisor restarts.
#[tokio::test]
async fn halted_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let workers = vec![worker("feed", &[], false)];

    {
        let ctx = context(
            config(dir.path(), workers.clone()),
            Arc::new(FakeFactory::default()),
        )
        .await;
        ctx.kill_switch.activate("exchange outage", "ops").await.unwrap();
    }

    let ctx = WardenContext::build_with_factory(
        config(dir.path(), workers),
        Arc::new(FakeFactory::default()),
    )
    .await
    .unwrap();
    assert_eq!(ctx.kill_switch.phase(), KillSwitchPhase::Active);
    assert_eq!(
        ctx.kill_switch.state().reason.as_deref(),
        Some("exchange outage")
    );
    assert!(matches!(
        ctx.supervisor.start("feed", StartOptions::default()).await,
        Err(WardenError::KillSwitchActive { .. })
    ));
}
