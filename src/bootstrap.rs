//! Component wiring
//!
//! Builds every component from one [`AppConfig`], connects the kill switch
//! to the supervisor and runs the background loops that route events
//! between them.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::coordination::kill_switch::{HaltTarget, KillSwitch};
use crate::coordination::shutdown::{GracefulShutdown, ShutdownError};
use crate::error::{Result, WardenError};
use crate::persistence::{AuditLog, Checkpoint, RecoverySystem};
use crate::supervisor::{AlertManager, HealthMonitor, ProcessSupervisor, SupervisorEvent};
use crate::worker::{ProcessWorkerFactory, WorkerFactory};

/// State type of the fleet-wide checkpoint
pub const SYSTEM_STATE_TYPE: &str = "system";

const TICK_INTERVAL: Duration = Duration::from_secs(1);

pub struct WardenContext {
    pub config: Arc<AppConfig>,
    pub alerts: Arc<AlertManager>,
    pub audit: Arc<AuditLog>,
    pub recovery: Arc<RecoverySystem>,
    pub monitor: Arc<HealthMonitor>,
    pub kill_switch: Arc<KillSwitch>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub shutdown: Arc<GracefulShutdown>,
    pub started_at: DateTime<Utc>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WardenContext {
    /// Build with OS-process workers
    pub async fn build(config: AppConfig) -> Result<Self> {
        let factory = Arc::new(ProcessWorkerFactory {
            probe_timeout: Duration::from_millis(config.health.poll_timeout_ms),
            restore_dir: config.recovery.checkpoint_dir.join("restore"),
        });
        Self::build_with_factory(config, factory).await
    }

    /// Validate `config`, build every component, restore the kill switch and
    /// register the configured workers
    pub async fn build_with_factory(
        config: AppConfig,
        factory: Arc<dyn WorkerFactory>,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|errors| WardenError::InvalidConfig(errors.join("; ")))?;
        let config = Arc::new(config);

        let alerts = Arc::new(AlertManager::with_defaults());
        let audit = Arc::new(AuditLog::new(config.recovery.audit_log.clone()));
        let recovery = Arc::new(RecoverySystem::new(&config.recovery));
        let monitor = Arc::new(HealthMonitor::new(config.health.clone()));
        let kill_switch = Arc::new(KillSwitch::new(
            config.kill_switch.clone(),
            recovery.clone(),
            audit.clone(),
            alerts.clone(),
        ));
        let supervisor = Arc::new(ProcessSupervisor::new(
            config.supervisor.clone(),
            config.safe_mode.clone(),
            factory,
            monitor.clone(),
            kill_switch.clone(),
            recovery.clone(),
            alerts.clone(),
        ));

        let target: Arc<dyn HaltTarget> = supervisor.clone();
        kill_switch.attach(Arc::downgrade(&target));

        if let Some(state) = kill_switch.restore().await? {
            info!(
                "Kill switch restored in {} ({} activation(s))",
                state.phase, state.activation_count
            );
        }

        for descriptor in config.descriptors() {
            supervisor.register(descriptor).await?;
        }
        info!("Supervisor ready with {} worker(s)", config.workers.len());

        Ok(Self {
            shutdown: Arc::new(GracefulShutdown::new(config.shutdown.clone())),
            config,
            alerts,
            audit,
            recovery,
            monitor,
            kill_switch,
            supervisor,
            started_at: Utc::now(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn uptime_seconds(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }

    /// Start the safety, tick and checkpoint loops
    pub async fn spawn_background(&self) {
        let mut tasks = self.tasks.lock().await;
        tasks.push(self.spawn_safety_loop());
        tasks.push(self.spawn_escalation_loop());
        tasks.push(self.spawn_tick_loop());
        if self.config.recovery.checkpoint_interval_secs > 0 {
            tasks.push(self.spawn_checkpoint_loop());
        }
        debug!("{} background task(s) running", tasks.len());
    }

    /// Health events go to the supervisor (status) and the kill switch (triggers)
    fn spawn_safety_loop(&self) -> JoinHandle<()> {
        let mut events = self.monitor.subscribe();
        let supervisor = self.supervisor.clone();
        let kill_switch = self.kill_switch.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        supervisor.handle_health_event(&event).await;
                        if let Some(breach) = kill_switch.observe(&event).await {
                            warn!("Trigger breached: {}", breach);
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!("Safety loop lagged, {} health event(s) dropped", n)
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Critical start failures are safety signals
    fn spawn_escalation_loop(&self) -> JoinHandle<()> {
        let mut events = self.supervisor.subscribe();
        let kill_switch = self.kill_switch.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SupervisorEvent::CriticalFailure { worker_id, detail }) => {
                        if let Err(e) = kill_switch.escalate(&worker_id, &detail).await {
                            error!("Failed to escalate {}: {}", worker_id, e);
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        warn!("Escalation loop lagged, {} event(s) dropped", n)
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Drives time-based kill switch transitions (cooldown, re-arm)
    fn spawn_tick_loop(&self) -> JoinHandle<()> {
        let monitor = self.monitor.clone();
        let kill_switch = self.kill_switch.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            loop {
                interval.tick().await;
                let healthy_run = monitor.longest_healthy_run().await;
                if let Some(phase) = kill_switch.tick(healthy_run).await {
                    info!("Kill switch moved to {}", phase);
                }
            }
        })
    }

    fn spawn_checkpoint_loop(&self) -> JoinHandle<()> {
        let every = Duration::from_secs(self.config.recovery.checkpoint_interval_secs);
        let recovery = self.recovery.clone();
        let supervisor = self.supervisor.clone();
        let kill_switch = self.kill_switch.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                let result =
                    write_system_checkpoint(&recovery, &supervisor, &kill_switch, "periodic").await;
                if let Err(e) = result {
                    warn!("Periodic checkpoint failed: {}", e);
                }
            }
        })
    }

    /// Fleet snapshot plus every worker's exported state
    pub async fn system_checkpoint(&self, trigger: &str) -> Result<Checkpoint> {
        write_system_checkpoint(&self.recovery, &self.supervisor, &self.kill_switch, trigger).await
    }

    /// Stop intake, stop workers, write the final checkpoint, stop loops
    pub async fn shutdown(
        &self,
        stop_intake: impl FnOnce() + Send + 'static,
    ) -> std::result::Result<(), ShutdownError> {
        let supervisor = self.supervisor.clone();
        let recovery = self.recovery.clone();
        let kill_switch = self.kill_switch.clone();
        let checkpoint_supervisor = self.supervisor.clone();

        let result = self
            .shutdown
            .execute(
                move || {
                    Box::pin(async move {
                        stop_intake();
                    })
                },
                move || Box::pin(async move { supervisor.stop_all("shutdown").await.failures }),
                move || {
                    Box::pin(async move {
                        write_system_checkpoint(
                            &recovery,
                            &checkpoint_supervisor,
                            &kill_switch,
                            "shutdown",
                        )
                        .await
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                    })
                },
            )
            .await;

        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        self.monitor.shutdown().await;
        result
    }
}

async fn write_system_checkpoint(
    recovery: &RecoverySystem,
    supervisor: &ProcessSupervisor,
    kill_switch: &KillSwitch,
    trigger: &str,
) -> Result<Checkpoint> {
    let exported = supervisor.checkpoint_workers().await?;
    let payload = serde_json::json!({
        "workers": supervisor.snapshot().await,
        "killSwitch": kill_switch.state(),
    });
    let mut metadata = BTreeMap::new();
    metadata.insert("trigger".to_string(), trigger.to_string());
    metadata.insert("workerCheckpoints".to_string(), exported.to_string());
    recovery
        .create_checkpoint(SYSTEM_STATE_TYPE, payload, metadata)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::domain::WorkerLimits;

    fn config(dir: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.recovery.checkpoint_dir = dir.join("checkpoints");
        config.recovery.audit_log = dir.join("audit.jsonl");
        config.workers = vec![WorkerConfig {
            id: "feed".to_string(),
            command: "/bin/sleep".to_string(),
            args: vec!["30".to_string()],
            depends_on: Vec::new(),
            health_url: None,
            auto_start: true,
            critical: false,
            startup_timeout_ms: 5_000,
            limits: WorkerLimits::default(),
        }];
        config
    }

    #[tokio::test]
    async fn test_build_registers_configured_workers() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = WardenContext::build(config(dir.path())).await.unwrap();
        assert_eq!(ctx.supervisor.startup_order().await, vec!["feed"]);

        let cp = ctx.system_checkpoint("test").await.unwrap();
        assert_eq!(cp.state_type, SYSTEM_STATE_TYPE);
        assert_eq!(cp.payload["workers"][0]["id"], "feed");
        assert_eq!(cp.metadata.get("trigger").map(String::as_str), Some("test"));
    }

    #[tokio::test]
    async fn test_invalid_config_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.workers[0].depends_on = vec!["ghost".to_string()];
        assert!(matches!(
            WardenContext::build(cfg).await,
            Err(WardenError::InvalidConfig(_))
        ));
    }
}
