#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use botwarden::config::{AppConfig, WorkerConfig};
use botwarden::coordination::{TriggerAction, TriggerCondition, TriggerKind};
use botwarden::domain::{ProbeReport, WorkerDescriptor, WorkerLimits};
use botwarden::error::{Result, WardenError};
use botwarden::worker::{LaunchContext, Worker, WorkerFactory};
use botwarden::WardenContext;

/// Shared record of worker calls, in call order
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub struct FakeWorker {
    id: String,
    fail_start: bool,
    healthy: AtomicBool,
    log: CallLog,
}

impl FakeWorker {
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    fn record(&self, call: &str) {
        if let Ok(mut log) = self.log.lock() {
            log.push(format!("{}:{}", call, self.id));
        }
    }
}

#[async_trait]
impl Worker for FakeWorker {
    async fn start(&self, _ctx: &LaunchContext) -> Result<()> {
        self.record("start");
        if self.fail_start {
            return Err(WardenError::WorkerFailure {
                worker_id: self.id.clone(),
                reason: "exited with status 1".to_string(),
            });
        }
        Ok(())
    }

    async fn stop(&self, _timeout: Duration) -> Result<()> {
        self.record("stop");
        Ok(())
    }

    async fn health_check(&self) -> Result<ProbeReport> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(ProbeReport::default())
        } else {
            Err(WardenError::ConnectionRefused(format!("{} health endpoint", self.id)))
        }
    }
}

/// Hands out pre-built fakes so tests keep a handle on each worker
#[derive(Default)]
pub struct FakeFactory {
    workers: HashMap<String, Arc<FakeWorker>>,
    pub log: CallLog,
}

impl FakeFactory {
    pub fn with(mut self, id: &str, fail_start: bool) -> Self {
        let worker = Arc::new(FakeWorker {
            id: id.to_string(),
            fail_start,
            healthy: AtomicBool::new(true),
            log: self.log.clone(),
        });
        self.workers.insert(id.to_string(), worker);
        self
    }

    pub fn worker(&self, id: &str) -> Arc<FakeWorker> {
        self.workers[id].clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl WorkerFactory for FakeFactory {
    fn create(&self, descriptor: &WorkerDescriptor) -> Arc<dyn Worker> {
        match self.workers.get(&descriptor.id) {
            Some(worker) => worker.clone(),
            None => Arc::new(FakeWorker {
                id: descriptor.id.clone(),
                fail_start: false,
                healthy: AtomicBool::new(true),
                log: self.log.clone(),
            }),
        }
    }
}

pub fn worker(id: &str, depends_on: &[&str], critical: bool) -> WorkerConfig {
    WorkerConfig {
        id: id.to_string(),
        command: format!("/opt/bots/{}", id),
        args: Vec::new(),
        depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
        health_url: None,
        auto_start: true,
        critical,
        startup_timeout_ms: 1_000,
        limits: WorkerLimits::default(),
    }
}

/// Fast polling and a three-strike consecutive failure trigger
pub fn config(dir: &Path, workers: Vec<WorkerConfig>) -> AppConfig {
    let mut config = AppConfig::default();
    config.health.poll_interval_ms = 20;
    config.health.poll_timeout_ms = 100;
    config.health.freeze_threshold_ms = 5_000;
    config.health.unhealthy_after = 3;
    config.supervisor.readiness_poll_ms = 10;
    config.supervisor.stop_timeout_ms = 500;
    config.recovery.checkpoint_dir = dir.join("checkpoints");
    config.recovery.audit_log = dir.join("audit.jsonl");
    config.recovery.retry_base_delay_ms = 10;
    config.recovery.retry_max_delay_ms = 50;
    config.recovery.checkpoint_interval_secs = 0;
    config.kill_switch.manual_approval_required = false;
    config.kill_switch.triggers = vec![TriggerCondition::new(
        "consecutive-failures",
        TriggerKind::ConsecutiveFailures {
            threshold: 3,
            window_minutes: 1,
        },
        TriggerAction::StopAll,
    )];
    config.workers = workers;
    config
}

pub async fn context(config: AppConfig, factory: Arc<FakeFactory>) -> Arc<WardenContext> {
    let ctx = WardenContext::build_with_factory(config, factory)
        .await
        .expect("context should build");
    Arc::new(ctx)
}

/// Poll `check` until it holds or five seconds pass
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
