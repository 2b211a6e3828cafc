//! Process Supervisor
//!
//! Owns the worker registry and every lifecycle transition. Starts are gated
//! by the kill switch; health polling is registered only once a worker has
//! passed its readiness probe, so a RUNNING worker is always being polled.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::alert_manager::AlertManager;
use super::graph;
use super::health_monitor::{HealthEvent, HealthMonitor};
use crate::config::{SafeModeConfig, SupervisorConfig};
use crate::coordination::kill_switch::{HaltTarget, KillSwitch};
use crate::domain::{WorkerDescriptor, WorkerSnapshot, WorkerState, WorkerStatus};
use crate::error::{Result, WardenError};
use crate::persistence::RecoverySystem;
use crate::worker::{LaunchContext, Worker, WorkerFactory, WorkerProbe};

/// Checkpoint bucket holding a worker's exported state
pub fn worker_state_type(worker_id: &str) -> String {
    format!("worker.{}", worker_id)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// Launch with limits scaled by `safe_mode.limit_factor`
    pub safe_mode: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StartSelection {
    /// Every registered worker
    #[default]
    All,
    /// Auto-start workers and everything they depend on
    AutoStart,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceOptions {
    pub safe_mode: bool,
    pub selection: StartSelection,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoverOptions {
    /// Stop a running worker before recovering it
    pub force: bool,
}

/// Result of a fleet-wide stop
#[derive(Debug, Clone, Default)]
pub struct StopReport {
    pub stopped: Vec<String>,
    /// `(worker_id, error)` for every worker that failed to stop
    pub failures: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    StatusChanged {
        worker_id: String,
        from: WorkerStatus,
        to: WorkerStatus,
    },
    StartFailed {
        worker_id: String,
        attempts: u32,
        error: String,
    },
    /// A critical worker exhausted its start retries
    CriticalFailure { worker_id: String, detail: String },
}

struct Slot {
    descriptor: WorkerDescriptor,
    worker: Arc<dyn Worker>,
    state: WorkerState,
    /// Bumped by stop to cancel an in-flight start
    cancel_tx: watch::Sender<u64>,
}

#[derive(Default)]
struct Registry {
    order: Vec<String>,
    slots: HashMap<String, Slot>,
}

impl Registry {
    fn descriptors(&self) -> Vec<WorkerDescriptor> {
        self.order
            .iter()
            .filter_map(|id| self.slots.get(id).map(|s| s.descriptor.clone()))
            .collect()
    }

    fn slot_mut(&mut self, id: &str) -> Result<&mut Slot> {
        self.slots
            .get_mut(id)
            .ok_or_else(|| WardenError::WorkerNotFound(id.to_string()))
    }
}

pub struct ProcessSupervisor {
    config: SupervisorConfig,
    safe_mode: SafeModeConfig,
    factory: Arc<dyn WorkerFactory>,
    registry: RwLock<Registry>,
    op_locks: DashMap<String, Arc<Mutex<()>>>,
    fleet: Mutex<()>,
    halt_epoch: AtomicU64,
    monitor: Arc<HealthMonitor>,
    kill_switch: Arc<KillSwitch>,
    recovery: Arc<RecoverySystem>,
    alerts: Arc<AlertManager>,
    event_tx: broadcast::Sender<SupervisorEvent>,
}

impl ProcessSupervisor {
    pub fn new(
        config: SupervisorConfig,
        safe_mode: SafeModeConfig,
        factory: Arc<dyn WorkerFactory>,
        monitor: Arc<HealthMonitor>,
        kill_switch: Arc<KillSwitch>,
        recovery: Arc<RecoverySystem>,
        alerts: Arc<AlertManager>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            config,
            safe_mode,
            factory,
            registry: RwLock::new(Registry::default()),
            op_locks: DashMap::new(),
            fleet: Mutex::new(()),
            halt_epoch: AtomicU64::new(0),
            monitor,
            kill_switch,
            recovery,
            alerts,
            event_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.event_tx.subscribe()
    }

    fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.config.stop_timeout_ms)
    }

    fn op_lock(&self, id: &str) -> Result<Arc<Mutex<()>>> {
        self.op_locks
            .get(id)
            .map(|lock| lock.value().clone())
            .ok_or_else(|| WardenError::WorkerNotFound(id.to_string()))
    }

    fn transition(&self, worker_id: &str, slot: &mut Slot, to: WorkerStatus) -> Result<()> {
        let from = slot.state.status;
        if from == to {
            return Ok(());
        }
        if !from.can_transition_to(to) {
            return Err(WardenError::InvalidStateTransition {
                worker_id: worker_id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        slot.state.status = to;
        debug!("Worker {}: {} -> {}", worker_id, from, to);
        let _ = self.event_tx.send(SupervisorEvent::StatusChanged {
            worker_id: worker_id.to_string(),
            from,
            to,
        });
        Ok(())
    }

    // ==================== Registration ====================

    /// Register a worker built by the configured factory
    pub async fn register(&self, descriptor: WorkerDescriptor) -> Result<()> {
        let worker = self.factory.create(&descriptor);
        self.register_worker(descriptor, worker).await
    }

    /// Register a worker with an explicit implementation
    pub async fn register_worker(
        &self,
        descriptor: WorkerDescriptor,
        worker: Arc<dyn Worker>,
    ) -> Result<()> {
        let mut reg = self.registry.write().await;
        if reg.slots.contains_key(&descriptor.id) {
            return Err(WardenError::DuplicateWorker(descriptor.id));
        }

        let mut candidate = reg.descriptors();
        candidate.push(descriptor.clone());
        graph::validate(&candidate)?;

        let id = descriptor.id.clone();
        let (cancel_tx, _) = watch::channel(0);
        reg.order.push(id.clone());
        reg.slots.insert(
            id.clone(),
            Slot {
                descriptor,
                worker,
                state: WorkerState::default(),
                cancel_tx,
            },
        );
        self.op_locks.insert(id.clone(), Arc::new(Mutex::new(())));
        info!("Registered worker {}", id);
        Ok(())
    }

    /// Swap a stopped worker's descriptor; counters are kept
    pub async fn replace(&self, descriptor: WorkerDescriptor) -> Result<()> {
        let lock = self.op_lock(&descriptor.id)?;
        let _guard = lock.lock().await;

        let mut reg = self.registry.write().await;
        let candidate: Vec<WorkerDescriptor> = reg
            .descriptors()
            .into_iter()
            .map(|d| {
                if d.id == descriptor.id {
                    descriptor.clone()
                } else {
                    d
                }
            })
            .collect();
        graph::validate(&candidate)?;

        let worker = self.factory.create(&descriptor);
        let slot = reg.slot_mut(&descriptor.id)?;
        if slot.state.status != WorkerStatus::Stopped {
            return Err(WardenError::AlreadyRunning(descriptor.id));
        }
        info!("Replaced descriptor for worker {}", descriptor.id);
        slot.descriptor = descriptor;
        slot.worker = worker;
        Ok(())
    }

    pub async fn descriptors(&self) -> Vec<WorkerDescriptor> {
        self.registry.read().await.descriptors()
    }

    pub async fn status_of(&self, id: &str) -> Option<WorkerStatus> {
        self.registry
            .read()
            .await
            .slots
            .get(id)
            .map(|s| s.state.status)
    }

    pub async fn startup_order(&self) -> Vec<String> {
        let descs = self.descriptors().await;
        let all = descs.iter().map(|d| d.id.clone()).collect();
        graph::start_order(&descs, &all)
    }

    pub async fn shutdown_order(&self) -> Vec<String> {
        let descs = self.descriptors().await;
        let all = descs.iter().map(|d| d.id.clone()).collect();
        graph::stop_order(&descs, &all)
    }

    // ==================== Start ====================

    /// Start one worker and wait for it to pass readiness.
    ///
    /// Transient failures are retried under the recovery policy. A stop issued
    /// meanwhile cancels the start with `Cancelled`.
    pub async fn start(&self, id: &str, options: StartOptions) -> Result<()> {
        self.kill_switch.ensure_start_allowed()?;

        let lock = self.op_lock(id)?;
        let Ok(_guard) = lock.try_lock() else {
            return Err(match self.status_of(id).await {
                Some(WorkerStatus::Starting) => WardenError::AlreadyRunning(id.to_string()),
                status => WardenError::InvalidStateTransition {
                    worker_id: id.to_string(),
                    from: status.map(|s| s.to_string()).unwrap_or_default(),
                    to: WorkerStatus::Starting.to_string(),
                },
            });
        };

        let (worker, descriptor, mut cancel_rx, previously_started, prior) = {
            let mut reg = self.registry.write().await;
            let slot = reg.slot_mut(id)?;
            if matches!(
                slot.state.status,
                WorkerStatus::Starting | WorkerStatus::Running | WorkerStatus::Paused
            ) {
                return Err(WardenError::AlreadyRunning(id.to_string()));
            }
            // Checked again under the registry lock: a trip publishes its phase
            // before halting, so it either blocks this start or sees Starting
            self.kill_switch.ensure_start_allowed()?;
            let prior = slot.state.status;
            self.transition(id, slot, WorkerStatus::Starting)?;
            slot.state.safe_mode = options.safe_mode;
            slot.state.last_error = None;
            (
                slot.worker.clone(),
                slot.descriptor.clone(),
                slot.cancel_tx.subscribe(),
                slot.state.started_at.is_some(),
                prior,
            )
        };

        if prior == WorkerStatus::Error {
            // A health verdict leaves the process alive; release it first
            self.monitor.unregister_worker(id).await;
            if let Err(e) = worker.stop(self.stop_timeout()).await {
                error!("Could not release failing worker {} before restart: {}", id, e);
                let mut reg = self.registry.write().await;
                let slot = reg.slot_mut(id)?;
                self.transition(id, slot, WorkerStatus::Error)?;
                slot.state.error_count += 1;
                slot.state.last_error = Some(e.to_string());
                return Err(WardenError::WorkerFailure {
                    worker_id: id.to_string(),
                    reason: e.to_string(),
                });
            }
        }

        let ctx = LaunchContext {
            limits: if options.safe_mode {
                descriptor.limits.scaled(self.safe_mode.limit_factor)
            } else {
                descriptor.limits.clone()
            },
            safe_mode: options.safe_mode,
        };
        info!(
            "Starting worker {}{}",
            id,
            if options.safe_mode { " in safe mode" } else { "" }
        );

        let startup_timeout = descriptor.startup_timeout_duration();
        let w = &worker;
        let c = &ctx;
        let launch = self
            .recovery
            .retry_with_backoff(move |attempt| {
                if attempt > 0 {
                    info!("Retrying start of {} (attempt {})", id, attempt + 1);
                }
                self.launch_once(id, w, c, startup_timeout)
            });

        let outcome = tokio::select! {
            result = launch => result.map_err(|f| (f.attempts, f.error)),
            _ = cancel_rx.changed() => Err((0, WardenError::Cancelled)),
        };

        match outcome {
            Ok(()) => {
                self.monitor
                    .register_worker(
                        id,
                        Arc::new(WorkerProbe(worker.clone())),
                        self.monitor.config().poll_interval(),
                    )
                    .await;
                let mut reg = self.registry.write().await;
                let slot = reg.slot_mut(id)?;
                self.transition(id, slot, WorkerStatus::Running)?;
                slot.state.started_at = Some(Utc::now());
                if previously_started {
                    slot.state.restart_count += 1;
                }
                info!("Worker {} is running", id);
                Ok(())
            }
            Err((_, WardenError::Cancelled)) => {
                warn!("Start of {} cancelled by stop", id);
                Err(WardenError::Cancelled)
            }
            Err((attempts, err)) => {
                error!("Worker {} failed to start after {} attempt(s): {}", id, attempts, err);
                {
                    let mut reg = self.registry.write().await;
                    let slot = reg.slot_mut(id)?;
                    self.transition(id, slot, WorkerStatus::Error)?;
                    slot.state.error_count += 1;
                    slot.state.last_error = Some(err.to_string());
                }
                self.alerts
                    .startup_failed(id, attempts, &err.to_string())
                    .await;
                let _ = self.event_tx.send(SupervisorEvent::StartFailed {
                    worker_id: id.to_string(),
                    attempts,
                    error: err.to_string(),
                });
                if descriptor.critical {
                    let _ = self.event_tx.send(SupervisorEvent::CriticalFailure {
                        worker_id: id.to_string(),
                        detail: err.to_string(),
                    });
                }
                Err(err)
            }
        }
    }

    /// One launch attempt; resources are released again on failure
    async fn launch_once(
        &self,
        id: &str,
        worker: &Arc<dyn Worker>,
        ctx: &LaunchContext,
        startup_timeout: Duration,
    ) -> Result<()> {
        let result = async {
            worker.initialize(ctx).await?;
            worker.start(ctx).await?;
            self.wait_ready(id, worker.as_ref(), startup_timeout).await
        }
        .await;

        if let Err(e) = &result {
            warn!("Launch of {} failed: {}", id, e);
            if let Err(stop_err) = worker.stop(self.stop_timeout()).await {
                warn!("Cleanup after failed launch of {} failed: {}", id, stop_err);
            }
        }
        result
    }

    /// Probe until the worker answers or the startup timeout passes
    async fn wait_ready(&self, id: &str, worker: &dyn Worker, startup_timeout: Duration) -> Result<()> {
        let started = Instant::now();
        let poll = Duration::from_millis(self.config.readiness_poll_ms);

        let probe = async {
            loop {
                match worker.health_check().await {
                    Ok(_) => return Ok(()),
                    Err(e) if e.is_transient() => debug!("{} not ready yet: {}", id, e),
                    Err(e) => return Err(e),
                }
                tokio::time::sleep(poll).await;
            }
        };

        match tokio::time::timeout(startup_timeout, probe).await {
            Ok(result) => result,
            Err(_) => Err(WardenError::StartupTimeout {
                worker_id: id.to_string(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            }),
        }
    }

    /// Start the selected workers in dependency order, one at a time.
    ///
    /// Returns the ids that reached RUNNING, in start order.
    pub async fn start_sequential(&self, options: SequenceOptions) -> Result<Vec<String>> {
        self.kill_switch.ensure_start_allowed()?;
        let _fleet = self.fleet.lock().await;
        let epoch = self.halt_epoch.load(Ordering::SeqCst);

        let descriptors = self.descriptors().await;
        let selected: HashSet<String> = match options.selection {
            StartSelection::All => descriptors.iter().map(|d| d.id.clone()).collect(),
            StartSelection::AutoStart => {
                let roots: Vec<String> = descriptors
                    .iter()
                    .filter(|d| d.auto_start)
                    .map(|d| d.id.clone())
                    .collect();
                graph::with_dependencies(&descriptors, &roots)
            }
        };
        let order = graph::start_order(&descriptors, &selected);
        info!("Sequential start order: {}", order.join(" -> "));

        let mut started: Vec<String> = Vec::new();
        let mut skipped: HashSet<String> = HashSet::new();

        for id in &order {
            if self.halt_epoch.load(Ordering::SeqCst) != epoch {
                warn!("Sequential start interrupted by a fleet stop");
                return Err(WardenError::Cancelled);
            }
            if skipped.contains(id) {
                warn!("Skipping {}: a dependency failed to start", id);
                continue;
            }
            match self.status_of(id).await {
                Some(WorkerStatus::Running) => {
                    started.push(id.clone());
                    continue;
                }
                Some(WorkerStatus::Paused) => continue,
                _ => {}
            }

            let critical = descriptors
                .iter()
                .find(|d| &d.id == id)
                .map(|d| d.critical)
                .unwrap_or(false);

            match self
                .start(id, StartOptions { safe_mode: options.safe_mode })
                .await
            {
                Ok(()) => started.push(id.clone()),
                Err(e @ (WardenError::Cancelled | WardenError::KillSwitchActive { .. })) => {
                    return Err(e)
                }
                Err(e) if critical => {
                    error!(
                        "Critical worker {} failed ({}); stopping {} started worker(s)",
                        id,
                        e,
                        started.len()
                    );
                    for done in started.iter().rev() {
                        if let Err(stop_err) =
                            self.stop(done, &format!("critical dependency {} failed", id)).await
                        {
                            warn!("Failed to stop {} during rollback: {}", done, stop_err);
                        }
                    }
                    return Err(WardenError::DependencyFailure {
                        worker_id: id.clone(),
                    });
                }
                Err(e) => {
                    let dependents = graph::dependents_of(&descriptors, id);
                    warn!(
                        "Worker {} failed to start ({}); skipping {} dependent(s)",
                        id,
                        e,
                        dependents.len()
                    );
                    skipped.extend(dependents);
                }
            }
        }

        info!("Sequential start complete: {} worker(s) running", started.len());
        Ok(started)
    }

    // ==================== Stop ====================

    /// Stop one worker, cancelling an in-flight start first
    pub async fn stop(&self, id: &str, reason: &str) -> Result<()> {
        {
            let reg = self.registry.read().await;
            let slot = reg
                .slots
                .get(id)
                .ok_or_else(|| WardenError::WorkerNotFound(id.to_string()))?;
            if slot.state.status == WorkerStatus::Stopped {
                return Err(WardenError::NotRunning(id.to_string()));
            }
            slot.cancel_tx.send_modify(|generation| *generation += 1);
        }

        let lock = self.op_lock(id)?;
        let _guard = lock.lock().await;
        self.stop_locked(id, reason).await
    }

    async fn stop_locked(&self, id: &str, reason: &str) -> Result<()> {
        let worker = {
            let mut reg = self.registry.write().await;
            let slot = reg.slot_mut(id)?;
            if slot.state.status == WorkerStatus::Stopped {
                return Err(WardenError::NotRunning(id.to_string()));
            }
            self.transition(id, slot, WorkerStatus::Stopping)?;
            slot.worker.clone()
        };

        info!("Stopping worker {}: {}", id, reason);
        self.monitor.unregister_worker(id).await;
        let result = worker.stop(self.stop_timeout()).await;

        let mut reg = self.registry.write().await;
        let slot = reg.slot_mut(id)?;
        match result {
            Ok(()) => {
                self.transition(id, slot, WorkerStatus::Stopped)?;
                slot.state.stopped_at = Some(Utc::now());
                info!("Worker {} stopped", id);
                Ok(())
            }
            Err(e) => {
                error!("Worker {} failed to stop: {}", id, e);
                self.transition(id, slot, WorkerStatus::Error)?;
                slot.state.error_count += 1;
                slot.state.last_error = Some(e.to_string());
                Err(WardenError::WorkerFailure {
                    worker_id: id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Stop every active worker in reverse dependency order.
    ///
    /// In-flight starts (including a running sequential start) are cancelled
    /// before the fleet lock is taken.
    pub async fn stop_all(&self, reason: &str) -> StopReport {
        self.halt_epoch.fetch_add(1, Ordering::SeqCst);
        let order = {
            let reg = self.registry.read().await;
            let mut active = HashSet::new();
            for (id, slot) in &reg.slots {
                slot.cancel_tx.send_modify(|generation| *generation += 1);
                if slot.state.status != WorkerStatus::Stopped {
                    active.insert(id.clone());
                }
            }
            graph::stop_order(&reg.descriptors(), &active)
        };

        let _fleet = self.fleet.lock().await;
        info!("Stopping {} worker(s): {}", order.len(), reason);

        let mut report = StopReport::default();
        for id in order {
            let lock = match self.op_lock(&id) {
                Ok(lock) => lock,
                Err(_) => continue,
            };
            let _guard = lock.lock().await;
            match self.stop_locked(&id, reason).await {
                Ok(()) => report.stopped.push(id),
                Err(WardenError::NotRunning(_)) => {}
                Err(e) => report.failures.push((id, e.to_string())),
            }
        }

        if report.failures.is_empty() {
            info!("All workers stopped ({})", report.stopped.len());
        } else {
            error!(
                "{} worker(s) failed to stop: {:?}",
                report.failures.len(),
                report.failures
            );
        }
        report
    }

    // ==================== Pause / Resume ====================

    /// Suspend a running worker without releasing its resources
    pub async fn pause(&self, id: &str) -> Result<()> {
        let lock = self.op_lock(id)?;
        let _guard = lock.lock().await;

        let worker = {
            let reg = self.registry.read().await;
            let slot = reg
                .slots
                .get(id)
                .ok_or_else(|| WardenError::WorkerNotFound(id.to_string()))?;
            if slot.state.status != WorkerStatus::Running {
                return Err(WardenError::NotRunning(id.to_string()));
            }
            slot.worker.clone()
        };

        worker.pause().await?;
        self.monitor.suspend(id).await;

        let mut reg = self.registry.write().await;
        let slot = reg.slot_mut(id)?;
        self.transition(id, slot, WorkerStatus::Paused)?;
        info!("Worker {} paused", id);
        Ok(())
    }

    pub async fn resume(&self, id: &str) -> Result<()> {
        self.kill_switch.ensure_start_allowed()?;
        let lock = self.op_lock(id)?;
        let _guard = lock.lock().await;

        let worker = {
            let reg = self.registry.read().await;
            let slot = reg
                .slots
                .get(id)
                .ok_or_else(|| WardenError::WorkerNotFound(id.to_string()))?;
            match slot.state.status {
                WorkerStatus::Paused => slot.worker.clone(),
                WorkerStatus::Running => {
                    return Err(WardenError::InvalidStateTransition {
                        worker_id: id.to_string(),
                        from: WorkerStatus::Running.to_string(),
                        to: WorkerStatus::Running.to_string(),
                    })
                }
                _ => return Err(WardenError::NotRunning(id.to_string())),
            }
        };

        worker.resume().await?;
        self.monitor.resume_polling(id).await;

        let mut reg = self.registry.write().await;
        let slot = reg.slot_mut(id)?;
        self.transition(id, slot, WorkerStatus::Running)?;
        info!("Worker {} resumed", id);
        Ok(())
    }

    // ==================== Recovery ====================

    /// Restore the worker's latest checkpoint and restart it in safe mode.
    ///
    /// Returns the id of the checkpoint handed to the worker, if any.
    pub async fn recover(&self, id: &str, options: RecoverOptions) -> Result<Option<Uuid>> {
        self.kill_switch.ensure_start_allowed()?;

        let status = self
            .status_of(id)
            .await
            .ok_or_else(|| WardenError::WorkerNotFound(id.to_string()))?;
        match status {
            WorkerStatus::Stopped => {}
            WorkerStatus::Error => self.stop(id, "recovery").await?,
            _ if options.force => self.stop(id, "forced recovery").await?,
            _ => return Err(WardenError::AlreadyRunning(id.to_string())),
        }

        let restored = {
            let lock = self.op_lock(id)?;
            let _guard = lock.lock().await;

            let worker = {
                let mut reg = self.registry.write().await;
                let slot = reg.slot_mut(id)?;
                self.transition(id, slot, WorkerStatus::Recovering)?;
                slot.worker.clone()
            };

            match self.restore_into(id, worker.as_ref()).await {
                Ok(restored) => restored,
                Err(e) => {
                    let mut reg = self.registry.write().await;
                    let slot = reg.slot_mut(id)?;
                    self.transition(id, slot, WorkerStatus::Error)?;
                    slot.state.error_count += 1;
                    slot.state.last_error = Some(e.to_string());
                    return Err(e);
                }
            }
        };

        self.start(id, StartOptions { safe_mode: true }).await?;
        Ok(restored)
    }

    async fn restore_into(&self, id: &str, worker: &dyn Worker) -> Result<Option<Uuid>> {
        match self
            .recovery
            .restore_checkpoint(&worker_state_type(id))
            .await?
        {
            Some(checkpoint) => {
                worker.restore(&checkpoint).await?;
                info!("Worker {} restored from checkpoint {}", id, checkpoint.id);
                Ok(Some(checkpoint.id))
            }
            None => {
                info!("No checkpoint for {}; recovering with fresh state", id);
                Ok(None)
            }
        }
    }

    /// Checkpoint the exported state of every active worker
    pub async fn checkpoint_workers(&self) -> Result<usize> {
        let workers: Vec<(String, Arc<dyn Worker>, WorkerStatus)> = {
            let reg = self.registry.read().await;
            reg.order
                .iter()
                .filter_map(|id| {
                    reg.slots
                        .get(id)
                        .map(|s| (id.clone(), s.worker.clone(), s.state.status))
                })
                .collect()
        };

        // Exports run concurrently; writes stay sequential per store
        let exports = join_all(
            workers
                .into_iter()
                .filter(|(_, _, status)| {
                    matches!(status, WorkerStatus::Running | WorkerStatus::Paused)
                })
                .map(|(id, worker, status)| async move {
                    let exported = worker.export_state().await;
                    (id, status, exported)
                }),
        )
        .await;

        let mut written = 0;
        for (id, status, exported) in exports {
            match exported {
                Ok(Some(state)) => {
                    let mut metadata = BTreeMap::new();
                    metadata.insert("status".to_string(), status.to_string());
                    self.recovery
                        .create_checkpoint(&worker_state_type(&id), state, metadata)
                        .await?;
                    written += 1;
                }
                Ok(None) => {}
                Err(e) => warn!("Could not export state of {}: {}", id, e),
            }
        }
        Ok(written)
    }

    // ==================== Health ====================

    /// Apply a health monitor verdict to the worker's status
    pub async fn handle_health_event(&self, event: &HealthEvent) {
        match event {
            HealthEvent::Sampled { .. } => {}
            HealthEvent::Unhealthy {
                worker_id,
                consecutive_failures,
                last_error,
            } => {
                let detail = format!(
                    "{} consecutive failed polls{}",
                    consecutive_failures,
                    last_error
                        .as_deref()
                        .map(|e| format!(": {}", e))
                        .unwrap_or_default()
                );
                if self.mark_failing(worker_id, &detail).await {
                    self.alerts.worker_unhealthy(worker_id, &detail).await;
                }
            }
            HealthEvent::Frozen {
                worker_id,
                silent_for,
            } => {
                let detail = format!("no heartbeat for {}s", silent_for.as_secs());
                if self.mark_failing(worker_id, &detail).await {
                    self.alerts
                        .worker_frozen(worker_id, silent_for.as_secs())
                        .await;
                }
            }
            HealthEvent::Recovered { worker_id } => {
                let mut reg = self.registry.write().await;
                if let Some(slot) = reg.slots.get_mut(worker_id) {
                    if slot.state.status == WorkerStatus::Error
                        && self.transition(worker_id, slot, WorkerStatus::Running).is_ok()
                    {
                        slot.state.last_error = None;
                        info!("Worker {} recovered", worker_id);
                    }
                }
            }
        }
    }

    async fn mark_failing(&self, worker_id: &str, detail: &str) -> bool {
        let mut reg = self.registry.write().await;
        let Some(slot) = reg.slots.get_mut(worker_id) else {
            return false;
        };
        if slot.state.status != WorkerStatus::Running {
            return false;
        }
        if self.transition(worker_id, slot, WorkerStatus::Error).is_err() {
            return false;
        }
        slot.state.error_count += 1;
        slot.state.last_error = Some(detail.to_string());
        warn!("Worker {} marked as failing: {}", worker_id, detail);
        true
    }

    // ==================== Snapshot ====================

    /// Status merged with monitor health, in registration order
    pub async fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let rows: Vec<(WorkerDescriptor, WorkerState)> = {
            let reg = self.registry.read().await;
            reg.order
                .iter()
                .filter_map(|id| reg.slots.get(id))
                .map(|s| (s.descriptor.clone(), s.state.clone()))
                .collect()
        };

        let mut out = Vec::with_capacity(rows.len());
        for (descriptor, state) in rows {
            out.push(self.merge(descriptor, state).await);
        }
        out
    }

    pub async fn snapshot_of(&self, id: &str) -> Result<WorkerSnapshot> {
        let (descriptor, state) = {
            let reg = self.registry.read().await;
            let slot = reg
                .slots
                .get(id)
                .ok_or_else(|| WardenError::WorkerNotFound(id.to_string()))?;
            (slot.descriptor.clone(), slot.state.clone())
        };
        Ok(self.merge(descriptor, state).await)
    }

    async fn merge(&self, descriptor: WorkerDescriptor, state: WorkerState) -> WorkerSnapshot {
        let health = self.monitor.health_of(&descriptor.id).await;
        WorkerSnapshot {
            status: state.status,
            health: health.as_ref().map(|h| h.score).unwrap_or(0),
            classification: health.as_ref().map(|h| h.class).unwrap_or_default(),
            error_count: state.error_count,
            restart_count: state.restart_count,
            last_heartbeat_at: health.as_ref().and_then(|h| h.last_heartbeat_at),
            started_at: state.started_at,
            safe_mode: state.safe_mode,
            critical: descriptor.critical,
            depends_on: descriptor.depends_on,
            last_error: state.last_error,
            id: descriptor.id,
        }
    }
}

#[async_trait]
impl HaltTarget for ProcessSupervisor {
    async fn halt_all(&self, reason: &str) -> Vec<(String, String)> {
        self.stop_all(reason).await.failures
    }

    async fn pause_worker(&self, worker_id: &str, reason: &str) -> Result<()> {
        warn!("Pausing {}: {}", worker_id, reason);
        self.pause(worker_id).await
    }

    async fn snapshot_state(&self) -> serde_json::Value {
        serde_json::json!({ "workers": self.snapshot().await })
    }
}
