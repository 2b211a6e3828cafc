//! Global kill switch
//!
//! Phases: ARMED -> ACTIVE -> COOLDOWN -> OVERRIDDEN -> ARMED, plus the sticky
//! LOCKED phase entered when too many activations land inside the circuit
//! breaker window. Transitions run under one async mutex; readers observe the
//! phase through a `watch` channel and never wait on a transition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::triggers::{Breach, MetricsWindow, TriggerAction, TriggerCondition};
use crate::config::KillSwitchConfig;
use crate::error::{Result, WardenError};
use crate::persistence::{AuditEntry, AuditLog, RecoverySystem};
use crate::supervisor::alert_manager::AlertManager;
use crate::supervisor::health_monitor::HealthEvent;

const WINDOW_MAX_SAMPLES: usize = 2_000;
pub const SYSTEM_ACTOR: &str = "system";

/// Kill switch phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KillSwitchPhase {
    /// Normal operation, triggers evaluated
    Armed,
    /// Fleet halted
    Active,
    /// Halted, waiting for an override
    Cooldown,
    /// Operator took responsibility; starts allowed
    Overridden,
    /// Circuit breaker tripped; manual reset required
    Locked,
}

impl KillSwitchPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            KillSwitchPhase::Armed => "ARMED",
            KillSwitchPhase::Active => "ACTIVE",
            KillSwitchPhase::Cooldown => "COOLDOWN",
            KillSwitchPhase::Overridden => "OVERRIDDEN",
            KillSwitchPhase::Locked => "LOCKED",
        }
    }

    /// Whether worker starts and resumes are refused
    pub fn blocks_starts(&self) -> bool {
        matches!(
            self,
            KillSwitchPhase::Active | KillSwitchPhase::Cooldown | KillSwitchPhase::Locked
        )
    }

    /// Whether a new breach may activate the switch from this phase
    pub fn can_activate(&self) -> bool {
        matches!(
            self,
            KillSwitchPhase::Armed | KillSwitchPhase::Overridden | KillSwitchPhase::Cooldown
        )
    }
}

impl std::fmt::Display for KillSwitchPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Published kill switch state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KillSwitchState {
    pub phase: KillSwitchPhase,
    pub activated_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    /// Activations inside the circuit breaker window
    pub activation_count: u32,
    pub approved_by: Option<String>,
    pub last_transition_at: DateTime<Utc>,
    pub last_actor: Option<String>,
}

impl Default for KillSwitchState {
    fn default() -> Self {
        Self {
            phase: KillSwitchPhase::Armed,
            activated_at: None,
            reason: None,
            activation_count: 0,
            approved_by: None,
            last_transition_at: Utc::now(),
            last_actor: None,
        }
    }
}

/// What the kill switch halts. Implemented by the process supervisor.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HaltTarget: Send + Sync {
    /// Stop every worker; returns `(worker_id, error)` for each stop failure
    async fn halt_all(&self, reason: &str) -> Vec<(String, String)>;

    async fn pause_worker(&self, worker_id: &str, reason: &str) -> Result<()>;

    /// Fleet state to include in the activation checkpoint
    async fn snapshot_state(&self) -> serde_json::Value;
}

struct Inner {
    state: KillSwitchState,
    activations: VecDeque<Instant>,
    active_since: Option<Instant>,
}

pub struct KillSwitch {
    config: KillSwitchConfig,
    triggers: Vec<TriggerCondition>,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<KillSwitchState>,
    windows: Mutex<HashMap<String, MetricsWindow>>,
    target: OnceLock<Weak<dyn HaltTarget>>,
    recovery: Arc<RecoverySystem>,
    audit: Arc<AuditLog>,
    alerts: Arc<AlertManager>,
    coalesced: AtomicU64,
}

impl KillSwitch {
    pub fn new(
        config: KillSwitchConfig,
        recovery: Arc<RecoverySystem>,
        audit: Arc<AuditLog>,
        alerts: Arc<AlertManager>,
    ) -> Self {
        let (state_tx, _) = watch::channel(KillSwitchState::default());
        Self {
            triggers: config.triggers.clone(),
            config,
            inner: Mutex::new(Inner {
                state: KillSwitchState::default(),
                activations: VecDeque::new(),
                active_since: None,
            }),
            state_tx,
            windows: Mutex::new(HashMap::new()),
            target: OnceLock::new(),
            recovery,
            audit,
            alerts,
            coalesced: AtomicU64::new(0),
        }
    }

    /// Wire the halt target. Only the first call takes effect.
    pub fn attach(&self, target: Weak<dyn HaltTarget>) {
        if self.target.set(target).is_err() {
            warn!("Kill switch halt target already attached");
        }
    }

    fn halt_target(&self) -> Option<Arc<dyn HaltTarget>> {
        self.target.get().and_then(|w| w.upgrade())
    }

    /// Current phase without waiting on a pending transition
    pub fn phase(&self) -> KillSwitchPhase {
        self.state_tx.borrow().phase
    }

    /// Published state; updated after every transition
    pub fn subscribe(&self) -> watch::Receiver<KillSwitchState> {
        self.state_tx.subscribe()
    }

    pub fn is_blocking(&self) -> bool {
        self.phase().blocks_starts()
    }

    /// Fail with `KillSwitchActive` when starts are blocked
    pub fn ensure_start_allowed(&self) -> Result<()> {
        let phase = self.phase();
        if phase.blocks_starts() {
            return Err(WardenError::KillSwitchActive {
                phase: phase.to_string(),
                reason: "starts are blocked until the kill switch is overridden".to_string(),
            });
        }
        Ok(())
    }

    pub fn state(&self) -> KillSwitchState {
        self.state_tx.borrow().clone()
    }

    pub fn triggers(&self) -> &[TriggerCondition] {
        &self.triggers
    }

    /// Breaches dropped because the switch was already halted
    pub fn coalesced_breaches(&self) -> u64 {
        self.coalesced.load(Ordering::Relaxed)
    }

    /// Feed a health event; acts on the first breach it produces
    pub async fn observe(&self, event: &HealthEvent) -> Option<Breach> {
        let now = Utc::now();
        let breaches = {
            let mut windows = self.windows.lock().await;
            let worker_id = event.worker_id().to_string();
            let retention = MetricsWindow::retention_for(&self.triggers);
            let window = windows
                .entry(worker_id.clone())
                .or_insert_with(|| MetricsWindow::new(&worker_id, retention, WINDOW_MAX_SAMPLES));

            match event {
                HealthEvent::Sampled { sample, score, .. } => {
                    window.push(sample.clone(), Some(*score))
                }
                HealthEvent::Frozen { .. } => window.mark_frozen(),
                HealthEvent::Unhealthy { .. } | HealthEvent::Recovered { .. } => return None,
            }

            let window: &MetricsWindow = window;
            self.triggers
                .iter()
                .filter_map(|t| t.evaluate(window, now))
                .collect::<Vec<_>>()
        };

        let breach = breaches
            .iter()
            .find(|b| b.action == TriggerAction::StopAll)
            .or_else(|| breaches.first())
            .cloned()?;

        match breach.action {
            TriggerAction::StopAll => {
                if let Err(e) = self.trip(&breach.to_string(), SYSTEM_ACTOR).await {
                    error!("Kill switch activation failed: {}", e);
                }
            }
            TriggerAction::PauseWorker => self.pause_offender(&breach).await,
        }
        Some(breach)
    }

    async fn pause_offender(&self, breach: &Breach) {
        self.windows.lock().await.remove(&breach.worker_id);
        warn!("Trigger {} pausing worker {}", breach.trigger, breach.worker_id);
        self.audit(
            AuditEntry::new("kill_switch", "worker_paused", &breach.to_string(), SYSTEM_ACTOR)
                .with_details(serde_json::json!({ "workerId": breach.worker_id })),
        )
        .await;
        match self.halt_target() {
            Some(target) => {
                if let Err(e) = target.pause_worker(&breach.worker_id, &breach.detail).await {
                    warn!("Could not pause {}: {}", breach.worker_id, e);
                }
            }
            None => warn!("No halt target attached; cannot pause {}", breach.worker_id),
        }
    }

    /// Manual activation
    pub async fn activate(&self, reason: &str, actor: &str) -> Result<KillSwitchState> {
        if reason.trim().is_empty() {
            return Err(WardenError::Validation("activation reason is required".into()));
        }
        self.trip(reason, actor).await
    }

    /// Safety signal from outside the trigger set (e.g. a critical worker failed)
    pub async fn escalate(&self, worker_id: &str, detail: &str) -> Result<KillSwitchState> {
        self.trip(&format!("critical worker {} failed: {}", worker_id, detail), SYSTEM_ACTOR)
            .await
    }

    async fn trip(&self, reason: &str, actor: &str) -> Result<KillSwitchState> {
        // Coalesce without queuing behind an in-flight transition
        let current = self.phase();
        if !current.can_activate() {
            return Ok(self.coalesce(reason, current));
        }

        let mut inner = self.inner.lock().await;
        let from = inner.state.phase;
        if !from.can_activate() {
            drop(inner);
            return Ok(self.coalesce(reason, from));
        }

        self.prune_activations(&mut inner);
        inner.activations.push_back(Instant::now());
        let count = inner.activations.len() as u32;
        let to = if count >= self.config.circuit_breaker_threshold {
            KillSwitchPhase::Locked
        } else {
            KillSwitchPhase::Active
        };

        let now = Utc::now();
        inner.state.phase = to;
        inner.state.activated_at = Some(now);
        inner.state.reason = Some(reason.to_string());
        inner.state.activation_count = count;
        inner.state.approved_by = None;
        inner.state.last_transition_at = now;
        inner.state.last_actor = Some(actor.to_string());
        inner.active_since = Some(Instant::now());
        self.state_tx.send_replace(inner.state.clone());

        error!("KILL SWITCH {} -> {} by {}: {}", from, to, actor, reason);
        self.audit(
            AuditEntry::new("kill_switch", "activated", reason, actor)
                .transition(from.as_str(), to.as_str())
                .with_details(serde_json::json!({ "activationCount": count })),
        )
        .await;
        self.alerts.kill_switch_activated(reason, count).await;
        if to == KillSwitchPhase::Locked {
            self.audit(
                AuditEntry::new("kill_switch", "locked", reason, actor)
                    .with_details(serde_json::json!({ "activationCount": count })),
            )
            .await;
            self.alerts.kill_switch_locked(count).await;
        }

        let target = self.halt_target();
        self.checkpoint_before_halt(target.as_deref(), reason, to).await;

        match target {
            Some(target) => {
                let failures = target.halt_all(reason).await;
                for (worker_id, err) in &failures {
                    self.alerts.stop_failed(worker_id, err).await;
                }
                if !failures.is_empty() {
                    error!(
                        "Kill switch {} but {} worker(s) failed to stop",
                        to,
                        failures.len()
                    );
                }
            }
            None => error!("Kill switch activated with no halt target attached"),
        }

        self.windows.lock().await.clear();
        let state = inner.state.clone();
        drop(inner);
        self.persist(&state).await;
        Ok(state)
    }

    fn coalesce(&self, reason: &str, phase: KillSwitchPhase) -> KillSwitchState {
        let n = self.coalesced.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            "Breach coalesced while kill switch {} ({} so far): {}",
            phase, n, reason
        );
        self.state()
    }

    async fn checkpoint_before_halt(
        &self,
        target: Option<&dyn HaltTarget>,
        reason: &str,
        phase: KillSwitchPhase,
    ) {
        let work = async {
            let fleet = match target {
                Some(t) => t.snapshot_state().await,
                None => serde_json::Value::Null,
            };
            let mut metadata = BTreeMap::new();
            metadata.insert("trigger".to_string(), "kill_switch".to_string());
            metadata.insert("phase".to_string(), phase.as_str().to_string());
            self.recovery
                .create_checkpoint(
                    "system",
                    serde_json::json!({ "reason": reason, "fleet": fleet }),
                    metadata,
                )
                .await
        };

        match tokio::time::timeout(self.config.checkpoint_timeout(), work).await {
            Ok(Ok(cp)) => debug!("Pre-halt checkpoint {} written", cp.id),
            Ok(Err(e)) => warn!("Pre-halt checkpoint failed: {}", e),
            Err(_) => warn!(
                "Pre-halt checkpoint abandoned after {:?}",
                self.config.checkpoint_timeout()
            ),
        }
    }

    /// Move ACTIVE/COOLDOWN/LOCKED to OVERRIDDEN
    pub async fn override_switch(
        &self,
        reason: &str,
        approved_by: Option<&str>,
        actor: &str,
    ) -> Result<KillSwitchState> {
        let approved_by = approved_by.map(str::trim).filter(|s| !s.is_empty());
        let mut inner = self.inner.lock().await;
        let from = inner.state.phase;

        let rejection = if reason.trim().is_empty() {
            Some(WardenError::Validation("override reason is required".into()))
        } else {
            match from {
                KillSwitchPhase::Active
                    if self.config.manual_approval_required && approved_by.is_none() =>
                {
                    Some(WardenError::ApprovalRequired(
                        "manual approval is required to override an active kill switch".into(),
                    ))
                }
                KillSwitchPhase::Locked if approved_by.is_none() => {
                    Some(WardenError::ApprovalRequired(
                        "a locked kill switch can only be reset with approval".into(),
                    ))
                }
                KillSwitchPhase::Active | KillSwitchPhase::Cooldown | KillSwitchPhase::Locked => {
                    None
                }
                KillSwitchPhase::Armed | KillSwitchPhase::Overridden => {
                    Some(WardenError::InvalidKillSwitchTransition(format!(
                        "cannot override from {}",
                        from
                    )))
                }
            }
        };

        if let Some(err) = rejection {
            drop(inner);
            warn!("Override rejected ({}): {}", from, err);
            self.audit(
                AuditEntry::new("kill_switch", "override_rejected", reason, actor)
                    .with_details(serde_json::json!({ "phase": from, "error": err.to_string() })),
            )
            .await;
            return Err(err);
        }

        if from == KillSwitchPhase::Locked {
            inner.activations.clear();
        }
        let now = Utc::now();
        inner.state.phase = KillSwitchPhase::Overridden;
        inner.state.approved_by = approved_by.map(str::to_string);
        inner.state.reason = Some(reason.to_string());
        inner.state.last_transition_at = now;
        inner.state.last_actor = Some(actor.to_string());
        inner.state.activation_count = inner.activations.len() as u32;
        inner.active_since = None;
        self.state_tx.send_replace(inner.state.clone());

        warn!(
            "Kill switch overridden from {} by {} (approved by {:?}): {}",
            from, actor, approved_by, reason
        );
        let mut entry = AuditEntry::new("kill_switch", "override", reason, actor)
            .transition(from.as_str(), KillSwitchPhase::Overridden.as_str());
        if let Some(approver) = approved_by {
            entry = entry.with_details(serde_json::json!({ "approvedBy": approver }));
        }
        self.audit(entry).await;

        let state = inner.state.clone();
        drop(inner);
        self.persist(&state).await;
        Ok(state)
    }

    /// Re-arm from COOLDOWN or OVERRIDDEN
    pub async fn deactivate(&self, reason: &str, actor: &str) -> Result<KillSwitchState> {
        if reason.trim().is_empty() {
            return Err(WardenError::Validation("deactivation reason is required".into()));
        }
        let from = self.phase();
        if !matches!(from, KillSwitchPhase::Cooldown | KillSwitchPhase::Overridden) {
            return Err(WardenError::InvalidKillSwitchTransition(format!(
                "cannot deactivate from {}",
                from
            )));
        }
        self.transition(from, KillSwitchPhase::Armed, reason, actor, "deactivated")
            .await
    }

    /// Time-driven transitions. `healthy_run` is the longest current healthy
    /// streak across the fleet.
    pub async fn tick(&self, healthy_run: Option<Duration>) -> Option<KillSwitchPhase> {
        match self.phase() {
            KillSwitchPhase::Active if !self.config.manual_approval_required => {
                let due = {
                    let inner = self.inner.lock().await;
                    inner
                        .active_since
                        .map(|since| since.elapsed() >= self.config.cooldown_period())
                        .unwrap_or(false)
                };
                if due {
                    return self
                        .transition(
                            KillSwitchPhase::Active,
                            KillSwitchPhase::Cooldown,
                            "cooldown period elapsed",
                            SYSTEM_ACTOR,
                            "cooldown",
                        )
                        .await
                        .ok()
                        .map(|s| s.phase);
                }
            }
            KillSwitchPhase::Overridden => {
                if healthy_run.map(|d| d >= self.config.settle_period()).unwrap_or(false) {
                    return self
                        .transition(
                            KillSwitchPhase::Overridden,
                            KillSwitchPhase::Armed,
                            "fleet healthy through settle period",
                            SYSTEM_ACTOR,
                            "rearmed",
                        )
                        .await
                        .ok()
                        .map(|s| s.phase);
                }
            }
            _ => {}
        }
        None
    }

    async fn transition(
        &self,
        expected: KillSwitchPhase,
        to: KillSwitchPhase,
        reason: &str,
        actor: &str,
        event_type: &str,
    ) -> Result<KillSwitchState> {
        let mut inner = self.inner.lock().await;
        let from = inner.state.phase;
        if from != expected {
            return Err(WardenError::InvalidKillSwitchTransition(format!(
                "phase changed to {} before {} -> {}",
                from, expected, to
            )));
        }

        inner.state.phase = to;
        inner.state.last_transition_at = Utc::now();
        inner.state.last_actor = Some(actor.to_string());
        if to == KillSwitchPhase::Armed {
            inner.state.reason = None;
            inner.state.approved_by = None;
            inner.active_since = None;
        }
        self.state_tx.send_replace(inner.state.clone());
        info!("Kill switch {} -> {} by {}: {}", from, to, actor, reason);

        self.audit(
            AuditEntry::new("kill_switch", event_type, reason, actor)
                .transition(from.as_str(), to.as_str()),
        )
        .await;

        let state = inner.state.clone();
        drop(inner);
        self.persist(&state).await;
        Ok(state)
    }

    /// Restore the last persisted state (on startup). A halted switch stays
    /// halted across restarts.
    pub async fn restore(&self) -> Result<Option<KillSwitchState>> {
        let Some(saved) = self
            .recovery
            .restore_typed::<KillSwitchState>("kill_switch")
            .await?
        else {
            return Ok(None);
        };

        let mut inner = self.inner.lock().await;
        inner.state = saved.clone();
        if saved.phase.blocks_starts() {
            inner.active_since = Some(Instant::now());
        }
        self.state_tx.send_replace(saved.clone());
        info!("Kill switch restored in phase {}", saved.phase);
        Ok(Some(saved))
    }

    async fn persist(&self, state: &KillSwitchState) {
        if let Err(e) = self
            .recovery
            .create_typed("kill_switch", state, BTreeMap::new())
            .await
        {
            warn!("Failed to persist kill switch state: {}", e);
        }
    }

    async fn audit(&self, entry: AuditEntry) {
        if let Err(e) = self.audit.append(&entry).await {
            error!("Failed to write audit entry {}: {}", entry.event_type, e);
        }
    }

    fn prune_activations(&self, inner: &mut Inner) {
        let window = self.config.breaker_window();
        while let Some(first) = inner.activations.front() {
            if first.elapsed() > window {
                inner.activations.pop_front();
            } else {
                break;
            }
        }
    }
}
