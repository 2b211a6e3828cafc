//! Alert Manager
//!
//! Routes alerts by severity, rate-limits duplicates and broadcasts them to
//! subscribers. Delivery to email/chat is left to whoever subscribes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const THROTTLE_WINDOW: Duration = Duration::from_secs(60);

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    /// Informational - log only
    Info,
    Warning,
    Error,
    /// Never rate limited
    Critical,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Info => "info",
            AlertLevel::Warning => "warning",
            AlertLevel::Error => "error",
            AlertLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Alert payload
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub level: AlertLevel,
    pub component: String,
    pub title: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(level: AlertLevel, component: &str, title: &str, message: &str) -> Self {
        Self {
            level,
            component: component.to_string(),
            title: title.to_string(),
            message: message.to_string(),
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Configuration for alert manager
#[derive(Debug, Clone)]
pub struct AlertManagerConfig {
    /// Minimum interval between two alerts with the same key
    pub dedup_window: Duration,
    /// Global cap on non-critical alerts per rolling minute
    pub max_alerts_per_minute: usize,
    /// Alerts kept for `/alerts`
    pub history_size: usize,
}

impl Default for AlertManagerConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(60),
            max_alerts_per_minute: 10,
            history_size: 100,
        }
    }
}

#[derive(Default)]
struct Limiter {
    /// Last delivery and suppressed count per `component:level:title`
    by_key: HashMap<String, (Instant, u32)>,
    /// Deliveries in the last minute
    recent: VecDeque<Instant>,
}

impl Limiter {
    fn admit(&mut self, key: String, config: &AlertManagerConfig) -> bool {
        let now = Instant::now();

        if let Some((last, suppressed)) = self.by_key.get_mut(&key) {
            if now.duration_since(*last) < config.dedup_window {
                *suppressed += 1;
                debug!("Suppressed duplicate alert {} ({} so far)", key, suppressed);
                return false;
            }
        }

        while let Some(front) = self.recent.front() {
            if now.duration_since(*front) >= THROTTLE_WINDOW {
                self.recent.pop_front();
            } else {
                break;
            }
        }
        if self.recent.len() >= config.max_alerts_per_minute {
            warn!(
                "Alert throttled: {} alerts in the last minute (max {})",
                self.recent.len(),
                config.max_alerts_per_minute
            );
            return false;
        }

        self.recent.push_back(now);
        self.by_key.insert(key, (now, 0));
        true
    }
}

pub struct AlertManager {
    config: AlertManagerConfig,
    limiter: Mutex<Limiter>,
    history: Mutex<VecDeque<Alert>>,
    event_tx: broadcast::Sender<Alert>,
}

impl AlertManager {
    pub fn new(config: AlertManagerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            config,
            limiter: Mutex::new(Limiter::default()),
            history: Mutex::new(VecDeque::new()),
            event_tx,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(AlertManagerConfig::default())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.event_tx.subscribe()
    }

    /// Log and broadcast `alert`. Critical alerts bypass deduplication and
    /// throttling. Returns whether the alert was delivered.
    pub async fn alert(&self, alert: Alert) -> bool {
        match alert.level {
            AlertLevel::Info => info!("[{}] {}: {}", alert.component, alert.title, alert.message),
            AlertLevel::Warning => {
                warn!("[{}] {}: {}", alert.component, alert.title, alert.message)
            }
            AlertLevel::Error | AlertLevel::Critical => error!(
                "{} [{}] {}: {}",
                alert.level.as_str().to_uppercase(),
                alert.component,
                alert.title,
                alert.message
            ),
        }

        if alert.level < AlertLevel::Critical {
            let key = format!("{}:{}:{}", alert.component, alert.level, alert.title);
            if !self.limiter.lock().await.admit(key, &self.config) {
                return false;
            }
        }

        {
            let mut history = self.history.lock().await;
            if history.len() >= self.config.history_size.max(1) {
                history.pop_front();
            }
            history.push_back(alert.clone());
        }

        let _ = self.event_tx.send(alert);
        true
    }

    pub async fn kill_switch_activated(&self, reason: &str, activation_count: u32) {
        self.alert(
            Alert::new(
                AlertLevel::Critical,
                "kill_switch",
                "Kill Switch Activated",
                reason,
            )
            .with_metadata(serde_json::json!({
                "action": "all_workers_stopped",
                "activationCount": activation_count,
            })),
        )
        .await;
    }

    pub async fn kill_switch_locked(&self, activations: u32) {
        self.alert(
            Alert::new(
                AlertLevel::Critical,
                "kill_switch",
                "Kill Switch Locked",
                &format!(
                    "{} activations within the circuit breaker window; manual reset required",
                    activations
                ),
            )
            .with_metadata(serde_json::json!({
                "action": "manual_intervention_required",
            })),
        )
        .await;
    }

    /// A worker could not be stopped during a kill
    pub async fn stop_failed(&self, worker_id: &str, error: &str) {
        self.alert(
            Alert::new(AlertLevel::Critical, worker_id, "Worker Stop Failed", error)
                .with_metadata(serde_json::json!({
                    "action": "manual_intervention_required",
                    "error": error,
                })),
        )
        .await;
    }

    pub async fn worker_unhealthy(&self, worker_id: &str, detail: &str) {
        self.alert(Alert::new(AlertLevel::Error, worker_id, "Worker Unhealthy", detail))
            .await;
    }

    pub async fn worker_frozen(&self, worker_id: &str, silent_for_secs: u64) {
        self.alert(Alert::new(
            AlertLevel::Critical,
            worker_id,
            "Worker Frozen",
            &format!("No heartbeat for {}s", silent_for_secs),
        ))
        .await;
    }

    pub async fn startup_failed(&self, worker_id: &str, attempts: u32, error: &str) {
        self.alert(
            Alert::new(
                AlertLevel::Error,
                worker_id,
                "Worker Startup Failed",
                &format!("Failed after {} attempt(s): {}", attempts, error),
            )
            .with_metadata(serde_json::json!({
                "attempts": attempts,
                "error": error,
            })),
        )
        .await;
    }

    /// Most recent delivered alerts, newest last
    pub async fn recent(&self, limit: usize) -> Vec<Alert> {
        let history = self.history.lock().await;
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// Duplicates suppressed per alert key since its last delivery
    pub async fn suppressed_counts(&self) -> HashMap<String, u32> {
        self.limiter
            .lock()
            .await
            .by_key
            .iter()
            .filter(|(_, (_, n))| *n > 0)
            .map(|(key, (_, n))| (key.clone(), *n))
            .collect()
    }
}
