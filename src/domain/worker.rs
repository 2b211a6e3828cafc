use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::health::HealthClass;

/// Worker lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    /// Not running, resources released
    Stopped,
    /// Start issued, waiting for readiness
    Starting,
    /// Running with health polling active
    Running,
    /// Suspended without releasing resources
    Paused,
    /// Restoring checkpointed state before a restart
    Recovering,
    /// Stop issued, waiting for the process to exit
    Stopping,
    /// Failed to start or reported unhealthy
    Error,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Stopped => "STOPPED",
            WorkerStatus::Starting => "STARTING",
            WorkerStatus::Running => "RUNNING",
            WorkerStatus::Paused => "PAUSED",
            WorkerStatus::Recovering => "RECOVERING",
            WorkerStatus::Stopping => "STOPPING",
            WorkerStatus::Error => "ERROR",
        }
    }

    /// Check if this state can transition to another state
    pub fn can_transition_to(&self, target: WorkerStatus) -> bool {
        use WorkerStatus::*;

        match (self, target) {
            (Stopped, Starting) | (Stopped, Recovering) => true,

            (Starting, Running) | (Starting, Error) => true,
            (Starting, Stopping) | (Starting, Stopped) => true, // cancelled by stop

            (Running, Paused) | (Running, Stopping) | (Running, Error) => true,

            (Paused, Running) | (Paused, Stopping) | (Paused, Error) => true,

            (Recovering, Starting) | (Recovering, Error) => true,
            (Recovering, Stopping) | (Recovering, Stopped) => true,

            (Stopping, Stopped) | (Stopping, Error) => true,

            // Health recovered while the process kept running
            (Error, Running) => true,
            (Error, Starting) | (Error, Recovering) => true,
            (Error, Stopping) | (Error, Stopped) => true,

            _ => false,
        }
    }

    /// Whether the worker holds live resources that a stop must release
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            WorkerStatus::Starting
                | WorkerStatus::Running
                | WorkerStatus::Paused
                | WorkerStatus::Recovering
                | WorkerStatus::Error
        )
    }

    /// Stopped or on the way there
    pub fn is_halted(&self) -> bool {
        matches!(self, WorkerStatus::Stopped | WorkerStatus::Stopping)
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-worker risk limits handed to the worker process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerLimits {
    /// Maximum daily loss in USD before the worker must stop trading
    pub max_daily_loss_usd: Decimal,
    /// Maximum open position size in USD
    pub max_position_usd: Decimal,
    /// Maximum orders per minute
    pub max_orders_per_minute: u32,
}

impl Default for WorkerLimits {
    fn default() -> Self {
        Self {
            max_daily_loss_usd: Decimal::from(100),
            max_position_usd: Decimal::from(500),
            max_orders_per_minute: 30,
        }
    }
}

impl WorkerLimits {
    /// Reduced limits for safe-mode restarts
    pub fn scaled(&self, factor: Decimal) -> Self {
        let orders = Decimal::from(self.max_orders_per_minute) * factor;
        Self {
            max_daily_loss_usd: (self.max_daily_loss_usd * factor).round_dp(2),
            max_position_usd: (self.max_position_usd * factor).round_dp(2),
            max_orders_per_minute: orders.floor().to_u32().unwrap_or(0).max(1),
        }
    }
}

/// Static description of a supervised worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    /// Unique worker id
    pub id: String,
    /// Ids this worker requires to be RUNNING before it starts
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Executable to launch
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// HTTP health endpoint; process liveness is used when absent
    #[serde(default)]
    pub health_url: Option<String>,
    #[serde(default)]
    pub auto_start: bool,
    /// Startup failure aborts the whole sequential startup
    #[serde(default)]
    pub critical: bool,
    pub startup_timeout_ms: u64,
    #[serde(default)]
    pub limits: WorkerLimits,
}

impl WorkerDescriptor {
    /// Minimal descriptor, mostly useful for tests and ad-hoc registration
    pub fn new(id: &str, command: &str) -> Self {
        Self {
            id: id.to_string(),
            depends_on: Vec::new(),
            command: command.to_string(),
            args: Vec::new(),
            health_url: None,
            auto_start: true,
            critical: false,
            startup_timeout_ms: 30_000,
            limits: WorkerLimits::default(),
        }
    }

    pub fn depends_on(mut self, ids: &[&str]) -> Self {
        self.depends_on = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    pub fn auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn startup_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }
}

/// Mutable runtime state, one per descriptor
#[derive(Debug, Clone)]
pub struct WorkerState {
    pub status: WorkerStatus,
    pub error_count: u32,
    pub restart_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub safe_mode: bool,
    pub last_error: Option<String>,
}

impl Default for WorkerState {
    fn default() -> Self {
        Self {
            status: WorkerStatus::Stopped,
            error_count: 0,
            restart_count: 0,
            started_at: None,
            stopped_at: None,
            safe_mode: false,
            last_error: None,
        }
    }
}

/// Published view of a worker: supervisor status merged with monitor health
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub id: String,
    pub status: WorkerStatus,
    pub health: u8,
    pub classification: HealthClass,
    pub error_count: u32,
    pub restart_count: u32,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub safe_mode: bool,
    pub critical: bool,
    pub depends_on: Vec<String>,
    pub last_error: Option<String>,
}
