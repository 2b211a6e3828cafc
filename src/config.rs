use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::coordination::triggers::{default_triggers, TriggerCondition};
use crate::domain::{WorkerDescriptor, WorkerLimits};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub kill_switch: KillSwitchConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub safe_mode: SafeModeConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Address the control API listens on
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Admin token for mutating endpoints (WARDEN_API_ADMIN_TOKEN also honoured)
    #[serde(default)]
    pub admin_token: Option<String>,
}

fn default_bind_addr() -> String {
    "127.0.0.1:8080".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            admin_token: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily rolling log files
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            log_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Interval between polls of one worker
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// A poll slower than this counts as a miss
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,
    /// No heartbeat for this long classifies the worker FROZEN
    #[serde(default = "default_freeze_threshold")]
    pub freeze_threshold_ms: u64,
    /// Consecutive failed polls before a worker is unhealthy
    #[serde(default = "default_unhealthy_after")]
    pub unhealthy_after: u32,
    /// Consecutive successes before an unhealthy worker is recovered
    #[serde(default = "default_recovered_after")]
    pub recovered_after: u32,
    /// Samples kept per worker
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Latency at which the latency component of the score bottoms out
    #[serde(default = "default_latency_budget")]
    pub latency_budget_ms: u64,
}

fn default_poll_interval() -> u64 {
    5_000
}

fn default_poll_timeout() -> u64 {
    2_000
}

fn default_freeze_threshold() -> u64 {
    35_000
}

fn default_unhealthy_after() -> u32 {
    3
}

fn default_recovered_after() -> u32 {
    2
}

fn default_buffer_size() -> usize {
    100
}

fn default_latency_budget() -> u64 {
    1_000
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            poll_timeout_ms: default_poll_timeout(),
            freeze_threshold_ms: default_freeze_threshold(),
            unhealthy_after: default_unhealthy_after(),
            recovered_after: default_recovered_after(),
            buffer_size: default_buffer_size(),
            latency_budget_ms: default_latency_budget(),
        }
    }
}

impl HealthConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct KillSwitchConfig {
    /// Time ACTIVE must last before the automatic move to COOLDOWN
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_period_minutes: u64,
    /// When true, ACTIVE never cools down on its own
    #[serde(default)]
    pub manual_approval_required: bool,
    /// Activations within the window that lock the switch
    #[serde(default = "default_breaker_threshold")]
    pub circuit_breaker_threshold: u32,
    #[serde(default = "default_breaker_window")]
    pub circuit_breaker_window_minutes: u64,
    /// Healthy run required before OVERRIDDEN re-arms
    #[serde(default = "default_settle_period")]
    pub settle_period_secs: u64,
    /// Upper bound on the pre-stop checkpoint
    #[serde(default = "default_checkpoint_timeout")]
    pub checkpoint_timeout_ms: u64,
    #[serde(default = "default_triggers")]
    pub triggers: Vec<TriggerCondition>,
}

fn default_cooldown_minutes() -> u64 {
    30
}

fn default_breaker_threshold() -> u32 {
    3
}

fn default_breaker_window() -> u64 {
    60
}

fn default_settle_period() -> u64 {
    300
}

fn default_checkpoint_timeout() -> u64 {
    2_000
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            cooldown_period_minutes: default_cooldown_minutes(),
            manual_approval_required: false,
            circuit_breaker_threshold: default_breaker_threshold(),
            circuit_breaker_window_minutes: default_breaker_window(),
            settle_period_secs: default_settle_period(),
            checkpoint_timeout_ms: default_checkpoint_timeout(),
            triggers: default_triggers(),
        }
    }
}

impl KillSwitchConfig {
    pub fn cooldown_period(&self) -> Duration {
        Duration::from_secs(self.cooldown_period_minutes.saturating_mul(60))
    }

    pub fn breaker_window(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_window_minutes.saturating_mul(60))
    }

    pub fn settle_period(&self) -> Duration {
        Duration::from_secs(self.settle_period_secs)
    }

    pub fn checkpoint_timeout(&self) -> Duration {
        Duration::from_millis(self.checkpoint_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecoveryConfig {
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
    #[serde(default = "default_audit_log")]
    pub audit_log: PathBuf,
    /// Checkpoints retained per state type
    #[serde(default = "default_max_checkpoints")]
    pub max_checkpoints: usize,
    /// Retries for transient worker start failures
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
    /// Interval of the periodic `system` checkpoint (0 disables it)
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval_secs: u64,
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("data/checkpoints")
}

fn default_audit_log() -> PathBuf {
    PathBuf::from("data/audit/kill_switch.jsonl")
}

fn default_max_checkpoints() -> usize {
    10
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_base_delay() -> u64 {
    500
}

fn default_retry_max_delay() -> u64 {
    30_000
}

fn default_checkpoint_interval() -> u64 {
    300
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: default_checkpoint_dir(),
            audit_log: default_audit_log(),
            max_checkpoints: default_max_checkpoints(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            checkpoint_interval_secs: default_checkpoint_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SafeModeConfig {
    /// Multiplier applied to every worker limit in safe mode, in (0, 1]
    #[serde(default = "default_limit_factor")]
    pub limit_factor: Decimal,
}

fn default_limit_factor() -> Decimal {
    Decimal::new(5, 1)
}

impl Default for SafeModeConfig {
    fn default() -> Self {
        Self {
            limit_factor: default_limit_factor(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Time a worker gets to exit before it is killed
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_ms: u64,
    /// Readiness probe interval while a worker is starting
    #[serde(default = "default_readiness_poll")]
    pub readiness_poll_ms: u64,
}

fn default_stop_timeout() -> u64 {
    10_000
}

fn default_readiness_poll() -> u64 {
    250
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: default_stop_timeout(),
            readiness_poll_ms: default_readiness_poll(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// Overall budget for the shutdown sequence
    #[serde(default = "default_shutdown_total")]
    pub total_timeout_secs: u64,
    /// Budget for stopping every worker (halved on SIGQUIT)
    #[serde(default = "default_shutdown_workers")]
    pub worker_stop_timeout_secs: u64,
    #[serde(default = "default_shutdown_checkpoint")]
    pub checkpoint_timeout_secs: u64,
}

fn default_shutdown_total() -> u64 {
    120
}

fn default_shutdown_workers() -> u64 {
    60
}

fn default_shutdown_checkpoint() -> u64 {
    10
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            total_timeout_secs: default_shutdown_total(),
            worker_stop_timeout_secs: default_shutdown_workers(),
            checkpoint_timeout_secs: default_shutdown_checkpoint(),
        }
    }
}

/// One worker entry from the configuration file
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub health_url: Option<String>,
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,
    #[serde(default)]
    pub critical: bool,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_ms: u64,
    #[serde(default)]
    pub limits: WorkerLimits,
}

fn default_auto_start() -> bool {
    true
}

fn default_startup_timeout() -> u64 {
    30_000
}

impl WorkerConfig {
    pub fn to_descriptor(&self) -> WorkerDescriptor {
        WorkerDescriptor {
            id: self.id.clone(),
            depends_on: self.depends_on.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            health_url: self.health_url.clone(),
            auto_start: self.auto_start,
            critical: self.critical,
            startup_timeout_ms: self.startup_timeout_ms,
            limits: self.limits.clone(),
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("WARDEN_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (WARDEN_API__BIND_ADDR, etc.)
            .add_source(
                Environment::with_prefix("WARDEN")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Load a single configuration file (CLI `--config path/to/file.toml`)
    pub fn load_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path.as_ref()).required(true))
            .add_source(
                Environment::with_prefix("WARDEN")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Admin token from config, falling back to the environment
    pub fn admin_token(&self) -> Option<String> {
        self.api
            .admin_token
            .clone()
            .or_else(|| std::env::var("WARDEN_API_ADMIN_TOKEN").ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    pub fn descriptors(&self) -> Vec<WorkerDescriptor> {
        self.workers.iter().map(WorkerConfig::to_descriptor).collect()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        // Health polling
        if self.health.poll_interval_ms == 0 {
            errors.push("health.poll_interval_ms must be positive".to_string());
        }
        if self.health.poll_timeout_ms == 0 {
            errors.push("health.poll_timeout_ms must be positive".to_string());
        }
        if self.health.freeze_threshold_ms <= self.health.poll_interval_ms.saturating_mul(6) {
            errors.push(format!(
                "health.freeze_threshold_ms ({}) must exceed 6x poll_interval_ms ({})",
                self.health.freeze_threshold_ms, self.health.poll_interval_ms
            ));
        }
        if self.health.unhealthy_after == 0 || self.health.recovered_after == 0 {
            errors.push("health.unhealthy_after and recovered_after must be positive".to_string());
        }
        if self.health.buffer_size == 0 {
            errors.push("health.buffer_size must be positive".to_string());
        }

        // Kill switch
        if self.kill_switch.circuit_breaker_threshold == 0 {
            errors.push("kill_switch.circuit_breaker_threshold must be positive".to_string());
        }
        for trigger in &self.kill_switch.triggers {
            if let Err(e) = trigger.validate() {
                errors.push(format!("kill_switch.triggers[{}]: {}", trigger.name, e));
            }
        }

        // Recovery
        if self.recovery.max_checkpoints == 0 {
            errors.push("recovery.max_checkpoints must be positive".to_string());
        }
        if self.recovery.retry_base_delay_ms > self.recovery.retry_max_delay_ms {
            errors.push("recovery.retry_base_delay_ms must not exceed retry_max_delay_ms".to_string());
        }

        // Safe mode
        if self.safe_mode.limit_factor <= Decimal::ZERO || self.safe_mode.limit_factor > Decimal::ONE {
            errors.push("safe_mode.limit_factor must be in (0, 1]".to_string());
        }

        if self.shutdown.worker_stop_timeout_secs > self.shutdown.total_timeout_secs {
            errors.push(
                "shutdown.worker_stop_timeout_secs must not exceed total_timeout_secs".to_string(),
            );
        }

        // Workers
        let mut seen = HashSet::new();
        for worker in &self.workers {
            if worker.id.trim().is_empty() {
                errors.push("workers: id must not be empty".to_string());
            }
            if !seen.insert(worker.id.as_str()) {
                errors.push(format!("workers: duplicate id {}", worker.id));
            }
            if worker.command.trim().is_empty() {
                errors.push(format!("workers.{}: command must not be empty", worker.id));
            }
            if worker.startup_timeout_ms == 0 {
                errors.push(format!("workers.{}: startup_timeout_ms must be positive", worker.id));
            }
        }
        for worker in &self.workers {
            for dep in &worker.depends_on {
                if !seen.contains(dep.as_str()) {
                    errors.push(format!(
                        "workers.{}: depends on unknown worker {}",
                        worker.id, dep
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
            health: HealthConfig::default(),
            kill_switch: KillSwitchConfig::default(),
            recovery: RecoveryConfig::default(),
            safe_mode: SafeModeConfig::default(),
            supervisor: SupervisorConfig::default(),
            shutdown: ShutdownConfig::default(),
            workers: Vec::new(),
        }
    }
}
