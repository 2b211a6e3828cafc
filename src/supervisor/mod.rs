//! Supervision layer
//!
//! - Process supervisor: registry, dependency order, lifecycle transitions
//! - Health monitor: polling, freeze detection, health score
//! - Alert manager: severity routing with rate limits

pub mod alert_manager;
pub mod graph;
pub mod health_monitor;
pub mod process_supervisor;

pub use alert_manager::{Alert, AlertLevel, AlertManager, AlertManagerConfig};
pub use health_monitor::{HealthEvent, HealthMonitor, WorkerHealth};
pub use process_supervisor::{
    ProcessSupervisor, RecoverOptions, SequenceOptions, StartOptions, StartSelection,
    StopReport, SupervisorEvent,
};
