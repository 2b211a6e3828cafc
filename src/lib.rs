pub mod api;
pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod persistence;
pub mod supervisor;
pub mod worker;

pub use bootstrap::WardenContext;
pub use config::AppConfig;
pub use coordination::{
    GracefulShutdown, KillSwitch, KillSwitchPhase, KillSwitchState, ShutdownSignal,
};
pub use error::{ErrorKind, Result, WardenError};
pub use persistence::{AuditLog, RecoverySystem};
pub use supervisor::{AlertManager, HealthMonitor, ProcessSupervisor};
