//! Coordination layer
//!
//! - Kill switch / circuit breaker over the whole fleet
//! - Trigger conditions evaluated against per-worker metric windows
//! - Graceful shutdown sequencing

pub mod kill_switch;
pub mod shutdown;
pub mod triggers;

pub use kill_switch::{HaltTarget, KillSwitch, KillSwitchPhase, KillSwitchState, SYSTEM_ACTOR};
pub use shutdown::{GracefulShutdown, ShutdownPhase, ShutdownSignal};
pub use triggers::{Breach, MetricsWindow, TriggerAction, TriggerCondition, TriggerKind};
