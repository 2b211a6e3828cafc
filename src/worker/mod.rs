//! Worker abstraction
//!
//! A worker is an opaque trading process. The supervisor drives it through
//! the [`Worker`] trait; stages that do not apply keep the no-op defaults.

pub mod http_probe;
pub mod process;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::{ProbeReport, WorkerDescriptor, WorkerLimits};
use crate::error::Result;
use crate::persistence::Checkpoint;

pub use http_probe::HttpProbe;
pub use process::ProcessWorker;

/// Parameters for one launch of a worker
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchContext {
    /// Effective limits (already scaled in safe mode)
    pub limits: WorkerLimits,
    pub safe_mode: bool,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Worker: Send + Sync {
    /// One-time preparation before the first start of a launch
    async fn initialize(&self, _ctx: &LaunchContext) -> Result<()> {
        Ok(())
    }

    async fn start(&self, ctx: &LaunchContext) -> Result<()>;

    /// Stop and release resources, forcing termination after `timeout`
    async fn stop(&self, timeout: Duration) -> Result<()>;

    async fn pause(&self) -> Result<()> {
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        Ok(())
    }

    /// Hand restored state to the worker before its next start
    async fn restore(&self, _checkpoint: &Checkpoint) -> Result<()> {
        Ok(())
    }

    async fn health_check(&self) -> Result<ProbeReport>;

    /// Worker-private state to include in checkpoints
    async fn export_state(&self) -> Result<Option<serde_json::Value>> {
        Ok(None)
    }
}

/// Source of health samples for the monitor
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> Result<ProbeReport>;
}

/// Probes a worker through its own `health_check`
pub struct WorkerProbe(pub Arc<dyn Worker>);

#[async_trait]
impl HealthProbe for WorkerProbe {
    async fn probe(&self) -> Result<ProbeReport> {
        self.0.health_check().await
    }
}

/// Builds the worker implementation for a registered descriptor
pub trait WorkerFactory: Send + Sync {
    fn create(&self, descriptor: &WorkerDescriptor) -> Arc<dyn Worker>;
}

/// Default factory: every descriptor is an OS process
pub struct ProcessWorkerFactory {
    pub probe_timeout: Duration,
    pub restore_dir: std::path::PathBuf,
}

impl WorkerFactory for ProcessWorkerFactory {
    fn create(&self, descriptor: &WorkerDescriptor) -> Arc<dyn Worker> {
        Arc::new(ProcessWorker::new(
            descriptor,
            self.probe_timeout,
            self.restore_dir.clone(),
        ))
    }
}
