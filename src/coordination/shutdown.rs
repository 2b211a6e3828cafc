//! Graceful Shutdown Handler
//!
//! Sequences process exit: stop accepting control requests, stop every
//! worker in reverse dependency order, write a final checkpoint.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use crate::config::ShutdownConfig;

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM, SIGINT
    Graceful,
    /// SIGQUIT: halve the worker stop budget
    Urgent,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Graceful => write!(f, "graceful"),
            ShutdownSignal::Urgent => write!(f, "urgent"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    /// Control API no longer accepts requests
    StoppingIntake,
    StoppingWorkers,
    /// Final system checkpoint
    Checkpointing,
    Complete,
}

impl std::fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownPhase::Running => write!(f, "running"),
            ShutdownPhase::StoppingIntake => write!(f, "stopping_intake"),
            ShutdownPhase::StoppingWorkers => write!(f, "stopping_workers"),
            ShutdownPhase::Checkpointing => write!(f, "checkpointing"),
            ShutdownPhase::Complete => write!(f, "complete"),
        }
    }
}

pub type ShutdownStep<T> = Pin<Box<dyn Future<Output = T> + Send>>;

pub struct GracefulShutdown {
    config: ShutdownConfig,
    shutdown_requested: AtomicBool,
    urgent: AtomicBool,
    phase_tx: watch::Sender<ShutdownPhase>,
    signal_tx: broadcast::Sender<ShutdownSignal>,
}

impl GracefulShutdown {
    pub fn new(config: ShutdownConfig) -> Self {
        let (phase_tx, _) = watch::channel(ShutdownPhase::Running);
        let (signal_tx, _) = broadcast::channel(8);
        Self {
            config,
            shutdown_requested: AtomicBool::new(false),
            urgent: AtomicBool::new(false),
            phase_tx,
            signal_tx,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ShutdownConfig::default())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.signal_tx.subscribe()
    }

    pub fn phase_receiver(&self) -> watch::Receiver<ShutdownPhase> {
        self.phase_tx.subscribe()
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn current_phase(&self) -> ShutdownPhase {
        *self.phase_tx.borrow()
    }

    /// Request shutdown; only the first request is broadcast
    pub fn request_shutdown(&self, signal: ShutdownSignal) {
        if signal == ShutdownSignal::Urgent {
            self.urgent.store(true, Ordering::SeqCst);
        }
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            warn!("Shutdown already requested, ignoring duplicate signal: {}", signal);
            return;
        }

        info!("Shutdown requested: {}", signal);
        let _ = self.signal_tx.send(signal);
    }

    /// Resolves once shutdown has been requested
    pub async fn wait_for_request(&self) -> ShutdownSignal {
        let mut rx = self.signal_tx.subscribe();
        if self.is_shutdown_requested() {
            return self.requested_signal();
        }
        match rx.recv().await {
            Ok(signal) => signal,
            Err(_) => self.requested_signal(),
        }
    }

    fn requested_signal(&self) -> ShutdownSignal {
        if self.urgent.load(Ordering::SeqCst) {
            ShutdownSignal::Urgent
        } else {
            ShutdownSignal::Graceful
        }
    }

    fn set_phase(&self, phase: ShutdownPhase) {
        self.phase_tx.send_replace(phase);
        info!("Shutdown phase: {}", phase);
    }

    /// Budget for stopping workers; halved on an urgent request
    pub fn worker_stop_budget(&self) -> Duration {
        let budget = Duration::from_secs(self.config.worker_stop_timeout_secs);
        if self.urgent.load(Ordering::SeqCst) {
            budget / 2
        } else {
            budget
        }
    }

    /// Run the shutdown sequence. Each step is bounded; a step that overruns
    /// is logged and the sequence continues.
    pub async fn execute<F1, F2, F3>(
        &self,
        stop_intake: F1,
        stop_workers: F2,
        checkpoint: F3,
    ) -> Result<(), ShutdownError>
    where
        F1: FnOnce() -> ShutdownStep<()>,
        F2: FnOnce() -> ShutdownStep<Vec<(String, String)>>,
        F3: FnOnce() -> ShutdownStep<Result<(), String>>,
    {
        let start = std::time::Instant::now();
        let total_timeout = Duration::from_secs(self.config.total_timeout_secs);
        info!(
            "Starting graceful shutdown (timeout: {}s)",
            self.config.total_timeout_secs
        );

        self.set_phase(ShutdownPhase::StoppingIntake);
        stop_intake().await;
        debug!("Control intake stopped");

        self.set_phase(ShutdownPhase::StoppingWorkers);
        let budget = self.worker_stop_budget();
        let mut failed = Vec::new();
        match tokio::time::timeout(budget, stop_workers()).await {
            Ok(failures) if failures.is_empty() => info!("All workers stopped"),
            Ok(failures) => {
                for (worker_id, err) in &failures {
                    error!("Worker {} failed to stop during shutdown: {}", worker_id, err);
                }
                failed = failures.into_iter().map(|(id, _)| id).collect();
            }
            Err(_) => warn!("Worker stop timeout after {:?}, proceeding anyway", budget),
        }

        if start.elapsed() > total_timeout {
            error!("Total shutdown timeout exceeded");
            self.set_phase(ShutdownPhase::Complete);
            return Err(ShutdownError::Timeout);
        }

        self.set_phase(ShutdownPhase::Checkpointing);
        let checkpoint_timeout = Duration::from_secs(self.config.checkpoint_timeout_secs);
        match tokio::time::timeout(checkpoint_timeout, checkpoint()).await {
            Ok(Ok(())) => debug!("Final checkpoint created"),
            Ok(Err(e)) => warn!("Final checkpoint failed: {}", e),
            Err(_) => warn!("Final checkpoint timeout after {:?}", checkpoint_timeout),
        }

        self.set_phase(ShutdownPhase::Complete);
        info!("Graceful shutdown completed in {:?}", start.elapsed());

        if failed.is_empty() {
            Ok(())
        } else {
            Err(ShutdownError::WorkersFailed(failed))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShutdownError {
    #[error("shutdown timed out")]
    Timeout,
    #[error("workers failed to stop: {}", .0.join(", "))]
    WorkersFailed(Vec<String>),
}

/// Route OS signals into `shutdown`
pub fn install_signal_handlers(shutdown: Arc<GracefulShutdown>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let handlers = [
            (SignalKind::terminate(), "SIGTERM", ShutdownSignal::Graceful),
            (SignalKind::interrupt(), "SIGINT", ShutdownSignal::Graceful),
            (SignalKind::quit(), "SIGQUIT", ShutdownSignal::Urgent),
        ];
        for (kind, name, request) in handlers {
            let shutdown = shutdown.clone();
            match signal(kind) {
                Ok(mut stream) => {
                    tokio::spawn(async move {
                        stream.recv().await;
                        info!("Received {}", name);
                        shutdown.request_shutdown(request);
                    });
                }
                Err(e) => error!("Failed to install {} handler: {}", name, e),
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl+C");
                    shutdown.request_shutdown(ShutdownSignal::Graceful);
                }
                Err(e) => error!("Failed to install Ctrl+C handler: {}", e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_phase_display() {
        assert_eq!(ShutdownPhase::StoppingWorkers.to_string(), "stopping_workers");
        assert_eq!(ShutdownPhase::Complete.to_string(), "complete");
    }

    #[tokio::test]
    async fn test_duplicate_request_keeps_first_signal() {
        let shutdown = GracefulShutdown::with_defaults();
        let mut rx = shutdown.subscribe();

        shutdown.request_shutdown(ShutdownSignal::Graceful);
        shutdown.request_shutdown(ShutdownSignal::Graceful);

        assert_eq!(rx.recv().await.unwrap(), ShutdownSignal::Graceful);
        assert!(rx.try_recv().is_err());
        assert_eq!(shutdown.wait_for_request().await, ShutdownSignal::Graceful);
    }

    #[tokio::test]
    async fn test_urgent_halves_worker_budget() {
        let shutdown = GracefulShutdown::with_defaults();
        let full = shutdown.worker_stop_budget();
        shutdown.request_shutdown(ShutdownSignal::Urgent);
        assert_eq!(shutdown.worker_stop_budget(), full / 2);
    }

    #[tokio::test]
    async fn test_execute_runs_steps_in_order() {
        let shutdown = GracefulShutdown::with_defaults();
        let log = Arc::new(Mutex::new(Vec::new()));

        let (a, b, c) = (log.clone(), log.clone(), log.clone());
        let result = shutdown
            .execute(
                move || {
                    Box::pin(async move {
                        a.lock().unwrap().push("intake");
                    })
                },
                move || {
                    Box::pin(async move {
                        b.lock().unwrap().push("workers");
                        vec![("trader".to_string(), "SIGKILL failed".to_string())]
                    })
                },
                move || {
                    Box::pin(async move {
                        c.lock().unwrap().push("checkpoint");
                        Ok(())
                    })
                },
            )
            .await;

        assert_eq!(*log.lock().unwrap(), vec!["intake", "workers", "checkpoint"]);
        assert_eq!(
            result,
            Err(ShutdownError::WorkersFailed(vec!["trader".to_string()]))
        );
        assert_eq!(shutdown.current_phase(), ShutdownPhase::Complete);
    }
}
