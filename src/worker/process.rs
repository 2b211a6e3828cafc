//! OS process worker
//!
//! Limits, safe-mode flag and the restore file reach the child through
//! `WARDEN_*` environment variables. Stop sends SIGTERM and escalates to
//! SIGKILL after the stop timeout; pause/resume use SIGSTOP/SIGCONT.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{HttpProbe, LaunchContext, Worker};
use crate::domain::{ProbeReport, WorkerDescriptor};
use crate::error::{Result, WardenError};
use crate::persistence::Checkpoint;

pub struct ProcessWorker {
    id: String,
    command: String,
    args: Vec<String>,
    probe: Option<HttpProbe>,
    probe_error: Option<String>,
    restore_dir: PathBuf,
    child: Mutex<Option<Child>>,
    /// Passed to every launch until one answers a health check
    restore_file: Mutex<Option<PathBuf>>,
}

impl ProcessWorker {
    pub fn new(descriptor: &WorkerDescriptor, probe_timeout: Duration, restore_dir: PathBuf) -> Self {
        let (probe, probe_error) = match descriptor.health_url.as_deref() {
            Some(url) => match HttpProbe::new(url, probe_timeout) {
                Ok(p) => (Some(p), None),
                Err(e) => (None, Some(e.to_string())),
            },
            None => (None, None),
        };

        Self {
            id: descriptor.id.clone(),
            command: descriptor.command.clone(),
            args: descriptor.args.clone(),
            probe,
            probe_error,
            restore_dir,
            child: Mutex::new(None),
            restore_file: Mutex::new(None),
        }
    }

    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(|c| c.id())
    }

    fn failure(&self, reason: impl Into<String>) -> WardenError {
        WardenError::WorkerFailure {
            worker_id: self.id.clone(),
            reason: reason.into(),
        }
    }

    #[cfg(unix)]
    fn signal(&self, pid: u32, sig: nix::sys::signal::Signal) -> Result<()> {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        kill(Pid::from_raw(pid as i32), sig)
            .map_err(|e| self.failure(format!("signal {:?} failed: {}", sig, e)))
    }

    #[cfg(unix)]
    fn terminate(&self, child: &mut Child) -> Result<()> {
        use nix::sys::signal::Signal;

        if let Some(pid) = child.id() {
            // A stopped process ignores SIGTERM until continued
            let _ = self.signal(pid, Signal::SIGCONT);
            self.signal(pid, Signal::SIGTERM)?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn terminate(&self, child: &mut Child) -> Result<()> {
        Ok(child.start_kill()?)
    }

    #[cfg(unix)]
    fn suspend(&self, pid: u32) -> Result<()> {
        self.signal(pid, nix::sys::signal::Signal::SIGSTOP)
    }

    #[cfg(unix)]
    fn cont(&self, pid: u32) -> Result<()> {
        self.signal(pid, nix::sys::signal::Signal::SIGCONT)
    }

    #[cfg(not(unix))]
    fn suspend(&self, _pid: u32) -> Result<()> {
        Err(self.failure("pause is not supported on this platform"))
    }

    #[cfg(not(unix))]
    fn cont(&self, _pid: u32) -> Result<()> {
        Err(self.failure("resume is not supported on this platform"))
    }
}

#[async_trait]
impl Worker for ProcessWorker {
    async fn initialize(&self, _ctx: &LaunchContext) -> Result<()> {
        if let Some(err) = &self.probe_error {
            return Err(WardenError::InvalidConfig(format!(
                "worker {} health probe: {}",
                self.id, err
            )));
        }
        Ok(())
    }

    async fn start(&self, ctx: &LaunchContext) -> Result<()> {
        let mut guard = self.child.lock().await;
        if let Some(child) = guard.as_mut() {
            if child.try_wait()?.is_none() {
                return Err(WardenError::AlreadyRunning(self.id.clone()));
            }
        }

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .env("WARDEN_WORKER_ID", &self.id)
            .env(
                "WARDEN_MAX_DAILY_LOSS_USD",
                ctx.limits.max_daily_loss_usd.to_string(),
            )
            .env("WARDEN_MAX_POSITION_USD", ctx.limits.max_position_usd.to_string())
            .env(
                "WARDEN_MAX_ORDERS_PER_MINUTE",
                ctx.limits.max_orders_per_minute.to_string(),
            )
            .env("WARDEN_SAFE_MODE", if ctx.safe_mode { "1" } else { "0" })
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(path) = self.restore_file.lock().await.as_ref() {
            cmd.env("WARDEN_RESTORE_FILE", path);
        }

        let child = cmd.spawn()?;
        info!(
            "Spawned worker {} (pid {:?}, safe_mode={})",
            self.id,
            child.id(),
            ctx.safe_mode
        );
        *guard = Some(child);
        Ok(())
    }

    async fn stop(&self, timeout: Duration) -> Result<()> {
        let mut guard = self.child.lock().await;
        let Some(mut child) = guard.take() else {
            return Ok(());
        };

        if child.try_wait()?.is_some() {
            return Ok(());
        }

        if let Err(e) = self.terminate(&mut child) {
            warn!("{}", e);
        }

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => {
                debug!("Worker {} exited: {:?}", self.id, status?);
                Ok(())
            }
            Err(_) => {
                warn!(
                    "Worker {} did not exit within {:?}, killing",
                    self.id, timeout
                );
                child.kill().await?;
                Ok(())
            }
        }
    }

    async fn pause(&self) -> Result<()> {
        let pid = self
            .pid()
            .await
            .ok_or_else(|| WardenError::NotRunning(self.id.clone()))?;
        self.suspend(pid)
    }

    async fn resume(&self) -> Result<()> {
        let pid = self
            .pid()
            .await
            .ok_or_else(|| WardenError::NotRunning(self.id.clone()))?;
        self.cont(pid)
    }

    async fn restore(&self, checkpoint: &Checkpoint) -> Result<()> {
        tokio::fs::create_dir_all(&self.restore_dir).await?;
        let path = self.restore_dir.join(format!("{}.restore.json", self.id));
        let body = serde_json::to_vec_pretty(&checkpoint.payload)?;
        tokio::fs::write(&path, body).await?;
        debug!(
            "Restore file for {} written from checkpoint {}",
            self.id, checkpoint.id
        );
        *self.restore_file.lock().await = Some(path);
        Ok(())
    }

    async fn health_check(&self) -> Result<ProbeReport> {
        {
            let mut guard = self.child.lock().await;
            match guard.as_mut() {
                None => return Err(WardenError::NotRunning(self.id.clone())),
                Some(child) => {
                    if let Some(status) = child.try_wait()? {
                        return Err(self.failure(format!("process exited: {}", status)));
                    }
                }
            }
        }

        let report = match &self.probe {
            Some(probe) => probe.check().await?,
            None => ProbeReport::default(),
        };

        // The launch that answered has loaded the restored state
        if let Some(path) = self.restore_file.lock().await.take() {
            debug!("Worker {} is up; restore file {} consumed", self.id, path.display());
        }
        Ok(report)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domain::WorkerLimits;

    fn ctx() -> LaunchContext {
        LaunchContext {
            limits: WorkerLimits::default(),
            safe_mode: false,
        }
    }

    fn sleeper(dir: &std::path::Path) -> ProcessWorker {
        let mut desc = WorkerDescriptor::new("sleeper", "sleep");
        desc.args = vec!["30".to_string()];
        ProcessWorker::new(&desc, Duration::from_secs(1), dir.to_path_buf())
    }

    #[tokio::test]
    async fn test_start_check_stop() {
        let dir = tempfile::tempdir().unwrap();
        let worker = sleeper(dir.path());

        worker.start(&ctx()).await.unwrap();
        assert!(worker.pid().await.is_some());
        assert!(worker.health_check().await.is_ok());
        assert!(matches!(
            worker.start(&ctx()).await,
            Err(WardenError::AlreadyRunning(_))
        ));

        worker.stop(Duration::from_secs(5)).await.unwrap();
        assert!(worker.pid().await.is_none());
        assert!(matches!(
            worker.health_check().await,
            Err(WardenError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_exited_process_is_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        let desc = WorkerDescriptor::new("oneshot", "true");
        let worker = ProcessWorker::new(&desc, Duration::from_secs(1), dir.path().to_path_buf());

        worker.start(&ctx()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(matches!(
            worker.health_check().await,
            Err(WardenError::WorkerFailure { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_binary_is_not_transient() {
        let dir = tempfile::tempdir().unwrap();
        let desc = WorkerDescriptor::new("ghost", "/nonexistent/botwarden-worker");
        let worker = ProcessWorker::new(&desc, Duration::from_secs(1), dir.path().to_path_buf());

        let err = worker.start(&ctx()).await.unwrap_err();
        assert!(!err.is_transient());
    }

    async fn lines_eventually(path: &std::path::Path, n: usize) -> Vec<String> {
        for _ in 0..100 {
            if let Ok(body) = tokio::fs::read_to_string(path).await {
                let lines: Vec<String> = body.lines().map(str::to_string).collect();
                if lines.len() >= n {
                    return lines;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{} never reached {} line(s)", path.display(), n);
    }

    #[tokio::test]
    async fn test_restore_file_survives_failed_launch() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("launches.log");
        let mut desc = WorkerDescriptor::new("trader", "sh");
        desc.args = vec![
            "-c".to_string(),
            format!("echo \"[$WARDEN_RESTORE_FILE]\" >> {}; sleep 30", log.display()),
        ];
        let worker = ProcessWorker::new(&desc, Duration::from_secs(1), dir.path().join("restore"));

        let checkpoint = Checkpoint::new(
            "worker.trader",
            serde_json::json!({"positions": ["BTC-UP"]}),
            Default::default(),
        )
        .unwrap();
        worker.restore(&checkpoint).await.unwrap();
        let restore_path = dir.path().join("restore").join("trader.restore.json");
        let expected = format!("[{}]", restore_path.display());

        // First launch is torn down before it ever reports healthy
        worker.start(&ctx()).await.unwrap();
        lines_eventually(&log, 1).await;
        worker.stop(Duration::from_secs(5)).await.unwrap();

        worker.start(&ctx()).await.unwrap();
        let lines = lines_eventually(&log, 2).await;
        assert_eq!(lines, vec![expected.clone(), expected.clone()]);

        // Once a launch answers, later launches start fresh
        worker.health_check().await.unwrap();
        worker.stop(Duration::from_secs(5)).await.unwrap();
        worker.start(&ctx()).await.unwrap();
        let lines = lines_eventually(&log, 3).await;
        assert_eq!(lines[2], "[]");
        worker.stop(Duration::from_secs(5)).await.unwrap();
    }
}
