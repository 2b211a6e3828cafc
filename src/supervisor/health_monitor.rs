//! Health Monitor
//!
//! Polls each registered worker's probe, keeps a bounded ring buffer of
//! samples per worker and classifies it healthy, degraded, unhealthy or
//! frozen. The monitor never starts or stops workers; it only emits
//! [`HealthEvent`]s.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::HealthConfig;
use crate::domain::{HealthClass, HealthSample};
use crate::worker::HealthProbe;

/// Samples considered when deciding healthy vs degraded
const RECENT_WINDOW: usize = 10;
/// Per-sample decay for the success ratio (newest weighs 1.0)
const SCORE_DECAY: f64 = 0.9;

/// Event emitted by the health monitor
#[derive(Debug, Clone)]
pub enum HealthEvent {
    /// Every recorded poll
    Sampled {
        sample: HealthSample,
        class: HealthClass,
        score: u8,
    },
    /// Consecutive failures crossed `unhealthy_after`
    Unhealthy {
        worker_id: String,
        consecutive_failures: u32,
        last_error: Option<String>,
    },
    /// No heartbeat for longer than the freeze threshold
    Frozen {
        worker_id: String,
        silent_for: Duration,
    },
    /// A failing worker passed `recovered_after` consecutive polls
    Recovered { worker_id: String },
}

impl HealthEvent {
    pub fn worker_id(&self) -> &str {
        match self {
            HealthEvent::Sampled { sample, .. } => &sample.worker_id,
            HealthEvent::Unhealthy { worker_id, .. }
            | HealthEvent::Frozen { worker_id, .. }
            | HealthEvent::Recovered { worker_id } => worker_id,
        }
    }
}

/// Published health view of one worker
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerHealth {
    pub worker_id: String,
    pub class: HealthClass,
    pub score: u8,
    pub consecutive_failures: u32,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub healthy_since: Option<DateTime<Utc>>,
    pub suspended: bool,
    pub sample_count: usize,
}

#[derive(Debug)]
struct Tracked {
    samples: VecDeque<HealthSample>,
    consecutive_failures: u32,
    consecutive_successes: u32,
    /// Latched on Unhealthy/Frozen until Recovered
    failing: bool,
    frozen: bool,
    class: HealthClass,
    score: u8,
    last_heartbeat: Instant,
    last_heartbeat_at: Option<DateTime<Utc>>,
    healthy_since: Option<Instant>,
    healthy_since_at: Option<DateTime<Utc>>,
    suspended: bool,
}

impl Tracked {
    fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            consecutive_failures: 0,
            consecutive_successes: 0,
            failing: false,
            frozen: false,
            class: HealthClass::Unknown,
            score: 0,
            last_heartbeat: Instant::now(),
            last_heartbeat_at: None,
            healthy_since: None,
            healthy_since_at: None,
            suspended: false,
        }
    }

    fn view(&self, worker_id: &str) -> WorkerHealth {
        WorkerHealth {
            worker_id: worker_id.to_string(),
            class: self.class,
            score: self.score,
            consecutive_failures: self.consecutive_failures,
            last_heartbeat_at: self.last_heartbeat_at,
            healthy_since: self.healthy_since_at,
            suspended: self.suspended,
            sample_count: self.samples.len(),
        }
    }
}

/// Health score in 0..=100: decayed success ratio (0.7) and latency (0.3)
pub fn health_score(samples: &VecDeque<HealthSample>, latency_budget_ms: u64) -> u8 {
    if samples.is_empty() {
        return 0;
    }

    let mut weight = 1.0;
    let mut total = 0.0;
    let mut ok = 0.0;
    for sample in samples.iter().rev() {
        total += weight;
        if sample.healthy {
            ok += weight;
        }
        weight *= SCORE_DECAY;
    }
    let ratio = ok / total;

    let recent: Vec<u64> = samples
        .iter()
        .rev()
        .take(RECENT_WINDOW)
        .filter(|s| s.healthy)
        .map(|s| s.latency_ms)
        .collect();
    let latency_factor = if recent.is_empty() {
        0.0
    } else {
        let avg = recent.iter().sum::<u64>() as f64 / recent.len() as f64;
        let budget = latency_budget_ms.max(1) as f64;
        1.0 - (avg / budget).min(1.0)
    };

    ((0.7 * ratio + 0.3 * latency_factor) * 100.0).round().clamp(0.0, 100.0) as u8
}

#[derive(Clone)]
struct Shared {
    config: Arc<HealthConfig>,
    workers: Arc<RwLock<HashMap<String, Tracked>>>,
    event_tx: broadcast::Sender<HealthEvent>,
}

impl Shared {
    fn freeze_threshold(&self) -> Duration {
        Duration::from_millis(self.config.freeze_threshold_ms)
    }

    fn emit(&self, event: HealthEvent) {
        // No subscribers is fine
        let _ = self.event_tx.send(event);
    }

    async fn record(&self, sample: HealthSample) {
        let mut events = Vec::new();
        {
            let mut workers = self.workers.write().await;
            let Some(t) = workers.get_mut(&sample.worker_id) else {
                debug!("Dropping sample for unregistered worker {}", sample.worker_id);
                return;
            };
            if t.suspended {
                return;
            }

            let now = Instant::now();
            if sample.healthy {
                t.consecutive_failures = 0;
                t.consecutive_successes += 1;
                t.last_heartbeat = now;
                t.last_heartbeat_at = Some(sample.timestamp);
                t.frozen = false;
                if t.healthy_since.is_none() {
                    t.healthy_since = Some(now);
                    t.healthy_since_at = Some(sample.timestamp);
                }
            } else {
                t.consecutive_successes = 0;
                t.consecutive_failures += 1;
                t.healthy_since = None;
                t.healthy_since_at = None;
            }

            if t.samples.len() >= self.config.buffer_size.max(1) {
                t.samples.pop_front();
            }
            t.samples.push_back(sample.clone());
            t.score = health_score(&t.samples, self.config.latency_budget_ms);

            if !t.failing && t.consecutive_failures >= self.config.unhealthy_after {
                t.failing = true;
                warn!(
                    "Worker {} unhealthy after {} consecutive failed polls",
                    sample.worker_id, t.consecutive_failures
                );
                events.push(HealthEvent::Unhealthy {
                    worker_id: sample.worker_id.clone(),
                    consecutive_failures: t.consecutive_failures,
                    last_error: sample.error.clone(),
                });
            }

            let silent_for = now.saturating_duration_since(t.last_heartbeat);
            if !t.frozen && silent_for > self.freeze_threshold() {
                t.frozen = true;
                t.failing = true;
                error!(
                    "Worker {} frozen: no heartbeat for {:?}",
                    sample.worker_id, silent_for
                );
                events.push(HealthEvent::Frozen {
                    worker_id: sample.worker_id.clone(),
                    silent_for,
                });
            }

            if t.failing && !t.frozen && t.consecutive_successes >= self.config.recovered_after {
                t.failing = false;
                info!("Worker {} recovered", sample.worker_id);
                events.push(HealthEvent::Recovered {
                    worker_id: sample.worker_id.clone(),
                });
            }

            t.class = classify(t, self.config.latency_budget_ms);
            events.insert(
                0,
                HealthEvent::Sampled {
                    sample,
                    class: t.class,
                    score: t.score,
                },
            );
        }

        for event in events {
            self.emit(event);
        }
    }
}

fn classify(t: &Tracked, latency_budget_ms: u64) -> HealthClass {
    if t.frozen {
        return HealthClass::Frozen;
    }
    if t.failing {
        return HealthClass::Unhealthy;
    }
    let Some(last) = t.samples.back() else {
        return HealthClass::Unknown;
    };
    let recent_failure = t.samples.iter().rev().take(RECENT_WINDOW).any(|s| !s.healthy);
    if !last.healthy || recent_failure || last.latency_ms > latency_budget_ms {
        HealthClass::Degraded
    } else {
        HealthClass::Healthy
    }
}

struct PollHandle {
    task: JoinHandle<()>,
    suspend_tx: watch::Sender<bool>,
}

pub struct HealthMonitor {
    shared: Shared,
    tasks: Mutex<HashMap<String, PollHandle>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        let (event_tx, _) = broadcast::channel(1024);
        Self {
            shared: Shared {
                config: Arc::new(config),
                workers: Arc::new(RwLock::new(HashMap::new())),
                event_tx,
            },
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.shared.config
    }

    /// Subscribe to health events
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Start polling `worker_id` immediately, replacing any existing poller
    pub async fn register_worker(
        &self,
        worker_id: &str,
        probe: Arc<dyn HealthProbe>,
        interval: Duration,
    ) {
        self.unregister_worker(worker_id).await;
        self.shared
            .workers
            .write()
            .await
            .insert(worker_id.to_string(), Tracked::new());

        let (suspend_tx, suspend_rx) = watch::channel(false);
        let task = tokio::spawn(poll_loop(
            self.shared.clone(),
            worker_id.to_string(),
            probe,
            interval,
            suspend_rx,
        ));

        self.tasks
            .lock()
            .await
            .insert(worker_id.to_string(), PollHandle { task, suspend_tx });
        info!("Health polling started for {} every {:?}", worker_id, interval);
    }

    /// Stop polling and forget the worker's samples
    pub async fn unregister_worker(&self, worker_id: &str) {
        if let Some(handle) = self.tasks.lock().await.remove(worker_id) {
            handle.task.abort();
            debug!("Health polling stopped for {}", worker_id);
        }
        self.shared.workers.write().await.remove(worker_id);
    }

    /// Pause polling without dropping history
    pub async fn suspend(&self, worker_id: &str) {
        if let Some(handle) = self.tasks.lock().await.get(worker_id) {
            let _ = handle.suspend_tx.send(true);
        }
        if let Some(t) = self.shared.workers.write().await.get_mut(worker_id) {
            t.suspended = true;
            t.class = HealthClass::Unknown;
            t.healthy_since = None;
            t.healthy_since_at = None;
        }
    }

    /// Resume polling; the freeze clock restarts from now
    pub async fn resume_polling(&self, worker_id: &str) {
        if let Some(t) = self.shared.workers.write().await.get_mut(worker_id) {
            t.suspended = false;
            t.consecutive_failures = 0;
            t.consecutive_successes = 0;
            t.last_heartbeat = Instant::now();
        }
        if let Some(handle) = self.tasks.lock().await.get(worker_id) {
            let _ = handle.suspend_tx.send(false);
        }
    }

    pub async fn is_polling(&self, worker_id: &str) -> bool {
        let tasks = self.tasks.lock().await;
        match tasks.get(worker_id) {
            Some(handle) => !handle.task.is_finished() && !*handle.suspend_tx.borrow(),
            None => false,
        }
    }

    /// Feed a sample directly (also used by the poll loop)
    pub async fn record_sample(&self, sample: HealthSample) {
        self.shared.record(sample).await;
    }

    pub async fn health_of(&self, worker_id: &str) -> Option<WorkerHealth> {
        self.shared
            .workers
            .read()
            .await
            .get(worker_id)
            .map(|t| t.view(worker_id))
    }

    pub async fn all_health(&self) -> Vec<WorkerHealth> {
        let workers = self.shared.workers.read().await;
        let mut out: Vec<_> = workers.iter().map(|(id, t)| t.view(id)).collect();
        out.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        out
    }

    pub async fn samples(&self, worker_id: &str) -> Vec<HealthSample> {
        self.shared
            .workers
            .read()
            .await
            .get(worker_id)
            .map(|t| t.samples.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// How long the worker has been continuously healthy
    pub async fn healthy_for(&self, worker_id: &str) -> Option<Duration> {
        let workers = self.shared.workers.read().await;
        let t = workers.get(worker_id)?;
        t.healthy_since.map(|since| since.elapsed())
    }

    /// Longest current healthy streak across all polled workers
    pub async fn longest_healthy_run(&self) -> Option<Duration> {
        let workers = self.shared.workers.read().await;
        workers
            .values()
            .filter(|t| !t.suspended)
            .filter_map(|t| t.healthy_since.map(|since| since.elapsed()))
            .max()
    }

    /// Abort every poll task
    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        for (_, handle) in tasks.drain() {
            handle.task.abort();
        }
    }
}

async fn poll_loop(
    shared: Shared,
    worker_id: String,
    probe: Arc<dyn HealthProbe>,
    interval: Duration,
    mut suspend_rx: watch::Receiver<bool>,
) {
    let poll_timeout = Duration::from_millis(shared.config.poll_timeout_ms);

    loop {
        if *suspend_rx.borrow() {
            if suspend_rx.changed().await.is_err() {
                return;
            }
            continue;
        }

        let started = Instant::now();
        let result = tokio::time::timeout(poll_timeout, probe.probe()).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let sample = match result {
            Ok(Ok(report)) => HealthSample::success(&worker_id, latency_ms, report),
            Ok(Err(e)) => HealthSample::failure(&worker_id, latency_ms, e.to_string()),
            Err(_) => HealthSample::failure(
                &worker_id,
                latency_ms,
                format!("health poll timed out after {:?}", poll_timeout),
            ),
        };
        shared.record(sample).await;

        // Next poll only after this one completed; a suspend interrupts the wait
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = suspend_rx.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProbeReport;
    use crate::error::WardenError;
    use crate::worker::MockHealthProbe;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn config() -> HealthConfig {
        HealthConfig {
            poll_interval_ms: 1_000,
            poll_timeout_ms: 500,
            freeze_threshold_ms: 6_500,
            unhealthy_after: 3,
            recovered_after: 2,
            buffer_size: 5,
            latency_budget_ms: 1_000,
        }
    }

    async fn registered(monitor: &HealthMonitor, id: &str) {
        monitor
            .shared
            .workers
            .write()
            .await
            .insert(id.to_string(), Tracked::new());
    }

    #[test]
    fn test_score_weights() {
        let mut samples = VecDeque::new();
        assert_eq!(health_score(&samples, 1_000), 0);

        samples.push_back(HealthSample::success("a", 0, ProbeReport::default()));
        assert_eq!(health_score(&samples, 1_000), 100);

        samples.push_back(HealthSample::failure("a", 0, "boom"));
        let score = health_score(&samples, 1_000);
        assert!(score < 70 && score > 30, "score {}", score);
    }

    #[tokio::test]
    async fn test_unhealthy_then_recovered_events() {
        let monitor = HealthMonitor::new(config());
        registered(&monitor, "a").await;
        let mut rx = monitor.subscribe();

        for _ in 0..3 {
            monitor.record_sample(HealthSample::failure("a", 10, "refused")).await;
        }
        let mut saw_unhealthy = false;
        while let Ok(ev) = rx.try_recv() {
            if let HealthEvent::Unhealthy { consecutive_failures, .. } = ev {
                assert_eq!(consecutive_failures, 3);
                saw_unhealthy = true;
            }
        }
        assert!(saw_unhealthy);
        assert_eq!(monitor.health_of("a").await.unwrap().class, HealthClass::Unhealthy);

        monitor.record_sample(HealthSample::success("a", 10, ProbeReport::default())).await;
        assert_eq!(monitor.health_of("a").await.unwrap().class, HealthClass::Unhealthy);
        monitor.record_sample(HealthSample::success("a", 10, ProbeReport::default())).await;

        let recovered = std::iter::from_fn(|| rx.try_recv().ok())
            .any(|ev| matches!(ev, HealthEvent::Recovered { .. }));
        assert!(recovered);
        assert_eq!(monitor.health_of("a").await.unwrap().class, HealthClass::Degraded);
    }

    #[tokio::test]
    async fn test_ring_buffer_evicts_oldest() {
        let monitor = HealthMonitor::new(config());
        registered(&monitor, "a").await;
        for i in 0..8u64 {
            monitor
                .record_sample(HealthSample::success("a", i, ProbeReport::default()))
                .await;
        }
        let samples = monitor.samples("a").await;
        assert_eq!(samples.len(), 5);
        assert_eq!(samples[0].latency_ms, 3);
        assert_eq!(samples[4].latency_ms, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_frozen_within_one_interval() {
        let monitor = HealthMonitor::new(config());
        let alive = Arc::new(AtomicBool::new(true));
        let flag = alive.clone();

        let mut probe = MockHealthProbe::new();
        probe.expect_probe().returning(move || {
            if flag.load(Ordering::SeqCst) {
                Ok(ProbeReport::default())
            } else {
                Err(WardenError::Timeout("hung".into()))
            }
        });

        let mut rx = monitor.subscribe();
        monitor
            .register_worker("a", Arc::new(probe), Duration::from_secs(1))
            .await;
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(monitor.health_of("a").await.unwrap().class, HealthClass::Healthy);

        // Last heartbeat at t=2s; threshold 6.5s; first poll after 8.5s is at t=9s
        alive.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(7_000)).await;

        assert_eq!(monitor.health_of("a").await.unwrap().class, HealthClass::Frozen);
        let frozen = std::iter::from_fn(|| rx.try_recv().ok())
            .any(|ev| matches!(ev, HealthEvent::Frozen { .. }));
        assert!(frozen);
        monitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_suspend_stops_sampling() {
        let monitor = HealthMonitor::new(config());
        let mut probe = MockHealthProbe::new();
        probe.expect_probe().returning(|| Ok(ProbeReport::default()));
        monitor
            .register_worker("a", Arc::new(probe), Duration::from_secs(1))
            .await;
        tokio::time::sleep(Duration::from_millis(1_500)).await;

        monitor.suspend("a").await;
        let before = monitor.samples("a").await.len();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(monitor.samples("a").await.len(), before);
        assert!(!monitor.is_polling("a").await);
        let health = monitor.health_of("a").await.unwrap();
        assert!(health.suspended);
        assert_eq!(health.class, HealthClass::Unknown);

        monitor.resume_polling("a").await;
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert!(monitor.samples("a").await.len() > before);
        assert!(monitor.is_polling("a").await);
        monitor.shutdown().await;
    }
}
