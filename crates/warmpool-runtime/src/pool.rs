//! Ready processes for one configuration.
//!
//! The pool owns an idle queue of started, paused processes. Callers block on
//! [`ProcessPool::get_process`] until one is available; background tasks feed
//! the queue through [`ProcessPool::start_process`]. Every checkout and every
//! startup is recorded so the coordinator can size the pool to demand.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};
use warmpool_core::{PoolError, PoolResult, ProcessConfiguration};

use crate::process::ManagedProcess;
use crate::spawn::ProcessSpawner;
use crate::stats::{DemandTracker, clock_time, epoch_millis};

/// A point-in-time view of one pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub configuration: String,
    pub ready: usize,
    pub starting: usize,
    pub total_started: u64,
    pub demand_estimate_hz: f64,
    pub startup_estimate_ms: u64,
    pub recent_startups_ms: Vec<u64>,
    /// `HH:MM:SS` (UTC) of recent checkouts.
    pub recent_requests: Vec<String>,
    /// Idle size the maintenance cycle aims for, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_size: Option<usize>,
}

impl PoolStatus {
    /// Human-readable name/value pairs.
    pub fn describe(&self) -> Vec<(String, String)> {
        let startups = self
            .recent_startups_ms
            .iter()
            .map(|ms| format!("{ms} ms"))
            .collect::<Vec<_>>()
            .join(" ");
        let mut values = vec![
            ("Ready processes in the pool".to_string(), self.ready.to_string()),
            ("Processes starting up".into(), self.starting.to_string()),
            ("Total processes started".into(), self.total_started.to_string()),
            (
                "Current demand estimate".into(),
                format!("{} Hz", self.demand_estimate_hz),
            ),
            (
                "Current start-up time estimate".into(),
                format!("{} ms", self.startup_estimate_ms),
            ),
            ("Recent start-up times".into(), startups),
            ("Recent request times".into(), self.recent_requests.join(" ")),
        ];
        if let Some(target) = self.target_size {
            values.push(("Target pool size".into(), target.to_string()));
        }
        values
    }
}

/// Decrements the starting counter however a startup ends.
struct StartingGuard<'a>(&'a AtomicUsize);

impl<'a> StartingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for StartingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Idle processes for a single configuration plus its demand statistics.
pub struct ProcessPool {
    name: String,
    config: Arc<ProcessConfiguration>,
    spawner: Arc<dyn ProcessSpawner>,
    checkout_timeout: Duration,
    available: Mutex<VecDeque<ManagedProcess>>,
    available_changed: Notify,
    stats: Mutex<DemandTracker>,
    started_count: AtomicU64,
    starting: AtomicUsize,
    stopped: AtomicBool,
}

impl ProcessPool {
    /// Create an empty pool. Statistics are seeded from the configuration's
    /// initial estimates.
    pub fn new(
        name: impl Into<String>,
        config: Arc<ProcessConfiguration>,
        spawner: Arc<dyn ProcessSpawner>,
        checkout_timeout: Duration,
    ) -> Self {
        let stats = DemandTracker::new(
            config.startup_time_initial_estimate_ms,
            config.demand_initial_estimate_hz,
            epoch_millis(),
        );
        Self {
            name: name.into(),
            config,
            spawner,
            checkout_timeout,
            available: Mutex::new(VecDeque::new()),
            available_changed: Notify::new(),
            stats: Mutex::new(stats),
            started_count: AtomicU64::new(0),
            starting: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn configuration(&self) -> &Arc<ProcessConfiguration> {
        &self.config
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Take the oldest idle process, waiting for one if the queue is empty.
    ///
    /// The request counts towards the demand estimate even if it fails.
    pub async fn get_process(&self) -> PoolResult<ManagedProcess> {
        self.stats.lock().await.record_request(epoch_millis());
        let deadline = Instant::now() + self.checkout_timeout;

        loop {
            let notified = self.available_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_stopped() {
                return Err(PoolError::PoolStopped(self.name.clone()));
            }
            if let Some(process) = self.available.lock().await.pop_front() {
                return Ok(process);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline.into()) => {
                    debug!(configuration = %self.name, "no idle process before checkout deadline");
                    return Err(PoolError::CheckoutTimeout(self.name.clone()));
                }
            }
        }
    }

    /// Start one process, record how long it took, and park it in the idle
    /// queue. Runs until the process is ready or fails.
    pub async fn start_process(&self) -> PoolResult<()> {
        if self.is_stopped() {
            return Err(PoolError::PoolStopped(self.name.clone()));
        }
        let _starting = StartingGuard::enter(&self.starting);
        self.started_count.fetch_add(1, Ordering::SeqCst);

        let started = Instant::now();
        let mut process = ManagedProcess::start(self.config.clone(), self.spawner.as_ref()).await?;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.stats.lock().await.record_startup(elapsed_ms);
        process.deactivate();

        let mut available = self.available.lock().await;
        if self.is_stopped() {
            drop(available);
            process.kill().await;
            return Err(PoolError::PoolStopped(self.name.clone()));
        }
        available.push_back(process);
        let ready = available.len();
        drop(available);

        self.available_changed.notify_waiters();
        debug!(configuration = %self.name, elapsed_ms, ready, "process added to pool");
        Ok(())
    }

    /// Start a process outside the idle queue.
    pub async fn make_process(&self) -> PoolResult<ManagedProcess> {
        ManagedProcess::start(self.config.clone(), self.spawner.as_ref()).await
    }

    /// Kill idle processes from the front of the queue while they are
    /// overdue at `now`. Returns how many were killed.
    pub async fn kill_overdue_processes(&self, now: Instant) -> usize {
        let mut overdue = Vec::new();
        {
            let mut available = self.available.lock().await;
            while available.front().is_some_and(|p| p.is_overdue(now)) {
                if let Some(process) = available.pop_front() {
                    overdue.push(process);
                }
            }
        }

        let killed = overdue.len();
        for mut process in overdue {
            process.kill().await;
        }
        if killed > 0 {
            debug!(configuration = %self.name, killed, "reaped overdue idle processes");
        }
        killed
    }

    /// Refresh the startup and demand estimates over the last `window`
    /// samples.
    pub async fn update_demand_estimate(&self, window: usize) {
        self.stats.lock().await.update(window, epoch_millis());
    }

    pub async fn demand_estimate_hz(&self) -> f64 {
        self.stats.lock().await.demand_estimate_hz()
    }

    pub async fn startup_estimate_ms(&self) -> u64 {
        self.stats.lock().await.startup_estimate_ms()
    }

    /// Idle size worth keeping for the current demand, within `[min, max]`.
    pub async fn target_size(&self, safety: f64, interval_ms: u64, min: usize, max: usize) -> usize {
        self.stats
            .lock()
            .await
            .target_size(safety, interval_ms, min, max)
    }

    pub async fn available_count(&self) -> usize {
        self.available.lock().await.len()
    }

    /// Processes currently between spawn and readiness.
    pub fn starting_count(&self) -> usize {
        self.starting.load(Ordering::SeqCst)
    }

    pub fn started_count(&self) -> u64 {
        self.started_count.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> PoolStatus {
        let ready = self.available_count().await;
        let stats = self.stats.lock().await;
        PoolStatus {
            configuration: self.name.clone(),
            ready,
            starting: self.starting_count(),
            total_started: self.started_count(),
            demand_estimate_hz: stats.demand_estimate_hz(),
            startup_estimate_ms: stats.startup_estimate_ms(),
            recent_startups_ms: stats.recent_startups_ms(),
            recent_requests: stats
                .recent_requests_ms()
                .into_iter()
                .map(clock_time)
                .collect(),
            target_size: None,
        }
    }

    /// Kill every idle process and refuse further use. Waiting callers get
    /// [`PoolError::PoolStopped`].
    pub async fn destroy(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let idle: Vec<ManagedProcess> = self.available.lock().await.drain(..).collect();
        let killed = idle.len();
        for mut process in idle {
            process.kill().await;
        }
        self.available_changed.notify_waiters();
        info!(configuration = %self.name, killed, "pool destroyed");
    }
}
