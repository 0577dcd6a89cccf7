//! The facade over every running pool.
//!
//! The coordinator:
//! - Starts and stops one [`ProcessPool`] per configuration name
//! - Routes checkouts to the best matching running configuration
//! - Tracks checked-out processes so runaway ones can be reaped
//! - Throttles how many processes start at once
//! - Keeps each pool topped up from the maintenance loop

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{debug, info, warn};
use warmpool_core::{
    CommandRequest, PoolConfiguration, PoolError, PoolResult, ProcessConfiguration,
};
use warmpool_runtime::{ManagedProcess, PoolStatus, ProcessHandle, ProcessPool, ProcessSpawner};

use crate::maintenance::{Maintainable, MaintenanceLoop};
use crate::routing::best_match;
use crate::status::{CommandResponse, CoordinatorStatus};

/// A checked-out process.
struct InUseEntry {
    configuration: String,
    handle: ProcessHandle,
}

struct CoordinatorInner {
    settings: PoolConfiguration,
    available: RwLock<BTreeMap<String, Arc<ProcessConfiguration>>>,
    spawner: Arc<dyn ProcessSpawner>,
    pools: RwLock<BTreeMap<String, Arc<ProcessPool>>>,
    startup_throttle: Arc<Semaphore>,
    /// In checkout order; reaped from the front.
    in_use: Mutex<VecDeque<InUseEntry>>,
    starts_requested: AtomicU64,
    shut_down: AtomicBool,
    maintenance: StdMutex<Option<MaintenanceLoop>>,
}

impl CoordinatorInner {
    async fn running_pools(&self) -> Vec<Arc<ProcessPool>> {
        self.pools.read().await.values().cloned().collect()
    }

    /// Start one process for `pool` on its own task, once a startup permit
    /// is free.
    fn spawn_replacement(&self, pool: Arc<ProcessPool>) {
        let throttle = self.startup_throttle.clone();
        self.starts_requested.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            // Closed when the coordinator shuts down.
            let Ok(_permit) = throttle.acquire_owned().await else {
                return;
            };
            match pool.start_process().await {
                Ok(()) => {}
                Err(PoolError::PoolStopped(_)) => {
                    debug!(configuration = %pool.name(), "pool stopped during startup");
                }
                Err(e) => {
                    warn!(configuration = %pool.name(), error = %e, "failed to start replacement process");
                }
            }
        });
    }

    fn fair_minimum(&self, pool_count: usize) -> usize {
        self.settings.minimum_available / pool_count.max(1) + 1
    }

    async fn target_size(&self, pool: &ProcessPool, pool_count: usize) -> usize {
        pool.target_size(
            self.settings.safety_multiplier,
            self.settings.maintenance_interval_ms,
            self.fair_minimum(pool_count),
            self.settings.maximum_available,
        )
        .await
    }

    async fn reap_overdue(&self, pools: &[Arc<ProcessPool>], now: Instant) {
        let mut idle_reaped = 0;
        for pool in pools {
            idle_reaped += pool.kill_overdue_processes(now).await;
        }

        let overdue: Vec<InUseEntry> = {
            let mut in_use = self.in_use.lock().await;
            let mut overdue = Vec::new();
            while in_use.front().is_some_and(|e| e.handle.is_overdue(now)) {
                if let Some(entry) = in_use.pop_front() {
                    overdue.push(entry);
                }
            }
            overdue
        };
        for entry in &overdue {
            warn!(
                configuration = %entry.configuration,
                pid = ?entry.handle.pid(),
                "killing overdue in-use process"
            );
            entry.handle.close();
        }

        if idle_reaped > 0 || !overdue.is_empty() {
            debug!(idle = idle_reaped, in_use = overdue.len(), "reaped overdue processes");
        }
    }

    async fn replenish(&self, pools: &[Arc<ProcessPool>]) {
        for pool in pools {
            if self.startup_throttle.available_permits() == 0 {
                break;
            }
            let target = self.target_size(pool, pools.len()).await;
            let supply = pool.available_count().await + pool.starting_count();
            if supply < target {
                debug!(configuration = %pool.name(), supply, target, "starting process to refill pool");
                self.spawn_replacement(pool.clone());
            }
        }
    }
}

impl Maintainable for CoordinatorInner {
    async fn do_maintenance(&self) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        let pools = self.running_pools().await;
        self.reap_overdue(&pools, Instant::now()).await;
        for pool in &pools {
            pool.update_demand_estimate(self.settings.moving_average_points)
                .await;
        }
        self.replenish(&pools).await;
    }
}

/// Owns every pool, the in-use registry and the startup throttle.
pub struct PoolCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl PoolCoordinator {
    /// Create a coordinator with no running pools and no maintenance loop.
    ///
    /// The configurations in `settings` become the available set.
    pub fn new(settings: PoolConfiguration, spawner: Arc<dyn ProcessSpawner>) -> Self {
        let available = settings
            .configurations
            .iter()
            .map(|(name, config)| (name.clone(), Arc::new(config.clone())))
            .collect();
        let startup_throttle = Arc::new(Semaphore::new(settings.startup_limit));
        Self {
            inner: Arc::new(CoordinatorInner {
                settings,
                available: RwLock::new(available),
                spawner,
                pools: RwLock::new(BTreeMap::new()),
                startup_throttle,
                in_use: Mutex::new(VecDeque::new()),
                starts_requested: AtomicU64::new(0),
                shut_down: AtomicBool::new(false),
                maintenance: StdMutex::new(None),
            }),
        }
    }

    /// Create a coordinator, start its maintenance loop, and start every
    /// configuration marked `auto_start`.
    pub async fn start(settings: PoolConfiguration, spawner: Arc<dyn ProcessSpawner>) -> Self {
        let coordinator = Self::new(settings, spawner);
        coordinator.start_maintenance();

        let auto_start: Vec<String> = coordinator
            .inner
            .available
            .read()
            .await
            .iter()
            .filter(|(_, config)| config.auto_start)
            .map(|(name, _)| name.clone())
            .collect();
        for name in auto_start {
            if let Err(e) = coordinator.start_configuration(&name).await {
                warn!(configuration = %name, error = %e, "auto-start failed");
            }
        }
        coordinator
    }

    /// Start the maintenance loop if it is not already running.
    pub fn start_maintenance(&self) {
        let mut slot = self
            .inner
            .maintenance
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(MaintenanceLoop::start(
                &self.inner,
                self.inner.settings.maintenance_interval(),
            ));
        }
    }

    pub fn settings(&self) -> &PoolConfiguration {
        &self.inner.settings
    }

    fn ensure_running(&self) -> PoolResult<()> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(PoolError::ShutDown);
        }
        Ok(())
    }

    /// How long a checkout may wait for an idle process.
    fn checkout_timeout(&self, config: &ProcessConfiguration) -> Duration {
        config.startup_timeout() + self.inner.settings.maintenance_interval()
    }

    async fn pool(&self, name: &str) -> Option<Arc<ProcessPool>> {
        self.inner.pools.read().await.get(name).cloned()
    }

    /// Start a pool for `name` unless one is already running.
    ///
    /// The pool starts empty; the maintenance loop and checkouts fill it.
    pub async fn start_configuration(&self, name: &str) -> PoolResult<()> {
        self.ensure_running()?;
        if self.inner.pools.read().await.contains_key(name) {
            return Ok(());
        }

        let config = self
            .process_configuration(name)
            .await
            .ok_or_else(|| PoolError::UnknownConfiguration(name.to_string()))?;
        let pool = Arc::new(ProcessPool::new(
            name,
            config.clone(),
            self.inner.spawner.clone(),
            self.checkout_timeout(&config),
        ));

        let mut pools = self.inner.pools.write().await;
        if pools.contains_key(name) {
            drop(pools);
            debug!(configuration = %name, "pool already started concurrently, discarding");
            pool.destroy().await;
            return Ok(());
        }
        pools.insert(name.to_string(), pool);
        info!(configuration = %name, "configuration started");
        Ok(())
    }

    /// Stop and destroy the pool for `name`. Returns false if none was running.
    pub async fn stop_configuration(&self, name: &str) -> bool {
        let removed = self.inner.pools.write().await.remove(name);
        match removed {
            Some(pool) => {
                pool.destroy().await;
                info!(configuration = %name, "configuration stopped");
                true
            }
            None => false,
        }
    }

    /// Names of running configurations, sorted.
    pub async fn running_configurations(&self) -> Vec<String> {
        self.inner.pools.read().await.keys().cloned().collect()
    }

    /// The running configuration that would serve `requested`.
    pub async fn best_matching_pool_name(&self, requested: Option<&str>) -> PoolResult<String> {
        let running = self.running_configurations().await;
        best_match(&running, requested)
            .map(str::to_string)
            .ok_or(PoolError::NoRunningConfigurations)
    }

    async fn checkout(&self, requested: Option<&str>) -> PoolResult<(String, ManagedProcess)> {
        self.ensure_running()?;
        let name = self.best_matching_pool_name(requested).await?;
        let pool = self
            .pool(&name)
            .await
            .ok_or_else(|| PoolError::NotRunning(name.clone()))?;

        // Replace the process we are about to take.
        if self.inner.startup_throttle.available_permits() > 0 {
            self.inner.spawn_replacement(pool.clone());
        }

        let process = pool.get_process().await?;
        self.inner.in_use.lock().await.push_back(InUseEntry {
            configuration: name.clone(),
            handle: process.handle(),
        });
        process.activate();
        debug!(configuration = %name, pid = ?process.pid(), "process checked out");
        Ok((name, process))
    }

    /// Take an idle process from the best matching pool and activate it.
    ///
    /// Hand it back with [`PoolCoordinator::release`] once done.
    pub async fn get_process(&self, requested: Option<&str>) -> PoolResult<ManagedProcess> {
        self.checkout(requested).await.map(|(_, process)| process)
    }

    /// Forget a checked-out process and kill it.
    pub async fn release(&self, process: &mut ManagedProcess) {
        let handle = process.handle();
        self.inner
            .in_use
            .lock()
            .await
            .retain(|entry| !entry.handle.same_process(&handle));
        process.kill().await;
    }

    /// Check out a process, run one command, collect its output and files,
    /// and release the process.
    ///
    /// A command that runs out of time is reported through the response
    /// status, not as an error.
    pub async fn execute(&self, request: &CommandRequest) -> PoolResult<CommandResponse> {
        let (configuration, mut process) = self.checkout(request.configuration.as_deref()).await?;

        let status = process
            .execute(
                &request.command,
                Duration::from_millis(request.timeout_ms()),
                request.plot_url_base.as_deref().unwrap_or_default(),
            )
            .await;
        let output = process.output();
        let files = process.take_generated_files();
        self.release(&mut process).await;

        debug!(configuration = %configuration, status = ?status, "command finished");
        Ok(CommandResponse {
            configuration,
            status,
            output,
            files,
        })
    }

    /// Start a process for `name` on the current task, outside any pool.
    pub async fn make_process(&self, name: &str) -> PoolResult<ManagedProcess> {
        self.ensure_running()?;
        let pool = self
            .pool(name)
            .await
            .ok_or_else(|| PoolError::NotRunning(name.to_string()))?;
        pool.make_process().await
    }

    /// One maintenance cycle: reap overdue processes, refresh estimates, and
    /// start processes for pools below target.
    pub async fn do_maintenance(&self) {
        self.inner.do_maintenance().await;
    }

    pub async fn in_use_count(&self) -> usize {
        self.inner.in_use.lock().await.len()
    }

    /// Startup permits currently held.
    pub fn processes_starting(&self) -> usize {
        self.inner
            .settings
            .startup_limit
            .saturating_sub(self.inner.startup_throttle.available_permits())
    }

    pub async fn status(&self) -> CoordinatorStatus {
        let pools = self.inner.running_pools().await;
        let mut pool_statuses = Vec::with_capacity(pools.len());
        for pool in &pools {
            let mut status = pool.status().await;
            status.target_size = Some(self.inner.target_size(pool, pools.len()).await);
            pool_statuses.push(status);
        }
        CoordinatorStatus {
            processes_starting: self.processes_starting(),
            processes_in_use: self.in_use_count().await,
            total_started: self.inner.starts_requested.load(Ordering::SeqCst),
            running_configurations: pools.iter().map(|p| p.name().to_string()).collect(),
            pools: pool_statuses,
        }
    }

    pub async fn pool_status(&self, name: &str) -> PoolResult<PoolStatus> {
        let pool = self
            .pool(name)
            .await
            .ok_or_else(|| PoolError::NotRunning(name.to_string()))?;
        let pool_count = self.inner.pools.read().await.len();
        let mut status = pool.status().await;
        status.target_size = Some(self.inner.target_size(&pool, pool_count).await);
        Ok(status)
    }

    /// Human-readable pool settings.
    pub fn describe_configuration(&self) -> Vec<(String, String)> {
        self.inner.settings.describe()
    }

    pub async fn available_configurations(&self) -> BTreeMap<String, Arc<ProcessConfiguration>> {
        self.inner.available.read().await.clone()
    }

    /// Replace the available configurations in one swap. Running pools keep
    /// the configuration they were started with.
    pub async fn set_available_configurations(
        &self,
        configurations: BTreeMap<String, ProcessConfiguration>,
    ) {
        let configurations: BTreeMap<_, _> = configurations
            .into_iter()
            .map(|(name, config)| (name, Arc::new(config)))
            .collect();
        let count = configurations.len();
        *self.inner.available.write().await = configurations;
        info!(count, "available configurations replaced");
    }

    pub async fn process_configuration(&self, name: &str) -> Option<Arc<ProcessConfiguration>> {
        self.inner.available.read().await.get(name).cloned()
    }

    /// Whether the running pool for `name` still matches the available
    /// configuration of that name.
    pub async fn is_configuration_current(&self, name: &str) -> PoolResult<bool> {
        let pool = self
            .pool(name)
            .await
            .ok_or_else(|| PoolError::NotRunning(name.to_string()))?;
        Ok(self
            .process_configuration(name)
            .await
            .is_some_and(|available| *available == **pool.configuration()))
    }

    /// Stop maintenance, destroy every pool and kill every in-use process.
    /// The coordinator refuses all further work.
    pub async fn destroy(&self) {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let maintenance = self
            .inner
            .maintenance
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(maintenance) = maintenance {
            maintenance.stop().await;
        }
        self.inner.startup_throttle.close();

        let pools = std::mem::take(&mut *self.inner.pools.write().await);
        for pool in pools.into_values() {
            pool.destroy().await;
        }

        let in_use: Vec<InUseEntry> = self.inner.in_use.lock().await.drain(..).collect();
        for entry in &in_use {
            entry.handle.close();
        }
        info!(killed_in_use = in_use.len(), "coordinator destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warmpool_core::ExecutionStatus;
    use warmpool_runtime::testing::{FakeBehaviour, FakeSpawner};

    fn settings(names: &[&str]) -> PoolConfiguration {
        let configurations = names
            .iter()
            .map(|name| {
                (
                    name.to_string(),
                    ProcessConfiguration {
                        startup_timeout_ms: 1000,
                        ..Default::default()
                    },
                )
            })
            .collect();
        PoolConfiguration {
            minimum_available: 2,
            maintenance_interval_ms: 20,
            configurations,
            ..Default::default()
        }
    }

    fn coordinator(names: &[&str]) -> (PoolCoordinator, FakeSpawner) {
        let spawner = FakeSpawner::new(FakeBehaviour::Interpreter);
        let coordinator = PoolCoordinator::new(settings(names), Arc::new(spawner.clone()));
        (coordinator, spawner)
    }

    async fn wait_until<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn checkout_after_start_succeeds() {
        let (coordinator, spawner) = coordinator(&["v1"]);
        coordinator.start_configuration("v1").await.unwrap();

        let mut process = coordinator.get_process(Some("v1")).await.unwrap();
        assert_eq!(coordinator.in_use_count().await, 1);
        assert!(spawner.spawned() >= 1);

        coordinator.release(&mut process).await;
        assert_eq!(coordinator.in_use_count().await, 0);
        coordinator.destroy().await;
    }

    #[tokio::test]
    async fn execute_runs_command() {
        let (coordinator, _) = coordinator(&["v1"]);
        coordinator.start_configuration("v1").await.unwrap();

        let response = coordinator
            .execute(&CommandRequest::new("1+1;").with_timeout_ms(5000))
            .await
            .unwrap();
        assert_eq!(response.configuration, "v1");
        assert_eq!(response.status, ExecutionStatus::Completed);
        assert!(response.output.contains('2'));
        assert_eq!(coordinator.in_use_count().await, 0);
        coordinator.destroy().await;
    }

    #[tokio::test]
    async fn execute_reports_timeout_as_status() {
        let spawner = FakeSpawner::new(FakeBehaviour::Hangs);
        let coordinator = PoolCoordinator::new(settings(&["v1"]), Arc::new(spawner));
        coordinator.start_configuration("v1").await.unwrap();

        let response = coordinator
            .execute(&CommandRequest::new("loop;").with_timeout_ms(50))
            .await
            .unwrap();
        assert_eq!(response.status, ExecutionStatus::TimedOut);
        coordinator.destroy().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_starts_leave_one_pool() {
        let (coordinator, _) = coordinator(&["v1"]);
        let coordinator = Arc::new(coordinator);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.start_configuration("v1").await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(coordinator.running_configurations().await, vec!["v1"]);
        coordinator.destroy().await;
    }

    #[tokio::test]
    async fn routes_to_latest_older_configuration() {
        let (coordinator, _) = coordinator(&["v1", "v2", "v3"]);
        coordinator.start_configuration("v1").await.unwrap();
        coordinator.start_configuration("v2").await.unwrap();

        assert_eq!(
            coordinator.best_matching_pool_name(Some("v3")).await.unwrap(),
            "v2"
        );
        assert_eq!(coordinator.best_matching_pool_name(None).await.unwrap(), "v1");

        let response = coordinator
            .execute(&CommandRequest::new("1+1;").with_configuration("v3"))
            .await
            .unwrap();
        assert_eq!(response.configuration, "v2");
        coordinator.destroy().await;
    }

    #[tokio::test]
    async fn checkout_errors() {
        let (coordinator, _) = coordinator(&["v1"]);
        assert!(matches!(
            coordinator.get_process(None).await,
            Err(PoolError::NoRunningConfigurations)
        ));
        assert!(matches!(
            coordinator.start_configuration("nope").await,
            Err(PoolError::UnknownConfiguration(name)) if name == "nope"
        ));
        assert!(matches!(
            coordinator.make_process("v1").await,
            Err(PoolError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn stop_configuration_removes_pool() {
        let (coordinator, _) = coordinator(&["v1"]);
        coordinator.start_configuration("v1").await.unwrap();
        assert!(coordinator.stop_configuration("v1").await);
        assert!(!coordinator.stop_configuration("v1").await);
        assert!(coordinator.running_configurations().await.is_empty());
    }

    #[tokio::test]
    async fn maintenance_fills_pool_to_fair_share() {
        // No demand term, so the target is the fair share alone.
        let settings = PoolConfiguration {
            safety_multiplier: 0.0,
            ..settings(&["v1"])
        };
        let coordinator =
            PoolCoordinator::new(settings, Arc::new(FakeSpawner::new(FakeBehaviour::Interpreter)));
        coordinator.start_configuration("v1").await.unwrap();
        // minimum 2 across one pool: 2 / 1 + 1.
        let target = 3;

        for expected in 1..=target {
            coordinator.do_maintenance().await;
            let status_ready = || async {
                coordinator.pool_status("v1").await.unwrap().ready == expected
            };
            assert!(wait_until(status_ready).await, "pool never reached {expected}");
        }

        coordinator.do_maintenance().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let status = coordinator.pool_status("v1").await.unwrap();
        assert_eq!(status.ready, target);
        assert_eq!(status.target_size, Some(target));
        coordinator.destroy().await;
    }

    #[tokio::test]
    async fn overdue_in_use_process_is_reaped() {
        let mut settings = settings(&["v1"]);
        if let Some(config) = settings.configurations.get_mut("v1") {
            config.maximum_lifetime_ms = 20;
            config.execution_timeout_ms = 0;
        }
        let coordinator =
            PoolCoordinator::new(settings, Arc::new(FakeSpawner::new(FakeBehaviour::Interpreter)));
        coordinator.start_configuration("v1").await.unwrap();

        let process = coordinator.get_process(Some("v1")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        coordinator.do_maintenance().await;

        assert_eq!(coordinator.in_use_count().await, 0);
        assert!(process.was_killed());
        coordinator.destroy().await;
    }

    #[tokio::test]
    async fn drift_is_detected_after_rescan() {
        let (coordinator, _) = coordinator(&["v1"]);
        coordinator.start_configuration("v1").await.unwrap();
        assert!(coordinator.is_configuration_current("v1").await.unwrap());

        let mut changed = coordinator.settings().configurations.clone();
        if let Some(config) = changed.get_mut("v1") {
            config.execution_timeout_ms += 1;
        }
        coordinator.set_available_configurations(changed).await;
        assert!(!coordinator.is_configuration_current("v1").await.unwrap());

        coordinator.set_available_configurations(BTreeMap::new()).await;
        assert!(!coordinator.is_configuration_current("v1").await.unwrap());
        assert!(coordinator.available_configurations().await.is_empty());
        coordinator.destroy().await;
    }

    #[tokio::test]
    async fn destroy_kills_in_use_and_refuses_work() {
        let (coordinator, _) = coordinator(&["v1"]);
        coordinator.start_configuration("v1").await.unwrap();
        let process = coordinator.get_process(None).await.unwrap();

        coordinator.destroy().await;
        coordinator.destroy().await;
        assert!(process.was_killed());
        assert!(coordinator.running_configurations().await.is_empty());
        assert!(matches!(
            coordinator.start_configuration("v1").await,
            Err(PoolError::ShutDown)
        ));
        assert!(matches!(
            coordinator.get_process(None).await,
            Err(PoolError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn auto_start_and_background_maintenance() {
        let mut settings = settings(&["auto", "manual"]);
        if let Some(config) = settings.configurations.get_mut("auto") {
            config.auto_start = true;
        }
        let coordinator = PoolCoordinator::start(
            settings,
            Arc::new(FakeSpawner::new(FakeBehaviour::Interpreter)),
        )
        .await;
        assert_eq!(coordinator.running_configurations().await, vec!["auto"]);

        let filled = || async { coordinator.pool_status("auto").await.unwrap().ready >= 1 };
        assert!(wait_until(filled).await);

        let status = coordinator.status().await;
        assert!(status.total_started >= 1);
        assert_eq!(status.pools.len(), 1);
        coordinator.destroy().await;
    }
}
