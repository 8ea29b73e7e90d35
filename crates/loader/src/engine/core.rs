use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use preload_core::{LoadError, LoaderConfig, Result};
use preload_queue::AbandonedThreadBudget;
use tracing::info;

use crate::class::ClassHandle;
use crate::dependent::DependentLoadingTaskSpawner;
use crate::engine::pool::ThreadPoolHolder;
use crate::engine::EngineShared;
use crate::monitor::{DependentKeyIndexMonitor, TaskMonitor, ThreadPoolMonitor};
use crate::runner::{LoadingTaskRunner, RunnerState};
use crate::syslog::ReplicaLogProbe;
use crate::task::{LoadOperation, LoadingTask, PostLoadFilter};

/// Runs the loading tasks of one load. Thread pools are created on demand,
/// one per database, until [`wait_until_all_tasks_completed`] freezes them.
///
/// [`wait_until_all_tasks_completed`]: CacheLoaderEngine::wait_until_all_tasks_completed
pub struct CacheLoaderEngine {
    pub(super) shared: Arc<EngineShared>,
    pub(super) budget: Arc<AbandonedThreadBudget>,
    pub(super) pools: RwLock<IndexMap<String, Arc<ThreadPoolHolder>>>,
    /// Set once scheduling starts. No pools are created afterwards.
    pub(super) init_completed: AtomicBool,
    /// Queued runners added before the pools were started.
    pub(super) deferred: Mutex<Vec<Arc<LoadingTaskRunner>>>,
    replica_probe: RwLock<Option<Arc<dyn ReplicaLogProbe>>>,
}

impl CacheLoaderEngine {
    /// Create an engine with its own abandoned-thread budget.
    pub fn new(config: LoaderConfig) -> Result<Self> {
        config.validate()?;
        let budget = Arc::new(AbandonedThreadBudget::new(config.max_abandoned_threads));
        Ok(Self {
            shared: Arc::new(EngineShared::new(config)),
            budget,
            pools: RwLock::new(IndexMap::new()),
            init_completed: AtomicBool::new(false),
            deferred: Mutex::new(Vec::new()),
            replica_probe: RwLock::new(None),
        })
    }

    /// Share an abandoned-thread budget with other engines (pools of the same
    /// name count against the same limit).
    pub fn with_budget(mut self, budget: Arc<AbandonedThreadBudget>) -> Self {
        self.budget = budget;
        self
    }

    /// Probe consulted by pools created from now on before every query.
    pub fn set_replica_probe(&self, probe: Arc<dyn ReplicaLogProbe>) {
        *self.replica_probe.write() = Some(probe);
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.shared.config
    }

    pub fn budget(&self) -> &Arc<AbandonedThreadBudget> {
        &self.budget
    }

    pub(crate) fn shared(&self) -> &Arc<EngineShared> {
        &self.shared
    }

    // ── Pools ─────────────────────────────────────────────────

    /// The pool of database `name`, created on first use.
    pub fn thread_pool(&self, name: &str) -> Result<Arc<ThreadPoolHolder>> {
        if let Some(pool) = self.pools.read().get(name) {
            return Ok(Arc::clone(pool));
        }
        let mut pools = self.pools.write();
        if let Some(pool) = pools.get(name) {
            return Ok(Arc::clone(pool));
        }
        if self.init_completed.load(Ordering::SeqCst) {
            return Err(LoadError::PoolsFrozen(name.to_string()));
        }
        let probe = self.replica_probe.read().clone();
        let pool = Arc::new(ThreadPoolHolder::new(name, &self.shared, Arc::clone(&self.budget), probe));
        pools.insert(name.to_string(), Arc::clone(&pool));
        Ok(pool)
    }

    pub fn pool_names(&self) -> Vec<String> {
        self.pools.read().keys().cloned().collect()
    }

    // ── Runners ───────────────────────────────────────────────

    /// Wrap `task` in a runner bound to the pool of its class's database.
    ///
    /// The runner counts as outstanding work from here on; hand it to
    /// [`add_task_to_load`](Self::add_task_to_load).
    pub fn create_runner(
        &self,
        task: LoadingTask,
        state: RunnerState,
        prerequisites: Vec<String>,
    ) -> Result<Arc<LoadingTaskRunner>> {
        if self.shared.is_stopped() {
            return Err(LoadError::EngineStopped);
        }
        let pool = task.class().database_for(&task.operation().source)?;
        self.thread_pool(&pool)?;
        Ok(LoadingTaskRunner::new(&self.shared, task, state, prerequisites, pool))
    }

    /// Schedule a runner. Waiting runners join the scan list; queued runners
    /// go straight to their pool (or wait there until the pools start).
    pub fn add_task_to_load(&self, runner: Arc<LoadingTaskRunner>) -> Result<()> {
        if self.shared.is_stopped() {
            return Err(LoadError::EngineStopped);
        }
        match runner.state() {
            RunnerState::WaitingForPrerequisites => {
                self.shared.runners.lock().push(runner);
                self.shared.signal();
                Ok(())
            }
            RunnerState::Queued => {
                {
                    let mut deferred = self.deferred.lock();
                    if !self.init_completed.load(Ordering::SeqCst) {
                        deferred.push(runner);
                        return Ok(());
                    }
                }
                self.queue_runner(runner)
            }
            state => Err(LoadError::Config(format!(
                "{} cannot be scheduled in state {:?}",
                runner.describe(),
                state
            ))),
        }
    }

    pub(super) fn queue_runner(&self, runner: Arc<LoadingTaskRunner>) -> Result<()> {
        let pool = self
            .pools
            .read()
            .get(runner.pool_name())
            .cloned()
            .ok_or_else(|| LoadError::Config(format!("no thread pool named '{}'", runner.pool_name())))?;
        pool.queue(runner, &self.shared)
    }

    /// Resolve the prerequisite class names of every runner added so far.
    pub fn attach_prerequisites(&self) {
        let mut candidates = self.shared.runners.lock().clone();
        candidates.extend(self.deferred.lock().iter().cloned());
        for runner in &candidates {
            runner.attach_prerequisites(&candidates);
        }
    }

    /// Runners added so far that have not yet been released to a pool.
    pub fn waiting_runners(&self) -> Vec<Arc<LoadingTaskRunner>> {
        let mut runners = self.shared.runners.lock().clone();
        runners.extend(self.deferred.lock().iter().cloned());
        runners
    }

    // ── Dependents ────────────────────────────────────────────

    /// Register a spawner for `class` on the pool of its database.
    pub fn create_spawner(
        &self,
        class: Arc<ClassHandle>,
        base_operation: LoadOperation,
        post_filter: PostLoadFilter,
    ) -> Result<Arc<DependentLoadingTaskSpawner>> {
        let pool_name = class.database_for(&base_operation.source)?;
        let pool = self.thread_pool(&pool_name)?;
        let task_size = self.shared.config.task_size;
        Ok(self.shared.register_spawner(|id| {
            DependentLoadingTaskSpawner::new(
                id,
                class,
                base_operation,
                post_filter,
                pool_name,
                task_size,
                pool.cpu_sender(),
                Arc::clone(pool.syslog()),
            )
        }))
    }

    pub fn spawners(&self) -> Vec<Arc<DependentLoadingTaskSpawner>> {
        self.shared.spawners()
    }

    // ── Monitoring ────────────────────────────────────────────

    /// Outstanding units of work.
    pub fn count(&self) -> i64 {
        self.shared.count()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    pub fn task_monitors(&self) -> Vec<TaskMonitor> {
        self.shared
            .monitored_runners()
            .iter()
            .map(|r| r.monitor())
            .collect()
    }

    pub fn thread_pool_monitors(&self) -> Vec<ThreadPoolMonitor> {
        self.pools
            .read()
            .values()
            .map(|p| p.monitor(&self.budget))
            .collect()
    }

    pub fn dependent_key_index_monitors(&self) -> Vec<DependentKeyIndexMonitor> {
        self.shared
            .spawners()
            .iter()
            .flat_map(|s| s.monitors())
            .collect()
    }

    // ── Shutdown ──────────────────────────────────────────────

    /// Stop every pool and refuse further work. Idempotent.
    pub fn shutdown(&self) {
        if !self.shared.stop() {
            return;
        }
        let pools: Vec<Arc<ThreadPoolHolder>> = self.pools.read().values().cloned().collect();
        info!("Shutting down cache loader engine ({} thread pool(s))", pools.len());
        for spawner in self.shared.spawners() {
            spawner.close();
        }
        for pool in pools {
            pool.shutdown();
        }
        self.shared.runners.lock().clear();
        self.deferred.lock().clear();
    }
}

impl Drop for CacheLoaderEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
