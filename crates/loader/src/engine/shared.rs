use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use preload_core::{LoadError, LoaderConfig};
use tracing::{error, info};

use crate::dependent::{DependentLoadingTaskSpawner, SpawnerId};
use crate::runner::LoadingTaskRunner;

const STATUS_INTERVAL: Duration = Duration::from_secs(60);

/// Outstanding work plus the wake-up flag of the scheduling loop.
///
/// `count` is the sum of these units:
/// - one per runner from construction until it has run
/// - one per owner record per feed while the record sits in a stripe
/// - one per key pending in a dependent key index
struct WorkState {
    count: i64,
    ready: bool,
    fatal: Vec<LoadError>,
}

/// State shared by the engine, its pool threads and the spawners.
pub(crate) struct EngineShared {
    pub(crate) config: LoaderConfig,
    work: Mutex<WorkState>,
    ready: Condvar,
    /// Runners the scheduling loop still has to look at.
    pub(crate) runners: Mutex<Vec<Arc<LoadingTaskRunner>>>,
    monitored: Mutex<Vec<Arc<LoadingTaskRunner>>>,
    task_errors: Mutex<Vec<LoadError>>,
    spawners: RwLock<Vec<Arc<DependentLoadingTaskSpawner>>>,
    stopped: AtomicBool,
    next_runner_id: AtomicU64,
}

impl EngineShared {
    pub(crate) fn new(config: LoaderConfig) -> Self {
        Self {
            config,
            work: Mutex::new(WorkState {
                count: 0,
                ready: false,
                fatal: Vec::new(),
            }),
            ready: Condvar::new(),
            runners: Mutex::new(Vec::new()),
            monitored: Mutex::new(Vec::new()),
            task_errors: Mutex::new(Vec::new()),
            spawners: RwLock::new(Vec::new()),
            stopped: AtomicBool::new(false),
            next_runner_id: AtomicU64::new(1),
        }
    }

    // ── Outstanding work ──────────────────────────────────────

    /// Add `delta` units. Reaching zero wakes the scheduling loop.
    pub(crate) fn change_count(&self, delta: i64) {
        if delta == 0 {
            return;
        }
        let mut work = self.work.lock();
        if self.apply(&mut work, delta) {
            work.ready = true;
            self.ready.notify_all();
        }
    }

    /// Returns whether the scheduling loop must wake up. A negative count is
    /// recorded as fatal.
    fn apply(&self, work: &mut WorkState, delta: i64) -> bool {
        work.count += delta;
        if work.count < 0 {
            error!("Outstanding work count went negative: {}", work.count);
            let count = work.count;
            work.fatal.push(LoadError::CountUnderflow(count));
        }
        work.count <= 0
    }

    /// A runner was constructed. Returns its id.
    pub(crate) fn runner_created(&self) -> u64 {
        self.work.lock().count += 1;
        self.next_runner_id.fetch_add(1, Ordering::SeqCst)
    }

    /// A runner finished, successfully or not.
    pub(crate) fn runner_finished(&self) {
        let mut work = self.work.lock();
        self.apply(&mut work, -1);
        work.ready = true;
        self.ready.notify_all();
    }

    pub(crate) fn signal(&self) {
        let mut work = self.work.lock();
        work.ready = true;
        self.ready.notify_all();
    }

    pub(crate) fn count(&self) -> i64 {
        self.work.lock().count
    }

    /// Block until signalled, then report the count and whether a fatal
    /// error was recorded.
    pub(crate) fn wait_until_ready_and_check_count(&self) -> (i64, bool) {
        let mut work = self.work.lock();
        while !work.ready {
            if self.ready.wait_for(&mut work, STATUS_INTERVAL).timed_out() && !work.ready {
                info!("Waiting for {} outstanding unit(s) of load work", work.count);
            }
        }
        work.ready = false;
        (work.count, !work.fatal.is_empty())
    }

    // ── Errors ────────────────────────────────────────────────

    /// A task failed. The run continues and fails once drained.
    pub(crate) fn record_task_error(&self, error: LoadError) {
        self.task_errors.lock().push(error);
    }

    /// Something outside a task failed. The run stops at the next wake-up.
    pub(crate) fn record_fatal(&self, error: LoadError) {
        let mut work = self.work.lock();
        work.fatal.push(error);
        work.ready = true;
        self.ready.notify_all();
    }

    /// All recorded errors, fatal ones first.
    pub(crate) fn take_errors(&self) -> Vec<LoadError> {
        let mut errors = std::mem::take(&mut self.work.lock().fatal);
        errors.append(&mut self.task_errors.lock());
        errors
    }

    // ── Registries ────────────────────────────────────────────

    pub(crate) fn monitor_runner(&self, runner: Arc<LoadingTaskRunner>) {
        self.monitored.lock().push(runner);
    }

    pub(crate) fn monitored_runners(&self) -> Vec<Arc<LoadingTaskRunner>> {
        self.monitored.lock().clone()
    }

    pub(crate) fn register_spawner(
        &self,
        build: impl FnOnce(SpawnerId) -> DependentLoadingTaskSpawner,
    ) -> Arc<DependentLoadingTaskSpawner> {
        let mut spawners = self.spawners.write();
        let spawner = Arc::new(build(SpawnerId(spawners.len())));
        spawners.push(Arc::clone(&spawner));
        spawner
    }

    pub(crate) fn spawner(&self, id: SpawnerId) -> Option<Arc<DependentLoadingTaskSpawner>> {
        self.spawners.read().get(id.0).cloned()
    }

    pub(crate) fn spawners(&self) -> Vec<Arc<DependentLoadingTaskSpawner>> {
        self.spawners.read().clone()
    }

    pub(crate) fn spawners_in_pool(&self, pool: &str) -> Vec<Arc<DependentLoadingTaskSpawner>> {
        self.spawners
            .read()
            .iter()
            .filter(|s| s.pool_name() == pool)
            .cloned()
            .collect()
    }

    pub(crate) fn stop(&self) -> bool {
        !self.stopped.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}
