use std::sync::{Arc, Weak};

use crossbeam_channel::Sender;
use preload_core::{LoadError, Result};
use preload_queue::{
    AbandonedThreadBudget, CpuIoConveyor, CpuTask, ExceptionHandler, IoTaskBuilder, QueueError, Runnable,
};
use tracing::{error, info};

use crate::engine::EngineShared;
use crate::monitor::ThreadPoolMonitor;
use crate::runner::LoadingTaskRunner;
use crate::syslog::{ReplicaLogProbe, SyslogChecker};

/// A runner queued on a pool, with what it needs to execute there.
pub(crate) struct RunnerTask {
    runner: Arc<LoadingTaskRunner>,
    shared: Arc<EngineShared>,
    syslog: Arc<SyslogChecker>,
}

impl RunnerTask {
    pub(crate) fn new(runner: Arc<LoadingTaskRunner>, shared: Arc<EngineShared>, syslog: Arc<SyslogChecker>) -> Self {
        Self { runner, shared, syslog }
    }
}

impl Runnable for RunnerTask {
    fn describe(&self) -> String {
        self.runner.describe()
    }

    fn run(self) {
        self.runner.run(&self.shared, &self.syslog);
    }
}

pub(crate) fn queue_error(error: QueueError) -> LoadError {
    match error {
        QueueError::Stopped(_) => LoadError::EngineStopped,
        QueueError::Panicked { thread, task, message } => LoadError::Panicked {
            task: format!("{} on {}", task, thread),
            message,
        },
        QueueError::Spawn { source, .. } => LoadError::Io(source),
    }
}

/// Builds partial dependent tasks from the spawners of one pool once the
/// pool has nothing queued.
struct PendingKeys {
    shared: Weak<EngineShared>,
    pool: String,
}

impl IoTaskBuilder<RunnerTask> for PendingKeys {
    fn has_pending(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared
                .spawners_in_pool(&self.pool)
                .iter()
                .any(|s| s.has_pending()),
            None => false,
        }
    }

    fn build_io_task(&self) -> Option<RunnerTask> {
        let shared = self.shared.upgrade()?;
        shared
            .spawners_in_pool(&self.pool)
            .iter()
            .find_map(|s| s.build_partial_task(&shared))
    }
}

/// Conveyor, worker pool and replica-log checker of one database.
pub struct ThreadPoolHolder {
    name: String,
    conveyor: CpuIoConveyor<RunnerTask>,
    syslog: Arc<SyslogChecker>,
}

impl ThreadPoolHolder {
    pub(crate) fn new(
        name: &str,
        shared: &Arc<EngineShared>,
        budget: Arc<AbandonedThreadBudget>,
        probe: Option<Arc<dyn ReplicaLogProbe>>,
    ) -> Self {
        let weak = Arc::downgrade(shared);
        let handler: Arc<dyn ExceptionHandler> = Arc::new(move |e: QueueError| {
            error!("Thread pool error: {}", e);
            if let Some(shared) = weak.upgrade() {
                shared.record_fatal(queue_error(e));
            }
        });
        let builder = Arc::new(PendingKeys {
            shared: Arc::downgrade(shared),
            pool: name.to_string(),
        });
        info!(
            "Creating thread pool '{}' with {} threads",
            name, shared.config.threads_per_db_server
        );
        Self {
            name: name.to_string(),
            conveyor: CpuIoConveyor::new(name, shared.config.threads_per_db_server, handler, budget, builder),
            syslog: Arc::new(SyslogChecker::new(name, &shared.config, probe)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn syslog(&self) -> &Arc<SyslogChecker> {
        &self.syslog
    }

    pub(crate) fn start(&self) -> Result<()> {
        self.conveyor.start().map_err(queue_error)
    }

    /// Hand a queued runner to the workers, blocking while the pool queue is full.
    pub(crate) fn queue(&self, runner: Arc<LoadingTaskRunner>, shared: &Arc<EngineShared>) -> Result<()> {
        self.conveyor
            .submit_io(RunnerTask::new(runner, Arc::clone(shared), Arc::clone(&self.syslog)))
            .map_err(queue_error)
    }

    pub(crate) fn cpu_sender(&self) -> Sender<CpuTask<RunnerTask>> {
        self.conveyor.cpu_sender()
    }

    pub(crate) fn shutdown(&self) {
        self.conveyor.shutdown();
    }

    pub fn is_stopped(&self) -> bool {
        self.conveyor.is_stopped()
    }

    pub fn monitor(&self, budget: &AbandonedThreadBudget) -> ThreadPoolMonitor {
        let executor = self.conveyor.executor();
        ThreadPoolMonitor {
            name: self.name.clone(),
            threads: executor.thread_count(),
            busy_threads: executor.busy_threads(),
            queued_io_tasks: executor.queue().len(),
            pending_cpu_tasks: self.conveyor.pending_cpu_tasks(),
            abandoned_threads: budget.abandoned(&self.name),
        }
    }
}
