//! Loading task runners and their state machine.
//!
//! ```text
//! WaitingForPrerequisites --(all prerequisites done)--> Queued
//! Queued --(worker picks up)--> Processing
//! Processing --(success)--> Completed
//! Processing --(error)--> Failed
//! ```

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use preload_core::{DateCluster, LoadError, SourceAttribute};
use preload_queue::error::panic_message;
use serde::Serialize;
use tracing::{debug, error};

use crate::dependent::DependentFeed;
use crate::engine::EngineShared;
use crate::monitor::TaskMonitor;
use crate::syslog::SyslogChecker;
use crate::task::LoadingTask;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunnerState {
    WaitingForPrerequisites,
    Queued,
    Processing,
    Completed,
    Failed,
}

impl RunnerState {
    /// Completed or failed. Either satisfies dependents waiting on this runner.
    pub fn is_done(self) -> bool {
        matches!(self, RunnerState::Completed | RunnerState::Failed)
    }
}

struct RunnerInner {
    state: RunnerState,
    task: Option<LoadingTask>,
    prerequisites: Vec<Arc<LoadingTaskRunner>>,
    monitor: TaskMonitor,
}

/// Wraps one [`LoadingTask`] with its state, prerequisites and monitor.
///
/// Counts as one unit of outstanding work from construction until it has run.
pub struct LoadingTaskRunner {
    id: u64,
    class_name: String,
    source: SourceAttribute,
    dates: Option<DateCluster>,
    pool_name: String,
    prerequisite_classes: Vec<String>,
    needs_dependents: bool,
    description: String,
    inner: Mutex<RunnerInner>,
}

impl LoadingTaskRunner {
    pub(crate) fn new(
        shared: &EngineShared,
        task: LoadingTask,
        state: RunnerState,
        prerequisite_classes: Vec<String>,
        pool_name: String,
    ) -> Arc<Self> {
        let id = shared.runner_created();
        let operation = task.operation();
        let monitor = TaskMonitor {
            id,
            class_name: task.class().name.clone(),
            source: operation.source.to_string(),
            pool: pool_name.clone(),
            state,
            operation: operation.to_string(),
            rows: 0,
            started_at: None,
            finished_at: None,
            elapsed_ms: None,
            error: None,
        };
        let runner = Arc::new(Self {
            id,
            class_name: task.class().name.clone(),
            source: operation.source.clone(),
            dates: operation.dates.clone(),
            description: format!("LoadingTask#{} {}", id, task.describe()),
            pool_name,
            prerequisite_classes,
            needs_dependents: task.needs_dependents(),
            inner: Mutex::new(RunnerInner {
                state,
                task: Some(task),
                prerequisites: Vec::new(),
                monitor,
            }),
        });
        if shared.config.capture_loading_task_details {
            shared.monitor_runner(Arc::clone(&runner));
        }
        runner
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn source(&self) -> &SourceAttribute {
        &self.source
    }

    pub fn dates(&self) -> Option<&DateCluster> {
        self.dates.as_ref()
    }

    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    pub fn prerequisite_classes(&self) -> &[String] {
        &self.prerequisite_classes
    }

    pub fn needs_dependents(&self) -> bool {
        self.needs_dependents
    }

    pub fn describe(&self) -> String {
        self.description.clone()
    }

    pub fn state(&self) -> RunnerState {
        self.inner.lock().state
    }

    pub fn monitor(&self) -> TaskMonitor {
        let inner = self.inner.lock();
        let mut monitor = inner.monitor.clone();
        monitor.state = inner.state;
        monitor
    }

    /// Number of resolved prerequisite runners not yet released.
    pub fn prerequisite_count(&self) -> usize {
        self.inner.lock().prerequisites.len()
    }

    /// Feed this runner's records into another key index. False once the task
    /// has started or when it does not feed dependents.
    pub(crate) fn add_dependent(&self, feed: DependentFeed) -> bool {
        match self.inner.lock().task.as_mut() {
            Some(task) => task.add_dependent(feed),
            None => false,
        }
    }

    /// Resolve prerequisite class names against `candidates`. Runners of a
    /// different named source attribute are not prerequisites.
    pub fn attach_prerequisites(&self, candidates: &[Arc<LoadingTaskRunner>]) {
        if self.prerequisite_classes.is_empty() {
            return;
        }
        let found: Vec<Arc<LoadingTaskRunner>> = candidates
            .iter()
            .filter(|c| !std::ptr::eq(Arc::as_ptr(c), self))
            .filter(|c| self.prerequisite_classes.iter().any(|p| p == c.class_name()))
            .filter(|c| self.source.matches(c.source()))
            .cloned()
            .collect();
        let mut inner = self.inner.lock();
        for runner in found {
            if !inner.prerequisites.iter().any(|p| Arc::ptr_eq(p, &runner)) {
                inner.prerequisites.push(runner);
            }
        }
    }

    /// Move from waiting to queued once every prerequisite is done. Returns
    /// true when this call made the transition; the caller then queues the
    /// runner. Must be called with the engine's runner list locked.
    pub(crate) fn advance(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != RunnerState::WaitingForPrerequisites {
            return false;
        }
        if inner.prerequisites.iter().all(|p| p.state().is_done()) {
            inner.state = RunnerState::Queued;
            inner.monitor.state = RunnerState::Queued;
            true
        } else {
            false
        }
    }

    /// Execute the task on the current (worker) thread.
    pub(crate) fn run(&self, shared: &Arc<EngineShared>, syslog: &SyslogChecker) {
        let task = {
            let mut inner = self.inner.lock();
            inner.state = RunnerState::Processing;
            inner.monitor.started_at = Some(Utc::now());
            inner.task.take()
        };

        let started = Instant::now();
        let outcome = match task {
            Some(task) => panic::catch_unwind(AssertUnwindSafe(|| task.execute(shared, syslog)))
                .unwrap_or_else(|payload| {
                    Err(LoadError::Panicked {
                        task: self.description.clone(),
                        message: panic_message(payload.as_ref()),
                    })
                }),
            None => Ok(0),
        };
        let elapsed = started.elapsed();

        {
            let mut inner = self.inner.lock();
            inner.prerequisites.clear();
            inner.monitor.finished_at = Some(Utc::now());
            inner.monitor.elapsed_ms = Some(elapsed.as_millis() as u64);
            match &outcome {
                Ok(rows) => {
                    inner.state = RunnerState::Completed;
                    inner.monitor.rows = *rows;
                }
                Err(e) => {
                    inner.state = RunnerState::Failed;
                    inner.monitor.error = Some(e.to_string());
                }
            }
            inner.monitor.state = inner.state;
        }

        match outcome {
            Ok(rows) => debug!("{} completed: {} rows in {:?}", self.description, rows, elapsed),
            Err(e) => {
                error!("{} failed: {}", self.description, e);
                shared.record_task_error(e.in_task(self.description.clone()));
            }
        }
        shared.runner_finished();
    }
}

impl std::fmt::Debug for LoadingTaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadingTaskRunner")
            .field("id", &self.id)
            .field("class", &self.class_name)
            .field("source", &self.source)
            .field("pool", &self.pool_name)
            .field("state", &self.state())
            .finish()
    }
}
