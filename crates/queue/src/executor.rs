//! Fixed-size worker pool draining a [`DualCapacityBlockingQueue`].

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::budget::AbandonedThreadBudget;
use crate::dual_queue::DualCapacityBlockingQueue;
use crate::error::{panic_message, QueueError};

/// Unit of work executed by a pool thread.
pub trait Runnable: Send + 'static {
    /// Short description used in logs and panic reports.
    fn describe(&self) -> String;

    fn run(self);
}

/// Receives every panic that escapes a pool or conveyor task.
///
/// Implementations must not panic themselves.
pub trait ExceptionHandler: Send + Sync {
    fn handle(&self, error: QueueError);
}

impl<F> ExceptionHandler for F
where
    F: Fn(QueueError) + Send + Sync,
{
    fn handle(&self, error: QueueError) {
        self(error)
    }
}

struct SlotState {
    thread_name: String,
    busy: bool,
    abandoned: bool,
}

/// Per-thread bookkeeping shared between the worker and `shutdown`.
struct WorkerSlot {
    state: Mutex<SlotState>,
}

// ── Executor ──────────────────────────────────────────────────

pub struct ExternalQueueThreadExecutor<T: Runnable> {
    name: String,
    thread_count: usize,
    queue: Arc<DualCapacityBlockingQueue<T>>,
    handler: Arc<dyn ExceptionHandler>,
    budget: Arc<AbandonedThreadBudget>,
    slots: Mutex<Vec<Arc<WorkerSlot>>>,
    stopped: Arc<AtomicBool>,
}

impl<T: Runnable> ExternalQueueThreadExecutor<T> {
    /// The queue keeps one ready task per thread beyond the one each thread
    /// is running, so workers never idle while work is buffered upstream.
    pub fn new(
        name: impl Into<String>,
        thread_count: usize,
        handler: Arc<dyn ExceptionHandler>,
        budget: Arc<AbandonedThreadBudget>,
    ) -> Self {
        let name = name.into();
        let thread_count = thread_count.max(1);
        Self {
            queue: Arc::new(DualCapacityBlockingQueue::new(name.clone(), thread_count)),
            name,
            thread_count,
            handler,
            budget,
            slots: Mutex::new(Vec::new()),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Wait for abandoned-thread headroom, then spawn the workers.
    pub fn start(&self) -> Result<(), QueueError> {
        self.budget.await_headroom(&self.name);

        let mut slots = self.slots.lock();
        for i in 0..self.thread_count {
            let thread_name = format!("{}-worker-{}", self.name, i);
            let slot = Arc::new(WorkerSlot {
                state: Mutex::new(SlotState {
                    thread_name: thread_name.clone(),
                    busy: false,
                    abandoned: false,
                }),
            });
            let worker = Worker {
                pool: self.name.clone(),
                slot: Arc::clone(&slot),
                queue: Arc::clone(&self.queue),
                handler: Arc::clone(&self.handler),
                budget: Arc::clone(&self.budget),
                stopped: Arc::clone(&self.stopped),
            };
            thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || worker.run())
                .map_err(|source| QueueError::Spawn {
                    thread: thread_name,
                    source,
                })?;
            slots.push(slot);
        }
        info!("Pool '{}' started with {} threads", self.name, self.thread_count);
        Ok(())
    }

    /// Enqueue `task`, blocking while the queue is full.
    pub fn submit(&self, task: T) -> Result<(), QueueError> {
        self.queue.put(task)
    }

    pub fn submit_unlimited(&self, task: T) -> bool {
        self.queue.add_unlimited(task)
    }

    /// Stop the pool. Queued tasks are dropped; threads still running a task
    /// are renamed "Abandoned ..." and charged to the shared budget.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let discarded = self.queue.shutdown();

        let mut abandoned = 0;
        for slot in self.slots.lock().iter() {
            let mut state = slot.state.lock();
            if state.busy {
                state.abandoned = true;
                state.thread_name = format!("Abandoned {}", state.thread_name);
                abandoned += 1;
            }
        }
        self.budget.abandon(&self.name, abandoned);
        info!(
            "Pool '{}' shut down ({} queued task(s) discarded, {} thread(s) abandoned)",
            self.name, discarded, abandoned
        );
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    pub fn queue(&self) -> &Arc<DualCapacityBlockingQueue<T>> {
        &self.queue
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Threads currently running a task.
    pub fn busy_threads(&self) -> usize {
        self.slots.lock().iter().filter(|s| s.state.lock().busy).count()
    }

    /// Diagnostic names of the pool's threads, including abandoned ones.
    pub fn thread_names(&self) -> Vec<String> {
        self.slots
            .lock()
            .iter()
            .map(|s| s.state.lock().thread_name.clone())
            .collect()
    }
}

struct Worker<T: Runnable> {
    pool: String,
    slot: Arc<WorkerSlot>,
    queue: Arc<DualCapacityBlockingQueue<T>>,
    handler: Arc<dyn ExceptionHandler>,
    budget: Arc<AbandonedThreadBudget>,
    stopped: Arc<AtomicBool>,
}

impl<T: Runnable> Worker<T> {
    fn run(self) {
        while let Some(task) = self.queue.take() {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            let thread_name = {
                let mut state = self.slot.state.lock();
                state.busy = true;
                state.thread_name.clone()
            };

            let description = task.describe();
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
                self.handler.handle(QueueError::Panicked {
                    thread: thread_name,
                    task: description,
                    message: panic_message(payload.as_ref()),
                });
            }

            let abandoned = {
                let mut state = self.slot.state.lock();
                state.busy = false;
                state.abandoned
            };
            if abandoned {
                warn!("Abandoned worker of pool '{}' finished its task", self.pool);
                self.budget.release(&self.pool);
                return;
            }
        }
        debug!("Worker of pool '{}' exiting", self.pool);
    }
}
