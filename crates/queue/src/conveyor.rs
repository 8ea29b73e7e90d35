//! CPU/IO conveyor.
//!
//! One conveyor thread runs short CPU tasks from an unbounded channel. A CPU
//! task may yield an I/O task, which is pushed into the bounded queue of the
//! worker pool. When there is nothing else to do and the pool is idle, the
//! conveyor asks its [`IoTaskBuilder`] for a partial I/O task so buffered work
//! never waits for a batch that will not fill up.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{select, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::budget::AbandonedThreadBudget;
use crate::error::{panic_message, QueueError};
use crate::executor::{ExceptionHandler, ExternalQueueThreadExecutor, Runnable};

/// A CPU-bound closure that may hand back I/O work.
pub type CpuTask<T> = Box<dyn FnOnce() -> Option<T> + Send>;

const PENDING_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Source of I/O tasks built from partially filled buffers.
///
/// Called only from the conveyor thread.
pub trait IoTaskBuilder<T>: Send + Sync {
    /// Whether there is buffered work that could become an I/O task.
    fn has_pending(&self) -> bool;

    fn build_io_task(&self) -> Option<T>;
}

pub struct CpuIoConveyor<T: Runnable> {
    name: String,
    executor: Arc<ExternalQueueThreadExecutor<T>>,
    cpu_tx: Sender<CpuTask<T>>,
    cpu_rx: Receiver<CpuTask<T>>,
    builder: Arc<dyn IoTaskBuilder<T>>,
    handler: Arc<dyn ExceptionHandler>,
    stopped: Arc<AtomicBool>,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Runnable> CpuIoConveyor<T> {
    pub fn new(
        name: impl Into<String>,
        io_threads: usize,
        handler: Arc<dyn ExceptionHandler>,
        budget: Arc<AbandonedThreadBudget>,
        builder: Arc<dyn IoTaskBuilder<T>>,
    ) -> Self {
        let name = name.into();
        let (cpu_tx, cpu_rx) = crossbeam_channel::unbounded();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        Self {
            executor: Arc::new(ExternalQueueThreadExecutor::new(
                name.clone(),
                io_threads,
                Arc::clone(&handler),
                budget,
            )),
            name,
            cpu_tx,
            cpu_rx,
            builder,
            handler,
            stopped: Arc::new(AtomicBool::new(false)),
            stop_tx,
            stop_rx,
            thread: Mutex::new(None),
        }
    }

    /// Start the worker pool, then the conveyor thread.
    pub fn start(&self) -> Result<(), QueueError> {
        self.executor.start()?;

        let thread_name = format!("{}-conveyor", self.name);
        let conveyor = ConveyorLoop {
            thread_name: thread_name.clone(),
            executor: Arc::clone(&self.executor),
            cpu_rx: self.cpu_rx.clone(),
            stop_rx: self.stop_rx.clone(),
            builder: Arc::clone(&self.builder),
            handler: Arc::clone(&self.handler),
            stopped: Arc::clone(&self.stopped),
        };
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || conveyor.run())
            .map_err(|source| QueueError::Spawn {
                thread: thread_name,
                source,
            })?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    /// Queue a CPU task for the conveyor thread. Never blocks.
    pub fn submit_cpu(&self, task: CpuTask<T>) -> Result<(), QueueError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped(self.name.clone()));
        }
        self.cpu_tx
            .send(task)
            .map_err(|_| QueueError::Stopped(self.name.clone()))
    }

    /// Queue an I/O task directly, blocking while the pool queue is full.
    pub fn submit_io(&self, task: T) -> Result<(), QueueError> {
        self.executor.submit(task)
    }

    /// A sender for CPU tasks that outlives borrows of the conveyor.
    pub fn cpu_sender(&self) -> Sender<CpuTask<T>> {
        self.cpu_tx.clone()
    }

    /// Stop the conveyor and its pool, then wait for the conveyor thread to
    /// exit. Pending CPU tasks are dropped unrun.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.stop_tx.try_send(()) {
            debug!("Conveyor '{}' stop signal not sent: {}", self.name, e);
        }
        // Unblocks a conveyor thread waiting on a full pool queue.
        self.executor.shutdown();

        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() == thread::current().id() {
                debug!("Conveyor '{}' shut down from its own thread", self.name);
            } else if handle.join().is_err() {
                debug!("Conveyor thread '{}' panicked while stopping", self.name);
            }
        }
        let dropped = self.cpu_rx.try_iter().count();
        info!("Conveyor '{}' shut down ({} CPU task(s) dropped)", self.name, dropped);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn executor(&self) -> &ExternalQueueThreadExecutor<T> {
        &self.executor
    }

    pub fn pending_cpu_tasks(&self) -> usize {
        self.cpu_rx.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Whether the conveyor thread has been started and not yet exited.
    pub fn is_running(&self) -> bool {
        self.thread.lock().as_ref().is_some_and(|h| !h.is_finished())
    }
}

enum Wake<T> {
    Task(CpuTask<T>),
    Idle,
    Stop,
}

struct ConveyorLoop<T: Runnable> {
    thread_name: String,
    executor: Arc<ExternalQueueThreadExecutor<T>>,
    cpu_rx: Receiver<CpuTask<T>>,
    stop_rx: Receiver<()>,
    builder: Arc<dyn IoTaskBuilder<T>>,
    handler: Arc<dyn ExceptionHandler>,
    stopped: Arc<AtomicBool>,
}

impl<T: Runnable> ConveyorLoop<T> {
    fn run(self) {
        debug!("Conveyor thread '{}' running", self.thread_name);
        loop {
            let idle = if self.builder.has_pending() {
                crossbeam_channel::after(PENDING_POLL_INTERVAL)
            } else {
                crossbeam_channel::never()
            };
            let wake = select! {
                recv(self.stop_rx) -> _ => Wake::Stop,
                recv(self.cpu_rx) -> task => task.map_or(Wake::Stop, Wake::Task),
                recv(idle) -> _ => Wake::Idle,
            };
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }

            match wake {
                Wake::Task(task) => {
                    if !self.run_cpu_task(task) {
                        break;
                    }
                    while let Ok(task) = self.cpu_rx.try_recv() {
                        if !self.run_cpu_task(task) {
                            break;
                        }
                    }
                }
                Wake::Idle => {}
                Wake::Stop => break,
            }

            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            if self.executor.queue().is_empty() && self.builder.has_pending() {
                if let Some(io_task) = self.builder.build_io_task() {
                    if self.executor.submit(io_task).is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Conveyor thread '{}' exiting", self.thread_name);
    }

    /// Run one CPU task and forward its I/O task. Returns false once the pool
    /// refuses work.
    fn run_cpu_task(&self, task: CpuTask<T>) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        match panic::catch_unwind(AssertUnwindSafe(task)) {
            Ok(Some(io_task)) => self.executor.submit(io_task).is_ok(),
            Ok(None) => true,
            Err(payload) => {
                self.handler.handle(QueueError::Panicked {
                    thread: self.thread_name.clone(),
                    task: "cpu task".to_string(),
                    message: panic_message(payload.as_ref()),
                });
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct Io {
        id: usize,
        done: Arc<Mutex<Vec<usize>>>,
    }

    impl Runnable for Io {
        fn describe(&self) -> String {
            format!("io-{}", self.id)
        }

        fn run(self) {
            self.done.lock().push(self.id);
        }
    }

    /// Hands out its buffered ids as one task once the pool is idle.
    struct Leftovers {
        pending: Mutex<Vec<usize>>,
        done: Arc<Mutex<Vec<usize>>>,
        builds: AtomicUsize,
    }

    impl IoTaskBuilder<Io> for Leftovers {
        fn has_pending(&self) -> bool {
            !self.pending.lock().is_empty()
        }

        fn build_io_task(&self) -> Option<Io> {
            let id = self.pending.lock().pop()?;
            self.builds.fetch_add(1, Ordering::SeqCst);
            Some(Io {
                id,
                done: Arc::clone(&self.done),
            })
        }
    }

    fn conveyor(pending: Vec<usize>) -> (CpuIoConveyor<Io>, Arc<Leftovers>, Arc<Mutex<Vec<String>>>) {
        let done = Arc::new(Mutex::new(Vec::new()));
        let builder = Arc::new(Leftovers {
            pending: Mutex::new(pending),
            done,
            builds: AtomicUsize::new(0),
        });
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let handler: Arc<dyn ExceptionHandler> =
            Arc::new(move |e: QueueError| sink.lock().push(e.to_string()));
        let conveyor = CpuIoConveyor::new(
            "db1",
            2,
            handler,
            Arc::new(AbandonedThreadBudget::new(5)),
            Arc::clone(&builder) as Arc<dyn IoTaskBuilder<Io>>,
        );
        (conveyor, builder, errors)
    }

    fn wait_until(timeout: Duration, check: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        check()
    }

    #[test]
    fn cpu_task_output_reaches_the_pool() {
        let (conveyor, builder, _) = conveyor(Vec::new());
        conveyor.start().unwrap();

        for id in 0..10 {
            let done = Arc::clone(&builder.done);
            conveyor
                .submit_cpu(Box::new(move || if id % 2 == 0 { Some(Io { id, done }) } else { None }))
                .unwrap();
        }

        assert!(wait_until(Duration::from_secs(2), || builder.done.lock().len() == 5));
        let mut done = builder.done.lock().clone();
        done.sort();
        assert_eq!(done, vec![0, 2, 4, 6, 8]);
        conveyor.shutdown();
    }

    #[test]
    fn pending_work_is_flushed_when_idle() {
        let (conveyor, builder, _) = conveyor(vec![7, 8]);
        conveyor.start().unwrap();

        assert!(wait_until(Duration::from_secs(2), || builder.done.lock().len() == 2));
        assert_eq!(builder.builds.load(Ordering::SeqCst), 2);
        conveyor.shutdown();
    }

    #[test]
    fn panicking_cpu_task_is_reported_and_conveyor_keeps_running() {
        let (conveyor, builder, errors) = conveyor(Vec::new());
        conveyor.start().unwrap();

        conveyor.submit_cpu(Box::new(|| panic!("bad stripe"))).unwrap();
        let done = Arc::clone(&builder.done);
        conveyor.submit_cpu(Box::new(move || Some(Io { id: 1, done }))).unwrap();

        assert!(wait_until(Duration::from_secs(2), || builder.done.lock().len() == 1));
        assert!(errors.lock()[0].contains("bad stripe"));
        conveyor.shutdown();
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let (conveyor, builder, _) = conveyor(Vec::new());
        conveyor.start().unwrap();
        assert!(conveyor.is_running());
        conveyor.shutdown();
        assert!(conveyor.is_stopped());
        assert!(!conveyor.is_running());
        assert!(conveyor.submit_cpu(Box::new(|| None)).is_err());
        assert!(conveyor.executor().is_stopped());
        // Only the conveyor and this test still hold the builder.
        assert_eq!(Arc::strong_count(&builder), 2);
    }

    #[test]
    fn idle_conveyor_thread_exits_on_shutdown() {
        for _ in 0..100 {
            let (conveyor, builder, _) = conveyor(Vec::new());
            conveyor.start().unwrap();
            thread::sleep(Duration::from_millis(1));
            conveyor.shutdown();
            assert!(!conveyor.is_running());
            assert_eq!(Arc::strong_count(&builder), 2);
        }
    }

    #[test]
    fn conveyor_thread_exits_while_work_is_pending() {
        let (conveyor, builder, _) = conveyor(Vec::new());
        let done = Arc::clone(&builder.done);
        conveyor.start().unwrap();
        conveyor
            .submit_cpu(Box::new(move || {
                thread::sleep(Duration::from_millis(20));
                Some(Io { id: 1, done })
            }))
            .unwrap();
        for id in 2..50 {
            let done = Arc::clone(&builder.done);
            conveyor.submit_cpu(Box::new(move || Some(Io { id, done }))).unwrap();
        }
        conveyor.shutdown();
        assert!(!conveyor.is_running());
        assert_eq!(Arc::strong_count(&builder), 2);
    }

    #[test]
    fn shutdown_before_start_is_harmless() {
        let (conveyor, _, _) = conveyor(Vec::new());
        conveyor.shutdown();
        assert!(conveyor.is_stopped());
        assert!(!conveyor.is_running());
    }
}
