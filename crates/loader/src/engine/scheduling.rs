use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use preload_core::{LoadError, Result};
use tracing::{debug, error, info};

use crate::engine::core::CacheLoaderEngine;
use crate::engine::pool::ThreadPoolHolder;
use crate::runner::{LoadingTaskRunner, RunnerState};

impl CacheLoaderEngine {
    /// Freeze and start the pools, then release runners as their
    /// prerequisites finish until no work is outstanding or a fatal error is
    /// recorded. Pools are shut down on every exit path.
    ///
    /// Task failures do not stop the loop; they are raised once everything
    /// else has drained.
    pub fn wait_until_all_tasks_completed(&self) -> Result<()> {
        if self.shared.is_stopped() {
            return Err(LoadError::EngineStopped);
        }
        let started = Instant::now();
        info!(
            "Cache loader starting: {} runner(s), {} thread pool(s)",
            self.shared.runners.lock().len() + self.deferred.lock().len(),
            self.pools.read().len()
        );

        match self.start_pools() {
            Ok(()) => self.run_loop(),
            Err(e) => self.shared.record_fatal(e),
        }
        let remaining = self.shared.count();
        self.shutdown();

        let errors = self.shared.take_errors();
        if errors.is_empty() {
            info!("Cache loader finished in {:?}", started.elapsed());
            return Ok(());
        }
        error!(
            "Cache loader aborted after {:?} with {} error(s), {} unit(s) of work outstanding",
            started.elapsed(),
            errors.len(),
            remaining
        );
        for e in &errors {
            error!("  {}", e);
        }
        let count = errors.len();
        let first = errors
            .into_iter()
            .next()
            .map(Box::new)
            .unwrap_or_else(|| Box::new(LoadError::EngineStopped));
        Err(LoadError::Aborted { count, first })
    }

    /// Freeze the pool map, start every pool, and queue the runners that were
    /// added in the queued state during setup.
    fn start_pools(&self) -> Result<()> {
        let (pools, deferred) = {
            let mut deferred = self.deferred.lock();
            let pools = self.pools.write();
            self.init_completed.store(true, Ordering::SeqCst);
            let pools: Vec<Arc<ThreadPoolHolder>> = pools.values().cloned().collect();
            (pools, std::mem::take(&mut *deferred))
        };
        for pool in &pools {
            info!("Starting thread pool '{}'", pool.name());
            pool.start()?;
        }
        for runner in deferred {
            self.queue_runner(runner)?;
        }
        Ok(())
    }

    fn run_loop(&self) {
        self.shared.signal();
        loop {
            let (count, fatal) = self.shared.wait_until_ready_and_check_count();
            if fatal {
                debug!("Fatal error recorded, leaving scheduling loop");
                break;
            }
            if count <= 0 {
                break;
            }
            if let Err(e) = self.schedule_remaining_tasks() {
                self.shared.record_fatal(e);
                break;
            }
        }
    }

    /// Advance every waiting runner and drop finished or released ones from
    /// the scan list. Runners are queued after the list lock is released.
    fn schedule_remaining_tasks(&self) -> Result<()> {
        let ready: Vec<Arc<LoadingTaskRunner>> = {
            let mut runners = self.shared.runners.lock();
            let mut ready = Vec::new();
            let mut i = runners.len();
            while i > 0 {
                i -= 1;
                if runners[i].advance() {
                    ready.push(runners.swap_remove(i));
                } else if runners[i].state() != RunnerState::WaitingForPrerequisites {
                    runners.swap_remove(i);
                }
            }
            ready
        };
        if !ready.is_empty() {
            debug!("Releasing {} runner(s)", ready.len());
        }
        for runner in ready {
            self.queue_runner(runner)?;
        }
        Ok(())
    }
}
