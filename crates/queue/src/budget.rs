//! Shared limit on stuck worker threads.
//!
//! A worker still running a task when its pool shuts down is abandoned rather
//! than interrupted. Every pool with the same name draws on the same
//! allowance; a new pool waits in [`AbandonedThreadBudget::await_headroom`]
//! until enough of those threads have finished.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};

const WAIT_LOG_INTERVAL: Duration = Duration::from_secs(30);

pub struct AbandonedThreadBudget {
    max_per_name: usize,
    abandoned: Mutex<HashMap<String, usize>>,
    released: Condvar,
}

impl AbandonedThreadBudget {
    pub fn new(max_per_name: usize) -> Self {
        Self {
            max_per_name,
            abandoned: Mutex::new(HashMap::new()),
            released: Condvar::new(),
        }
    }

    pub fn max_per_name(&self) -> usize {
        self.max_per_name
    }

    /// Count `threads` more stuck threads against `name`.
    pub fn abandon(&self, name: &str, threads: usize) {
        if threads == 0 {
            return;
        }
        let mut counts = self.abandoned.lock();
        let count = counts.entry(name.to_string()).or_default();
        *count += threads;
        warn!(
            "{} thread(s) of pool '{}' abandoned ({} outstanding, limit {})",
            threads, name, *count, self.max_per_name
        );
    }

    /// An abandoned thread of `name` finally returned.
    pub fn release(&self, name: &str) {
        let mut counts = self.abandoned.lock();
        if let Some(count) = counts.get_mut(name) {
            *count = count.saturating_sub(1);
            info!("Abandoned thread of pool '{}' finished ({} left)", name, *count);
            if *count == 0 {
                counts.remove(name);
            }
        }
        self.released.notify_all();
    }

    pub fn abandoned(&self, name: &str) -> usize {
        self.abandoned.lock().get(name).copied().unwrap_or(0)
    }

    /// Block until `name` has fewer abandoned threads than the limit.
    pub fn await_headroom(&self, name: &str) {
        let mut counts = self.abandoned.lock();
        loop {
            let current = counts.get(name).copied().unwrap_or(0);
            if current < self.max_per_name {
                return;
            }
            warn!(
                "Pool '{}' waiting: {} abandoned threads at limit {}",
                name, current, self.max_per_name
            );
            self.released.wait_for(&mut counts, WAIT_LOG_INTERVAL);
        }
    }
}

impl Default for AbandonedThreadBudget {
    fn default() -> Self {
        Self::new(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn counts_are_per_name() {
        let budget = AbandonedThreadBudget::new(2);
        budget.abandon("db1", 2);
        budget.abandon("db2", 1);
        assert_eq!(budget.abandoned("db1"), 2);
        assert_eq!(budget.abandoned("db2"), 1);
        budget.release("db1");
        assert_eq!(budget.abandoned("db1"), 1);
        budget.release("unknown");
        assert_eq!(budget.abandoned("unknown"), 0);
    }

    #[test]
    fn await_headroom_returns_immediately_below_limit() {
        let budget = AbandonedThreadBudget::new(2);
        budget.abandon("db1", 1);
        budget.await_headroom("db1");
        budget.await_headroom("db2");
    }

    #[test]
    fn await_headroom_blocks_until_release() {
        let budget = Arc::new(AbandonedThreadBudget::new(1));
        budget.abandon("db1", 1);

        let started = Arc::new(AtomicBool::new(false));
        let waiter = {
            let budget = Arc::clone(&budget);
            let started = Arc::clone(&started);
            thread::spawn(move || {
                budget.await_headroom("db1");
                started.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!started.load(Ordering::SeqCst));

        budget.release("db1");
        waiter.join().unwrap();
        assert!(started.load(Ordering::SeqCst));
    }
}
