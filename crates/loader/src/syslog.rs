//! Replica log back-pressure.
//!
//! Before a loading task queries a database it asks the pool's checker
//! whether the replica's transaction log is too full. If so the task waits,
//! up to a configured maximum, for the log to drain. The wait is advisory:
//! once it expires the query runs anyway.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use preload_core::{LoaderConfig, Result};
use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(5);
/// A passing check is trusted for this long before probing again.
const RECHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Reports how full a database's replica log is.
pub trait ReplicaLogProbe: Send + Sync {
    /// Usage of the log of `database`, in percent.
    fn usage_percent(&self, database: &str) -> Result<f64>;
}

pub struct SyslogChecker {
    database: String,
    threshold: f64,
    max_wait: Duration,
    poll_interval: Duration,
    probe: Option<Arc<dyn ReplicaLogProbe>>,
    last_passed: Mutex<Option<Instant>>,
}

impl SyslogChecker {
    pub fn new(database: impl Into<String>, config: &LoaderConfig, probe: Option<Arc<dyn ReplicaLogProbe>>) -> Self {
        Self {
            database: database.into(),
            threshold: config.syslog_check_threshold,
            max_wait: config.syslog_check_max_wait(),
            poll_interval: POLL_INTERVAL,
            probe,
            last_passed: Mutex::new(None),
        }
    }

    /// A checker that never waits.
    pub fn disabled(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            threshold: 0.0,
            max_wait: Duration::ZERO,
            poll_interval: POLL_INTERVAL,
            probe: None,
            last_passed: Mutex::new(None),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.threshold > 0.0 && self.probe.is_some()
    }

    /// Block while the replica log is above the threshold, for at most `max_wait`.
    pub fn check_and_wait(&self) -> Result<()> {
        let probe = match (&self.probe, self.threshold > 0.0) {
            (Some(probe), true) => probe,
            _ => return Ok(()),
        };
        if let Some(passed) = *self.last_passed.lock() {
            if passed.elapsed() < RECHECK_INTERVAL {
                return Ok(());
            }
        }

        let started = Instant::now();
        loop {
            let usage = probe.usage_percent(&self.database)?;
            if usage < self.threshold {
                if started.elapsed() > self.poll_interval {
                    info!(
                        "Replica log of {} drained to {:.1}% after {:?}",
                        self.database,
                        usage,
                        started.elapsed()
                    );
                }
                *self.last_passed.lock() = Some(Instant::now());
                return Ok(());
            }
            if started.elapsed() >= self.max_wait {
                warn!(
                    "Replica log of {} still at {:.1}% after {:?}, loading anyway",
                    self.database,
                    usage,
                    started.elapsed()
                );
                return Ok(());
            }
            warn!(
                "Replica log of {} at {:.1}% (threshold {:.1}%), waiting",
                self.database, usage, self.threshold
            );
            thread::sleep(self.poll_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Reports 95% for the first `busy_polls` calls, then 10%.
    struct DrainingProbe {
        calls: AtomicUsize,
        busy_polls: usize,
    }

    impl ReplicaLogProbe for DrainingProbe {
        fn usage_percent(&self, _database: &str) -> Result<f64> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(if call < self.busy_polls { 95.0 } else { 10.0 })
        }
    }

    fn config(threshold: f64, max_wait_secs: u64) -> LoaderConfig {
        LoaderConfig {
            syslog_check_threshold: threshold,
            syslog_check_max_wait_secs: max_wait_secs,
            ..LoaderConfig::default()
        }
    }

    #[test]
    fn disabled_checker_never_probes() {
        let probe = Arc::new(DrainingProbe {
            calls: AtomicUsize::new(0),
            busy_polls: 100,
        });
        let checker = SyslogChecker::new("db1", &config(0.0, 10), Some(probe.clone() as Arc<dyn ReplicaLogProbe>));
        assert!(!checker.is_enabled());
        checker.check_and_wait().unwrap();
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn waits_until_log_drains() {
        let probe = Arc::new(DrainingProbe {
            calls: AtomicUsize::new(0),
            busy_polls: 2,
        });
        let checker = SyslogChecker::new("db1", &config(80.0, 10), Some(probe.clone() as Arc<dyn ReplicaLogProbe>))
            .with_poll_interval(Duration::from_millis(5));
        checker.check_and_wait().unwrap();
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);

        // A recent pass is trusted.
        checker.check_and_wait().unwrap();
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn gives_up_after_max_wait() {
        let probe = Arc::new(DrainingProbe {
            calls: AtomicUsize::new(0),
            busy_polls: usize::MAX,
        });
        let checker = SyslogChecker::new("db1", &config(80.0, 0), Some(probe.clone() as Arc<dyn ReplicaLogProbe>));
        checker.check_and_wait().unwrap();
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }
}
