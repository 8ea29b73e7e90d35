//! Read-only progress snapshots of a load run.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::runner::RunnerState;

/// State of one loading task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskMonitor {
    pub id: u64,
    pub class_name: String,
    /// Empty for the global store.
    pub source: String,
    pub pool: String,
    pub state: RunnerState,
    pub operation: String,
    pub rows: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub elapsed_ms: Option<u64>,
    pub error: Option<String>,
}

/// Worker pool of one database.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadPoolMonitor {
    pub name: String,
    pub threads: usize,
    pub busy_threads: usize,
    pub queued_io_tasks: usize,
    pub pending_cpu_tasks: usize,
    pub abandoned_threads: usize,
}

/// Key counters of one dependent key index.
#[derive(Debug, Clone, Serialize)]
pub struct DependentKeyIndexMonitor {
    pub class_name: String,
    /// Attributes the index keys on, e.g. `(id)`.
    pub extractor: String,
    pub pool: String,
    pub source: String,
    pub business_dates: Option<String>,
    /// Distinct keys seen over the run.
    pub key_count: usize,
    /// Keys not yet turned into a loading task.
    pub pending_keys: usize,
    pub spawned_tasks: usize,
}

/// Snapshot of a whole run.
#[derive(Debug, Clone, Serialize)]
pub struct CacheLoaderMonitor {
    pub run_id: Uuid,
    pub kind: String,
    pub business_dates: Vec<NaiveDate>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub exception: Option<String>,
    pub tasks: Vec<TaskMonitor>,
    pub thread_pools: Vec<ThreadPoolMonitor>,
    pub dependent_indices: Vec<DependentKeyIndexMonitor>,
}

impl CacheLoaderMonitor {
    pub fn new(kind: impl Into<String>, business_dates: Vec<NaiveDate>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            kind: kind.into(),
            business_dates,
            started_at: Utc::now(),
            finished_at: None,
            exception: None,
            tasks: Vec::new(),
            thread_pools: Vec::new(),
            dependent_indices: Vec::new(),
        }
    }

    pub fn tasks_in(&self, state: RunnerState) -> usize {
        self.tasks.iter().filter(|t| t.state == state).count()
    }

    pub fn total_rows(&self) -> usize {
        self.tasks.iter().map(|t| t.rows).sum()
    }

    /// Tasks of `class_name`.
    pub fn tasks_for<'a>(&'a self, class_name: &'a str) -> impl Iterator<Item = &'a TaskMonitor> + 'a {
        self.tasks.iter().filter(move |t| t.class_name == class_name)
    }
}
