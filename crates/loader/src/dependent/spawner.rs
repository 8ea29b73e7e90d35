//! Builds dependent loading tasks from the pending keys of its key indices.

use std::fmt;
use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::Mutex;
use preload_core::{DateCluster, Key, LoadError, Operation, Record, Result, SourceAttribute};
use preload_queue::CpuTask;
use serde::Serialize;
use tracing::{debug, error};

use crate::class::ClassHandle;
use crate::dependent::key_index::DependentKeyIndex;
use crate::dependent::DependentFeed;
use crate::engine::{EngineShared, RunnerTask};
use crate::monitor::DependentKeyIndexMonitor;
use crate::runner::{LoadingTaskRunner, RunnerState};
use crate::syslog::SyslogChecker;
use crate::task::{LoadOperation, LoadingTask, PostLoadFilter};

/// Position of a spawner in the engine's spawner registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SpawnerId(pub(crate) usize);

impl fmt::Display for SpawnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One per dependent loader, source attribute and (shifted) business-date
/// cluster.
///
/// Key indices are only mutated on the conveyor thread of the spawner's pool;
/// the mutex makes setup-time registration and monitoring safe as well.
pub struct DependentLoadingTaskSpawner {
    id: SpawnerId,
    class: Arc<ClassHandle>,
    source: SourceAttribute,
    dates: Option<DateCluster>,
    base_operation: LoadOperation,
    post_filter: PostLoadFilter,
    pool_name: String,
    task_size: usize,
    cpu: Mutex<Option<Sender<CpuTask<RunnerTask>>>>,
    syslog: Arc<SyslogChecker>,
    indices: Mutex<Vec<DependentKeyIndex>>,
    dependents: Mutex<Vec<DependentFeed>>,
}

impl DependentLoadingTaskSpawner {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: SpawnerId,
        class: Arc<ClassHandle>,
        base_operation: LoadOperation,
        post_filter: PostLoadFilter,
        pool_name: String,
        task_size: usize,
        cpu: Sender<CpuTask<RunnerTask>>,
        syslog: Arc<SyslogChecker>,
    ) -> Self {
        Self {
            id,
            source: base_operation.source.clone(),
            dates: base_operation.dates.clone(),
            class,
            base_operation,
            post_filter,
            pool_name,
            task_size: task_size.max(1),
            cpu: Mutex::new(Some(cpu)),
            syslog,
            indices: Mutex::new(Vec::new()),
            dependents: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> SpawnerId {
        self.id
    }

    pub fn class_name(&self) -> &str {
        &self.class.name
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

    /// Slot of the key index on `attributes`, created on first use. The owner
    /// filter is combined with any filter already attached to that index.
    pub fn index_for(&self, attributes: Vec<String>, owner_filter: Option<Operation>) -> usize {
        let mut indices = self.indices.lock();
        let slot = match indices.iter().position(|i| i.attributes() == attributes.as_slice()) {
            Some(slot) => slot,
            None => {
                indices.push(DependentKeyIndex::new(attributes, self.task_size));
                indices.len() - 1
            }
        };
        indices[slot].attach_owner_filter(owner_filter);
        slot
    }

    /// Tasks spawned here also feed `feed` (a dependent of this class).
    pub(crate) fn add_dependent(&self, feed: DependentFeed) {
        let mut dependents = self.dependents.lock();
        if !dependents.contains(&feed) {
            dependents.push(feed);
        }
    }

    /// Queue a CPU task that merges `stripe` into the index at `feed.slot`.
    pub(crate) fn submit_stripe(
        self: &Arc<Self>,
        shared: &Arc<EngineShared>,
        feed: &DependentFeed,
        stripe: Arc<Vec<Arc<Record>>>,
    ) -> Result<()> {
        let sender = self.cpu.lock().clone().ok_or(LoadError::EngineStopped)?;
        let spawner = Arc::clone(self);
        let shared = Arc::clone(shared);
        let feed = feed.clone();
        sender
            .send(Box::new(move || spawner.process_stripe(&shared, &feed, &stripe)))
            .map_err(|_| LoadError::EngineStopped)
    }

    /// Runs on the conveyor thread. The stripe's records stop counting as
    /// outstanding work and the new keys start counting; a full batch of
    /// pending keys becomes a task.
    pub(crate) fn process_stripe(
        &self,
        shared: &Arc<EngineShared>,
        feed: &DependentFeed,
        stripe: &[Arc<Record>],
    ) -> Option<RunnerTask> {
        let mut indices = self.indices.lock();
        let Some(index) = indices.get_mut(feed.slot) else {
            shared.change_count(-(stripe.len() as i64));
            return None;
        };

        let before = index.total_keys();
        let added = index.add_stripe(&feed.owner_class, &feed.owner_attributes, stripe);
        let new_keys = (index.total_keys() - before) as i64;
        shared.change_count(new_keys - stripe.len() as i64);

        if let Err(e) = added {
            error!("Dependent index {} of {} failed: {}", index.describe_extractor(), self.class.name, e);
            shared.record_fatal(e);
            return None;
        }

        if index.pending_len() >= self.task_size {
            let attributes = index.attributes().to_vec();
            let keys = index.take_pending(self.task_size);
            drop(indices);
            return Some(self.spawn_task(shared, attributes, keys));
        }
        None
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.indices.lock().iter().any(|i| i.pending_len() > 0)
    }

    /// Turn whatever is pending in the first non-empty index into a task.
    pub(crate) fn build_partial_task(&self, shared: &Arc<EngineShared>) -> Option<RunnerTask> {
        let (attributes, keys) = {
            let mut indices = self.indices.lock();
            let index = indices.iter_mut().find(|i| i.pending_len() > 0)?;
            (index.attributes().to_vec(), index.take_pending(self.task_size))
        };
        Some(self.spawn_task(shared, attributes, keys))
    }

    /// Add the keys of owners that are already cached to the index at
    /// `feed.slot`. New keys count as outstanding work until spawned.
    pub(crate) fn seed(&self, shared: &Arc<EngineShared>, feed: &DependentFeed, owners: &[Arc<Record>]) -> Result<usize> {
        let mut indices = self.indices.lock();
        let index = indices.get_mut(feed.slot).ok_or_else(|| {
            LoadError::Config(format!("{} has no key index in slot {}", self.class.name, feed.slot))
        })?;
        let before = index.total_keys();
        let added = index.add_stripe(&feed.owner_class, &feed.owner_attributes, owners);
        let new_keys = index.total_keys() - before;
        shared.change_count(new_keys as i64);
        added.map(|_| new_keys)
    }

    /// The new runner counts before the consumed keys stop counting, so the
    /// outstanding work never dips to zero in between.
    fn spawn_task(&self, shared: &Arc<EngineShared>, attributes: Vec<String>, keys: Vec<Key>) -> RunnerTask {
        let consumed = keys.len() as i64;
        let operation = self
            .base_operation
            .clone()
            .with_additional(Operation::in_keys(attributes, keys));
        let mut task = LoadingTask::new(Arc::clone(&self.class), operation).with_post_filter(self.post_filter.clone());
        for feed in self.dependents.lock().iter() {
            task.add_dependent(feed.clone());
        }

        let runner = LoadingTaskRunner::new(shared, task, RunnerState::Queued, Vec::new(), self.pool_name.clone());
        shared.change_count(-consumed);
        debug!("Spawned {} for {} key(s)", runner.describe(), consumed);
        RunnerTask::new(runner, Arc::clone(shared), Arc::clone(&self.syslog))
    }

    /// Stop accepting stripes.
    pub(crate) fn close(&self) {
        self.cpu.lock().take();
    }

    pub fn monitors(&self) -> Vec<DependentKeyIndexMonitor> {
        self.indices
            .lock()
            .iter()
            .map(|index| DependentKeyIndexMonitor {
                class_name: self.class.name.clone(),
                extractor: index.describe_extractor(),
                pool: self.pool_name.clone(),
                source: self.source.to_string(),
                business_dates: self.dates.as_ref().map(|d| d.to_string()),
                key_count: index.total_keys(),
                pending_keys: index.pending_len(),
                spawned_tasks: index.spawned_tasks(),
            })
            .collect()
    }
}

impl fmt::Debug for DependentLoadingTaskSpawner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependentLoadingTaskSpawner")
            .field("id", &self.id)
            .field("class", &self.class.name)
            .field("source", &self.source)
            .field("dates", &self.dates)
            .field("pool", &self.pool_name)
            .finish()
    }
}
