use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use preload_core::{LoadError, LoaderConfig, Operation, Record, Result, Value};

use crate::class::{ClassCache, ClassHandle, Cursor, RecordSource};
use crate::dependent::stripe::StripeBuffer;
use crate::dependent::DependentFeed;
use crate::engine::CacheLoaderEngine;
use crate::memory::{MemoryCache, MemoryTable};
use crate::runner::RunnerState;
use crate::task::{LoadOperation, LoadingTask, PostLoadFilter};

fn test_config() -> LoaderConfig {
    LoaderConfig {
        threads_per_db_server: 2,
        stripe_size: 10,
        task_size: 50,
        ..LoaderConfig::default()
    }
}

fn class_with(name: &str, records: Vec<Record>) -> (Arc<ClassHandle>, Arc<MemoryCache>) {
    let cache = Arc::new(MemoryCache::new(name));
    let class = ClassHandle::new(name, cache.clone(), Arc::new(MemoryTable::new(name, records)));
    (Arc::new(class), cache)
}

fn products(n: i64) -> Vec<Record> {
    (0..n).map(|i| Record::new().with("id", i).with("name", format!("P{}", i))).collect()
}

/// Record source that logs the start and end of each query.
struct LoggingSource {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
    delay: Duration,
}

impl RecordSource for LoggingSource {
    fn find(&self, _operation: &Operation) -> Result<Cursor> {
        self.log.lock().push(format!("{}:start", self.name));
        thread::sleep(self.delay);
        self.log.lock().push(format!("{}:done", self.name));
        Ok(Box::new(std::iter::once(Ok(Arc::new(Record::new().with("id", 1))))))
    }
}

struct PanickingSource {
    calls: Arc<AtomicUsize>,
}

impl RecordSource for PanickingSource {
    fn find(&self, _operation: &Operation) -> Result<Cursor> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        panic!("driver exploded");
    }
}

#[test]
fn test_empty_engine_completes_immediately() {
    let engine = CacheLoaderEngine::new(test_config()).unwrap();
    engine.wait_until_all_tasks_completed().unwrap();
    assert_eq!(engine.count(), 0);
    assert!(engine.is_stopped());
}

#[test]
fn test_single_task_loads_into_cache() {
    let engine = CacheLoaderEngine::new(test_config()).unwrap();
    let (class, cache) = class_with("Product", products(20));

    let runner = engine
        .create_runner(LoadingTask::new(class, LoadOperation::all()), RunnerState::WaitingForPrerequisites, vec![])
        .unwrap();
    engine.add_task_to_load(Arc::clone(&runner)).unwrap();
    assert_eq!(engine.count(), 1);

    engine.wait_until_all_tasks_completed().unwrap();
    assert_eq!(cache.len(), 20);
    assert_eq!(runner.state(), RunnerState::Completed);
    assert_eq!(engine.count(), 0);

    let monitors = engine.task_monitors();
    assert_eq!(monitors.len(), 1);
    assert_eq!(monitors[0].rows, 20);
    assert_eq!(monitors[0].pool, "default");
    assert!(engine.dependent_key_index_monitors().is_empty());
}

#[test]
fn test_prerequisite_finishes_before_dependent_starts() {
    let engine = CacheLoaderEngine::new(test_config()).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let source = |name: &'static str, delay: u64| -> Arc<ClassHandle> {
        Arc::new(ClassHandle::new(
            name,
            Arc::new(MemoryCache::new(name)),
            Arc::new(LoggingSource {
                name,
                log: Arc::clone(&log),
                delay: Duration::from_millis(delay),
            }),
        ))
    };

    let later = engine
        .create_runner(
            LoadingTask::new(source("Account", 0), LoadOperation::all()),
            RunnerState::WaitingForPrerequisites,
            vec!["Desk".to_string()],
        )
        .unwrap();
    let first = engine
        .create_runner(
            LoadingTask::new(source("Desk", 80), LoadOperation::all()),
            RunnerState::WaitingForPrerequisites,
            vec![],
        )
        .unwrap();
    engine.add_task_to_load(later.clone()).unwrap();
    engine.add_task_to_load(first).unwrap();
    engine.attach_prerequisites();
    assert_eq!(later.prerequisite_count(), 1);

    engine.wait_until_all_tasks_completed().unwrap();
    assert_eq!(
        *log.lock(),
        vec!["Desk:start", "Desk:done", "Account:start", "Account:done"]
    );
}

#[test]
fn test_pools_are_frozen_once_scheduling_starts() {
    let engine = CacheLoaderEngine::new(test_config()).unwrap();
    engine.thread_pool("db1").unwrap();
    engine.wait_until_all_tasks_completed().unwrap();

    assert!(engine.thread_pool("db1").is_ok());
    assert!(matches!(engine.thread_pool("db2"), Err(LoadError::PoolsFrozen(name)) if name == "db2"));
}

#[test]
fn test_add_after_shutdown_is_refused() {
    let engine = CacheLoaderEngine::new(test_config()).unwrap();
    let (class, _) = class_with("Product", products(1));
    let runner = engine
        .create_runner(LoadingTask::new(class, LoadOperation::all()), RunnerState::WaitingForPrerequisites, vec![])
        .unwrap();
    engine.shutdown();

    assert!(matches!(engine.add_task_to_load(runner), Err(LoadError::EngineStopped)));
    assert!(matches!(engine.wait_until_all_tasks_completed(), Err(LoadError::EngineStopped)));
}

#[test]
fn test_failed_task_does_not_stop_independent_tasks() {
    let engine = CacheLoaderEngine::new(test_config()).unwrap();
    let table = Arc::new(MemoryTable::new("Contract", products(10)));
    table.fail_after(3);
    let broken = Arc::new(ClassHandle::new("Contract", Arc::new(MemoryCache::new("Contract")), table));
    let (healthy, healthy_cache) = class_with("Product", products(10));

    let failing = engine
        .create_runner(LoadingTask::new(broken, LoadOperation::all()), RunnerState::WaitingForPrerequisites, vec![])
        .unwrap();
    let passing = engine
        .create_runner(LoadingTask::new(healthy, LoadOperation::all()), RunnerState::WaitingForPrerequisites, vec![])
        .unwrap();
    engine.add_task_to_load(failing.clone()).unwrap();
    engine.add_task_to_load(passing.clone()).unwrap();

    let err = engine.wait_until_all_tasks_completed().unwrap_err();
    assert!(matches!(err, LoadError::Aborted { count: 1, .. }));
    assert!(matches!(err.root(), LoadError::Source { class, .. } if class == "Contract"));
    assert_eq!(failing.state(), RunnerState::Failed);
    assert_eq!(passing.state(), RunnerState::Completed);
    assert_eq!(healthy_cache.len(), 10);
    assert_eq!(engine.count(), 0);
}

#[test]
fn test_panicking_source_fails_its_task() {
    let engine = CacheLoaderEngine::new(test_config()).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));
    let class = Arc::new(ClassHandle::new(
        "Trade",
        Arc::new(MemoryCache::new("Trade")),
        Arc::new(PanickingSource { calls: calls.clone() }),
    ));
    let runner = engine
        .create_runner(LoadingTask::new(class, LoadOperation::all()), RunnerState::WaitingForPrerequisites, vec![])
        .unwrap();
    engine.add_task_to_load(runner.clone()).unwrap();

    let err = engine.wait_until_all_tasks_completed().unwrap_err();
    assert!(matches!(err.root(), LoadError::Panicked { message, .. } if message.contains("driver exploded")));
    assert_eq!(runner.state(), RunnerState::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_fatal_error_aborts_with_outstanding_work() {
    let engine = CacheLoaderEngine::new(test_config()).unwrap();
    engine.shared.change_count(5);
    engine.shared.record_fatal(LoadError::Config("conveyor lost".into()));

    let err = engine.wait_until_all_tasks_completed().unwrap_err();
    assert!(matches!(err.root(), LoadError::Config(message) if message == "conveyor lost"));
    assert!(engine.is_stopped());
}

#[test]
fn test_queued_runner_added_before_start_is_deferred() {
    let engine = CacheLoaderEngine::new(test_config()).unwrap();
    let (class, cache) = class_with("Product", products(5));
    let runner = engine
        .create_runner(LoadingTask::new(class, LoadOperation::all()), RunnerState::Queued, vec![])
        .unwrap();
    engine.add_task_to_load(runner.clone()).unwrap();
    assert_eq!(runner.state(), RunnerState::Queued);

    engine.wait_until_all_tasks_completed().unwrap();
    assert_eq!(runner.state(), RunnerState::Completed);
    assert_eq!(cache.len(), 5);
}

#[test]
fn test_duplicate_keys_still_drain_to_zero() {
    let engine = CacheLoaderEngine::new(test_config()).unwrap();
    // 100 owners referencing only 3 products: most stripes add no new key.
    let contracts: Vec<Record> = (0..100)
        .map(|i| Record::new().with("id", i).with("productId", i % 3))
        .collect();
    let (owner, _) = class_with("Contract", contracts);
    let (product, product_cache) = class_with("Product", products(10));

    let spawner = engine
        .create_spawner(product, LoadOperation::all(), PostLoadFilter::none())
        .unwrap();
    let slot = spawner.index_for(vec!["id".to_string()], None);

    let runner = engine
        .create_runner(LoadingTask::new(owner, LoadOperation::all()), RunnerState::WaitingForPrerequisites, vec![])
        .unwrap();
    assert!(runner.add_dependent(DependentFeed {
        spawner: spawner.id(),
        slot,
        owner_class: "Contract".to_string(),
        owner_attributes: Arc::from(vec!["productId".to_string()]),
    }));
    engine.add_task_to_load(runner).unwrap();

    engine.wait_until_all_tasks_completed().unwrap();
    assert_eq!(engine.count(), 0);

    let mut ids: Vec<Value> = product_cache
        .records()
        .iter()
        .filter_map(|r| r.get("id").cloned())
        .collect();
    ids.sort();
    assert_eq!(ids, vec![Value::Int(0), Value::Int(1), Value::Int(2)]);

    let monitors = engine.dependent_key_index_monitors();
    assert_eq!(monitors.len(), 1);
    assert_eq!(monitors[0].key_count, 3);
    assert_eq!(monitors[0].pending_keys, 0);
    assert_eq!(monitors[0].spawned_tasks, 1);
}

#[test]
fn test_outstanding_count_follows_each_unit_of_work() {
    let engine = CacheLoaderEngine::new(test_config()).unwrap();
    let shared = Arc::clone(&engine.shared);
    let (owner, _) = class_with("Contract", vec![]);
    let (product, _) = class_with("Product", products(10));

    let spawner = engine
        .create_spawner(product, LoadOperation::all(), PostLoadFilter::none())
        .unwrap();
    let feed = |slot: usize, attribute: &str| DependentFeed {
        spawner: spawner.id(),
        slot,
        owner_class: "Contract".to_string(),
        owner_attributes: Arc::from(vec![attribute.to_string()]),
    };
    let by_id = feed(spawner.index_for(vec!["id".to_string()], None), "productId");
    let by_code = feed(spawner.index_for(vec!["code".to_string()], None), "productCode");

    let _owner_runner = engine
        .create_runner(LoadingTask::new(owner, LoadOperation::all()), RunnerState::WaitingForPrerequisites, vec![])
        .unwrap();
    assert_eq!(engine.count(), 1);

    // Each buffered record counts once per feed.
    let stripe: Vec<Arc<Record>> = (0..4i64)
        .map(|i| Arc::new(Record::new().with("id", i).with("productId", i % 3).with("productCode", "X")))
        .collect();
    let mut buffer = StripeBuffer::new(Arc::clone(&shared), 100, vec![by_id.clone(), by_code.clone()]);
    for record in &stripe {
        buffer.push(record).unwrap();
    }
    assert_eq!(engine.count(), 9);

    // Handing the stripe to the conveyor moves no units.
    buffer.flush().unwrap();
    drop(buffer);
    assert_eq!(engine.count(), 9);

    // Merging swaps the stripe's records for the keys it added.
    assert!(spawner.process_stripe(&shared, &by_id, &stripe).is_none());
    assert_eq!(engine.count(), 9 + 3 - 4);
    assert!(spawner.process_stripe(&shared, &by_code, &stripe).is_none());
    assert_eq!(engine.count(), 8 + 1 - 4);

    // A spawned task counts as one runner in place of its keys.
    let first = spawner.build_partial_task(&shared);
    assert!(first.is_some());
    assert_eq!(engine.count(), 5 + 1 - 3);
    let second = spawner.build_partial_task(&shared);
    assert!(second.is_some());
    assert_eq!(engine.count(), 3 + 1 - 1);
    assert!(spawner.build_partial_task(&shared).is_none());
    assert_eq!(engine.count(), 3);

    for _ in 0..3 {
        shared.runner_finished();
    }
    assert_eq!(engine.count(), 0);
    assert!(shared.take_errors().is_empty());
}

#[test]
fn test_negative_count_aborts_the_run() {
    let engine = CacheLoaderEngine::new(test_config()).unwrap();
    engine.shared.change_count(2);
    engine.shared.change_count(-3);
    assert_eq!(engine.count(), -1);

    let err = engine.wait_until_all_tasks_completed().unwrap_err();
    assert!(matches!(err, LoadError::Aborted { count: 1, .. }));
    assert!(matches!(err.root(), LoadError::CountUnderflow(-1)));
}

#[test]
fn test_finishing_an_uncounted_runner_is_an_underflow() {
    let engine = CacheLoaderEngine::new(test_config()).unwrap();
    engine.shared.runner_finished();
    assert_eq!(engine.count(), -1);
    assert!(matches!(
        engine.shared.take_errors().as_slice(),
        [LoadError::CountUnderflow(-1)]
    ));
}

#[test]
fn test_key_indices_of_one_spawner_dedup_independently() {
    let engine = CacheLoaderEngine::new(test_config()).unwrap();
    let shared = Arc::clone(&engine.shared);
    let (product, _) = class_with("Product", products(10));
    let spawner = engine
        .create_spawner(product, LoadOperation::all(), PostLoadFilter::none())
        .unwrap();
    let feed = |slot: usize, attribute: &str| DependentFeed {
        spawner: spawner.id(),
        slot,
        owner_class: "Contract".to_string(),
        owner_attributes: Arc::from(vec![attribute.to_string()]),
    };
    let by_id = feed(spawner.index_for(vec!["id".to_string()], None), "productId");
    let by_code = feed(spawner.index_for(vec!["code".to_string()], None), "productCode");

    // Same value through two relationships: each index keeps its own key.
    let stripe = vec![Arc::new(Record::new().with("productId", 7).with("productCode", 7))];
    shared.change_count(2);
    spawner.process_stripe(&shared, &by_id, &stripe);
    spawner.process_stripe(&shared, &by_code, &stripe);
    assert_eq!(engine.count(), 2);

    let monitors = spawner.monitors();
    assert_eq!(monitors.len(), 2);
    assert!(monitors.iter().all(|m| m.key_count == 1 && m.pending_keys == 1));
}
