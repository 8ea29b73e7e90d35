//! Bulk cache loading.
//!
//! A [`CacheLoaderContext`] turns a [`CachePlan`] into loading tasks, hands
//! them to a [`CacheLoaderEngine`] and waits until every task, including the
//! dependent tasks spawned while owner records stream in, has finished.

pub mod class;
pub mod context;
pub mod dependent;
pub mod engine;
pub mod factory;
pub mod filter;
pub mod loaders;
pub mod memory;
pub mod monitor;
pub mod runner;
pub mod syslog;
pub mod task;

pub use class::{ClassCache, ClassCatalog, ClassHandle, Cursor, DatabaseResolver, RecordSource};
pub use context::{CacheLoaderContext, CachePlan, LoadKind, LoadSummary, PlanSpec, QualifiedLoadContext};
pub use dependent::Relationship;
pub use engine::{CacheLoaderEngine, ThreadPoolHolder};
pub use factory::{FactoryRegistry, FullLoadFactory, PerDateLoadFactory, RefreshWindow, TopLevelLoaderFactory};
pub use filter::CacheIndexFilter;
pub use loaders::{DependentLoader, DependentLoaderSpec, LoadSetup, LoaderSources, TopLevelLoader};
pub use memory::{MemoryCache, MemoryTable, StaticCatalog};
pub use monitor::{CacheLoaderMonitor, DependentKeyIndexMonitor, TaskMonitor, ThreadPoolMonitor};
pub use runner::{LoadingTaskRunner, RunnerState};
pub use syslog::{ReplicaLogProbe, SyslogChecker};
pub use task::{LoadOperation, LoadingTask, PostLoadFilter, RecordFilter, TaskOperationDefinition};
