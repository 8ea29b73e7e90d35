//! One end-to-end load run: plan in, populated caches and a summary out.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use preload_core::{LoadError, LoaderConfig, Operation, Result, SourceAttribute, Value};
use preload_queue::AbandonedThreadBudget;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::class::ClassCatalog;
use crate::dependent::Relationship;
use crate::engine::CacheLoaderEngine;
use crate::factory::{FactoryRegistry, RefreshWindow};
use crate::loaders::{DependentLoader, DependentLoaderSpec, LoadSetup, LoaderSources, SpawnerRegistry, TopLevelLoader};
use crate::monitor::CacheLoaderMonitor;
use crate::runner::RunnerState;
use crate::syslog::ReplicaLogProbe;

// ── Run kinds ─────────────────────────────────────────────────

/// Which classes a qualified load covers, with an optional extra filter each.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum QualifiedLoadContext {
    #[default]
    All,
    Qualified(IndexMap<String, Option<Operation>>),
}

static QUALIFY_ALL: QualifiedLoadContext = QualifiedLoadContext::All;

impl QualifiedLoadContext {
    pub fn qualified() -> Self {
        QualifiedLoadContext::Qualified(IndexMap::new())
    }

    /// Include `class`, optionally restricted by `filter`.
    pub fn with_class(self, class: impl Into<String>, filter: Option<Operation>) -> Self {
        let mut classes = match self {
            QualifiedLoadContext::All => IndexMap::new(),
            QualifiedLoadContext::Qualified(classes) => classes,
        };
        classes.insert(class.into(), filter);
        QualifiedLoadContext::Qualified(classes)
    }

    pub fn qualifies(&self, class: &str) -> bool {
        match self {
            QualifiedLoadContext::All => true,
            QualifiedLoadContext::Qualified(classes) => classes.contains_key(class),
        }
    }

    pub fn additional_operation(&self, class: &str) -> Option<Operation> {
        match self {
            QualifiedLoadContext::All => None,
            QualifiedLoadContext::Qualified(classes) => classes.get(class).cloned().flatten(),
        }
    }

    /// Whether `dependent` is loaded from cached owners: it is qualified but
    /// its owner class is not reloaded.
    pub fn qualifies_dependents_of(&self, owner: &str, dependent: &str) -> bool {
        match self {
            QualifiedLoadContext::All => false,
            QualifiedLoadContext::Qualified(classes) => {
                classes.contains_key(dependent) && !classes.contains_key(owner)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadKind {
    Initial,
    Refresh(RefreshWindow),
    Qualified(QualifiedLoadContext),
}

impl LoadKind {
    pub fn name(&self) -> &'static str {
        match self {
            LoadKind::Initial => "initial",
            LoadKind::Refresh(_) => "refresh",
            LoadKind::Qualified(_) => "qualified",
        }
    }

    pub fn qualification(&self) -> &QualifiedLoadContext {
        match self {
            LoadKind::Qualified(qualification) => qualification,
            _ => &QUALIFY_ALL,
        }
    }
}

// ── Plans ─────────────────────────────────────────────────────

/// What to load: top-level classes and the dependents reached from them.
#[derive(Clone, Default)]
pub struct CachePlan {
    pub top_level: Vec<TopLevelLoader>,
    pub dependents: Vec<DependentLoaderSpec>,
}

impl CachePlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_top_level(mut self, loader: TopLevelLoader) -> Self {
        self.top_level.push(loader);
        self
    }

    pub fn with_dependent(mut self, spec: DependentLoaderSpec) -> Self {
        self.dependents.push(spec);
        self
    }

    /// Prerequisite chains that loop back on themselves.
    pub fn check_prerequisite_cycles(&self) -> Result<()> {
        let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
        for loader in &self.top_level {
            edges
                .entry(loader.class_name.as_str())
                .or_default()
                .extend(loader.prerequisites.iter().map(|p| p.as_str()));
        }

        fn visit<'a>(
            class: &'a str,
            edges: &HashMap<&'a str, Vec<&'a str>>,
            path: &mut Vec<&'a str>,
            done: &mut HashSet<&'a str>,
        ) -> Result<()> {
            if done.contains(class) {
                return Ok(());
            }
            if let Some(start) = path.iter().position(|c| *c == class) {
                let mut cycle: Vec<&str> = path[start..].to_vec();
                cycle.push(class);
                return Err(LoadError::Config(format!("prerequisite cycle: {}", cycle.join(" -> "))));
            }
            path.push(class);
            for next in edges.get(class).into_iter().flatten() {
                visit(*next, edges, path, done)?;
            }
            path.pop();
            done.insert(class);
            Ok(())
        }

        let mut done = HashSet::new();
        let mut roots: Vec<&str> = edges.keys().copied().collect();
        roots.sort_unstable();
        for class in roots {
            visit(class, &edges, &mut Vec::new(), &mut done)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopLevelSpec {
    pub class: String,
    #[serde(default = "default_factory")]
    pub factory: String,
    #[serde(default)]
    pub source_attributes: Vec<String>,
    #[serde(default)]
    pub prerequisites: Vec<String>,
    #[serde(default)]
    pub params: IndexMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependentSpec {
    pub relationship: Relationship,
    #[serde(default = "default_factory")]
    pub factory: String,
    #[serde(default)]
    pub owner_filter: Option<Operation>,
    #[serde(default)]
    pub filtered_mapper: Option<Operation>,
    #[serde(default)]
    pub source_attributes: Option<Vec<String>>,
    #[serde(default)]
    pub params: IndexMap<String, Value>,
}

fn default_factory() -> String {
    "full".to_string()
}

fn named_sources(names: &[String]) -> Vec<SourceAttribute> {
    names.iter().map(SourceAttribute::named).collect()
}

/// Serializable form of a [`CachePlan`], with factories named by registry key.
///
/// ```toml
/// [[top_level]]
/// class = "Contract"
/// factory = "dated"
/// source_attributes = ["NYK", "TKO"]
///
/// [[dependent]]
/// factory = "full"
/// [dependent.relationship]
/// name = "product"
/// owner_class = "Contract"
/// dependent_class = "Product"
/// attributes = [["productId", "id"]]
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanSpec {
    #[serde(default)]
    pub top_level: Vec<TopLevelSpec>,
    #[serde(default, rename = "dependent")]
    pub dependents: Vec<DependentSpec>,
}

impl PlanSpec {
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Resolve factory names. Unknown names fail here, before anything runs.
    pub fn into_plan(self, registry: &FactoryRegistry) -> Result<CachePlan> {
        let mut plan = CachePlan::new();
        for spec in self.top_level {
            let mut loader = TopLevelLoader::new(spec.class, registry.get(&spec.factory)?)
                .with_source_attributes(named_sources(&spec.source_attributes));
            loader.prerequisites = spec.prerequisites;
            loader.params = spec.params;
            plan = plan.with_top_level(loader);
        }
        for spec in self.dependents {
            let mut dependent = DependentLoaderSpec::new(spec.relationship, registry.get(&spec.factory)?);
            dependent.owner_filter = spec.owner_filter;
            dependent.filtered_mapper = spec.filtered_mapper;
            dependent.source_attributes = spec.source_attributes.as_deref().map(named_sources);
            dependent.params = spec.params;
            plan = plan.with_dependent(dependent);
        }
        Ok(plan)
    }
}

// ── Context ───────────────────────────────────────────────────

/// Outcome of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct LoadSummary {
    pub run_id: Uuid,
    pub kind: String,
    pub tasks: usize,
    pub completed: usize,
    pub failed: usize,
    pub rows: usize,
    pub dependent_tasks: usize,
    pub elapsed_ms: i64,
}

impl LoadSummary {
    fn from_monitor(monitor: &CacheLoaderMonitor) -> Self {
        let finished = monitor.finished_at.unwrap_or_else(Utc::now);
        Self {
            run_id: monitor.run_id,
            kind: monitor.kind.clone(),
            tasks: monitor.tasks.len(),
            completed: monitor.tasks_in(RunnerState::Completed),
            failed: monitor.tasks_in(RunnerState::Failed),
            rows: monitor.total_rows(),
            dependent_tasks: monitor.dependent_indices.iter().map(|i| i.spawned_tasks).sum(),
            elapsed_ms: (finished - monitor.started_at).num_milliseconds(),
        }
    }
}

/// Runs plans of one kind against one catalog.
pub struct CacheLoaderContext {
    config: LoaderConfig,
    catalog: Arc<dyn ClassCatalog>,
    kind: LoadKind,
    business_dates: Vec<NaiveDate>,
    budget: Option<Arc<AbandonedThreadBudget>>,
    replica_probe: Option<Arc<dyn ReplicaLogProbe>>,
    monitor: Mutex<Option<CacheLoaderMonitor>>,
    engine: Mutex<Option<Arc<CacheLoaderEngine>>>,
}

impl CacheLoaderContext {
    pub fn new(
        config: LoaderConfig,
        catalog: Arc<dyn ClassCatalog>,
        kind: LoadKind,
        mut business_dates: Vec<NaiveDate>,
    ) -> Self {
        business_dates.sort();
        business_dates.dedup();
        Self {
            config,
            catalog,
            kind,
            business_dates,
            budget: None,
            replica_probe: None,
            monitor: Mutex::new(None),
            engine: Mutex::new(None),
        }
    }

    /// Share an abandoned-thread budget across runs.
    pub fn with_budget(mut self, budget: Arc<AbandonedThreadBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    pub fn with_replica_probe(mut self, probe: Arc<dyn ReplicaLogProbe>) -> Self {
        self.replica_probe = Some(probe);
        self
    }

    pub fn kind(&self) -> &LoadKind {
        &self.kind
    }

    pub fn business_dates(&self) -> &[NaiveDate] {
        &self.business_dates
    }

    /// Snapshot of the current (or last) run.
    pub fn monitor(&self) -> Option<CacheLoaderMonitor> {
        let mut monitor = self.monitor.lock().clone()?;
        if let Some(engine) = self.engine.lock().as_ref() {
            refresh_monitor(&mut monitor, engine);
        }
        Some(monitor)
    }

    /// Create the work for `plan`, run it to completion and report.
    ///
    /// Setup errors (unknown classes, missing owners, prerequisite cycles)
    /// fail before any task starts. Pools are shut down on every path.
    pub fn execute(&self, plan: &CachePlan) -> Result<LoadSummary> {
        let mut engine = CacheLoaderEngine::new(self.config.clone())?;
        if let Some(budget) = &self.budget {
            engine = engine.with_budget(Arc::clone(budget));
        }
        if let Some(probe) = &self.replica_probe {
            engine.set_replica_probe(Arc::clone(probe));
        }
        let engine = Arc::new(engine);
        *self.monitor.lock() = Some(CacheLoaderMonitor::new(self.kind.name(), self.business_dates.clone()));
        *self.engine.lock() = Some(Arc::clone(&engine));
        info!(
            "Starting {} cache load for {} business date(s)",
            self.kind.name(),
            self.business_dates.len()
        );

        let result = self
            .create_work(&engine, plan)
            .and_then(|()| engine.wait_until_all_tasks_completed());
        engine.shutdown();

        let mut monitor = self
            .monitor
            .lock()
            .take()
            .unwrap_or_else(|| CacheLoaderMonitor::new(self.kind.name(), self.business_dates.clone()));
        refresh_monitor(&mut monitor, &engine);
        monitor.finished_at = Some(Utc::now());
        if let Err(e) = &result {
            error!("{} cache load failed: {}", self.kind.name(), e);
            monitor.exception = Some(e.to_string());
        }
        let summary = LoadSummary::from_monitor(&monitor);
        *self.monitor.lock() = Some(monitor);
        *self.engine.lock() = None;

        result.map(|()| {
            info!(
                "{} cache load finished: {} task(s), {} row(s) in {}ms",
                summary.kind, summary.tasks, summary.rows, summary.elapsed_ms
            );
            summary
        })
    }

    fn create_work(&self, engine: &CacheLoaderEngine, plan: &CachePlan) -> Result<()> {
        plan.check_prerequisite_cycles()?;
        let setup = LoadSetup {
            engine,
            kind: &self.kind,
            business_dates: &self.business_dates,
        };
        let qualification = self.kind.qualification();

        let mut runners = Vec::new();
        for loader in &plan.top_level {
            if !qualification.qualifies(&loader.class_name) {
                continue;
            }
            let class = self.catalog.class(&loader.class_name)?;
            runners.extend(loader.create_runners(&setup, class)?);
        }

        let mut dependents = plan
            .dependents
            .iter()
            .map(|spec| DependentLoader::new(spec.clone(), self.catalog.as_ref()))
            .collect::<Result<Vec<_>>>()?;
        resolve_source_attributes(&plan.top_level, &mut dependents)?;

        let mut registry = SpawnerRegistry::default();
        for dependent in &dependents {
            dependent.create_spawners(&setup, &mut registry)?;
        }
        for dependent in &dependents {
            runners.extend(dependent.create_refresh_runners(&setup)?);
        }
        for dependent in &dependents {
            dependent.attach_dependents(&setup, &registry, &runners)?;
        }

        info!(
            "Created {} loading task(s) and {} dependent spawner key(s)",
            runners.len(),
            registry.len()
        );
        for runner in runners {
            engine.add_task_to_load(runner)?;
        }
        engine.attach_prerequisites();
        for runner in engine.waiting_runners() {
            for class in runner.prerequisite_classes() {
                if !plan.top_level.iter().any(|l| &l.class_name == class) {
                    warn!("{} waits on {}, which is not part of the plan", runner.describe(), class);
                }
            }
        }
        Ok(())
    }
}

/// Pull owner source attributes into dependents until nothing changes, so
/// chains of dependents see the sources of their top-level ancestors.
fn resolve_source_attributes(top_level: &[TopLevelLoader], dependents: &mut [DependentLoader]) -> Result<()> {
    loop {
        let mut loaders: Vec<LoaderSources> = top_level
            .iter()
            .map(|l| LoaderSources {
                class_name: l.class_name.clone(),
                sources: l.sources(),
            })
            .collect();
        loaders.extend(dependents.iter().map(|d| LoaderSources {
            class_name: d.class_name().to_string(),
            sources: d.source_attributes().to_vec(),
        }));

        let mut changed = false;
        for dependent in dependents.iter_mut() {
            let owner_sources = dependent.find_owner_loaders(&loaders)?;
            changed |= dependent.pull_owner_source_attributes(&owner_sources);
        }
        if !changed {
            return Ok(());
        }
    }
}

fn refresh_monitor(monitor: &mut CacheLoaderMonitor, engine: &CacheLoaderEngine) {
    monitor.tasks = engine.task_monitors();
    monitor.thread_pools = engine.thread_pool_monitors();
    monitor.dependent_indices = engine.dependent_key_index_monitors();
}
