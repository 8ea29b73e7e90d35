//! Loader factories decide what a top-level loader queries for.
//!
//! Factories are looked up by name in a [`FactoryRegistry`], so a plan file
//! can say `factory = "dated"` instead of naming an implementation type.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use indexmap::IndexMap;
use preload_core::{DateCluster, LoadError, Operation, Result, Value};

use crate::class::ClassHandle;
use crate::task::{LoadOperation, TaskOperationDefinition};

/// Processing-time window of a refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl RefreshWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The window ending now and starting `minutes` ago.
    pub fn last_minutes(minutes: i64) -> Self {
        let end = Utc::now();
        Self {
            start: end - Duration::minutes(minutes),
            end,
        }
    }
}

impl fmt::Display for RefreshWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} .. {}", self.start.to_rfc3339(), self.end.to_rfc3339())
    }
}

/// Builds the operations a top-level loader runs for one class.
pub trait TopLevelLoaderFactory: Send + Sync {
    /// Registry key, e.g. `"full"`.
    fn name(&self) -> &str;

    /// Base operation for one business-date cluster. `None` for undated loads.
    fn build_load_operation(
        &self,
        _class: &ClassHandle,
        _dates: Option<&DateCluster>,
        _params: &IndexMap<String, Value>,
    ) -> Operation {
        Operation::All
    }

    /// Split an initial load operation into the operations of a refresh.
    fn build_refresh_task_definitions(
        &self,
        class: &ClassHandle,
        load: LoadOperation,
        window: &RefreshWindow,
    ) -> Vec<TaskOperationDefinition>;

    /// Map a requested business date to the date actually loaded.
    fn shift_business_date(&self, date: NaiveDate) -> NaiveDate {
        date
    }

    fn shift_date_cluster(&self, dates: &DateCluster) -> DateCluster {
        dates.shifted(|d| self.shift_business_date(d))
    }

    /// Load every business date with its own query instead of clustering.
    fn load_business_dates_separately(&self) -> bool {
        false
    }

    /// Extra filters added to every load. By default each param is an
    /// equality filter on the attribute of the same name.
    fn additional_operations(&self, _class: &ClassHandle, params: &IndexMap<String, Value>) -> Vec<Operation> {
        params
            .iter()
            .map(|(attribute, value)| Operation::Eq {
                attribute: attribute.clone(),
                value: value.clone(),
            })
            .collect()
    }

    /// Whether the additional operations give the same result for every
    /// business date. Date-dependent operations force single-date clusters.
    fn is_date_invariant(&self) -> bool {
        true
    }

    /// Whether business dates must be loaded one per query.
    fn single_date_clusters(&self) -> bool {
        self.load_business_dates_separately() || !self.is_date_invariant()
    }
}

/// Refresh definitions for milestoned classes: rows created in the window
/// feed dependents, rows closed in the window only update the cache.
fn milestone_refresh_definitions(
    class: &ClassHandle,
    load: LoadOperation,
    window: &RefreshWindow,
) -> Vec<TaskOperationDefinition> {
    match &class.processing_date_attributes {
        Some((from, to)) => vec![
            TaskOperationDefinition::new(
                load.clone()
                    .with_additional(Operation::between(from.clone(), window.start, window.end)),
                true,
            ),
            TaskOperationDefinition::new(
                load.with_additional(Operation::between(to.clone(), window.start, window.end)),
                false,
            ),
        ],
        None => vec![TaskOperationDefinition::new(load, true)],
    }
}

/// Loads the whole class, clustering nearby business dates into one query.
#[derive(Debug, Default, Clone)]
pub struct FullLoadFactory;

impl TopLevelLoaderFactory for FullLoadFactory {
    fn name(&self) -> &str {
        "full"
    }

    fn build_refresh_task_definitions(
        &self,
        class: &ClassHandle,
        load: LoadOperation,
        window: &RefreshWindow,
    ) -> Vec<TaskOperationDefinition> {
        milestone_refresh_definitions(class, load, window)
    }
}

/// Loads each business date separately, optionally shifted by a fixed
/// number of days (e.g. `-1` loads the previous day's rows).
#[derive(Debug, Default, Clone)]
pub struct PerDateLoadFactory {
    shift_days: i64,
}

impl PerDateLoadFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shifted_by(days: i64) -> Self {
        Self { shift_days: days }
    }
}

impl TopLevelLoaderFactory for PerDateLoadFactory {
    fn name(&self) -> &str {
        "dated"
    }

    fn build_refresh_task_definitions(
        &self,
        class: &ClassHandle,
        load: LoadOperation,
        window: &RefreshWindow,
    ) -> Vec<TaskOperationDefinition> {
        milestone_refresh_definitions(class, load, window)
    }

    fn shift_business_date(&self, date: NaiveDate) -> NaiveDate {
        date + Duration::days(self.shift_days)
    }

    fn load_business_dates_separately(&self) -> bool {
        true
    }
}

/// Factories by name.
#[derive(Clone, Default)]
pub struct FactoryRegistry {
    factories: IndexMap<String, Arc<dyn TopLevelLoaderFactory>>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding `"full"` and `"dated"`.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(FullLoadFactory));
        registry.register(Arc::new(PerDateLoadFactory::new()));
        registry
    }

    /// Add or replace the factory registered under its name.
    pub fn register(&mut self, factory: Arc<dyn TopLevelLoaderFactory>) {
        self.factories.insert(factory.name().to_string(), factory);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn TopLevelLoaderFactory>> {
        self.factories
            .get(name)
            .cloned()
            .ok_or_else(|| LoadError::UnknownFactory(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(|k| k.as_str()).collect()
    }
}

impl fmt::Debug for FactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FactoryRegistry").field("factories", &self.names()).finish()
    }
}
