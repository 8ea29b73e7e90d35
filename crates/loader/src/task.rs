//! Loading tasks: one query against a record source, streamed into the
//! class cache and fanned out to dependent key indices.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use preload_core::{DateCluster, Operation, Record, Result, SourceAttribute, Value};
use tracing::{debug, warn};

use crate::class::ClassHandle;
use crate::dependent::stripe::StripeBuffer;
use crate::dependent::DependentFeed;
use crate::engine::EngineShared;
use crate::syslog::SyslogChecker;

/// Records are handed to the cache in batches of this size.
const INSERT_BATCH: usize = 1000;

// ── Operations ────────────────────────────────────────────────

/// What a loading task asks its record source for.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadOperation {
    pub base: Operation,
    pub source: SourceAttribute,
    /// Business dates to load, for dated classes.
    pub dates: Option<DateCluster>,
    pub additional: Vec<Operation>,
}

impl LoadOperation {
    pub fn new(base: Operation) -> Self {
        Self {
            base,
            source: SourceAttribute::None,
            dates: None,
            additional: Vec::new(),
        }
    }

    pub fn all() -> Self {
        Self::new(Operation::All)
    }

    pub fn with_source(mut self, source: SourceAttribute) -> Self {
        self.source = source;
        self
    }

    pub fn with_dates(mut self, dates: Option<DateCluster>) -> Self {
        self.dates = dates;
        self
    }

    pub fn with_additional(mut self, operation: Operation) -> Self {
        if operation != Operation::All {
            self.additional.push(operation);
        }
        self
    }

    /// The full predicate for `class`: base, source partition, business dates
    /// and additional operations.
    pub fn to_operation(&self, class: &ClassHandle) -> Operation {
        let mut operation = self.base.clone();
        if let (Some(attribute), Some(value)) = (&class.source_attribute, self.source.as_value()) {
            operation = operation.and(Operation::Eq {
                attribute: attribute.clone(),
                value,
            });
        }
        if let (Some(attribute), Some(dates)) = (&class.business_date_attribute, &self.dates) {
            operation = operation.and(Operation::in_keys(
                vec![attribute.clone()],
                dates.dates().iter().map(|d| vec![Value::Date(*d)]),
            ));
        }
        for extra in &self.additional {
            operation = operation.and(extra.clone());
        }
        operation
    }
}

impl fmt::Display for LoadOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base)?;
        for extra in &self.additional {
            write!(f, " and {}", extra)?;
        }
        if self.source.is_source() {
            write!(f, " {}", self.source)?;
        }
        if let Some(dates) = &self.dates {
            write!(f, " [{}]", dates)?;
        }
        Ok(())
    }
}

/// One operation produced by a loader factory.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskOperationDefinition {
    pub operation: LoadOperation,
    /// Whether records loaded by this operation feed dependent loaders.
    pub needs_dependents: bool,
}

impl TaskOperationDefinition {
    pub fn new(operation: LoadOperation, needs_dependents: bool) -> Self {
        Self {
            operation,
            needs_dependents,
        }
    }
}

// ── Post-load filtering ───────────────────────────────────────

/// Client-side predicate applied to loaded records.
pub trait RecordFilter: Send + Sync {
    fn accepts(&self, record: &Record) -> bool;

    fn describe(&self) -> String;
}

impl RecordFilter for Operation {
    fn accepts(&self, record: &Record) -> bool {
        self.matches(record)
    }

    fn describe(&self) -> String {
        self.to_string()
    }
}

/// A record passes when it matches `filter` and, if any date filters exist,
/// at least one of them.
#[derive(Clone, Default)]
pub struct PostLoadFilter {
    filter: Option<Arc<dyn RecordFilter>>,
    date_filters: Vec<Operation>,
}

impl PostLoadFilter {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: Arc<dyn RecordFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_date_filter(mut self, filter: Operation) -> Self {
        self.date_filters.push(filter);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.filter.is_none() && self.date_filters.is_empty()
    }

    pub fn accepts(&self, record: &Record) -> bool {
        if let Some(filter) = &self.filter {
            if !filter.accepts(record) {
                return false;
            }
        }
        self.date_filters.is_empty() || self.date_filters.iter().any(|f| f.matches(record))
    }
}

impl fmt::Debug for PostLoadFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostLoadFilter")
            .field("filter", &self.filter.as_ref().map(|x| x.describe()))
            .field("date_filters", &self.date_filters.len())
            .finish()
    }
}

// ── Loading task ──────────────────────────────────────────────

/// One retrieval unit. Executed once, then dropped.
pub struct LoadingTask {
    class: Arc<ClassHandle>,
    operation: LoadOperation,
    post_filter: PostLoadFilter,
    dependents: Vec<DependentFeed>,
    needs_dependents: bool,
}

impl LoadingTask {
    pub fn new(class: Arc<ClassHandle>, operation: LoadOperation) -> Self {
        Self {
            class,
            operation,
            post_filter: PostLoadFilter::none(),
            dependents: Vec::new(),
            needs_dependents: true,
        }
    }

    pub fn from_definition(class: Arc<ClassHandle>, definition: TaskOperationDefinition) -> Self {
        let mut task = Self::new(class, definition.operation);
        task.needs_dependents = definition.needs_dependents;
        task
    }

    pub fn with_post_filter(mut self, filter: PostLoadFilter) -> Self {
        self.post_filter = filter;
        self
    }

    pub fn class(&self) -> &Arc<ClassHandle> {
        &self.class
    }

    pub fn operation(&self) -> &LoadOperation {
        &self.operation
    }

    pub fn needs_dependents(&self) -> bool {
        self.needs_dependents
    }

    pub fn dependent_count(&self) -> usize {
        self.dependents.len()
    }

    /// Feed loaded records into another key index. Ignored when this task does
    /// not feed dependents or already feeds that index.
    pub(crate) fn add_dependent(&mut self, feed: DependentFeed) -> bool {
        if !self.needs_dependents || self.dependents.contains(&feed) {
            return false;
        }
        self.dependents.push(feed);
        true
    }

    pub fn describe(&self) -> String {
        format!("{} {}", self.class.name, self.operation)
    }

    /// Stream the query into the cache and the dependent stripes. Returns the
    /// number of records kept.
    pub(crate) fn execute(self, shared: &Arc<EngineShared>, syslog: &SyslogChecker) -> Result<usize> {
        syslog.check_and_wait()?;

        let started = Instant::now();
        let operation = self.operation.to_operation(&self.class);
        debug!("Loading {}: {}", self.class.name, operation);

        let mut stripe = StripeBuffer::new(Arc::clone(shared), shared.config.stripe_size, self.dependents);
        let mut batch = Vec::with_capacity(INSERT_BATCH);
        let mut rows = 0;

        for record in self.class.source.find(&operation)? {
            let record = record?;
            if !self.post_filter.accepts(&record) {
                continue;
            }
            rows += 1;
            stripe.push(&record)?;
            batch.push(record);
            if batch.len() >= INSERT_BATCH {
                self.class.cache.insert(std::mem::take(&mut batch));
            }
        }
        if !batch.is_empty() {
            self.class.cache.insert(batch);
        }
        stripe.flush()?;

        let elapsed = started.elapsed();
        if elapsed > shared.config.slow_task_threshold() {
            warn!(
                "Slow loading task: {} {} loaded {} rows in {:?}",
                self.class.name, self.operation, rows, elapsed
            );
        }
        Ok(rows)
    }
}

impl fmt::Debug for LoadingTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadingTask")
            .field("class", &self.class.name)
            .field("operation", &self.operation)
            .field("dependents", &self.dependents.len())
            .finish()
    }
}
