use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::NaiveDate;
use indexmap::IndexMap;
use preload_core::{DateCluster, LoadError, Operation, Result, SourceAttribute, Value};
use tracing::{debug, info};

use crate::class::{ClassCatalog, ClassHandle};
use crate::context::LoadKind;
use crate::dependent::{DependentFeed, DependentLoadingTaskSpawner, Relationship};
use crate::factory::TopLevelLoaderFactory;
use crate::filter::CacheIndexFilter;
use crate::loaders::top_level::{create_load_tasks, initial_clusters};
use crate::loaders::{LoadSetup, SpawnerKey, SpawnerRegistry};
use crate::runner::{LoadingTaskRunner, RunnerState};
use crate::task::{LoadOperation, PostLoadFilter};

/// Configuration of a class loaded through a relationship from its owner.
#[derive(Clone)]
pub struct DependentLoaderSpec {
    pub relationship: Relationship,
    /// Only owners matching this filter contribute keys.
    pub owner_filter: Option<Operation>,
    /// Extra filter on the dependent class, part of the relationship itself.
    pub filtered_mapper: Option<Operation>,
    /// Supplies dates, shifting and extra operations for the dependent class.
    pub helper_factory: Arc<dyn TopLevelLoaderFactory>,
    /// Explicit source attributes; otherwise they are pulled from the owners.
    pub source_attributes: Option<Vec<SourceAttribute>>,
    pub params: IndexMap<String, Value>,
}

impl DependentLoaderSpec {
    pub fn new(relationship: Relationship, helper_factory: Arc<dyn TopLevelLoaderFactory>) -> Self {
        Self {
            relationship,
            owner_filter: None,
            filtered_mapper: None,
            helper_factory,
            source_attributes: None,
            params: IndexMap::new(),
        }
    }

    pub fn with_owner_filter(mut self, filter: Operation) -> Self {
        self.owner_filter = Some(filter);
        self
    }

    pub fn with_filtered_mapper(mut self, filter: Operation) -> Self {
        self.filtered_mapper = Some(filter);
        self
    }

    pub fn with_source_attributes(mut self, sources: Vec<SourceAttribute>) -> Self {
        self.source_attributes = Some(sources);
        self
    }

    pub fn with_param(mut self, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(attribute.into(), value.into());
        self
    }

    /// Relationship filters may not touch source or date attributes; those
    /// are decided by source attributes and factories.
    pub fn validate(&self, owner: &ClassHandle, dependent: &ClassHandle) -> Result<()> {
        if self.relationship.attributes.is_empty() {
            return Err(LoadError::Config(format!(
                "relationship {} maps no attributes",
                self.relationship
            )));
        }
        check_filter(&self.relationship, owner, self.owner_filter.as_ref())?;
        check_filter(&self.relationship, dependent, self.filtered_mapper.as_ref())
    }
}

fn check_filter(relationship: &Relationship, class: &ClassHandle, filter: Option<&Operation>) -> Result<()> {
    let Some(filter) = filter else {
        return Ok(());
    };
    let attributes = filter.attributes();
    if let Some(source) = &class.source_attribute {
        if attributes.contains(source) {
            return Err(LoadError::Config(format!(
                "filter {} on relationship {} uses source attribute '{}'; set source attributes on the loader instead",
                filter, relationship, source
            )));
        }
    }
    let mut dated: Vec<&String> = class.business_date_attribute.iter().collect();
    if let Some((from, to)) = &class.processing_date_attributes {
        dated.push(from);
        dated.push(to);
    }
    for attribute in dated {
        if attributes.contains(attribute) {
            return Err(LoadError::Config(format!(
                "filter {} on relationship {} uses date attribute '{}'; date logic belongs in the loader factory",
                filter, relationship, attribute
            )));
        }
    }
    Ok(())
}

/// Source attributes of one loader in the plan, used to resolve owners.
#[derive(Debug, Clone)]
pub struct LoaderSources {
    pub class_name: String,
    pub sources: Vec<SourceAttribute>,
}

/// A dependent class bound to its owner and dependent class handles.
pub struct DependentLoader {
    spec: DependentLoaderSpec,
    owner: Arc<ClassHandle>,
    class: Arc<ClassHandle>,
    source_attributes: Vec<SourceAttribute>,
}

impl DependentLoader {
    pub fn new(spec: DependentLoaderSpec, catalog: &dyn ClassCatalog) -> Result<Self> {
        let owner = catalog.class(&spec.relationship.owner_class)?;
        let class = catalog.class(&spec.relationship.dependent_class)?;
        spec.validate(&owner, &class)?;
        Ok(Self {
            spec,
            owner,
            class,
            source_attributes: Vec::new(),
        })
    }

    pub fn class_name(&self) -> &str {
        &self.class.name
    }

    pub fn owner_class_name(&self) -> &str {
        &self.owner.name
    }

    pub fn relationship(&self) -> &Relationship {
        &self.spec.relationship
    }

    pub fn source_attributes(&self) -> &[SourceAttribute] {
        &self.source_attributes
    }

    /// Union of the source attributes of every loader of the owner class.
    pub fn find_owner_loaders(&self, loaders: &[LoaderSources]) -> Result<Vec<SourceAttribute>> {
        let owners: Vec<&LoaderSources> = loaders
            .iter()
            .filter(|l| l.class_name == self.owner.name)
            .collect();
        if owners.is_empty() {
            return Err(LoadError::Config(format!(
                "dependent loader for {} cannot find a loader for its owner class {}",
                self.spec.relationship, self.owner.name
            )));
        }
        let mut sources: Vec<SourceAttribute> = Vec::new();
        for owner in owners {
            for source in &owner.sources {
                if !sources.contains(source) {
                    sources.push(source.clone());
                }
            }
        }
        Ok(sources)
    }

    /// Adopt the owners' source attributes. Returns true when the set changed,
    /// so chained dependents can be resolved to a fixpoint.
    pub fn pull_owner_source_attributes(&mut self, owner_sources: &[SourceAttribute]) -> bool {
        let fixed = match &self.spec.source_attributes {
            Some(explicit) => Some(explicit.clone()),
            None if !self.class.is_partitioned() => Some(vec![SourceAttribute::None]),
            None => None,
        };
        if let Some(fixed) = fixed {
            let changed = self.source_attributes != fixed;
            self.source_attributes = fixed;
            return changed;
        }
        let before = self.source_attributes.len();
        for source in owner_sources {
            if !self.source_attributes.contains(source) {
                self.source_attributes.push(source.clone());
            }
        }
        self.source_attributes.len() != before
    }

    fn sources(&self) -> Vec<SourceAttribute> {
        if self.source_attributes.is_empty() {
            vec![SourceAttribute::None]
        } else {
            self.source_attributes.clone()
        }
    }

    fn spawner_key(&self, source: &SourceAttribute, date: Option<NaiveDate>) -> SpawnerKey {
        SpawnerKey {
            class: self.class.name.clone(),
            source: source.clone(),
            date,
            attributes: self.spec.relationship.dependent_attributes(),
            mapper: self.spec.filtered_mapper.as_ref().map(|m| m.to_string()),
        }
    }

    /// Spawner dates for records of an owner task loaded for `owner_dates`.
    /// An owner without dates feeds every requested date.
    fn spawner_dates(&self, setup: &LoadSetup<'_>, owner_dates: Option<&DateCluster>) -> Vec<Option<NaiveDate>> {
        if !self.class.is_dated() || setup.business_dates.is_empty() {
            return vec![None];
        }
        let dates: Vec<NaiveDate> = match owner_dates {
            Some(cluster) => cluster.dates().to_vec(),
            None => setup.business_dates.to_vec(),
        };
        let shifted: BTreeSet<NaiveDate> = dates
            .into_iter()
            .map(|d| self.spec.helper_factory.shift_business_date(d))
            .collect();
        shifted.into_iter().map(Some).collect()
    }

    /// Register one spawner per source attribute and date cluster. Spawners
    /// whose keys are all taken by an equivalent loader are not created.
    pub(crate) fn create_spawners(&self, setup: &LoadSetup<'_>, registry: &mut SpawnerRegistry) -> Result<()> {
        let factory = self.spec.helper_factory.as_ref();
        let clusters: Vec<Option<DateCluster>> = match setup.kind {
            LoadKind::Refresh(_) if self.class.is_dated() && !setup.business_dates.is_empty() => setup
                .business_dates
                .iter()
                .map(|d| Some(DateCluster::single(*d)))
                .collect(),
            _ => initial_clusters(setup, &self.class, factory),
        };

        let mut additional = factory.additional_operations(&self.class, &self.spec.params);
        if let Some(op) = setup.kind.qualification().additional_operation(&self.class.name) {
            additional.push(op);
        }
        if let Some(mapper) = &self.spec.filtered_mapper {
            additional.push(mapper.clone());
        }

        for source in self.sources() {
            for cluster in &clusters {
                let shifted = cluster.as_ref().map(|c| factory.shift_date_cluster(c));
                let keys: Vec<SpawnerKey> = match &shifted {
                    Some(c) => c.dates().iter().map(|d| self.spawner_key(&source, Some(*d))).collect(),
                    None => vec![self.spawner_key(&source, None)],
                };
                if registry.contains_all(&keys) {
                    continue;
                }
                let base = factory.build_load_operation(&self.class, cluster.as_ref(), &self.spec.params);
                let operation = additional.iter().fold(
                    LoadOperation::new(base).with_source(source.clone()).with_dates(shifted),
                    |load, op| load.with_additional(op.clone()),
                );
                let spawner =
                    setup
                        .engine
                        .create_spawner(Arc::clone(&self.class), operation, PostLoadFilter::none())?;
                debug!("Created dependent spawner {:?} for {}", spawner, self.spec.relationship);
                registry.insert_missing(&keys, &spawner);
            }
        }
        Ok(())
    }

    /// Dependent source attributes fed by an owner task of `parent`:
    /// named to the same name, named to global when the dependent is global,
    /// global to every dependent source attribute.
    fn target_sources(&self, parent: &SourceAttribute) -> Vec<SourceAttribute> {
        let sources = self.sources();
        match parent {
            SourceAttribute::Named(_) => {
                if sources.contains(parent) {
                    vec![parent.clone()]
                } else if sources.first() == Some(&SourceAttribute::None) {
                    vec![SourceAttribute::None]
                } else {
                    Vec::new()
                }
            }
            SourceAttribute::None => sources,
        }
    }

    fn find_spawners(
        &self,
        setup: &LoadSetup<'_>,
        registry: &SpawnerRegistry,
        parent_source: &SourceAttribute,
        parent_dates: Option<&DateCluster>,
    ) -> Vec<Arc<DependentLoadingTaskSpawner>> {
        let mut found: Vec<Arc<DependentLoadingTaskSpawner>> = Vec::new();
        for source in self.target_sources(parent_source) {
            for date in self.spawner_dates(setup, parent_dates) {
                if let Some(spawner) = registry.get(&self.spawner_key(&source, date)) {
                    if !found.iter().any(|s| s.id() == spawner.id()) {
                        found.push(Arc::clone(spawner));
                    }
                }
            }
        }
        found
    }

    fn feed_for(&self, spawner: &DependentLoadingTaskSpawner) -> DependentFeed {
        let slot = spawner.index_for(self.spec.relationship.dependent_attributes(), self.spec.owner_filter.clone());
        DependentFeed {
            spawner: spawner.id(),
            slot,
            owner_class: self.owner.name.clone(),
            owner_attributes: Arc::from(self.spec.relationship.owner_attributes()),
        }
    }

    /// Make owner runners and owner spawners (for chained dependents) feed
    /// this loader's spawners.
    pub(crate) fn attach_dependents(
        &self,
        setup: &LoadSetup<'_>,
        registry: &SpawnerRegistry,
        runners: &[Arc<LoadingTaskRunner>],
    ) -> Result<()> {
        self.seed_from_owner_cache(setup, registry)?;

        let mut attached = 0;
        for runner in runners.iter().filter(|r| r.class_name() == self.owner.name) {
            for spawner in self.find_spawners(setup, registry, runner.source(), runner.dates()) {
                if runner.add_dependent(self.feed_for(&spawner)) {
                    attached += 1;
                }
            }
        }
        for owner_spawner in registry.for_class(&self.owner.name) {
            for spawner in self.find_spawners(setup, registry, owner_spawner.source(), owner_spawner.dates()) {
                owner_spawner.add_dependent(self.feed_for(&spawner));
                attached += 1;
            }
        }
        debug!("Attached {} feed(s) for {}", attached, self.spec.relationship);
        Ok(())
    }

    /// In a qualified load of a dependent class whose owner is not reloaded,
    /// seed the key indices from the owners already cached.
    fn seed_from_owner_cache(&self, setup: &LoadSetup<'_>, registry: &SpawnerRegistry) -> Result<()> {
        if !setup
            .kind
            .qualification()
            .qualifies_dependents_of(&self.owner.name, &self.class.name)
        {
            return Ok(());
        }
        for source in self.sources() {
            let mut owners = Operation::All;
            if let (Some(attribute), Some(value)) = (&self.owner.source_attribute, source.as_value()) {
                owners = owners.and(Operation::Eq {
                    attribute: attribute.clone(),
                    value,
                });
            }
            match &self.owner.business_date_attribute {
                Some(attribute) if !setup.business_dates.is_empty() => {
                    owners = owners.and(Operation::in_keys(
                        vec![attribute.clone()],
                        setup.business_dates.iter().map(|d| vec![Value::Date(*d)]),
                    ));
                }
                _ => {}
            }
            let cached = self.owner.cache.find(&owners);
            for spawner in self.find_spawners(setup, registry, &source, None) {
                let feed = self.feed_for(&spawner);
                let added = spawner.seed(setup.engine.shared(), &feed, &cached)?;
                info!(
                    "Seeded {} key(s) for {} from {} cached {} record(s)",
                    added,
                    self.spec.relationship,
                    cached.len(),
                    self.owner.name
                );
            }
        }
        Ok(())
    }

    /// In a refresh, reload dependents of cached owners through the helper
    /// factory, keeping only records an owner in the cache still references.
    pub(crate) fn create_refresh_runners(&self, setup: &LoadSetup<'_>) -> Result<Vec<Arc<LoadingTaskRunner>>> {
        if !matches!(setup.kind, LoadKind::Refresh(_)) {
            return Ok(Vec::new());
        }
        let filter = CacheIndexFilter::create(
            Arc::clone(&self.owner.cache),
            &self.spec.relationship,
            self.spec.owner_filter.clone(),
        )?
        .with_dependent_filter(self.spec.filtered_mapper.clone());
        let post_filter = PostLoadFilter::none().with_filter(Arc::new(filter));

        let mut runners = Vec::new();
        for source in self.sources() {
            for task in create_load_tasks(
                setup,
                &self.class,
                self.spec.helper_factory.as_ref(),
                &source,
                &self.spec.params,
                &post_filter,
            )? {
                runners.push(setup.engine.create_runner(task, RunnerState::WaitingForPrerequisites, Vec::new())?);
            }
        }
        Ok(runners)
    }
}

impl std::fmt::Debug for DependentLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DependentLoader")
            .field("relationship", &self.spec.relationship.to_string())
            .field("owner_filter", &self.spec.owner_filter)
            .field("sources", &self.source_attributes)
            .finish()
    }
}
