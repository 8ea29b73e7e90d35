use std::sync::Arc;

use indexmap::IndexMap;
use preload_core::{
    create_multi_date_clusters, create_single_date_clusters, DateCluster, Operation, Result, SourceAttribute, Value,
};
use tracing::debug;

use crate::class::ClassHandle;
use crate::context::LoadKind;
use crate::factory::TopLevelLoaderFactory;
use crate::loaders::LoadSetup;
use crate::runner::{LoadingTaskRunner, RunnerState};
use crate::task::{LoadOperation, LoadingTask, PostLoadFilter, TaskOperationDefinition};

/// A class loaded on its own, once per source attribute.
#[derive(Clone)]
pub struct TopLevelLoader {
    pub class_name: String,
    pub factory: Arc<dyn TopLevelLoaderFactory>,
    /// Empty means the global store only.
    pub source_attributes: Vec<SourceAttribute>,
    /// Classes whose tasks must finish before this class's tasks start.
    pub prerequisites: Vec<String>,
    pub params: IndexMap<String, Value>,
}

impl TopLevelLoader {
    pub fn new(class_name: impl Into<String>, factory: Arc<dyn TopLevelLoaderFactory>) -> Self {
        Self {
            class_name: class_name.into(),
            factory,
            source_attributes: Vec::new(),
            prerequisites: Vec::new(),
            params: IndexMap::new(),
        }
    }

    pub fn with_source_attributes(mut self, sources: Vec<SourceAttribute>) -> Self {
        self.source_attributes = sources;
        self
    }

    pub fn with_prerequisites(mut self, classes: &[&str]) -> Self {
        self.prerequisites.extend(classes.iter().map(|c| c.to_string()));
        self
    }

    pub fn with_param(mut self, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(attribute.into(), value.into());
        self
    }

    /// Source attributes this loader runs for. The global store when none are set.
    pub fn sources(&self) -> Vec<SourceAttribute> {
        if self.source_attributes.is_empty() {
            vec![SourceAttribute::None]
        } else {
            self.source_attributes.clone()
        }
    }

    /// One waiting runner per task of every source attribute.
    pub fn create_runners(&self, setup: &LoadSetup<'_>, class: Arc<ClassHandle>) -> Result<Vec<Arc<LoadingTaskRunner>>> {
        let mut runners = Vec::new();
        for source in self.sources() {
            let tasks = create_load_tasks(
                setup,
                &class,
                self.factory.as_ref(),
                &source,
                &self.params,
                &PostLoadFilter::none(),
            )?;
            for task in tasks {
                runners.push(setup.engine.create_runner(
                    task,
                    RunnerState::WaitingForPrerequisites,
                    self.prerequisites.clone(),
                )?);
            }
        }
        debug!("{} produced {} loading task(s)", self.class_name, runners.len());
        Ok(runners)
    }
}

impl std::fmt::Debug for TopLevelLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopLevelLoader")
            .field("class", &self.class_name)
            .field("factory", &self.factory.name())
            .field("sources", &self.source_attributes)
            .field("prerequisites", &self.prerequisites)
            .finish()
    }
}

/// Business-date clusters of an initial load for `class`, `[None]` when the
/// class is undated or no dates were requested.
pub(crate) fn initial_clusters(
    setup: &LoadSetup<'_>,
    class: &ClassHandle,
    factory: &dyn TopLevelLoaderFactory,
) -> Vec<Option<DateCluster>> {
    if !class.is_dated() || setup.business_dates.is_empty() {
        return vec![None];
    }
    let clusters = if factory.single_date_clusters() {
        create_single_date_clusters(setup.business_dates)
    } else {
        create_multi_date_clusters(
            setup.business_dates,
            setup.engine.config().date_cluster_max_gap_days,
        )
    };
    clusters.into_iter().map(Some).collect()
}

/// Tasks loading `class` from `source` for the run described by `setup`.
pub(crate) fn create_load_tasks(
    setup: &LoadSetup<'_>,
    class: &Arc<ClassHandle>,
    factory: &dyn TopLevelLoaderFactory,
    source: &SourceAttribute,
    params: &IndexMap<String, Value>,
    post_filter: &PostLoadFilter,
) -> Result<Vec<LoadingTask>> {
    let mut additional = factory.additional_operations(class, params);
    if let Some(op) = setup.kind.qualification().additional_operation(&class.name) {
        additional.push(op);
    }
    let load_for = |dates: Option<&DateCluster>, shift: bool| {
        let base = factory.build_load_operation(class, dates, params);
        let shifted = if shift {
            dates.map(|d| factory.shift_date_cluster(d))
        } else {
            None
        };
        additional.iter().fold(
            LoadOperation::new(base).with_source(source.clone()).with_dates(shifted),
            |load, op| load.with_additional(op.clone()),
        )
    };

    let mut tasks = Vec::new();
    match setup.kind {
        LoadKind::Refresh(window) => {
            let dated = class.is_dated() && !setup.business_dates.is_empty();
            if !dated || setup.business_dates.len() == 1 || factory.single_date_clusters() {
                let clusters: Vec<Option<DateCluster>> = if dated {
                    create_single_date_clusters(setup.business_dates)
                        .into_iter()
                        .map(Some)
                        .collect()
                } else {
                    vec![None]
                };
                for cluster in clusters {
                    let load = load_for(cluster.as_ref(), true);
                    for definition in factory.build_refresh_task_definitions(class, load, window) {
                        tasks.push(
                            LoadingTask::from_definition(Arc::clone(class), definition)
                                .with_post_filter(post_filter.clone()),
                        );
                    }
                }
            } else {
                // One query for every date, split after loading.
                let all_dates = DateCluster::new(setup.business_dates.to_vec());
                let load = load_for(Some(&all_dates), false);
                let mut filter = post_filter.clone();
                if let Some(attribute) = &class.business_date_attribute {
                    for date in setup.business_dates {
                        filter = filter.with_date_filter(Operation::eq(
                            attribute.clone(),
                            factory.shift_business_date(*date),
                        ));
                    }
                }
                for definition in factory.build_refresh_task_definitions(class, load, window) {
                    tasks.push(
                        LoadingTask::from_definition(Arc::clone(class), definition).with_post_filter(filter.clone()),
                    );
                }
            }
        }
        LoadKind::Initial | LoadKind::Qualified(_) => {
            for cluster in initial_clusters(setup, class, factory) {
                let load = load_for(cluster.as_ref(), true);
                tasks.push(
                    LoadingTask::from_definition(Arc::clone(class), TaskOperationDefinition::new(load, true))
                        .with_post_filter(post_filter.clone()),
                );
            }
        }
    }
    Ok(tasks)
}
