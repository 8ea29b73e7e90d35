//! Loaders turn a plan entry into runners and spawners.
//!
//! - `top_level`: classes loaded in full (or per business date)
//! - `dependent`: classes loaded by the keys their owners reference

mod dependent;
mod top_level;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use preload_core::SourceAttribute;

use crate::context::LoadKind;
use crate::dependent::DependentLoadingTaskSpawner;
use crate::engine::CacheLoaderEngine;

pub use self::dependent::{DependentLoader, DependentLoaderSpec, LoaderSources};
pub use self::top_level::TopLevelLoader;

/// What the loaders of one run share while creating their work.
pub struct LoadSetup<'a> {
    pub engine: &'a CacheLoaderEngine,
    pub kind: &'a LoadKind,
    pub business_dates: &'a [NaiveDate],
}

/// Identifies the spawner a dependent key lands in. Loaders that agree on
/// every field share one spawner, and with it one dedup index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct SpawnerKey {
    pub class: String,
    pub source: SourceAttribute,
    /// Shifted business date, `None` for undated classes.
    pub date: Option<NaiveDate>,
    pub attributes: Vec<String>,
    pub mapper: Option<String>,
}

/// Spawners of one run by key.
#[derive(Default)]
pub(crate) struct SpawnerRegistry {
    spawners: HashMap<SpawnerKey, Arc<DependentLoadingTaskSpawner>>,
}

impl SpawnerRegistry {
    pub fn get(&self, key: &SpawnerKey) -> Option<&Arc<DependentLoadingTaskSpawner>> {
        self.spawners.get(key)
    }

    /// Register `spawner` under every key not taken yet.
    pub fn insert_missing(&mut self, keys: &[SpawnerKey], spawner: &Arc<DependentLoadingTaskSpawner>) {
        for key in keys {
            self.spawners
                .entry(key.clone())
                .or_insert_with(|| Arc::clone(spawner));
        }
    }

    pub fn contains_all(&self, keys: &[SpawnerKey]) -> bool {
        keys.iter().all(|k| self.spawners.contains_key(k))
    }

    /// Distinct spawners loading `class`.
    pub fn for_class(&self, class: &str) -> Vec<Arc<DependentLoadingTaskSpawner>> {
        let mut out: Vec<Arc<DependentLoadingTaskSpawner>> = Vec::new();
        for (key, spawner) in &self.spawners {
            if key.class == class && !out.iter().any(|s| s.id() == spawner.id()) {
                out.push(Arc::clone(spawner));
            }
        }
        out.sort_by_key(|s| s.id());
        out
    }

    pub fn len(&self) -> usize {
        self.spawners.len()
    }
}
