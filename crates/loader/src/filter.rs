//! Post-load filter keeping dependent records whose owner is already cached.

use std::sync::Arc;

use preload_core::{LoadError, Operation, Record, Result, Value};
use tracing::warn;

use crate::class::ClassCache;
use crate::dependent::Relationship;
use crate::task::RecordFilter;

/// Average owners per index bucket above which an owner filter is expensive.
const HIGH_ITERATION_VOLUME: f64 = 100.0;

/// Accepts a dependent record when the owner cache holds at least one owner
/// referencing it (and, with an owner filter, one that matches the filter).
pub struct CacheIndexFilter {
    owner_cache: Arc<dyn ClassCache>,
    owner_attributes: Vec<String>,
    dependent_attributes: Vec<String>,
    owner_filter: Option<Operation>,
    dependent_filter: Option<Operation>,
    description: String,
}

impl CacheIndexFilter {
    /// Fails when the owner cache has no index on the relationship's owner
    /// attributes.
    pub fn create(
        owner_cache: Arc<dyn ClassCache>,
        relationship: &Relationship,
        owner_filter: Option<Operation>,
    ) -> Result<Self> {
        let owner_attributes = relationship.owner_attributes();
        if !owner_cache.has_index(&owner_attributes) {
            return Err(LoadError::MissingIndex {
                relationship: relationship.to_string(),
                attributes: owner_attributes.join(", "),
            });
        }
        if let Some(filter) = &owner_filter {
            let volume = owner_cache.average_bucket_size(&owner_attributes);
            if volume > HIGH_ITERATION_VOLUME {
                warn!(
                    "Using index ({}) with filter {} may result in high iteration volume ({:.0})",
                    owner_attributes.join(", "),
                    filter,
                    volume
                );
            }
        }
        Ok(Self {
            owner_cache,
            owner_attributes,
            dependent_attributes: relationship.dependent_attributes(),
            owner_filter,
            dependent_filter: None,
            description: relationship.to_string(),
        })
    }

    /// Also require dependent records to match `filter`.
    pub fn with_dependent_filter(mut self, filter: Option<Operation>) -> Self {
        self.dependent_filter = filter;
        self
    }

    fn dependent_key(&self, record: &Record) -> Option<Vec<Value>> {
        let mut key = Vec::with_capacity(self.dependent_attributes.len());
        for attribute in &self.dependent_attributes {
            match record.get(attribute) {
                Some(Value::Null) | None => return None,
                Some(value) => key.push(value.clone()),
            }
        }
        Some(key)
    }
}

impl RecordFilter for CacheIndexFilter {
    fn accepts(&self, record: &Record) -> bool {
        if let Some(filter) = &self.dependent_filter {
            if !filter.matches(record) {
                return false;
            }
        }
        let Some(key) = self.dependent_key(record) else {
            return false;
        };
        match &self.owner_filter {
            None => self.owner_cache.contains(&self.owner_attributes, &key),
            Some(filter) => self
                .owner_cache
                .lookup(&self.owner_attributes, &key)
                .iter()
                .any(|owner| filter.matches(owner)),
        }
    }

    fn describe(&self) -> String {
        match &self.owner_filter {
            Some(filter) => format!("owners of {} where {}", self.description, filter),
            None => format!("owners of {}", self.description),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCache;

    fn relationship() -> Relationship {
        Relationship::new("product", "Contract", "Product", &[("productId", "id")])
    }

    fn owner_cache() -> Arc<MemoryCache> {
        let cache = Arc::new(MemoryCache::new("Contract").with_index(&["productId"]));
        cache.insert(vec![
            Arc::new(Record::new().with("id", 1).with("productId", 10).with("desk", "FX")),
            Arc::new(Record::new().with("id", 2).with("productId", 11).with("desk", "EQ")),
        ]);
        cache
    }

    #[test]
    fn missing_owner_index_is_a_config_error() {
        let cache = Arc::new(MemoryCache::new("Contract"));
        let err = CacheIndexFilter::create(cache, &relationship(), None).err().unwrap();
        assert!(matches!(err, LoadError::MissingIndex { .. }));
        assert!(err.to_string().contains("productId"));
    }

    #[test]
    fn accepts_records_referenced_by_cached_owners() {
        let filter = CacheIndexFilter::create(owner_cache(), &relationship(), None).unwrap();
        assert!(filter.accepts(&Record::new().with("id", 10)));
        assert!(filter.accepts(&Record::new().with("id", 11)));
        assert!(!filter.accepts(&Record::new().with("id", 12)));
        assert!(!filter.accepts(&Record::new().with("name", "no key")));
    }

    #[test]
    fn owner_filter_narrows_matching_owners() {
        let filter =
            CacheIndexFilter::create(owner_cache(), &relationship(), Some(Operation::eq("desk", "FX"))).unwrap();
        assert!(filter.accepts(&Record::new().with("id", 10)));
        assert!(!filter.accepts(&Record::new().with("id", 11)));
        assert!(filter.describe().contains("desk"));
    }

    #[test]
    fn dependent_filter_applies_first() {
        let filter = CacheIndexFilter::create(owner_cache(), &relationship(), None)
            .unwrap()
            .with_dependent_filter(Some(Operation::eq("active", true)));
        assert!(!filter.accepts(&Record::new().with("id", 10).with("active", false)));
        assert!(filter.accepts(&Record::new().with("id", 10).with("active", true)));
    }
}
