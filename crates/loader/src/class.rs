//! Narrow interfaces to the object model: where a class's records come from,
//! where they are cached, and which database they live in.

use std::fmt;
use std::sync::Arc;

use preload_core::{Key, LoadError, Operation, Record, Result, SourceAttribute};

/// Lazily evaluated query result. Dropping it closes the underlying cursor.
pub type Cursor = Box<dyn Iterator<Item = Result<Arc<Record>>> + Send>;

/// Backing store of one class.
pub trait RecordSource: Send + Sync {
    fn find(&self, operation: &Operation) -> Result<Cursor>;
}

/// In-memory cache of one class.
pub trait ClassCache: Send + Sync {
    fn insert(&self, records: Vec<Arc<Record>>);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached records matching `operation`.
    fn find(&self, operation: &Operation) -> Vec<Arc<Record>>;

    /// Whether an index on exactly `attributes` exists.
    fn has_index(&self, attributes: &[String]) -> bool;

    /// Records whose `attributes` form `key`, through the index on `attributes`.
    fn lookup(&self, attributes: &[String], key: &Key) -> Vec<Arc<Record>>;

    fn contains(&self, attributes: &[String], key: &Key) -> bool {
        !self.lookup(attributes, key).is_empty()
    }

    /// Mean number of records per distinct key of the index on `attributes`.
    fn average_bucket_size(&self, attributes: &[String]) -> f64;
}

/// Maps a source attribute to the name of the database (and thread pool) it is loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseResolver {
    /// Every source attribute lives in the same database.
    Fixed(String),
    /// One database per source attribute, named `{prefix}{source}`.
    PerSource(String),
}

impl DatabaseResolver {
    pub fn resolve(&self, class: &str, source: &SourceAttribute) -> Result<String> {
        match (self, source) {
            (DatabaseResolver::Fixed(name), _) => Ok(name.clone()),
            (DatabaseResolver::PerSource(prefix), SourceAttribute::Named(name)) => {
                Ok(format!("{}{}", prefix, name))
            }
            (DatabaseResolver::PerSource(_), SourceAttribute::None) => Err(LoadError::Config(format!(
                "{} is partitioned per source but was requested without a source attribute",
                class
            ))),
        }
    }
}

/// Everything the loader needs to know about one class.
#[derive(Clone)]
pub struct ClassHandle {
    pub name: String,
    pub cache: Arc<dyn ClassCache>,
    pub source: Arc<dyn RecordSource>,
    /// Attribute holding the business date, for dated classes.
    pub business_date_attribute: Option<String>,
    /// `(from, to)` processing-date attributes, for milestoned classes.
    pub processing_date_attributes: Option<(String, String)>,
    /// Attribute holding the source attribute, for partitioned classes.
    pub source_attribute: Option<String>,
    pub database: DatabaseResolver,
}

impl ClassHandle {
    pub fn new(name: impl Into<String>, cache: Arc<dyn ClassCache>, source: Arc<dyn RecordSource>) -> Self {
        Self {
            name: name.into(),
            cache,
            source,
            business_date_attribute: None,
            processing_date_attributes: None,
            source_attribute: None,
            database: DatabaseResolver::Fixed("default".to_string()),
        }
    }

    pub fn dated(mut self, attribute: impl Into<String>) -> Self {
        self.business_date_attribute = Some(attribute.into());
        self
    }

    pub fn milestoned(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.processing_date_attributes = Some((from.into(), to.into()));
        self
    }

    pub fn partitioned(mut self, attribute: impl Into<String>) -> Self {
        self.source_attribute = Some(attribute.into());
        self
    }

    pub fn database(mut self, database: DatabaseResolver) -> Self {
        self.database = database;
        self
    }

    pub fn is_dated(&self) -> bool {
        self.business_date_attribute.is_some()
    }

    pub fn is_partitioned(&self) -> bool {
        self.source_attribute.is_some()
    }

    /// Database (thread pool) name for records of `source`.
    pub fn database_for(&self, source: &SourceAttribute) -> Result<String> {
        self.database.resolve(&self.name, source)
    }
}

impl fmt::Debug for ClassHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassHandle")
            .field("name", &self.name)
            .field("business_date_attribute", &self.business_date_attribute)
            .field("source_attribute", &self.source_attribute)
            .field("database", &self.database)
            .finish()
    }
}

/// Looks up class metadata by name.
pub trait ClassCatalog: Send + Sync {
    fn class(&self, name: &str) -> Result<Arc<ClassHandle>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_source_resolver_needs_a_source() {
        let resolver = DatabaseResolver::PerSource("db_".into());
        assert_eq!(
            resolver.resolve("Contract", &SourceAttribute::named("NYK")).unwrap(),
            "db_NYK"
        );
        assert!(matches!(
            resolver.resolve("Contract", &SourceAttribute::None),
            Err(LoadError::Config(_))
        ));
    }

    #[test]
    fn fixed_resolver_ignores_source() {
        let resolver = DatabaseResolver::Fixed("main".into());
        assert_eq!(resolver.resolve("Product", &SourceAttribute::None).unwrap(), "main");
        assert_eq!(
            resolver.resolve("Product", &SourceAttribute::named("TKO")).unwrap(),
            "main"
        );
    }
}
