//! In-memory collaborators used by the CLI driver and by tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use preload_core::{Key, LoadError, Operation, Record, Result};

use crate::class::{ClassCache, ClassCatalog, ClassHandle, Cursor, RecordSource};

// ── Record source ─────────────────────────────────────────────

/// A table of records answering `find` by evaluating the operation in memory.
pub struct MemoryTable {
    class: String,
    records: RwLock<Vec<Arc<Record>>>,
    /// Fail every query after this many rows.
    fail_after: RwLock<Option<usize>>,
    find_calls: AtomicUsize,
}

impl MemoryTable {
    pub fn new(class: impl Into<String>, records: Vec<Record>) -> Self {
        Self {
            class: class.into(),
            records: RwLock::new(records.into_iter().map(Arc::new).collect()),
            fail_after: RwLock::new(None),
            find_calls: AtomicUsize::new(0),
        }
    }

    /// Make every subsequent query fail after streaming `rows` records.
    pub fn fail_after(&self, rows: usize) {
        *self.fail_after.write() = Some(rows);
    }

    pub fn push(&self, record: Record) {
        self.records.write().push(Arc::new(record));
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Number of `find` calls served so far.
    pub fn find_calls(&self) -> usize {
        self.find_calls.load(Ordering::SeqCst)
    }
}

impl RecordSource for MemoryTable {
    fn find(&self, operation: &Operation) -> Result<Cursor> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        let matching: Vec<Arc<Record>> = self
            .records
            .read()
            .iter()
            .filter(|r| operation.matches(r))
            .cloned()
            .collect();

        match *self.fail_after.read() {
            None => Ok(Box::new(matching.into_iter().map(Ok))),
            Some(rows) => {
                let error = LoadError::Source {
                    class: self.class.clone(),
                    message: format!("cursor failed after {} rows", rows),
                };
                Ok(Box::new(
                    matching
                        .into_iter()
                        .take(rows)
                        .map(Ok)
                        .chain(std::iter::once(Err(error))),
                ))
            }
        }
    }
}

// ── Cache ─────────────────────────────────────────────────────

#[derive(Default)]
struct CacheState {
    records: Vec<Arc<Record>>,
    indices: HashMap<Vec<String>, HashMap<Key, Vec<Arc<Record>>>>,
}

/// A cache with hash indices on registered attribute sets.
pub struct MemoryCache {
    class: String,
    state: RwLock<CacheState>,
}

impl MemoryCache {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            state: RwLock::new(CacheState::default()),
        }
    }

    /// Register an index on `attributes`. Records already cached are indexed too.
    pub fn with_index(self, attributes: &[&str]) -> Self {
        let attributes: Vec<String> = attributes.iter().map(|a| a.to_string()).collect();
        {
            let mut state = self.state.write();
            let mut index: HashMap<Key, Vec<Arc<Record>>> = HashMap::new();
            for record in &state.records {
                if let Ok(key) = record.key(&self.class, &attributes) {
                    index.entry(key).or_default().push(Arc::clone(record));
                }
            }
            state.indices.insert(attributes, index);
        }
        self
    }

    pub fn records(&self) -> Vec<Arc<Record>> {
        self.state.read().records.clone()
    }
}

impl ClassCache for MemoryCache {
    fn insert(&self, records: Vec<Arc<Record>>) {
        let mut state = self.state.write();
        let CacheState { records: all, indices } = &mut *state;
        for record in records {
            for (attributes, index) in indices.iter_mut() {
                if let Ok(key) = record.key(&self.class, attributes) {
                    index.entry(key).or_default().push(Arc::clone(&record));
                }
            }
            all.push(record);
        }
    }

    fn len(&self) -> usize {
        self.state.read().records.len()
    }

    fn find(&self, operation: &Operation) -> Vec<Arc<Record>> {
        self.state
            .read()
            .records
            .iter()
            .filter(|r| operation.matches(r))
            .cloned()
            .collect()
    }

    fn has_index(&self, attributes: &[String]) -> bool {
        self.state.read().indices.contains_key(attributes)
    }

    fn lookup(&self, attributes: &[String], key: &Key) -> Vec<Arc<Record>> {
        let state = self.state.read();
        match state.indices.get(attributes) {
            Some(index) => index.get(key).cloned().unwrap_or_default(),
            None => state
                .records
                .iter()
                .filter(|r| r.key(&self.class, attributes).map(|k| &k == key).unwrap_or(false))
                .cloned()
                .collect(),
        }
    }

    fn average_bucket_size(&self, attributes: &[String]) -> f64 {
        let state = self.state.read();
        match state.indices.get(attributes) {
            Some(index) if !index.is_empty() => {
                let total: usize = index.values().map(|b| b.len()).sum();
                total as f64 / index.len() as f64
            }
            _ => 0.0,
        }
    }
}

// ── Catalog ───────────────────────────────────────────────────

/// A fixed set of class handles.
#[derive(Default)]
pub struct StaticCatalog {
    classes: IndexMap<String, Arc<ClassHandle>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, class: ClassHandle) -> Arc<ClassHandle> {
        let handle = Arc::new(class);
        self.classes.insert(handle.name.clone(), Arc::clone(&handle));
        handle
    }

    pub fn with(mut self, class: ClassHandle) -> Self {
        self.register(class);
        self
    }

    pub fn class_names(&self) -> impl Iterator<Item = &str> {
        self.classes.keys().map(|k| k.as_str())
    }
}

impl ClassCatalog for StaticCatalog {
    fn class(&self, name: &str) -> Result<Arc<ClassHandle>> {
        self.classes
            .get(name)
            .cloned()
            .ok_or_else(|| LoadError::UnknownClass(name.to_string()))
    }
}
