//! Dedup index of dependent keys already queued or loaded.

use std::collections::HashSet;
use std::sync::Arc;

use preload_core::{Key, Operation, Record, Result, Value};

use crate::dependent::tuple::TupleKeys;

enum KeyStore {
    Single(HashSet<Value>),
    Tuple(TupleKeys),
}

impl KeyStore {
    fn insert(&mut self, key: &Key) -> bool {
        match self {
            KeyStore::Single(values) => values.insert(key[0].clone()),
            KeyStore::Tuple(tuples) => tuples.insert(key),
        }
    }

    fn contains(&self, key: &Key) -> bool {
        match self {
            KeyStore::Single(values) => values.contains(&key[0]),
            KeyStore::Tuple(tuples) => tuples.contains(key),
        }
    }
}

/// Keys of one relationship seen so far, plus those not yet handed to a task.
///
/// Each distinct key enters `pending` at most once over the index's lifetime.
pub(crate) struct DependentKeyIndex {
    /// Dependent-side attributes the keys are matched on.
    attributes: Vec<String>,
    owner_filter: Option<Operation>,
    filter_attached: bool,
    keys: KeyStore,
    pending: Vec<Key>,
    total_keys: usize,
    spawned_tasks: usize,
}

impl DependentKeyIndex {
    pub fn new(attributes: Vec<String>, task_size: usize) -> Self {
        let keys = if attributes.len() == 1 {
            KeyStore::Single(HashSet::new())
        } else {
            KeyStore::Tuple(TupleKeys::new(attributes.len(), task_size))
        };
        Self {
            attributes,
            owner_filter: None,
            filter_attached: false,
            keys,
            pending: Vec::new(),
            total_keys: 0,
            spawned_tasks: 0,
        }
    }

    pub fn attributes(&self) -> &[String] {
        &self.attributes
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self.keys, KeyStore::Tuple(_))
    }

    /// Combine another owner filter with the current one. A missing filter on
    /// either side means every owner qualifies.
    pub fn attach_owner_filter(&mut self, filter: Option<Operation>) {
        if !self.filter_attached {
            self.owner_filter = filter;
            self.filter_attached = true;
            return;
        }
        self.owner_filter = match (self.owner_filter.take(), filter) {
            (Some(current), Some(other)) => Some(current.or(other)),
            _ => None,
        };
    }

    pub fn owner_filter(&self) -> Option<&Operation> {
        self.owner_filter.as_ref()
    }

    /// Add the keys of `records` that pass the owner filter. Null keys are
    /// skipped. Stops at the first record missing an owner attribute; keys
    /// added before that stay added.
    pub fn add_stripe(&mut self, owner_class: &str, owner_attributes: &[String], records: &[Arc<Record>]) -> Result<()> {
        for record in records {
            if let Some(filter) = &self.owner_filter {
                if !filter.matches(record) {
                    continue;
                }
            }
            let key = record.key(owner_class, owner_attributes)?;
            if key.iter().any(|v| *v == Value::Null) {
                continue;
            }
            if self.keys.insert(&key) {
                self.pending.push(key);
                self.total_keys += 1;
            }
        }
        Ok(())
    }

    /// Whether `key` has been queued or loaded through this index.
    pub fn has_owner_queued_or_loaded(&self, key: &Key) -> bool {
        self.keys.contains(key)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Remove up to `max` pending keys for a new task.
    pub fn take_pending(&mut self, max: usize) -> Vec<Key> {
        if let KeyStore::Tuple(tuples) = &mut self.keys {
            tuples.freeze();
        }
        let n = max.min(self.pending.len());
        if n == 0 {
            return Vec::new();
        }
        self.spawned_tasks += 1;
        if n == self.pending.len() {
            std::mem::take(&mut self.pending)
        } else {
            self.pending.drain(..n).collect()
        }
    }

    /// Distinct keys seen.
    pub fn total_keys(&self) -> usize {
        self.total_keys
    }

    pub fn spawned_tasks(&self) -> usize {
        self.spawned_tasks
    }

    pub fn describe_extractor(&self) -> String {
        format!("({})", self.attributes.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owners(ids: &[i64]) -> Vec<Arc<Record>> {
        ids.iter()
            .map(|id| Arc::new(Record::new().with("productId", *id).with("desk", if id % 2 == 0 { "FX" } else { "EQ" })))
            .collect()
    }

    fn attrs(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn duplicate_keys_enter_pending_once() {
        let mut index = DependentKeyIndex::new(attrs(&["id"]), 10);
        index.add_stripe("Contract", &attrs(&["productId"]), &owners(&[1, 2, 2, 3])).unwrap();
        index.add_stripe("Contract", &attrs(&["productId"]), &owners(&[3, 4])).unwrap();
        assert_eq!(index.total_keys(), 4);
        assert_eq!(index.pending_len(), 4);

        let first = index.take_pending(3);
        assert_eq!(first.len(), 3);
        assert_eq!(index.pending_len(), 1);

        index.add_stripe("Contract", &attrs(&["productId"]), &owners(&[1, 5])).unwrap();
        assert_eq!(index.pending_len(), 2);
        assert!(index.has_owner_queued_or_loaded(&vec![Value::Int(1)]));
        assert_eq!(index.spawned_tasks(), 1);
    }

    #[test]
    fn owner_filter_drops_records() {
        let mut index = DependentKeyIndex::new(attrs(&["id"]), 10);
        index.attach_owner_filter(Some(Operation::eq("desk", "FX")));
        index.add_stripe("Contract", &attrs(&["productId"]), &owners(&[1, 2, 3, 4])).unwrap();
        assert_eq!(index.total_keys(), 2);
    }

    #[test]
    fn missing_filter_widens_to_everything() {
        let mut index = DependentKeyIndex::new(attrs(&["id"]), 10);
        index.attach_owner_filter(Some(Operation::eq("desk", "FX")));
        index.attach_owner_filter(None);
        assert!(index.owner_filter().is_none());

        index.attach_owner_filter(Some(Operation::eq("desk", "EQ")));
        assert!(index.owner_filter().is_none());
    }

    #[test]
    fn two_filters_are_ored() {
        let mut index = DependentKeyIndex::new(attrs(&["id"]), 10);
        index.attach_owner_filter(Some(Operation::eq("desk", "FX")));
        index.attach_owner_filter(Some(Operation::eq("desk", "EQ")));
        assert!(matches!(index.owner_filter(), Some(Operation::Or(terms)) if terms.len() == 2));
    }

    #[test]
    fn missing_owner_attribute_is_an_error() {
        let mut index = DependentKeyIndex::new(attrs(&["id"]), 10);
        let err = index.add_stripe("Contract", &attrs(&["nope"]), &owners(&[1])).unwrap_err();
        assert!(matches!(err, preload_core::LoadError::MissingAttribute { .. }));
    }

    #[test]
    fn null_keys_are_skipped() {
        let mut index = DependentKeyIndex::new(attrs(&["id"]), 10);
        let records = vec![Arc::new(Record::new().with("productId", Value::Null))];
        index.add_stripe("Contract", &attrs(&["productId"]), &records).unwrap();
        assert_eq!(index.pending_len(), 0);
    }

    #[test]
    fn tuple_index_dedups_whole_keys() {
        let mut index = DependentKeyIndex::new(attrs(&["instrumentId", "acctId"]), 2);
        assert!(index.is_tuple());
        let records: Vec<_> = [("IBM", 1), ("IBM", 2), ("IBM", 1), ("MSFT", 1)]
            .iter()
            .map(|(i, a)| Arc::new(Record::new().with("instrumentId", *i).with("acctId", *a)))
            .collect();
        index
            .add_stripe("Position", &attrs(&["instrumentId", "acctId"]), &records)
            .unwrap();
        assert_eq!(index.total_keys(), 3);
        assert_eq!(index.take_pending(10).len(), 3);
        assert_eq!(index.describe_extractor(), "(instrumentId, acctId)");
    }
}
