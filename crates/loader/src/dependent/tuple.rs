//! Storage for composite keys.
//!
//! The first keys are kept in a plain set. Once the sample is full (or the
//! first batch is taken) the column with the smallest average bucket size is
//! chosen and keys move into buckets on that column. Membership still
//! compares whole tuples, so dedup stays exact.

use std::collections::{HashMap, HashSet};

use preload_core::{Key, Value};
use tracing::debug;

enum Phase {
    Sampling(HashSet<Key>),
    Bucketed {
        column: usize,
        buckets: HashMap<Value, Vec<Key>>,
    },
}

pub(crate) struct TupleKeys {
    width: usize,
    sample_limit: usize,
    len: usize,
    phase: Phase,
}

impl TupleKeys {
    pub fn new(width: usize, sample_limit: usize) -> Self {
        Self {
            width,
            sample_limit: sample_limit.max(1),
            len: 0,
            phase: Phase::Sampling(HashSet::new()),
        }
    }

    /// Returns true when `key` was not present.
    pub fn insert(&mut self, key: &Key) -> bool {
        let inserted = match &mut self.phase {
            Phase::Sampling(sample) => sample.insert(key.clone()),
            Phase::Bucketed { column, buckets } => {
                let bucket = buckets.entry(key[*column].clone()).or_default();
                if bucket.contains(key) {
                    false
                } else {
                    bucket.push(key.clone());
                    true
                }
            }
        };
        if inserted {
            self.len += 1;
            if self.len >= self.sample_limit {
                self.freeze();
            }
        }
        inserted
    }

    pub fn contains(&self, key: &Key) -> bool {
        match &self.phase {
            Phase::Sampling(sample) => sample.contains(key),
            Phase::Bucketed { column, buckets } => buckets
                .get(&key[*column])
                .map(|b| b.contains(key))
                .unwrap_or(false),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Column keys are bucketed on, once chosen.
    pub fn column(&self) -> Option<usize> {
        match &self.phase {
            Phase::Sampling(_) => None,
            Phase::Bucketed { column, .. } => Some(*column),
        }
    }

    /// End sampling: choose the bucket column and rehash the sample.
    pub fn freeze(&mut self) {
        let sample = match &mut self.phase {
            Phase::Sampling(sample) => std::mem::take(sample),
            Phase::Bucketed { .. } => return,
        };
        let column = least_mutating_column(&sample, self.width);
        debug!(
            "Tuple key index bucketing on column {} after {} sampled keys",
            column,
            sample.len()
        );
        let mut buckets: HashMap<Value, Vec<Key>> = HashMap::new();
        for key in sample {
            buckets.entry(key[column].clone()).or_default().push(key);
        }
        self.phase = Phase::Bucketed { column, buckets };
    }
}

/// Column whose distinct values split `sample` into the smallest buckets.
/// Ties go to the leftmost column.
pub(crate) fn least_mutating_column(sample: &HashSet<Key>, width: usize) -> usize {
    if sample.is_empty() || width <= 1 {
        return 0;
    }
    let mut best = 0;
    let mut best_average = f64::MAX;
    for column in 0..width {
        let distinct: HashSet<&Value> = sample.iter().map(|k| &k[column]).collect();
        let average = sample.len() as f64 / distinct.len() as f64;
        if average < best_average {
            best = column;
            best_average = average;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(a: &str, b: i64) -> Key {
        vec![Value::from(a), Value::Int(b)]
    }

    #[test]
    fn picks_most_selective_column() {
        // Two instruments, ten accounts: accounts split the sample finer.
        let sample: HashSet<Key> = (0..10).map(|i| key(if i % 2 == 0 { "IBM" } else { "MSFT" }, i)).collect();
        assert_eq!(least_mutating_column(&sample, 2), 1);
    }

    #[test]
    fn dedup_is_exact_after_freezing() {
        let mut keys = TupleKeys::new(2, 3);
        assert!(keys.insert(&key("IBM", 1)));
        assert!(keys.insert(&key("IBM", 2)));
        assert!(!keys.insert(&key("IBM", 1)));
        assert!(keys.column().is_none());

        assert!(keys.insert(&key("MSFT", 1)));
        assert!(keys.column().is_some());

        assert!(!keys.insert(&key("IBM", 2)));
        assert!(keys.insert(&key("MSFT", 2)));
        assert!(keys.contains(&key("MSFT", 1)));
        assert!(!keys.contains(&key("MSFT", 3)));
        assert_eq!(keys.len(), 4);
    }

    #[test]
    fn freeze_on_empty_sample_is_harmless() {
        let mut keys = TupleKeys::new(3, 100);
        keys.freeze();
        assert_eq!(keys.column(), Some(0));
        assert!(keys.insert(&vec![Value::Int(1), Value::Int(2), Value::Int(3)]));
    }
}
