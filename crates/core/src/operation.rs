//! Operation descriptions handed to record sources.
//!
//! A record source turns an [`Operation`] into a query against its store; the
//! in-memory sources used by tests and the CLI evaluate it with
//! [`Operation::matches`].

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::record::{Key, Record, Value};

/// A predicate over records of one class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// Every record.
    All,
    Eq { attribute: String, value: Value },
    /// Tuple membership: the record's values for `attributes` form one of `keys`.
    In {
        attributes: Vec<String>,
        keys: Arc<BTreeSet<Key>>,
    },
    /// Inclusive range.
    Between {
        attribute: String,
        start: Value,
        end: Value,
    },
    And(Vec<Operation>),
    Or(Vec<Operation>),
}

impl Operation {
    pub fn eq(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Operation::Eq {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    pub fn in_keys(attributes: Vec<String>, keys: impl IntoIterator<Item = Key>) -> Self {
        Operation::In {
            attributes,
            keys: Arc::new(keys.into_iter().collect()),
        }
    }

    pub fn between(attribute: impl Into<String>, start: impl Into<Value>, end: impl Into<Value>) -> Self {
        Operation::Between {
            attribute: attribute.into(),
            start: start.into(),
            end: end.into(),
        }
    }

    /// Conjunction that flattens nested `And`s and drops `All`.
    pub fn and(self, other: Operation) -> Operation {
        let mut terms = Vec::new();
        for op in [self, other] {
            match op {
                Operation::All => {}
                Operation::And(inner) => terms.extend(inner),
                op => terms.push(op),
            }
        }
        match terms.len() {
            0 => Operation::All,
            1 => terms.remove(0),
            _ => Operation::And(terms),
        }
    }

    /// Disjunction; `All` absorbs everything.
    pub fn or(self, other: Operation) -> Operation {
        if self == Operation::All || other == Operation::All {
            return Operation::All;
        }
        let mut terms = Vec::new();
        for op in [self, other] {
            match op {
                Operation::Or(inner) => terms.extend(inner),
                op => terms.push(op),
            }
        }
        Operation::Or(terms)
    }

    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Operation::All => true,
            Operation::Eq { attribute, value } => record.get(attribute) == Some(value),
            Operation::In { attributes, keys } => {
                let mut key = Vec::with_capacity(attributes.len());
                for attr in attributes {
                    match record.get(attr) {
                        Some(v) => key.push(v.clone()),
                        None => return false,
                    }
                }
                keys.contains(&key)
            }
            Operation::Between { attribute, start, end } => match record.get(attribute) {
                Some(v) => v >= start && v <= end,
                None => false,
            },
            Operation::And(terms) => terms.iter().all(|t| t.matches(record)),
            Operation::Or(terms) => terms.iter().any(|t| t.matches(record)),
        }
    }

    /// Every attribute this operation reads.
    pub fn attributes(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_attributes(&mut out);
        out
    }

    fn collect_attributes(&self, out: &mut BTreeSet<String>) {
        match self {
            Operation::All => {}
            Operation::Eq { attribute, .. } | Operation::Between { attribute, .. } => {
                out.insert(attribute.clone());
            }
            Operation::In { attributes, .. } => out.extend(attributes.iter().cloned()),
            Operation::And(terms) | Operation::Or(terms) => {
                for t in terms {
                    t.collect_attributes(out);
                }
            }
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::All => write!(f, "all"),
            Operation::Eq { attribute, value } => write!(f, "{} = {}", attribute, value),
            Operation::In { attributes, keys } => {
                write!(f, "({}) in [{} keys]", attributes.join(", "), keys.len())
            }
            Operation::Between { attribute, start, end } => {
                write!(f, "{} between {} and {}", attribute, start, end)
            }
            Operation::And(terms) => write_joined(f, terms, " and "),
            Operation::Or(terms) => write_joined(f, terms, " or "),
        }
    }
}

fn write_joined(f: &mut fmt::Formatter<'_>, terms: &[Operation], sep: &str) -> fmt::Result {
    write!(f, "(")?;
    for (i, t) in terms.iter().enumerate() {
        if i > 0 {
            write!(f, "{}", sep)?;
        }
        write!(f, "{}", t)?;
    }
    write!(f, ")")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn and_flattens_and_drops_all() {
        let op = Operation::All
            .and(Operation::eq("region", "NYK"))
            .and(Operation::eq("acctId", 1).and(Operation::eq("desk", "FX")));
        match op {
            Operation::And(terms) => assert_eq!(terms.len(), 3),
            other => panic!("expected conjunction, got {}", other),
        }
        assert_eq!(Operation::All.and(Operation::All), Operation::All);
    }

    #[test]
    fn or_with_all_is_all() {
        assert_eq!(Operation::eq("a", 1).or(Operation::All), Operation::All);
    }

    #[test]
    fn tuple_in_matches_whole_key() {
        let op = Operation::in_keys(
            vec!["instrumentId".into(), "acctId".into()],
            vec![vec![Value::from("IBM"), Value::Int(1)]],
        );
        let hit = Record::new().with("instrumentId", "IBM").with("acctId", 1);
        let miss = Record::new().with("instrumentId", "IBM").with("acctId", 2);
        assert!(op.matches(&hit));
        assert!(!op.matches(&miss));
    }

    #[test]
    fn between_is_inclusive() {
        let op = Operation::between("qty", 1, 3);
        assert!(op.matches(&Record::new().with("qty", 1)));
        assert!(op.matches(&Record::new().with("qty", 3)));
        assert!(!op.matches(&Record::new().with("qty", 4)));
        assert!(!op.matches(&Record::new()));
    }

    #[test]
    fn attributes_are_collected_recursively() {
        let op = Operation::eq("region", "NYK").and(Operation::between("qty", 1, 2).or(Operation::eq("desk", "FX")));
        let attrs: Vec<_> = op.attributes().into_iter().collect();
        assert_eq!(attrs, vec!["desk", "qty", "region"]);
    }
}
