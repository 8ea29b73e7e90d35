use std::fmt;

use serde::{Deserialize, Serialize};

use crate::record::Value;

/// Partition key naming the physical store a slice of a class lives in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SourceAttribute {
    /// The class lives in a single global store.
    #[default]
    None,
    Named(String),
}

impl SourceAttribute {
    pub fn named(name: impl Into<String>) -> Self {
        SourceAttribute::Named(name.into())
    }

    pub fn is_source(&self) -> bool {
        matches!(self, SourceAttribute::Named(_))
    }

    pub fn as_value(&self) -> Option<Value> {
        match self {
            SourceAttribute::None => None,
            SourceAttribute::Named(name) => Some(Value::Str(name.clone())),
        }
    }

    /// Whether a task partitioned by `self` may wait on one partitioned by `other`.
    ///
    /// Partitions only constrain each other when both are named.
    pub fn matches(&self, other: &SourceAttribute) -> bool {
        match (self, other) {
            (SourceAttribute::Named(a), SourceAttribute::Named(b)) => a == b,
            _ => true,
        }
    }
}

impl fmt::Display for SourceAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceAttribute::None => Ok(()),
            SourceAttribute::Named(name) => write!(f, "@{}", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_sources_match_only_themselves() {
        let nyk = SourceAttribute::named("NYK");
        let tko = SourceAttribute::named("TKO");
        assert!(nyk.matches(&nyk));
        assert!(!nyk.matches(&tko));
    }

    #[test]
    fn global_matches_everything() {
        let nyk = SourceAttribute::named("NYK");
        assert!(SourceAttribute::None.matches(&nyk));
        assert!(nyk.matches(&SourceAttribute::None));
    }
}
