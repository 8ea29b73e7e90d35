//! Dependent loading.
//!
//! While an owner task streams its records, the foreign keys of each
//! relationship are collected in stripes and handed to the key index of the
//! dependent class on that index's pool conveyor. The index drops keys it has
//! already seen and, once enough new keys are pending, spawns a loading task
//! for them.
//!
//! - `stripe`: per-task buffer of owner records
//! - `key_index`: dedup set plus pending keys for one relationship
//! - `tuple`: composite-key storage and its column choice
//! - `spawner`: builds dependent loading tasks from pending keys

pub(crate) mod key_index;
pub(crate) mod spawner;
pub(crate) mod stripe;
pub(crate) mod tuple;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use self::spawner::{DependentLoadingTaskSpawner, SpawnerId};

/// A relationship from an owner class to the dependent class it references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub name: String,
    pub owner_class: String,
    pub dependent_class: String,
    /// `(owner attribute, dependent attribute)` pairs, e.g. `("productId", "id")`.
    pub attributes: Vec<(String, String)>,
}

impl Relationship {
    pub fn new(
        name: impl Into<String>,
        owner_class: impl Into<String>,
        dependent_class: impl Into<String>,
        attributes: &[(&str, &str)],
    ) -> Self {
        Self {
            name: name.into(),
            owner_class: owner_class.into(),
            dependent_class: dependent_class.into(),
            attributes: attributes
                .iter()
                .map(|(o, d)| (o.to_string(), d.to_string()))
                .collect(),
        }
    }

    pub fn owner_attributes(&self) -> Vec<String> {
        self.attributes.iter().map(|(o, _)| o.clone()).collect()
    }

    pub fn dependent_attributes(&self) -> Vec<String> {
        self.attributes.iter().map(|(_, d)| d.clone()).collect()
    }
}

impl fmt::Display for Relationship {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} -> {}", self.owner_class, self.name, self.dependent_class)
    }
}

/// Where an owner task sends its records: one key index of one spawner, and
/// the owner attributes that form the key.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DependentFeed {
    pub spawner: SpawnerId,
    pub slot: usize,
    pub owner_class: String,
    pub owner_attributes: Arc<[String]>,
}
