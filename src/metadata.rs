//! Collection metadata and seed registry.
//!
//! Every target collection (backend type, connection, namespace path) owns a
//! seed: the base of its absolute key space. Offsets of every task aimed at
//! that collection are added to the same seed, so a validate task finds the
//! keys a create task wrote. The seed is assigned once and never changes;
//! `seed_end` is a high-water mark that only grows.

use std::collections::BTreeMap;
use std::fmt;

use rand::prelude::*;
use serde::{Deserialize, Serialize};

use crate::db::{ConnectionInfo, Extras};

/// Upper bound for randomly assigned seeds, leaving key-space headroom.
pub const MAX_RANDOM_SEED: u64 = 1 << 40;

/// Identity of a target collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionIdentifier {
    pub db_type: String,
    pub conn_str: String,
    pub namespace: String,
}

impl CollectionIdentifier {
    pub fn new(db_type: &str, conn: &ConnectionInfo, extras: &Extras) -> Self {
        Self {
            db_type: db_type.to_string(),
            conn_str: conn.conn_str.clone(),
            namespace: extras.namespace_path(),
        }
    }
}

impl fmt::Display for CollectionIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|{}", self.db_type, self.conn_str, self.namespace)
    }
}

/// Seed and high-water mark of one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionMetadata {
    pub seed: u64,
    /// Largest absolute key (exclusive) any task has targeted.
    pub seed_end: u64,
}

impl CollectionMetadata {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            seed_end: seed,
        }
    }

    /// Grows the high-water mark to cover offsets up to `end` (exclusive).
    pub fn extend_to(&mut self, end: u64) {
        self.seed_end = self.seed_end.max(self.seed.saturating_add(end));
    }
}

/// Per-request map of collection metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRegistry {
    collections: BTreeMap<String, CollectionMetadata>,
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the metadata for `id`, assigning a seed on first use and
    /// growing `seed_end` to cover `end`.
    ///
    /// `preferred_seed` is used only when the collection has no seed yet;
    /// otherwise a random seed below [`MAX_RANDOM_SEED`] is drawn.
    pub fn assign(
        &mut self,
        id: &CollectionIdentifier,
        end: u64,
        preferred_seed: Option<u64>,
    ) -> CollectionMetadata {
        let meta = self.collections.entry(id.to_string()).or_insert_with(|| {
            let seed = preferred_seed.unwrap_or_else(|| rand::rng().random_range(1..MAX_RANDOM_SEED));
            CollectionMetadata::new(seed)
        });
        meta.extend_to(end);
        *meta
    }

    pub fn get(&self, id: &CollectionIdentifier) -> Option<CollectionMetadata> {
        self.collections.get(&id.to_string()).copied()
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}
