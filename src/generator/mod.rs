//! Deterministic document templates.
//!
//! A [`Template`] turns a seeded random source and a key into a document.
//! Identical `(key, seed)` inputs must yield identical documents across
//! processes and runs: validation and mutation replay both rebuild expected
//! documents instead of reading them back.
//!
//! The random source is ChaCha8 with `seed_from_u64` seeding, whose output
//! is fixed by `rand_chacha`/`rand_core`. Changing it breaks validation of
//! every collection written before the change.
//!
//! Documents are JSON values. Sub-document paths are dotted (`address.city`)
//! and handled by [`lookup_path`], [`set_path`] and [`remove_path`].

pub mod person;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde_json::{Map, Value};

use crate::error::{GeneratorError, LoaderError};

pub use person::PersonTemplate;

/// A generated or stored document.
pub type Document = Value;

/// Seeded random source handed to templates.
pub type SeededRng = ChaCha8Rng;

/// Builds the random source for an absolute key.
pub fn seeded_rng(seed: u64) -> SeededRng {
    ChaCha8Rng::seed_from_u64(seed)
}

/// Mixes an absolute key with a task's mutation seed.
///
/// Each mutating task draws from its own stream per key, so replaying a
/// task's mutation reproduces exactly what it wrote.
pub fn mutation_seed(key: u64, task_seed: u64) -> u64 {
    key ^ task_seed.rotate_left(29) ^ 0x9E37_79B9_7F4A_7C15
}

/// Document shape and mutation policy.
pub trait Template: Send + Sync {
    /// Registry name.
    fn name(&self) -> &str;

    /// Generates the initial document for `key`, padded towards `size` bytes.
    fn generate_document(&self, rng: &mut SeededRng, key: &str, size: usize) -> Document;

    /// Rewrites `fields` of `previous` (all mutable fields when empty).
    fn update_document(
        &self,
        fields: &[String],
        previous: &Document,
        size: usize,
        rng: &mut SeededRng,
    ) -> Result<Document, GeneratorError>;

    /// Generates sub-document paths and values of roughly `size` bytes each.
    fn generate_sub_path_and_value(&self, rng: &mut SeededRng, size: usize)
        -> BTreeMap<String, Value>;

    /// Compares an expected document against a stored one.
    fn compare(&self, expected: &Document, actual: &Document) -> Result<bool, GeneratorError>;
}

/// Templates available to tasks, by name.
#[derive(Clone, Default)]
pub struct TemplateRegistry {
    templates: HashMap<String, Arc<dyn Template>>,
}

impl TemplateRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with the built-in templates.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PersonTemplate));
        registry
    }

    /// Registers a template under its own name, replacing any previous one.
    pub fn register(&mut self, template: Arc<dyn Template>) {
        self.templates.insert(template.name().to_string(), template);
    }

    /// Looks up a template by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Template>, LoaderError> {
        self.templates
            .get(name)
            .cloned()
            .ok_or_else(|| LoaderError::UnknownTemplate {
                template: name.to_string(),
            })
    }
}

impl std::fmt::Debug for TemplateRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.templates.keys().collect();
        names.sort();
        f.debug_struct("TemplateRegistry")
            .field("templates", &names)
            .finish()
    }
}

/// Returns the value at a dotted path.
pub fn lookup_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(doc, |node, segment| node.as_object()?.get(segment))
}

/// Writes `value` at a dotted path, creating intermediate objects.
///
/// A non-object intermediate node is replaced by an object.
pub fn set_path(doc: &mut Value, path: &str, value: Value) {
    let mut segments = path.split('.').peekable();
    let mut node = doc;
    while let Some(segment) = segments.next() {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            return;
        };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        node = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

/// Removes the value at a dotted path, returning it.
pub fn remove_path(doc: &mut Value, path: &str) -> Option<Value> {
    let (parent, leaf) = match path.rsplit_once('.') {
        Some((parent, leaf)) => (Some(parent), leaf),
        None => (None, path),
    };
    let node = match parent {
        Some(parent) => parent
            .split('.')
            .try_fold(doc, |node, segment| node.as_object_mut()?.get_mut(segment))?,
        None => doc,
    };
    node.as_object_mut()?.remove(leaf)
}
