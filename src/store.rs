//! Generic record store consumed by the deploy core
//!
//! Records are JSON objects grouped into named collections. The core only
//! needs predicate lookups by field equality, so that is all [`Filter`]
//! expresses. [`MemoryStore`] backs tests; [`crate::db::SqliteStore`] is the
//! durable implementation.

use anyhow::Result;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Conjunction of top-level field equality checks
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<(String, Value)>,
}

impl Filter {
    /// Matches every record
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::all().and(field, value)
    }

    pub fn and(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.push((field.into(), value.into()));
        self
    }

    pub fn matches(&self, record: &Value) -> bool {
        self.clauses
            .iter()
            .all(|(field, value)| record.get(field) == Some(value))
    }
}

/// Storage operations over named collections of JSON records
pub trait RecordStore: Send + Sync {
    fn insert(&self, collection: &str, record: Value) -> Result<()>;

    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Value>>;

    fn find_many(&self, collection: &str, filter: &Filter) -> Result<Vec<Value>>;

    /// Shallow-merge `patch` into every matching record; returns how many changed
    fn update(&self, collection: &str, filter: &Filter, patch: Value) -> Result<usize>;

    fn delete(&self, collection: &str, filter: &Filter) -> Result<usize>;

    fn count(&self, collection: &str, filter: &Filter) -> Result<usize> {
        Ok(self.find_many(collection, filter)?.len())
    }
}

/// Apply a shallow patch: top-level keys of `patch` overwrite those of `record`
pub fn merge_patch(record: &mut Value, patch: &Value) {
    let Some(patch) = patch.as_object() else {
        return;
    };
    if !record.is_object() {
        *record = Value::Object(Map::new());
    }
    if let Some(target) = record.as_object_mut() {
        for (key, value) in patch {
            target.insert(key.clone(), value.clone());
        }
    }
}

/// In-process store, insertion ordered
#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Vec<Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryStore {
    fn insert(&self, collection: &str, record: Value) -> Result<()> {
        if !record.is_object() {
            anyhow::bail!("records must be JSON objects");
        }
        self.collections
            .lock()
            .entry(collection.to_string())
            .or_default()
            .push(record);
        Ok(())
    }

    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<Value>> {
        let collections = self.collections.lock();
        Ok(collections
            .get(collection)
            .and_then(|records| records.iter().find(|r| filter.matches(r)).cloned()))
    }

    fn find_many(&self, collection: &str, filter: &Filter) -> Result<Vec<Value>> {
        let collections = self.collections.lock();
        Ok(collections
            .get(collection)
            .map(|records| records.iter().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default())
    }

    fn update(&self, collection: &str, filter: &Filter, patch: Value) -> Result<usize> {
        let mut collections = self.collections.lock();
        let Some(records) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let mut changed = 0;
        for record in records.iter_mut().filter(|r| filter.matches(r)) {
            merge_patch(record, &patch);
            changed += 1;
        }
        Ok(changed)
    }

    fn delete(&self, collection: &str, filter: &Filter) -> Result<usize> {
        let mut collections = self.collections.lock();
        let Some(records) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = records.len();
        records.retain(|r| !filter.matches(r));
        Ok(before - records.len())
    }
}
