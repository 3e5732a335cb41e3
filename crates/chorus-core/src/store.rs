//! Durable record store contract.
//!
//! The engine treats persistence as an opaque async record store of JSON
//! objects grouped in collections. Every record carries a string `id` field.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;
use tracing::trace;

/// Collection holding durable chat room records.
pub const ROOMS: &str = "chatRooms";
/// Collection holding chat messages.
pub const MESSAGES: &str = "chatMessages";
/// Collection holding last-seen presence records.
pub const PRESENCE: &str = "chatPresence";

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Record not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("Record already exists: {collection}/{id}")]
    Duplicate { collection: String, id: String },

    #[error("Invalid record: {0}")]
    InvalidRecord(&'static str),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// An async record store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a new record. The record must be an object with a string `id`.
    async fn create(&self, collection: &str, record: Value) -> Result<Value, StoreError>;

    /// Read a record by id.
    async fn read(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError>;

    /// Shallow-merge `patch` into an existing record and return the result.
    async fn update(&self, collection: &str, id: &str, patch: Value) -> Result<Value, StoreError>;

    /// Find records whose top-level fields equal every field in `query`.
    async fn find(&self, collection: &str, query: Value) -> Result<Vec<Value>, StoreError>;
}

/// In-memory store, used by default and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: DashMap<String, HashMap<String, Value>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records in a collection.
    #[must_use]
    pub fn len(&self, collection: &str) -> usize {
        self.collections.get(collection).map_or(0, |c| c.len())
    }

    #[must_use]
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }
}

fn record_id(record: &Value) -> Result<String, StoreError> {
    record
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(StoreError::InvalidRecord("record must be an object with a string id"))
}

fn matches(record: &Value, query: &Map<String, Value>) -> bool {
    query.iter().all(|(key, expected)| record.get(key) == Some(expected))
}

#[async_trait]
impl Store for MemoryStore {
    async fn create(&self, collection: &str, record: Value) -> Result<Value, StoreError> {
        let id = record_id(&record)?;
        let mut records = self.collections.entry(collection.to_string()).or_default();
        if records.contains_key(&id) {
            return Err(StoreError::Duplicate {
                collection: collection.to_string(),
                id,
            });
        }
        trace!(collection = %collection, id = %id, "Record created");
        records.insert(id, record.clone());
        Ok(record)
    }

    async fn read(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        Ok(self
            .collections
            .get(collection)
            .and_then(|records| records.get(id).cloned()))
    }

    async fn update(&self, collection: &str, id: &str, patch: Value) -> Result<Value, StoreError> {
        let Value::Object(patch) = patch else {
            return Err(StoreError::InvalidRecord("patch must be an object"));
        };
        let not_found = || StoreError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        };

        let mut records = self.collections.get_mut(collection).ok_or_else(not_found)?;
        let record = records.get_mut(id).ok_or_else(not_found)?;
        let Value::Object(fields) = &mut *record else {
            return Err(StoreError::InvalidRecord("stored record is not an object"));
        };
        for (key, value) in patch {
            if key != "id" {
                fields.insert(key, value);
            }
        }
        trace!(collection = %collection, id = %id, "Record updated");
        Ok(record.clone())
    }

    async fn find(&self, collection: &str, query: Value) -> Result<Vec<Value>, StoreError> {
        let query = match query {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => return Err(StoreError::InvalidRecord("query must be an object")),
        };
        Ok(self
            .collections
            .get(collection)
            .map(|records| {
                records
                    .values()
                    .filter(|r| matches(r, &query))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
