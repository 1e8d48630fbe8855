//! Graph store collaborator: typed queries, records, and the store contract.
//!
//! The core never speaks a database protocol. It builds [`GraphQuery`] values
//! and hands them to a [`GraphStore`]; adapters for Cypher-speaking backends
//! render them with [`GraphQuery::cypher`].

pub mod memory;
pub mod pool;
pub mod query;

pub use memory::{FailureRule, InMemoryGraph};
pub use pool::GraphPool;
pub use query::{is_valid_rel_type, GraphQuery};

use crate::error::{CoreError, ErrorKind, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub type DocId = String;

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

/// Stable business identity of an entity. Database-internal node ids are
/// never used to reconstruct or match entities.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
}

impl EntityKey {
    pub fn new(name: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity_type: entity_type.into(),
        }
    }

    /// Lock-table key.
    pub fn lock_key(&self) -> String {
        format!("entity:{}:{}", self.entity_type, self.name)
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.entity_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelationshipKey {
    pub source: EntityKey,
    pub rel_type: String,
    pub target: EntityKey,
}

impl RelationshipKey {
    pub fn touches(&self, key: &EntityKey) -> bool {
        &self.source == key || &self.target == key
    }
}

impl std::fmt::Display for RelationshipKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -[{}]-> {}",
            self.source.name, self.rel_type, self.target.name
        )
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Store-assigned id; informational only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(flatten)]
    pub key: EntityKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub source_documents: BTreeSet<DocId>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl EntityRecord {
    pub fn reference(&self) -> EntityReference {
        EntityReference {
            node_id: self.node_id.clone(),
            name: self.key.name.clone(),
            entity_type: self.key.entity_type.clone(),
            source_documents: self.source_documents.clone(),
            reference_count: self.source_documents.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRecord {
    #[serde(flatten)]
    pub key: RelationshipKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

/// Reference-counting view of an entity used when planning deletions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub source_documents: BTreeSet<DocId>,
    pub reference_count: usize,
}

impl EntityReference {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.name, &self.entity_type)
    }
}

// ---------------------------------------------------------------------------
// Store contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreError {
    pub kind: ErrorKind,
    pub message: String,
}

/// What a store returns for every query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub success: bool,
    #[serde(default)]
    pub records: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StoreError>,
}

impl QueryResult {
    pub fn ok(records: Vec<serde_json::Value>) -> Self {
        Self {
            success: true,
            records,
            error: None,
        }
    }

    pub fn failed(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            records: Vec::new(),
            error: Some(StoreError {
                kind,
                message: message.into(),
            }),
        }
    }

    pub fn into_result(self) -> Result<Vec<serde_json::Value>> {
        if self.success {
            return Ok(self.records);
        }
        match self.error {
            Some(e) => Err(CoreError::from_kind(e.kind, e.message)),
            None => Err(CoreError::Store(
                "store reported failure without an error".to_string(),
            )),
        }
    }
}

/// The only contract the core depends on.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn execute_query(&self, query: &GraphQuery) -> QueryResult;
}

/// Decode store records into a typed shape, rejecting malformed rows.
pub fn decode_records<T: serde::de::DeserializeOwned>(
    records: Vec<serde_json::Value>,
) -> Result<Vec<T>> {
    records
        .into_iter()
        .map(|r| {
            serde_json::from_value(r)
                .map_err(|e| CoreError::Validation(format!("malformed graph record: {e}")))
        })
        .collect()
}
