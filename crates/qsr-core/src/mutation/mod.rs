//! Document-scoped graph mutations that keep shared entities intact.
//!
//! Deleting a document runs `analyze → plan → backup → execute → verify`
//! inside one compensating transaction; ingesting one upserts its extracted
//! entities and relationships the same way.

pub mod extraction;
pub mod plan;
pub mod service;

pub use extraction::{
    DocumentExtraction, ExtractedEntity, ExtractedRelationship, EXTRACTION_SCHEMA_VERSION,
};
pub use plan::DeletionPlan;
pub use service::{GraphMutationService, MutationRetryHandler};

use crate::error::{CoreError, ErrorKind};
use crate::graph::EntityKey;
use crate::progress::ProgressStage;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// DLQ operation type for a whole deletion queued for a later attempt.
pub const DELETE_DOCUMENT_OP: &str = "delete_document";
/// DLQ operation type for a whole ingest queued for a later attempt.
pub const INGEST_DOCUMENT_OP: &str = "ingest_document";
/// DLQ operation type for a compensation that failed during rollback.
pub const COMPENSATION_OP: &str = "compensation";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationError {
    pub stage: ProgressStage,
    pub kind: ErrorKind,
    pub message: String,
}

impl MutationError {
    pub fn new(stage: ProgressStage, err: &CoreError) -> Self {
        Self {
            stage,
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn to_error(&self) -> CoreError {
        CoreError::from_kind(self.kind, self.message.clone())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeletionOutcome {
    pub document_id: String,
    pub success: bool,
    pub entities_removed: Vec<EntityKey>,
    /// Entities kept because another document still references them.
    pub entities_preserved: Vec<EntityKey>,
    pub relationships_removed: usize,
    pub errors: Vec<MutationError>,
    pub rollback_performed: bool,
    pub rollback_clean: bool,
    /// DLQ ids for compensations that need manual review.
    pub escalated_operations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<Uuid>,
    /// DLQ id when the whole deletion was queued for a later attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requeued_as: Option<String>,
}

impl DeletionOutcome {
    pub fn removed_names(&self) -> Vec<&str> {
        self.entities_removed.iter().map(|k| k.name.as_str()).collect()
    }

    pub fn preserved_names(&self) -> Vec<&str> {
        self.entities_preserved.iter().map(|k| k.name.as_str()).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub document_id: String,
    pub success: bool,
    pub entities_created: Vec<EntityKey>,
    /// Existing entities that gained the document as a source.
    pub entities_updated: Vec<EntityKey>,
    pub relationships_created: usize,
    pub errors: Vec<MutationError>,
    pub rollback_performed: bool,
    pub rollback_clean: bool,
    pub escalated_operations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requeued_as: Option<String>,
}
