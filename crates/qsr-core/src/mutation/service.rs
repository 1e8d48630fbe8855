use super::{
    DeletionOutcome, DeletionPlan, DocumentExtraction, IngestOutcome, MutationError,
    COMPENSATION_OP, DELETE_DOCUMENT_OP, INGEST_DOCUMENT_OP,
};
use crate::config::MutationConfig;
use crate::dlq::{DeadLetterQueue, FailedOperation, RetryHandler};
use crate::error::{CoreError, Result};
use crate::graph::{
    decode_records, EntityKey, EntityRecord, GraphPool, GraphQuery, RelationshipKey,
    RelationshipRecord,
};
use crate::locks::{KeyedLocks, LockSet};
use crate::progress::{notify, ProgressEvent, ProgressSink, ProgressStage, TracingProgress};
use crate::transaction::{CommitOutcome, TransactionManager};
use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// `(op_type, forward, compensation)` queued into a transaction.
type PlannedOp = (&'static str, GraphQuery, Vec<GraphQuery>);

fn document_lock_key(doc_id: &str) -> String {
    format!("document:{doc_id}")
}

/// Entities tagged with a document plus every relationship touching them.
#[derive(Debug, Default)]
struct Analysis {
    entities: Vec<EntityRecord>,
    relationships: Vec<RelationshipRecord>,
}

impl Analysis {
    /// Keys a deletion must hold: the tagged entities and their neighbours,
    /// whose relationships may have to be recreated on rollback.
    fn lock_keys(&self) -> BTreeSet<String> {
        let mut keys: BTreeSet<String> = self.entities.iter().map(|e| e.key.lock_key()).collect();
        for r in &self.relationships {
            keys.insert(r.key.source.lock_key());
            keys.insert(r.key.target.lock_key());
        }
        keys
    }
}

struct Backup {
    entities: Vec<EntityRecord>,
    relationships: Vec<RelationshipRecord>,
}

/// Rollback bookkeeping shared by both outcome types.
#[derive(Default)]
struct RollbackReport {
    performed: bool,
    clean: bool,
    escalated: Vec<String>,
    errors: Vec<MutationError>,
}

// ---------------------------------------------------------------------------
// GraphMutationService
// ---------------------------------------------------------------------------

pub struct GraphMutationService {
    pool: GraphPool,
    transactions: Arc<TransactionManager>,
    dlq: Arc<DeadLetterQueue>,
    locks: KeyedLocks,
    progress: Arc<dyn ProgressSink>,
    config: MutationConfig,
}

impl GraphMutationService {
    pub fn new(
        pool: GraphPool,
        transactions: Arc<TransactionManager>,
        dlq: Arc<DeadLetterQueue>,
        config: MutationConfig,
    ) -> Self {
        Self {
            pool,
            transactions,
            dlq,
            locks: KeyedLocks::new(),
            progress: Arc::new(TracingProgress),
            config,
        }
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    /// Route `delete_document` / `ingest_document` DLQ entries back here.
    pub fn register_retry_handlers(self: &Arc<Self>) {
        let handler: Arc<dyn RetryHandler> = Arc::new(MutationRetryHandler {
            service: Arc::downgrade(self),
        });
        self.dlq.register_handler(DELETE_DOCUMENT_OP, handler.clone());
        self.dlq.register_handler(INGEST_DOCUMENT_OP, handler);
    }

    fn emit(&self, doc_id: &str, stage: ProgressStage, percent: u8, message: impl Into<String>) {
        notify(self.progress.as_ref(), ProgressEvent::new(doc_id, stage, percent, message));
    }

    fn emit_counts(
        &self,
        doc_id: &str,
        stage: ProgressStage,
        percent: u8,
        message: impl Into<String>,
        entities: usize,
        relationships: usize,
    ) {
        notify(
            self.progress.as_ref(),
            ProgressEvent::new(doc_id, stage, percent, message).with_counts(entities, relationships),
        );
    }

    /// A read through the breaker and pool with its own deadline.
    async fn read(&self, query: GraphQuery, deadline: Duration) -> Result<Vec<serde_json::Value>> {
        self.transactions
            .breaker()
            .call(|| self.pool.execute_with_timeout(&query, deadline))
            .await
    }

    // -----------------------------------------------------------------------
    // Deletion
    // -----------------------------------------------------------------------

    /// Remove a document's contribution to the graph.
    ///
    /// Entities referenced only by `doc_id` are deleted with their
    /// relationships; entities shared with other documents lose `doc_id`
    /// from their sources and are otherwise untouched. Any failure rolls the
    /// whole deletion back.
    pub async fn delete_document(&self, doc_id: &str) -> DeletionOutcome {
        self.run_deletion(doc_id, self.config.requeue_failed_deletions)
            .await
    }

    async fn run_deletion(&self, doc_id: &str, requeue: bool) -> DeletionOutcome {
        let mut out = DeletionOutcome {
            document_id: doc_id.to_string(),
            rollback_clean: true,
            ..Default::default()
        };
        let _doc_lock = self.locks.lock(&document_lock_key(doc_id)).await;

        // ANALYZE
        self.emit(doc_id, ProgressStage::Analyze, 5, "analyzing document references");
        let (_entity_locks, analysis) = match self.analyze_locked(doc_id).await {
            Ok(v) => v,
            Err(e) => {
                out.errors.push(MutationError::new(ProgressStage::Analyze, &e));
                out.requeued_as = self.requeue(requeue, DELETE_DOCUMENT_OP, json!({ "document_id": doc_id }), &e);
                self.emit(doc_id, ProgressStage::Failed, 100, e.to_string());
                return out;
            }
        };
        if analysis.entities.is_empty() {
            info!(document = %doc_id, "document has no graph references; nothing to delete");
            out.success = true;
            self.emit(doc_id, ProgressStage::Completed, 100, "no graph references");
            return out;
        }
        self.emit_counts(
            doc_id,
            ProgressStage::Analyze,
            15,
            "analysis complete",
            analysis.entities.len(),
            analysis.relationships.len(),
        );

        // PLAN
        let plan = DeletionPlan::build(doc_id, &analysis.entities, &analysis.relationships);
        self.emit_counts(
            doc_id,
            ProgressStage::Plan,
            25,
            format!(
                "{} entities to remove, {} to preserve",
                plan.entities_to_remove.len(),
                plan.entities_to_preserve.len()
            ),
            plan.entities_to_remove.len(),
            plan.relationships_to_remove.len(),
        );
        debug!(
            document = %doc_id,
            remove = plan.entities_to_remove.len(),
            preserve = plan.entities_to_preserve.len(),
            relationships = plan.relationships_to_remove.len(),
            "deletion planned"
        );

        let tx = self
            .transactions
            .begin_transaction(format!("{DELETE_DOCUMENT_OP}:{doc_id}"));
        out.transaction_id = Some(tx);

        // BACKUP
        self.emit(doc_id, ProgressStage::Backup, 40, "snapshotting entities for rollback");
        let backup = match self.backup(&plan).await {
            Ok(b) => b,
            Err(e) => {
                out.errors.push(MutationError::new(ProgressStage::Backup, &e));
                return self.fail_deletion(out, tx, e, requeue).await;
            }
        };

        // EXECUTE
        self.emit(doc_id, ProgressStage::Execute, 60, "applying deletion");
        let ops = deletion_ops(doc_id, &plan, &backup);
        if let Err(e) = self.execute_all(tx, ops).await {
            out.errors.push(MutationError::new(ProgressStage::Execute, &e));
            return self.fail_deletion(out, tx, e, requeue).await;
        }

        // VERIFY
        self.emit(doc_id, ProgressStage::Verify, 85, "verifying no references remain");
        if let Err(e) = self.verify_deleted(doc_id).await {
            out.errors.push(MutationError::new(ProgressStage::Verify, &e));
            return self.fail_deletion(out, tx, e, requeue).await;
        }

        match self.transactions.commit_transaction(tx, &self.pool).await {
            Ok(c) if c.committed => {}
            Ok(c) => {
                let e = CoreError::Store(c.errors.join("; "));
                out.errors.push(MutationError::new(ProgressStage::Execute, &e));
                let report = self.escalate(&c);
                apply_report(&mut out.errors, &mut out.escalated_operations, &report);
                out.rollback_performed = report.performed;
                out.rollback_clean = report.clean;
                return out;
            }
            Err(e) => {
                out.errors.push(MutationError::new(ProgressStage::Execute, &e));
                return out;
            }
        }

        out.success = true;
        out.entities_removed = plan.entities_to_remove.iter().map(|e| e.key()).collect();
        out.entities_preserved = plan.entities_to_preserve.iter().map(|e| e.key()).collect();
        out.relationships_removed = backup.relationships.len();
        info!(
            document = %doc_id,
            removed = out.entities_removed.len(),
            preserved = out.entities_preserved.len(),
            relationships = out.relationships_removed,
            "document deleted from graph"
        );
        self.emit_counts(
            doc_id,
            ProgressStage::Completed,
            100,
            "deletion complete",
            out.entities_removed.len(),
            out.relationships_removed,
        );
        out
    }

    async fn fail_deletion(
        &self,
        mut out: DeletionOutcome,
        tx: Uuid,
        cause: CoreError,
        requeue: bool,
    ) -> DeletionOutcome {
        let doc_id = out.document_id.clone();
        let report = self.roll_back(&doc_id, tx, &cause).await;
        apply_report(&mut out.errors, &mut out.escalated_operations, &report);
        out.rollback_performed = report.performed;
        out.rollback_clean = report.clean;
        // A dirty rollback needs a human before the deletion can be retried.
        if report.clean {
            out.requeued_as = self.requeue(requeue, DELETE_DOCUMENT_OP, json!({ "document_id": doc_id }), &cause);
        }
        self.emit(&doc_id, ProgressStage::Failed, 100, cause.to_string());
        out
    }

    /// Analyze, then lock every affected entity and re-analyze until the
    /// held lock set covers what the analysis found.
    async fn analyze_locked(&self, doc_id: &str) -> Result<(LockSet, Analysis)> {
        let mut analysis = self.analyze(doc_id).await?;
        let rounds = self.config.max_lock_rounds.max(1);
        for round in 1..=rounds {
            let held = self.locks.lock_many(analysis.lock_keys()).await;
            analysis = self.analyze(doc_id).await?;
            if held.covers(&analysis.lock_keys()) {
                return Ok((held, analysis));
            }
            debug!(document = %doc_id, round, "affected entities changed while locking; widening");
        }
        Err(CoreError::Timeout(format!(
            "affected entities of '{doc_id}' kept changing after {rounds} lock rounds"
        )))
    }

    async fn analyze(&self, doc_id: &str) -> Result<Analysis> {
        let deadline = self.pool.query_timeout();
        let rows = self
            .read(
                GraphQuery::EntitiesForDocument {
                    document_id: doc_id.to_string(),
                },
                deadline,
            )
            .await?;
        let entities: Vec<EntityRecord> = decode_records(rows)?;
        if entities.is_empty() {
            return Ok(Analysis::default());
        }
        let rows = self
            .read(
                GraphQuery::RelationshipsTouching {
                    entities: entities.iter().map(|e| e.key.clone()).collect(),
                },
                deadline,
            )
            .await?;
        let relationships = decode_records(rows)?;
        Ok(Analysis {
            entities,
            relationships,
        })
    }

    async fn backup(&self, plan: &DeletionPlan) -> Result<Backup> {
        let keys: Vec<EntityKey> = plan.removed_keys().into_iter().collect();
        if keys.is_empty() {
            return Ok(Backup {
                entities: Vec::new(),
                relationships: Vec::new(),
            });
        }
        let deadline = self.config.backup_timeout();
        let rows = self
            .read(
                GraphQuery::SnapshotEntities {
                    entities: keys.clone(),
                },
                deadline,
            )
            .await?;
        let entities: Vec<EntityRecord> = decode_records(rows)?;
        let captured: BTreeSet<&EntityKey> = entities.iter().map(|e| &e.key).collect();
        if let Some(missing) = keys.iter().find(|k| !captured.contains(k)) {
            return Err(CoreError::Validation(format!("no backup captured for {missing}")));
        }

        let rows = self
            .read(GraphQuery::RelationshipsTouching { entities: keys }, deadline)
            .await?;
        let mut relationships: Vec<RelationshipRecord> = decode_records(rows)?;
        relationships.sort_by(|a, b| a.key.cmp(&b.key));
        relationships.dedup_by(|a, b| a.key == b.key);
        Ok(Backup {
            entities,
            relationships,
        })
    }

    async fn verify_deleted(&self, doc_id: &str) -> Result<()> {
        let rows = self
            .read(
                GraphQuery::CountDocumentReferences {
                    document_id: doc_id.to_string(),
                },
                self.config.verify_timeout(),
            )
            .await?;
        let count = rows
            .first()
            .and_then(|r| r.get("count"))
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| CoreError::Validation("reference count query returned no count".to_string()))?;
        if count != 0 {
            return Err(CoreError::Validation(format!(
                "{count} entities still reference document '{doc_id}'"
            )));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Ingest
    // -----------------------------------------------------------------------

    /// Write a document's extracted entities and relationships.
    ///
    /// Entities are upserted by business key with `doc_id` added to their
    /// sources; relationships are created if absent. All writes form one
    /// transaction and are undone together on failure.
    pub async fn ingest_document(&self, doc_id: &str, extraction: &DocumentExtraction) -> IngestOutcome {
        self.run_ingest(doc_id, extraction, self.config.requeue_failed_deletions)
            .await
    }

    async fn run_ingest(&self, doc_id: &str, extraction: &DocumentExtraction, requeue: bool) -> IngestOutcome {
        let mut out = IngestOutcome {
            document_id: doc_id.to_string(),
            rollback_clean: true,
            ..Default::default()
        };
        let _doc_lock = self.locks.lock(&document_lock_key(doc_id)).await;

        self.emit(doc_id, ProgressStage::Validate, 5, "validating extraction");
        let resolved = match extraction
            .validate(doc_id)
            .and_then(|_| extraction.resolve_relationships())
        {
            Ok(r) => r,
            Err(e) => {
                // Invalid input is never requeued; retrying cannot fix it.
                warn!(document = %doc_id, error = %e, "extraction rejected");
                out.errors.push(MutationError::new(ProgressStage::Validate, &e));
                self.emit(doc_id, ProgressStage::Failed, 100, e.to_string());
                return out;
            }
        };

        // Collapse duplicate extractions of the same entity.
        let mut wanted: BTreeMap<EntityKey, EntityRecord> = BTreeMap::new();
        for e in &extraction.entities {
            let record = wanted.entry(e.key()).or_insert_with(|| EntityRecord {
                node_id: None,
                key: e.key(),
                description: None,
                source_documents: BTreeSet::from([doc_id.to_string()]),
                properties: Default::default(),
            });
            if e.description.is_some() {
                record.description = e.description.clone();
            }
            record.properties.extend(e.properties.clone());
        }
        let keys: Vec<EntityKey> = wanted.keys().cloned().collect();
        let _entity_locks = self.locks.lock_many(keys.iter().map(EntityKey::lock_key)).await;

        self.emit_counts(
            doc_id,
            ProgressStage::Analyze,
            20,
            "loading existing entities",
            keys.len(),
            resolved.len(),
        );
        let (existing, existing_rels) = match self.load_existing(&keys).await {
            Ok(v) => v,
            Err(e) => {
                out.errors.push(MutationError::new(ProgressStage::Analyze, &e));
                out.requeued_as = self.requeue_ingest(requeue, extraction, &e);
                self.emit(doc_id, ProgressStage::Failed, 100, e.to_string());
                return out;
            }
        };

        let mut ops: Vec<PlannedOp> = Vec::new();
        let mut created = Vec::new();
        let mut updated = Vec::new();
        for (key, record) in wanted {
            match existing.get(&key) {
                Some(prev) => {
                    let mut merged = prev.clone();
                    if record.description.is_some() {
                        merged.description = record.description;
                    }
                    merged.properties.extend(record.properties);
                    merged.source_documents.insert(doc_id.to_string());
                    ops.push((
                        "upsert_entity",
                        GraphQuery::CreateEntity { entity: merged },
                        vec![GraphQuery::CreateEntity {
                            entity: prev.clone(),
                        }],
                    ));
                    updated.push(key);
                }
                None => {
                    ops.push((
                        "upsert_entity",
                        GraphQuery::CreateEntity { entity: record },
                        vec![GraphQuery::DeleteEntity { entity: key.clone() }],
                    ));
                    created.push(key);
                }
            }
        }

        let mut new_rels = BTreeSet::new();
        for (i, (source, rel_type, target)) in resolved.into_iter().enumerate() {
            let key = RelationshipKey {
                source,
                rel_type,
                target,
            };
            if existing_rels.contains(&key) || !new_rels.insert(key.clone()) {
                continue;
            }
            let description = extraction.relationships[i].description.clone();
            ops.push((
                "create_relationship",
                GraphQuery::CreateRelationship {
                    relationship: RelationshipRecord {
                        key: key.clone(),
                        description,
                        properties: Default::default(),
                    },
                },
                vec![GraphQuery::DeleteRelationship { relationship: key }],
            ));
        }

        let tx = self
            .transactions
            .begin_transaction(format!("{INGEST_DOCUMENT_OP}:{doc_id}"));
        out.transaction_id = Some(tx);

        self.emit_counts(
            doc_id,
            ProgressStage::Execute,
            60,
            "writing entities and relationships",
            keys.len(),
            new_rels.len(),
        );
        let outcome = match self.execute_all(tx, ops).await {
            Err(e) => Err((ProgressStage::Execute, e)),
            Ok(()) => {
                self.emit(doc_id, ProgressStage::Verify, 85, "verifying entities carry the document");
                self.verify_ingested(doc_id, &keys)
                    .await
                    .map_err(|e| (ProgressStage::Verify, e))
            }
        };
        if let Err((stage, cause)) = outcome {
            out.errors.push(MutationError::new(stage, &cause));
            let report = self.roll_back(doc_id, tx, &cause).await;
            apply_report(&mut out.errors, &mut out.escalated_operations, &report);
            out.rollback_performed = report.performed;
            out.rollback_clean = report.clean;
            if report.clean {
                out.requeued_as = self.requeue_ingest(requeue, extraction, &cause);
            }
            self.emit(doc_id, ProgressStage::Failed, 100, cause.to_string());
            return out;
        }

        match self.transactions.commit_transaction(tx, &self.pool).await {
            Ok(c) if c.committed => {}
            Ok(c) => {
                let e = CoreError::Store(c.errors.join("; "));
                out.errors.push(MutationError::new(ProgressStage::Execute, &e));
                let report = self.escalate(&c);
                apply_report(&mut out.errors, &mut out.escalated_operations, &report);
                out.rollback_performed = report.performed;
                out.rollback_clean = report.clean;
                return out;
            }
            Err(e) => {
                out.errors.push(MutationError::new(ProgressStage::Execute, &e));
                return out;
            }
        }

        out.success = true;
        out.entities_created = created;
        out.entities_updated = updated;
        out.relationships_created = new_rels.len();
        info!(
            document = %doc_id,
            created = out.entities_created.len(),
            updated = out.entities_updated.len(),
            relationships = out.relationships_created,
            "document ingested into graph"
        );
        self.emit_counts(
            doc_id,
            ProgressStage::Completed,
            100,
            "ingest complete",
            keys.len(),
            out.relationships_created,
        );
        out
    }

    async fn load_existing(
        &self,
        keys: &[EntityKey],
    ) -> Result<(BTreeMap<EntityKey, EntityRecord>, BTreeSet<RelationshipKey>)> {
        if keys.is_empty() {
            return Ok((BTreeMap::new(), BTreeSet::new()));
        }
        let deadline = self.pool.query_timeout();
        let rows = self
            .read(
                GraphQuery::SnapshotEntities {
                    entities: keys.to_vec(),
                },
                deadline,
            )
            .await?;
        let entities: Vec<EntityRecord> = decode_records(rows)?;
        let rows = self
            .read(
                GraphQuery::RelationshipsTouching {
                    entities: keys.to_vec(),
                },
                deadline,
            )
            .await?;
        let relationships: Vec<RelationshipRecord> = decode_records(rows)?;
        Ok((
            entities.into_iter().map(|e| (e.key.clone(), e)).collect(),
            relationships.into_iter().map(|r| r.key).collect(),
        ))
    }

    async fn verify_ingested(&self, doc_id: &str, keys: &[EntityKey]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let rows = self
            .read(
                GraphQuery::SnapshotEntities {
                    entities: keys.to_vec(),
                },
                self.config.verify_timeout(),
            )
            .await?;
        let found: Vec<EntityRecord> = decode_records(rows)?;
        let tagged = found
            .iter()
            .filter(|e| e.source_documents.contains(doc_id))
            .count();
        if tagged != keys.len() {
            return Err(CoreError::Validation(format!(
                "{} of {} entities carry document '{doc_id}' after ingest",
                tagged,
                keys.len()
            )));
        }
        Ok(())
    }

    fn requeue_ingest(&self, requeue: bool, extraction: &DocumentExtraction, cause: &CoreError) -> Option<String> {
        match serde_json::to_value(extraction) {
            Ok(payload) => self.requeue(requeue, INGEST_DOCUMENT_OP, payload, cause),
            Err(e) => {
                error!(document = %extraction.document_id, error = %e, "could not serialize extraction for retry");
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Shared steps
    // -----------------------------------------------------------------------

    /// Queue every op, then execute them in order, stopping at the first failure.
    async fn execute_all(&self, tx: Uuid, ops: Vec<PlannedOp>) -> Result<()> {
        let ids = ops
            .into_iter()
            .map(|(op_type, forward, compensation)| {
                self.transactions
                    .add_operation(tx, op_type, forward, compensation)
            })
            .collect::<Result<Vec<_>>>()?;
        for id in ids {
            self.transactions.execute_operation(tx, id, &self.pool).await?;
        }
        Ok(())
    }

    async fn roll_back(&self, doc_id: &str, tx: Uuid, cause: &CoreError) -> RollbackReport {
        self.emit(doc_id, ProgressStage::Rollback, 90, format!("rolling back: {cause}"));
        match self
            .transactions
            .rollback_transaction(tx, cause.to_string(), &self.pool)
            .await
        {
            Ok(c) => self.escalate(&c),
            Err(e) => {
                error!(document = %doc_id, tx = %tx, error = %e, "rollback could not start");
                RollbackReport {
                    performed: false,
                    clean: false,
                    escalated: Vec::new(),
                    errors: vec![MutationError::new(ProgressStage::Rollback, &e)],
                }
            }
        }
    }

    /// Dead-letter every failed compensation for manual review.
    fn escalate(&self, outcome: &CommitOutcome) -> RollbackReport {
        let mut report = RollbackReport {
            performed: outcome.rollback_performed(),
            clean: outcome.rollback_clean(),
            ..Default::default()
        };
        for failure in &outcome.compensation_failures {
            let err = failure.to_error();
            report.errors.push(MutationError::new(ProgressStage::Rollback, &err));
            let queued = serde_json::to_value(failure)
                .map_err(CoreError::from)
                .and_then(|payload| self.dlq.add_failed_operation(COMPENSATION_OP, payload, &err, None));
            match queued {
                Ok(id) => report.escalated.push(id),
                Err(e) => {
                    error!(
                        tx = %failure.transaction_id,
                        operation = %failure.operation_id,
                        error = %e,
                        "could not dead-letter failed compensation"
                    );
                    report.errors.push(MutationError::new(ProgressStage::Rollback, &e));
                }
            }
        }
        report
    }

    fn requeue(
        &self,
        requeue: bool,
        op_type: &str,
        payload: serde_json::Value,
        cause: &CoreError,
    ) -> Option<String> {
        if !requeue {
            return None;
        }
        match self.dlq.add_failed_operation(op_type, payload, cause, None) {
            Ok(id) => Some(id),
            Err(e) => {
                error!(op_type, error = %e, "could not queue failed mutation for retry");
                None
            }
        }
    }
}

fn apply_report(errors: &mut Vec<MutationError>, escalated: &mut Vec<String>, report: &RollbackReport) {
    errors.extend(report.errors.iter().cloned());
    escalated.extend(report.escalated.iter().cloned());
}

/// Relationships first, then orphaned entities, then shared entities'
/// source sets; rollback undoes them in the opposite order.
fn deletion_ops(doc_id: &str, plan: &DeletionPlan, backup: &Backup) -> Vec<PlannedOp> {
    let mut ops = Vec::new();
    for r in &backup.relationships {
        ops.push((
            "delete_relationship",
            GraphQuery::DeleteRelationship {
                relationship: r.key.clone(),
            },
            vec![GraphQuery::CreateRelationship {
                relationship: r.clone(),
            }],
        ));
    }
    for e in &backup.entities {
        ops.push((
            "delete_entity",
            GraphQuery::DeleteEntity {
                entity: e.key.clone(),
            },
            vec![GraphQuery::CreateEntity { entity: e.clone() }],
        ));
    }
    for p in &plan.entities_to_preserve {
        let mut remaining = p.source_documents.clone();
        remaining.remove(doc_id);
        ops.push((
            "update_source_documents",
            GraphQuery::SetSourceDocuments {
                entity: p.key(),
                source_documents: remaining,
            },
            vec![GraphQuery::SetSourceDocuments {
                entity: p.key(),
                source_documents: p.source_documents.clone(),
            }],
        ));
    }
    ops
}

// ---------------------------------------------------------------------------
// DLQ integration
// ---------------------------------------------------------------------------

/// Retries whole deletions and ingests that were dead-lettered.
///
/// A retry never queues itself again; the DLQ entry tracks the attempts.
pub struct MutationRetryHandler {
    service: Weak<GraphMutationService>,
}

#[async_trait]
impl RetryHandler for MutationRetryHandler {
    async fn retry(&self, entry: &FailedOperation) -> Result<()> {
        let Some(service) = self.service.upgrade() else {
            return Err(CoreError::Store("mutation service is no longer running".to_string()));
        };
        let (success, clean, errors) = match entry.operation_type.as_str() {
            DELETE_DOCUMENT_OP => {
                let doc_id = entry
                    .payload
                    .get("document_id")
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| CoreError::Validation("delete_document payload has no document_id".to_string()))?;
                let out = service.run_deletion(doc_id, false).await;
                (out.success, out.rollback_clean, out.errors)
            }
            INGEST_DOCUMENT_OP => {
                let extraction: DocumentExtraction = serde_json::from_value(entry.payload.clone())
                    .map_err(|e| CoreError::Validation(format!("ingest payload is not an extraction: {e}")))?;
                let out = service
                    .run_ingest(&extraction.document_id, &extraction, false)
                    .await;
                (out.success, out.rollback_clean, out.errors)
            }
            other => return Err(CoreError::NoRetryHandler(other.to_string())),
        };
        if success {
            return Ok(());
        }
        if !clean {
            return Err(CoreError::Compensation {
                operation_id: entry.operation_id.clone(),
                message: "retry rolled back with failed compensations".to_string(),
            });
        }
        Err(errors
            .first()
            .map(MutationError::to_error)
            .unwrap_or_else(|| CoreError::Store("retry failed without an error".to_string())))
    }
}
