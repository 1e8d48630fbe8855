use qsr_core::config::Config;
use qsr_core::graph::{
    EntityKey, EntityRecord, FailureRule, GraphQuery, GraphStore, InMemoryGraph, RelationshipKey,
    RelationshipRecord,
};
use qsr_core::mutation::{DocumentExtraction, DELETE_DOCUMENT_OP};
use qsr_core::progress::{BroadcastProgress, ProgressSink, ProgressStage};
use qsr_core::{ErrorKind, Services};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn config() -> Config {
    let mut cfg = Config::new();
    cfg.dlq.base_backoff_secs = 0;
    cfg
}

fn services(dir: &TempDir, store: &Arc<InMemoryGraph>, cfg: Config) -> Services {
    let store: Arc<dyn GraphStore> = store.clone();
    Services::bootstrap(dir.path(), cfg, store).unwrap()
}

fn entity(name: &str, entity_type: &str, docs: &[&str]) -> EntityRecord {
    EntityRecord {
        node_id: None,
        key: EntityKey::new(name, entity_type),
        description: Some(format!("{name} description")),
        source_documents: docs.iter().map(|d| d.to_string()).collect(),
        properties: Default::default(),
    }
}

fn relationship(source: (&str, &str), rel_type: &str, target: (&str, &str)) -> RelationshipRecord {
    RelationshipRecord {
        key: RelationshipKey {
            source: EntityKey::new(source.0, source.1),
            rel_type: rel_type.to_string(),
            target: EntityKey::new(target.0, target.1),
        },
        description: None,
        properties: Default::default(),
    }
}

fn fryer() -> EntityKey {
    EntityKey::new("Fryer", "equipment")
}

fn cleaning() -> EntityKey {
    EntityKey::new("Cleaning", "procedure")
}

fn oil_change() -> EntityKey {
    EntityKey::new("OilChange", "procedure")
}

/// Fryer is shared by A and B; Cleaning belongs to A; OilChange to B.
fn kitchen_graph() -> Arc<InMemoryGraph> {
    let g = Arc::new(InMemoryGraph::new());
    g.put_entity(entity("Fryer", "equipment", &["A", "B"]));
    g.put_entity(entity("Cleaning", "procedure", &["A"]));
    g.put_entity(entity("OilChange", "procedure", &["B"]));
    g.put_relationship(relationship(
        ("Cleaning", "procedure"),
        "APPLIES_TO",
        ("Fryer", "equipment"),
    ));
    g.put_relationship(relationship(
        ("OilChange", "procedure"),
        "APPLIES_TO",
        ("Fryer", "equipment"),
    ));
    g
}

// ---------------------------------------------------------------------------
// Deletion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shared_entity_survives_until_last_document_is_deleted() {
    let dir = TempDir::new().unwrap();
    let graph = kitchen_graph();
    let svc = services(&dir, &graph, config());

    let first = svc.mutations.delete_document("A").await;
    assert!(first.success, "{:?}", first.errors);
    assert_eq!(first.removed_names(), ["Cleaning"]);
    assert_eq!(first.preserved_names(), ["Fryer"]);
    assert_eq!(first.relationships_removed, 1);
    assert!(!first.rollback_performed);

    let shared = graph.entity(&fryer()).unwrap();
    assert_eq!(
        shared.source_documents.iter().collect::<Vec<_>>(),
        ["B"]
    );
    assert!(graph.entity(&cleaning()).is_none());
    assert_eq!(graph.relationships().len(), 1);

    let second = svc.mutations.delete_document("B").await;
    assert!(second.success);
    let mut removed = second.removed_names();
    removed.sort();
    assert_eq!(removed, ["Fryer", "OilChange"]);
    assert!(second.entities_preserved.is_empty());
    assert!(graph.entity_names().is_empty());
    assert!(graph.relationships().is_empty());
}

#[tokio::test]
async fn deleting_twice_is_a_noop() {
    let dir = TempDir::new().unwrap();
    let graph = kitchen_graph();
    let svc = services(&dir, &graph, config());

    assert!(svc.mutations.delete_document("A").await.success);
    graph.clear_journal();

    let again = svc.mutations.delete_document("A").await;
    assert!(again.success);
    assert!(again.entities_removed.is_empty());
    assert!(again.transaction_id.is_none());
    assert!(graph.journal().is_empty());

    let unknown = svc.mutations.delete_document("never-ingested").await;
    assert!(unknown.success);
    assert!(unknown.entities_removed.is_empty());
}

#[tokio::test]
async fn failed_update_rolls_back_and_requeues() {
    let dir = TempDir::new().unwrap();
    let graph = kitchen_graph();
    graph.inject_failure(
        FailureRule::always("set_source_documents", ErrorKind::Connection).for_entity("Fryer"),
    );
    let svc = services(&dir, &graph, config());

    let out = svc.mutations.delete_document("A").await;
    assert!(!out.success);
    assert!(out.rollback_performed);
    assert!(out.rollback_clean);
    assert!(out.escalated_operations.is_empty());
    assert_eq!(out.errors[0].stage, ProgressStage::Execute);
    assert_eq!(out.errors[0].kind, ErrorKind::Connection);

    // Graph is back to its original shape.
    let restored = graph.entity(&cleaning()).unwrap();
    assert_eq!(restored.description.as_deref(), Some("Cleaning description"));
    assert_eq!(graph.entity(&fryer()).unwrap().source_documents.len(), 2);
    assert_eq!(graph.relationships().len(), 2);

    // The whole deletion waits in the DLQ and succeeds once the store recovers.
    let queued = out.requeued_as.clone().unwrap();
    let entry = svc.dlq.get(&queued).unwrap();
    assert_eq!(entry.operation_type, DELETE_DOCUMENT_OP);
    assert_eq!(entry.payload, json!({"document_id": "A"}));

    graph.clear_failures();
    let report = svc.dlq.process_due().await;
    assert_eq!(report.succeeded, 1);
    assert!(graph.entity(&cleaning()).is_none());
    assert_eq!(svc.dlq.get_queue_status().failed_operations, 0);
}

#[tokio::test]
async fn failed_compensation_is_escalated_for_manual_review() {
    let dir = TempDir::new().unwrap();
    let graph = kitchen_graph();
    graph.inject_failure(
        FailureRule::always("set_source_documents", ErrorKind::Connection).for_entity("Fryer"),
    );
    // Recreating Cleaning fails, so its relationship cannot come back either.
    graph.inject_failure(FailureRule::always("create_entity", ErrorKind::Connection));
    let svc = services(&dir, &graph, config());

    let out = svc.mutations.delete_document("A").await;
    assert!(!out.success);
    assert!(out.rollback_performed);
    assert!(!out.rollback_clean);
    assert_eq!(out.escalated_operations.len(), 2);
    assert!(out.requeued_as.is_none());

    let status = svc.dlq.get_queue_status();
    assert_eq!(status.manual_review_queue, 2);
    assert_eq!(status.failed_operations, 0);
    for id in &out.escalated_operations {
        let entry = svc.dlq.get(id).unwrap();
        assert!(entry.manual_review);
        assert_eq!(entry.error_type, ErrorKind::Compensation);
    }
}

#[tokio::test]
async fn verification_failure_rolls_back() {
    let dir = TempDir::new().unwrap();
    let graph = kitchen_graph();
    graph.inject_failure(FailureRule::always(
        "count_document_references",
        ErrorKind::Timeout,
    ));
    let mut cfg = config();
    cfg.mutation.requeue_failed_deletions = false;
    let svc = services(&dir, &graph, cfg);

    let out = svc.mutations.delete_document("A").await;
    assert!(!out.success);
    assert_eq!(out.errors[0].stage, ProgressStage::Verify);
    assert!(out.rollback_performed && out.rollback_clean);
    assert!(out.requeued_as.is_none());
    assert!(graph.entity(&cleaning()).is_some());
    assert_eq!(graph.entity(&fryer()).unwrap().source_documents.len(), 2);
}

#[tokio::test]
async fn backup_failure_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let graph = kitchen_graph();
    graph.inject_failure(FailureRule::always("snapshot_entities", ErrorKind::Timeout));
    let svc = services(&dir, &graph, config());
    graph.clear_journal();

    let out = svc.mutations.delete_document("A").await;
    assert!(!out.success);
    assert_eq!(out.errors[0].stage, ProgressStage::Backup);
    assert!(out.rollback_performed);
    assert!(out.rollback_clean);
    assert!(graph.journal().is_empty());
}

/// Which deletion a journaled mutation belongs to. Removing the shared
/// Fryer outright is left unlabelled: it is done by whichever runs second.
fn deletion_owner(query: &GraphQuery) -> Option<&'static str> {
    let owner_of = |key: &EntityKey| match key.name.as_str() {
        "Cleaning" => Some("A"),
        "OilChange" => Some("B"),
        _ => None,
    };
    match query {
        GraphQuery::DeleteRelationship { relationship } => {
            owner_of(&relationship.source).or_else(|| owner_of(&relationship.target))
        }
        GraphQuery::DeleteEntity { entity } => owner_of(entity),
        // The first deletion leaves Fryer tagged with the other document only.
        GraphQuery::SetSourceDocuments {
            source_documents, ..
        } => {
            if source_documents.contains("B") {
                Some("A")
            } else {
                Some("B")
            }
        }
        _ => None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_deletions_are_serialized() {
    let dir = TempDir::new().unwrap();
    let graph = kitchen_graph();
    // Every query yields, so unserialized deletions would interleave.
    graph.set_latency(Duration::from_millis(20));
    let svc = Arc::new(services(&dir, &graph, config()));

    let a = {
        let svc = svc.clone();
        tokio::spawn(async move { svc.mutations.delete_document("A").await })
    };
    let b = {
        let svc = svc.clone();
        tokio::spawn(async move { svc.mutations.delete_document("B").await })
    };
    let (a, b) = (a.await.unwrap(), b.await.unwrap());
    assert!(a.success && b.success);
    assert_eq!(a.entities_removed.len() + b.entities_removed.len(), 3);
    assert!(graph.entity_names().is_empty());
    assert!(graph.relationships().is_empty());

    let journal = graph.journal();
    let owners: Vec<Option<&str>> = journal.iter().map(deletion_owner).collect();
    let labelled: Vec<&str> = owners.iter().flatten().copied().collect();
    assert_eq!(labelled.len(), 5, "{journal:?}");
    let boundaries: Vec<usize> = labelled
        .windows(2)
        .enumerate()
        .filter(|(_, w)| w[0] != w[1])
        .map(|(i, _)| i + 1)
        .collect();
    assert_eq!(boundaries.len(), 1, "mutations interleaved: {owners:?}");

    // The shared entity is removed inside the second block.
    let second = labelled[boundaries[0]];
    let first_of_second = owners.iter().position(|o| *o == Some(second)).unwrap();
    let fryer_removed = journal
        .iter()
        .position(|q| matches!(q, GraphQuery::DeleteEntity { entity } if *entity == fryer()))
        .unwrap();
    assert!(fryer_removed > first_of_second, "{owners:?}");
}

#[tokio::test]
async fn open_breaker_fails_fast() {
    let dir = TempDir::new().unwrap();
    let graph = kitchen_graph();
    graph.set_offline(true);
    let mut cfg = config();
    cfg.breaker.failure_threshold = 1;
    let svc = services(&dir, &graph, cfg);

    let first = svc.mutations.delete_document("A").await;
    assert_eq!(first.errors[0].kind, ErrorKind::Connection);

    let second = svc.mutations.delete_document("A").await;
    assert_eq!(second.errors[0].kind, ErrorKind::CircuitOpen);
    assert_eq!(svc.breakers.snapshots()[0].rejected_calls, 1);
    assert_eq!(svc.dlq.get_queue_status().failed_operations, 2);
}

#[tokio::test]
async fn progress_events_follow_the_stages() {
    let dir = TempDir::new().unwrap();
    let graph = kitchen_graph();
    let progress = Arc::new(BroadcastProgress::new(64));
    let mut rx = progress.subscribe();
    let store: Arc<dyn GraphStore> = graph.clone();
    let sink: Arc<dyn ProgressSink> = progress;
    let svc = Services::bootstrap_with_progress(dir.path(), config(), store, Some(sink)).unwrap();

    assert!(svc.mutations.delete_document("A").await.success);

    let mut stages = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        stages.push(ev.stage);
    }
    stages.dedup();
    assert_eq!(
        stages,
        [
            ProgressStage::Analyze,
            ProgressStage::Plan,
            ProgressStage::Backup,
            ProgressStage::Execute,
            ProgressStage::Verify,
            ProgressStage::Completed,
        ]
    );
}

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

fn extraction(doc: &str) -> DocumentExtraction {
    serde_json::from_value(json!({
        "document_id": doc,
        "entities": [
            {"name": "Fryer", "type": "equipment", "source_document_id": doc, "confidence": 0.95,
             "description": "Deep fryer"},
            {"name": "Filtering", "type": "procedure", "source_document_id": doc, "confidence": 0.8}
        ],
        "relationships": [
            {"source": "Filtering", "target": "Fryer", "relationship_type": "APPLIES_TO",
             "source_document_id": doc, "confidence": 0.7}
        ]
    }))
    .unwrap()
}

#[tokio::test]
async fn ingest_then_delete_round_trip() {
    let dir = TempDir::new().unwrap();
    let graph = kitchen_graph();
    let svc = services(&dir, &graph, config());

    let out = svc.mutations.ingest_document("C", &extraction("C")).await;
    assert!(out.success, "{:?}", out.errors);
    assert_eq!(out.entities_created, [EntityKey::new("Filtering", "procedure")]);
    assert_eq!(out.entities_updated, [fryer()]);
    assert_eq!(out.relationships_created, 1);
    assert_eq!(graph.entity(&fryer()).unwrap().source_documents.len(), 3);
    assert_eq!(
        graph.entity(&fryer()).unwrap().description.as_deref(),
        Some("Deep fryer")
    );

    let del = svc.mutations.delete_document("C").await;
    assert!(del.success);
    assert_eq!(del.removed_names(), ["Filtering"]);
    assert_eq!(graph.entity(&fryer()).unwrap().source_documents.len(), 2);
    assert!(graph.entity(&oil_change()).is_some());
}

#[tokio::test]
async fn invalid_extraction_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let graph = kitchen_graph();
    let svc = services(&dir, &graph, config());
    graph.clear_journal();

    let mut ex = extraction("C");
    ex.entities[1].confidence = 4.0;
    let out = svc.mutations.ingest_document("C", &ex).await;
    assert!(!out.success);
    assert_eq!(out.errors[0].stage, ProgressStage::Validate);
    assert_eq!(out.errors[0].kind, ErrorKind::Validation);
    assert!(out.transaction_id.is_none());
    assert!(out.requeued_as.is_none());
    assert!(graph.journal().is_empty());
}

#[tokio::test]
async fn failed_ingest_is_undone() {
    let dir = TempDir::new().unwrap();
    let graph = kitchen_graph();
    graph.inject_failure(FailureRule::always("create_relationship", ErrorKind::Permission));
    let svc = services(&dir, &graph, config());

    let out = svc.mutations.ingest_document("C", &extraction("C")).await;
    assert!(!out.success);
    assert!(out.rollback_performed && out.rollback_clean);
    assert!(graph.entity(&EntityKey::new("Filtering", "procedure")).is_none());
    let shared = graph.entity(&fryer()).unwrap();
    assert_eq!(shared.source_documents.len(), 2);
    assert_eq!(shared.description.as_deref(), Some("Fryer description"));

    // Permission failures are not retried automatically.
    let entry = svc.dlq.get(out.requeued_as.as_deref().unwrap()).unwrap();
    assert!(entry.manual_review);
}

// ---------------------------------------------------------------------------
// Restart
// ---------------------------------------------------------------------------

#[tokio::test]
async fn queued_work_survives_restart() {
    let dir = TempDir::new().unwrap();
    let graph = kitchen_graph();
    graph.inject_failure(FailureRule::times("delete_entity", ErrorKind::Connection, 1));

    let queued = {
        let svc = services(&dir, &graph, config());
        let out = svc.mutations.delete_document("A").await;
        assert!(!out.success);
        svc.shutdown().await;
        out.requeued_as.unwrap()
    };

    let svc = services(&dir, &graph, config());
    assert_eq!(svc.dlq.get(&queued).unwrap().operation_type, DELETE_DOCUMENT_OP);
    svc.start();
    for _ in 0..200 {
        if svc.dlq.get_queue_status().failed_operations == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    svc.shutdown().await;
    assert_eq!(svc.dlq.get_queue_status().failed_operations, 0);
    assert!(graph.entity(&cleaning()).is_none());
}
