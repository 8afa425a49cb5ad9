//! SQLite store semantics: atomic claim, guarded terminal writes,
//! idempotent queue creation and stuck-alert bookkeeping.

use std::sync::Arc;

use dossier_pipeline::claim::claim_next_unit;
use dossier_pipeline::db;
use dossier_pipeline::migrate;
use dossier_pipeline::models::{
    AnalysisUnit, Chunk, Document, DocumentStatus, QueueItem, QueueStatus, RemoteFileState,
    StuckNotification, UnitStatus,
};
use dossier_pipeline::store::sqlite::SqliteUnitStore;
use dossier_pipeline::store::{UnitCompletion, UnitFailure, UnitStore};
use tempfile::TempDir;

async fn open_store(tmp: &TempDir) -> SqliteUnitStore {
    let pool = db::connect_path(&tmp.path().join("store.sqlite"))
        .await
        .unwrap();
    migrate::migrate_pool(&pool).await.unwrap();
    SqliteUnitStore::new(pool)
}

fn document(id: &str, page_count: i64) -> Document {
    Document {
        id: id.to_string(),
        file_name: format!("{}.pdf", id),
        storage_path: format!("{}/original.pdf", id),
        content_hash: format!("hash-{}", id),
        byte_size: 1024,
        page_count,
        is_chunked: false,
        status: DocumentStatus::Analyzing,
        error_reason: None,
        created_at: 0,
        updated_at: 0,
    }
}

fn unit(id: &str, document_id: &str, order: i64) -> AnalysisUnit {
    AnalysisUnit {
        id: id.to_string(),
        document_id: document_id.to_string(),
        stage_title: format!("Stage {}", order),
        execution_order: order,
        status: UnitStatus::Pending,
        prompt: "Analyse.".into(),
        system_instruction: String::new(),
        result_json: None,
        execution_time_ms: None,
        tokens_used: None,
        model_used: None,
        last_error: None,
        error_diagnostics: None,
        processing_started_at: None,
        completed_at: None,
        created_at: 0,
    }
}

fn chunk(id: &str, document_id: &str, index: i64) -> Chunk {
    Chunk {
        id: id.to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        total_chunks: 2,
        start_page: index * 10 + 1,
        end_page: index * 10 + 10,
        storage_path: format!("{}/chunks/chunk-{:04}.pdf", document_id, index),
        byte_size: 512,
        remote_name: None,
        remote_uri: None,
        remote_state: RemoteFileState::Uploading,
        expires_at: None,
        upload_attempts: 0,
    }
}

fn queue_item(id: &str, chunk: &Chunk, unit_id: &str) -> QueueItem {
    QueueItem {
        id: id.to_string(),
        document_id: chunk.document_id.clone(),
        chunk_id: chunk.id.clone(),
        chunk_index: chunk.chunk_index,
        unit_id: unit_id.to_string(),
        priority: 1,
        status: QueueStatus::Pending,
        attempt_count: 0,
        max_attempts: 3,
        partial_result: None,
        tokens_used: None,
        last_error: None,
    }
}

fn completion() -> UnitCompletion {
    UnitCompletion {
        result_json: r#"{"summary":"ok"}"#.into(),
        tokens_used: 42,
        model_used: "model-a".into(),
        execution_time_ms: 10,
        completed_at: 100,
    }
}

#[tokio::test]
async fn concurrent_claims_on_sqlite_yield_one_winner() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(open_store(&tmp).await);
    store.insert_document(&document("doc", 10)).await.unwrap();
    store.create_units(&[unit("only", "doc", 1)]).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            claim_next_unit(store.as_ref(), "doc").await
        }));
    }

    let mut winners = Vec::new();
    for handle in handles {
        if let Some(unit) = handle.await.unwrap().unwrap() {
            winners.push(unit);
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].id, "only");
    assert_eq!(winners[0].status, UnitStatus::Processing);

    let stored = store.get_unit("only").await.unwrap().unwrap();
    assert_eq!(stored.status, UnitStatus::Processing);
    assert!(stored.processing_started_at.is_some());
}

#[tokio::test]
async fn claims_follow_execution_order() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    store.insert_document(&document("doc", 10)).await.unwrap();
    store
        .create_units(&[unit("u3", "doc", 3), unit("u1", "doc", 1), unit("u2", "doc", 2)])
        .await
        .unwrap();

    let mut order = Vec::new();
    while let Some(u) = claim_next_unit(&store, "doc").await.unwrap() {
        order.push(u.id);
    }
    assert_eq!(order, vec!["u1", "u2", "u3"]);

    let counts = store.unit_counts("doc").await.unwrap();
    assert_eq!(counts.processing, 3);
    assert_eq!(counts.pending, 0);
}

#[tokio::test]
async fn complete_requires_processing() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    store.insert_document(&document("doc", 10)).await.unwrap();
    store.create_units(&[unit("u1", "doc", 1)]).await.unwrap();

    // Still pending: nobody holds the claim.
    assert!(store.complete_unit("u1", &completion()).await.is_err());

    claim_next_unit(&store, "doc").await.unwrap().unwrap();
    store.complete_unit("u1", &completion()).await.unwrap();

    let done = store.get_unit("u1").await.unwrap().unwrap();
    assert_eq!(done.status, UnitStatus::Completed);
    assert_eq!(done.tokens_used, Some(42));
    assert_eq!(done.model_used.as_deref(), Some("model-a"));

    // Completed units cannot be completed again.
    assert!(store.complete_unit("u1", &completion()).await.is_err());
    assert!(store.unit_counts("doc").await.unwrap().all_completed());
}

#[tokio::test]
async fn queue_insert_ignores_existing_pairs() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    store.insert_document(&document("doc", 20)).await.unwrap();
    store
        .create_units(&[unit("u1", "doc", 1), unit("u2", "doc", 2)])
        .await
        .unwrap();
    let chunks = vec![chunk("c0", "doc", 0), chunk("c1", "doc", 1)];
    store.insert_chunks(&chunks).await.unwrap();

    let items = vec![
        queue_item("q1", &chunks[0], "u1"),
        queue_item("q2", &chunks[1], "u1"),
        queue_item("q3", &chunks[0], "u2"),
        queue_item("q4", &chunks[1], "u2"),
    ];
    assert_eq!(store.insert_queue_items(&items).await.unwrap(), 4);

    // Same (chunk, unit) pairs under fresh ids are ignored.
    let again = vec![
        queue_item("q5", &chunks[0], "u1"),
        queue_item("q6", &chunks[1], "u2"),
    ];
    assert_eq!(store.insert_queue_items(&again).await.unwrap(), 0);
    assert_eq!(store.count_queue_items("doc").await.unwrap(), 4);

    let u1_items = store.list_queue_items("u1").await.unwrap();
    assert_eq!(u1_items.len(), 2);
    assert_eq!(u1_items[0].chunk_index, 0);
    assert_eq!(u1_items[1].chunk_index, 1);

    store.start_queue_item("q1").await.unwrap();
    store
        .complete_queue_item("q1", r#"{"partial":true}"#, 100)
        .await
        .unwrap();
    let q1 = store
        .list_queue_items("u1")
        .await
        .unwrap()
        .into_iter()
        .find(|q| q.id == "q1")
        .unwrap();
    assert_eq!(q1.status, QueueStatus::Completed);
    assert_eq!(q1.attempt_count, 1);
    assert_eq!(q1.tokens_used, Some(100));
}

#[tokio::test]
async fn stuck_units_respect_age_and_page_cap() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    store.insert_document(&document("small", 50)).await.unwrap();
    store.insert_document(&document("huge", 5000)).await.unwrap();
    store.create_units(&[unit("s1", "small", 1)]).await.unwrap();
    store.create_units(&[unit("h1", "huge", 1)]).await.unwrap();

    claim_next_unit(&store, "small").await.unwrap().unwrap();
    claim_next_unit(&store, "huge").await.unwrap().unwrap();

    let far_future = chrono::Utc::now().timestamp() + 3600;
    let stuck = store.list_stuck_units(far_future, 1000).await.unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].unit_id, "s1");
    assert_eq!(stuck[0].page_count, 50);

    // Nothing started before the epoch.
    assert!(store.list_stuck_units(0, 1000).await.unwrap().is_empty());
}

#[tokio::test]
async fn stuck_notifications_throttle_and_resolve() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    store.insert_document(&document("doc", 10)).await.unwrap();
    store.create_units(&[unit("u1", "doc", 1)]).await.unwrap();
    claim_next_unit(&store, "doc").await.unwrap().unwrap();

    store
        .record_stuck_notification(&StuckNotification {
            id: "n1".into(),
            document_id: "doc".into(),
            chunk_id: None,
            unit_id: "u1".into(),
            minutes_stuck: 45,
            sent_at: 1_000,
            resolved_at: None,
        })
        .await
        .unwrap();

    let recent = store.recent_stuck_notification("doc", 900).await.unwrap();
    assert_eq!(recent.map(|n| n.id), Some("n1".to_string()));
    assert!(store
        .recent_stuck_notification("doc", 1_001)
        .await
        .unwrap()
        .is_none());

    // Unit still processing: nothing to resolve.
    assert_eq!(store.resolve_stuck_notifications(2_000).await.unwrap(), 0);

    store.complete_unit("u1", &completion()).await.unwrap();
    assert_eq!(store.resolve_stuck_notifications(2_000).await.unwrap(), 1);
    assert_eq!(store.resolve_stuck_notifications(3_000).await.unwrap(), 0);
}

#[tokio::test]
async fn failed_unit_alerts_stay_open() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    store.insert_document(&document("doc", 10)).await.unwrap();
    store.create_units(&[unit("u1", "doc", 1)]).await.unwrap();
    claim_next_unit(&store, "doc").await.unwrap().unwrap();
    store
        .record_stuck_notification(&StuckNotification {
            id: "n1".into(),
            document_id: "doc".into(),
            chunk_id: None,
            unit_id: "u1".into(),
            minutes_stuck: 45,
            sent_at: 1_000,
            resolved_at: None,
        })
        .await
        .unwrap();

    store
        .fail_unit(
            "u1",
            &UnitFailure {
                message: "model exhausted".into(),
                diagnostics: None,
                execution_time_ms: 5,
            },
        )
        .await
        .unwrap();
    assert_eq!(store.resolve_stuck_notifications(2_000).await.unwrap(), 0);
}

#[tokio::test]
async fn preparation_lease_admits_one_preparer() {
    let tmp = TempDir::new().unwrap();
    let store = open_store(&tmp).await;
    let mut doc = document("doc", 10);
    doc.status = DocumentStatus::Created;
    store.insert_document(&doc).await.unwrap();

    assert!(store.begin_preparation("doc", 100, 0).await.unwrap());
    assert!(!store.begin_preparation("doc", 101, 0).await.unwrap());
    // A lease older than the staleness cutoff can be taken over.
    assert!(store.begin_preparation("doc", 200, 150).await.unwrap());

    store.release_preparation("doc").await.unwrap();
    assert!(store.begin_preparation("doc", 300, 0).await.unwrap());

    assert!(store.finish_preparation("doc", 400).await.unwrap());
    assert!(!store.finish_preparation("doc", 401).await.unwrap());
    let loaded = store.get_document("doc").await.unwrap().unwrap();
    assert_eq!(loaded.status, DocumentStatus::Analyzing);
    assert!(!store.begin_preparation("doc", 500, 0).await.unwrap());
}
