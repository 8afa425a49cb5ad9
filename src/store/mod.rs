//! Storage abstraction for the analysis pipeline.
//!
//! The [`UnitStore`] trait covers everything the core reads or writes:
//! documents, analysis units and their atomic claim, chunks, the
//! (chunk, stage) queue, the append-only attempt ledger and stuck-alert
//! throttle records.
//!
//! Two implementations ship with the crate:
//! - [`sqlite::SqliteUnitStore`]: the production backend (`sqlx`).
//! - [`memory::InMemoryUnitStore`]: `Mutex`-guarded maps for tests.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{
    AnalysisUnit, Chunk, Document, DocumentStatus, ModelAttempt, QueueItem, RemoteFileState,
    StuckNotification, StuckUnit, UnitCounts,
};

/// Fields written when a claimed unit completes.
#[derive(Debug, Clone)]
pub struct UnitCompletion {
    pub result_json: String,
    pub tokens_used: i64,
    pub model_used: String,
    pub execution_time_ms: i64,
    pub completed_at: i64,
}

/// Fields written when a claimed unit fails.
#[derive(Debug, Clone)]
pub struct UnitFailure {
    /// Short reason shown to users.
    pub message: String,
    /// Full JSON error payload (type, message, diagnostics).
    pub diagnostics: Option<String>,
    pub execution_time_ms: i64,
}

/// Remote-file fields written by the chunk uploader.
#[derive(Debug, Clone)]
pub struct RemoteUpdate {
    pub remote_name: Option<String>,
    pub remote_uri: Option<String>,
    pub remote_state: RemoteFileState,
    pub expires_at: Option<i64>,
    pub upload_attempts: i64,
}

/// Abstract storage backend for the pipeline.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`begin_preparation`](UnitStore::begin_preparation) / [`finish_preparation`](UnitStore::finish_preparation) | Single preparer, then conditional created → analyzing |
/// | [`claim_next_unit`](UnitStore::claim_next_unit) | Atomic pending → processing transition |
/// | [`complete_unit`](UnitStore::complete_unit) / [`fail_unit`](UnitStore::fail_unit) | Terminal unit writes by the claim holder |
/// | [`unit_counts`](UnitStore::unit_counts) | Full-table completion check |
/// | [`insert_queue_items`](UnitStore::insert_queue_items) | Idempotent (chunk, stage) queue creation |
/// | [`record_attempt`](UnitStore::record_attempt) | Append to the attempt ledger |
/// | [`list_stuck_units`](UnitStore::list_stuck_units) | Units processing longer than a threshold |
#[async_trait]
pub trait UnitStore: Send + Sync {
    // ---- documents ----

    async fn insert_document(&self, doc: &Document) -> Result<()>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    async fn find_document_by_hash(&self, content_hash: &str) -> Result<Option<Document>>;

    async fn set_document_status(
        &self,
        id: &str,
        status: DocumentStatus,
        error_reason: Option<&str>,
        now: i64,
    ) -> Result<()>;

    async fn set_document_chunked(&self, id: &str, is_chunked: bool, now: i64) -> Result<()>;

    /// Take the preparation lease of a `created` document. Fails (returns
    /// `false`) while another preparer holds a lease that started at or
    /// after `stale_before`.
    async fn begin_preparation(&self, id: &str, now: i64, stale_before: i64) -> Result<bool>;

    /// Drop the preparation lease and leave the status untouched.
    async fn release_preparation(&self, id: &str) -> Result<()>;

    /// `created → analyzing`, clearing the lease. Returns `false` when the
    /// document was no longer `created`.
    async fn finish_preparation(&self, id: &str, now: i64) -> Result<bool>;

    // ---- units ----

    /// Insert units, skipping any (document, execution_order) already present.
    /// Returns the number of rows inserted.
    async fn create_units(&self, units: &[AnalysisUnit]) -> Result<usize>;

    async fn get_unit(&self, id: &str) -> Result<Option<AnalysisUnit>>;

    /// Units of a document in execution order.
    async fn list_units(&self, document_id: &str) -> Result<Vec<AnalysisUnit>>;

    /// Atomically move the lowest-order pending unit of `document_id` to
    /// `processing` and return it. `None` when nothing is pending.
    ///
    /// Exactly one concurrent caller may receive a given unit.
    async fn claim_next_unit(&self, document_id: &str, now: i64) -> Result<Option<AnalysisUnit>>;

    /// Mark a `processing` unit completed. Fails if the unit is not `processing`.
    async fn complete_unit(&self, unit_id: &str, completion: &UnitCompletion) -> Result<()>;

    /// Mark a `processing` unit failed. Fails if the unit is not `processing`.
    async fn fail_unit(&self, unit_id: &str, failure: &UnitFailure) -> Result<()>;

    async fn unit_counts(&self, document_id: &str) -> Result<UnitCounts>;

    /// Units in `processing` whose claim started before `started_before`,
    /// for documents with fewer than `max_pages` pages.
    async fn list_stuck_units(&self, started_before: i64, max_pages: i64)
        -> Result<Vec<StuckUnit>>;

    // ---- chunks ----

    async fn insert_chunks(&self, chunks: &[Chunk]) -> Result<()>;

    /// Chunks of a document in index order.
    async fn list_chunks(&self, document_id: &str) -> Result<Vec<Chunk>>;

    async fn update_chunk_remote(&self, chunk_id: &str, update: &RemoteUpdate) -> Result<()>;

    /// Mark every chunk of the document `failed` and clear remote handles.
    async fn fail_all_chunks(&self, document_id: &str) -> Result<()>;

    // ---- queue ----

    async fn count_queue_items(&self, document_id: &str) -> Result<i64>;

    /// Insert queue items in one transaction, ignoring (chunk, unit) pairs
    /// that already exist. Returns the number of rows inserted.
    async fn insert_queue_items(&self, items: &[QueueItem]) -> Result<usize>;

    /// Queue items of a unit in chunk order.
    async fn list_queue_items(&self, unit_id: &str) -> Result<Vec<QueueItem>>;

    /// Move an item to `processing` and bump its attempt count.
    async fn start_queue_item(&self, id: &str) -> Result<()>;

    async fn complete_queue_item(&self, id: &str, partial_result: &str, tokens_used: i64)
        -> Result<()>;

    async fn fail_queue_item(&self, id: &str, error: &str) -> Result<()>;

    // ---- audit ----

    /// Append an attempt. Never updates existing rows.
    async fn record_attempt(&self, attempt: &ModelAttempt) -> Result<()>;

    /// Attempts of a document in insertion order.
    async fn list_attempts(&self, document_id: &str) -> Result<Vec<ModelAttempt>>;

    // ---- stuck alerts ----

    /// Most recent stuck notification for a document sent at or after `since`.
    async fn recent_stuck_notification(
        &self,
        document_id: &str,
        since: i64,
    ) -> Result<Option<StuckNotification>>;

    async fn record_stuck_notification(&self, notification: &StuckNotification) -> Result<()>;

    /// Resolve open notifications whose unit is `completed`. Alerts for
    /// failed units stay open.
    /// Returns how many were resolved.
    async fn resolve_stuck_notifications(&self, now: i64) -> Result<u64>;
}
