//! SQLite-backed [`UnitStore`] implementation.
//!
//! The claim is a single `UPDATE ... WHERE id = (SELECT ...) AND status =
//! 'pending' RETURNING` statement. SQLite serializes writers, so the
//! sub-select and the status flip happen under one write lock and at most
//! one connection can observe the row as still `pending`.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::models::{
    AnalysisUnit, AttemptOutcome, Chunk, Document, DocumentStatus, ExecutionPhase, ModelAttempt,
    QueueItem, QueueStatus, RemoteFileState, StuckNotification, StuckUnit, UnitCounts, UnitStatus,
};

use super::{RemoteUpdate, UnitCompletion, UnitFailure, UnitStore};

const UNIT_COLUMNS: &str = "id, document_id, stage_title, execution_order, status, prompt, \
    system_instruction, result_json, execution_time_ms, tokens_used, model_used, last_error, \
    error_diagnostics, processing_started_at, completed_at, created_at";

const DOCUMENT_COLUMNS: &str = "id, file_name, storage_path, content_hash, byte_size, \
    page_count, is_chunked, status, error_reason, created_at, updated_at";

const CHUNK_COLUMNS: &str = "id, document_id, chunk_index, total_chunks, start_page, end_page, \
    storage_path, byte_size, remote_name, remote_uri, remote_state, expires_at, upload_attempts";

const QUEUE_COLUMNS: &str = "id, document_id, chunk_id, chunk_index, unit_id, priority, status, \
    attempt_count, max_attempts, partial_result, tokens_used, last_error";

/// SQLite implementation of the [`UnitStore`] trait.
pub struct SqliteUnitStore {
    pool: SqlitePool,
}

impl SqliteUnitStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    Ok(Document {
        id: row.try_get("id")?,
        file_name: row.try_get("file_name")?,
        storage_path: row.try_get("storage_path")?,
        content_hash: row.try_get("content_hash")?,
        byte_size: row.try_get("byte_size")?,
        page_count: row.try_get("page_count")?,
        is_chunked: row.try_get::<i64, _>("is_chunked")? != 0,
        status: DocumentStatus::parse(row.try_get("status")?)?,
        error_reason: row.try_get("error_reason")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_unit(row: &SqliteRow) -> Result<AnalysisUnit> {
    Ok(AnalysisUnit {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        stage_title: row.try_get("stage_title")?,
        execution_order: row.try_get("execution_order")?,
        status: UnitStatus::parse(row.try_get("status")?)?,
        prompt: row.try_get("prompt")?,
        system_instruction: row.try_get("system_instruction")?,
        result_json: row.try_get("result_json")?,
        execution_time_ms: row.try_get("execution_time_ms")?,
        tokens_used: row.try_get("tokens_used")?,
        model_used: row.try_get("model_used")?,
        last_error: row.try_get("last_error")?,
        error_diagnostics: row.try_get("error_diagnostics")?,
        processing_started_at: row.try_get("processing_started_at")?,
        completed_at: row.try_get("completed_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_chunk(row: &SqliteRow) -> Result<Chunk> {
    Ok(Chunk {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        chunk_index: row.try_get("chunk_index")?,
        total_chunks: row.try_get("total_chunks")?,
        start_page: row.try_get("start_page")?,
        end_page: row.try_get("end_page")?,
        storage_path: row.try_get("storage_path")?,
        byte_size: row.try_get("byte_size")?,
        remote_name: row.try_get("remote_name")?,
        remote_uri: row.try_get("remote_uri")?,
        remote_state: RemoteFileState::parse(row.try_get("remote_state")?)?,
        expires_at: row.try_get("expires_at")?,
        upload_attempts: row.try_get("upload_attempts")?,
    })
}

fn row_to_queue_item(row: &SqliteRow) -> Result<QueueItem> {
    Ok(QueueItem {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        chunk_id: row.try_get("chunk_id")?,
        chunk_index: row.try_get("chunk_index")?,
        unit_id: row.try_get("unit_id")?,
        priority: row.try_get("priority")?,
        status: QueueStatus::parse(row.try_get("status")?)?,
        attempt_count: row.try_get("attempt_count")?,
        max_attempts: row.try_get("max_attempts")?,
        partial_result: row.try_get("partial_result")?,
        tokens_used: row.try_get("tokens_used")?,
        last_error: row.try_get("last_error")?,
    })
}

fn row_to_attempt(row: &SqliteRow) -> Result<ModelAttempt> {
    Ok(ModelAttempt {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        unit_id: row.try_get("unit_id")?,
        chunk_index: row.try_get("chunk_index")?,
        phase: ExecutionPhase::parse(row.try_get("phase")?)?,
        model_id: row.try_get("model_id")?,
        attempt_number: row.try_get("attempt_number")?,
        outcome: AttemptOutcome::parse(row.try_get("outcome")?)?,
        error_code: row.try_get("error_code")?,
        error_message: row.try_get("error_message")?,
        duration_ms: row.try_get("duration_ms")?,
        tokens_used: row.try_get("tokens_used")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_notification(row: &SqliteRow) -> Result<StuckNotification> {
    Ok(StuckNotification {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        chunk_id: row.try_get("chunk_id")?,
        unit_id: row.try_get("unit_id")?,
        minutes_stuck: row.try_get("minutes_stuck")?,
        sent_at: row.try_get("sent_at")?,
        resolved_at: row.try_get("resolved_at")?,
    })
}

#[async_trait]
impl UnitStore for SqliteUnitStore {
    async fn insert_document(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO documents (id, file_name, storage_path, content_hash, byte_size,
                                   page_count, is_chunked, status, error_reason,
                                   created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.file_name)
        .bind(&doc.storage_path)
        .bind(&doc.content_hash)
        .bind(doc.byte_size)
        .bind(doc.page_count)
        .bind(doc.is_chunked as i64)
        .bind(doc.status.as_str())
        .bind(&doc.error_reason)
        .bind(doc.created_at)
        .bind(doc.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE id = ?",
            DOCUMENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn find_document_by_hash(&self, content_hash: &str) -> Result<Option<Document>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM documents WHERE content_hash = ? ORDER BY created_at LIMIT 1",
            DOCUMENT_COLUMNS
        ))
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn set_document_status(
        &self,
        id: &str,
        status: DocumentStatus,
        error_reason: Option<&str>,
        now: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE documents SET status = ?, error_reason = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error_reason)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() != 1 {
            bail!("document {} not found", id);
        }
        Ok(())
    }

    async fn set_document_chunked(&self, id: &str, is_chunked: bool, now: i64) -> Result<()> {
        sqlx::query("UPDATE documents SET is_chunked = ?, updated_at = ? WHERE id = ?")
            .bind(is_chunked as i64)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn begin_preparation(&self, id: &str, now: i64, stale_before: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE documents
            SET preparing_since = ?, updated_at = ?
            WHERE id = ? AND status = 'created'
              AND (preparing_since IS NULL OR preparing_since < ?)
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(stale_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_preparation(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE documents SET preparing_since = NULL WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn finish_preparation(&self, id: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE documents
            SET status = 'analyzing', error_reason = NULL, preparing_since = NULL, updated_at = ?
            WHERE id = ? AND status = 'created'
            "#,
        )
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn create_units(&self, units: &[AnalysisUnit]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0usize;
        for unit in units {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO analysis_units
                    (id, document_id, stage_title, execution_order, status, prompt,
                     system_instruction, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&unit.id)
            .bind(&unit.document_id)
            .bind(&unit.stage_title)
            .bind(unit.execution_order)
            .bind(unit.status.as_str())
            .bind(&unit.prompt)
            .bind(&unit.system_instruction)
            .bind(unit.created_at)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn get_unit(&self, id: &str) -> Result<Option<AnalysisUnit>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM analysis_units WHERE id = ?",
            UNIT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_unit).transpose()
    }

    async fn list_units(&self, document_id: &str) -> Result<Vec<AnalysisUnit>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM analysis_units WHERE document_id = ? ORDER BY execution_order",
            UNIT_COLUMNS
        ))
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_unit).collect()
    }

    async fn claim_next_unit(&self, document_id: &str, now: i64) -> Result<Option<AnalysisUnit>> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE analysis_units
            SET status = 'processing', processing_started_at = ?, last_error = NULL
            WHERE id = (
                SELECT id FROM analysis_units
                WHERE document_id = ? AND status = 'pending'
                ORDER BY execution_order ASC
                LIMIT 1
            )
            AND status = 'pending'
            RETURNING {}
            "#,
            UNIT_COLUMNS
        ))
        .bind(now)
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        match rows.len() {
            0 => Ok(None),
            1 => Ok(Some(row_to_unit(&rows[0])?)),
            n => Err(anyhow!(
                "claim for document {} affected {} rows, expected at most one",
                document_id,
                n
            )),
        }
    }

    async fn complete_unit(&self, unit_id: &str, completion: &UnitCompletion) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE analysis_units
            SET status = 'completed', result_json = ?, tokens_used = ?, model_used = ?,
                execution_time_ms = ?, completed_at = ?, last_error = NULL,
                error_diagnostics = NULL
            WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(&completion.result_json)
        .bind(completion.tokens_used)
        .bind(&completion.model_used)
        .bind(completion.execution_time_ms)
        .bind(completion.completed_at)
        .bind(unit_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() != 1 {
            bail!("unit {} is not processing; refusing to complete it", unit_id);
        }
        Ok(())
    }

    async fn fail_unit(&self, unit_id: &str, failure: &UnitFailure) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE analysis_units
            SET status = 'failed', last_error = ?, error_diagnostics = ?, execution_time_ms = ?
            WHERE id = ? AND status = 'processing'
            "#,
        )
        .bind(&failure.message)
        .bind(&failure.diagnostics)
        .bind(failure.execution_time_ms)
        .bind(unit_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() != 1 {
            bail!("unit {} is not processing; refusing to fail it", unit_id);
        }
        Ok(())
    }

    async fn unit_counts(&self, document_id: &str) -> Result<UnitCounts> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM analysis_units WHERE document_id = ? GROUP BY status",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = UnitCounts::default();
        for row in rows {
            let n: i64 = row.try_get("n")?;
            match UnitStatus::parse(row.try_get("status")?)? {
                UnitStatus::Pending => counts.pending = n,
                UnitStatus::Processing => counts.processing = n,
                UnitStatus::Completed => counts.completed = n,
                UnitStatus::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }

    async fn list_stuck_units(
        &self,
        started_before: i64,
        max_pages: i64,
    ) -> Result<Vec<StuckUnit>> {
        let rows = sqlx::query(
            r#"
            SELECT u.id, u.document_id, u.stage_title, u.processing_started_at, d.page_count
            FROM analysis_units u
            JOIN documents d ON d.id = u.document_id
            WHERE u.status = 'processing'
              AND u.processing_started_at IS NOT NULL
              AND u.processing_started_at < ?
              AND d.page_count < ?
            ORDER BY u.processing_started_at
            "#,
        )
        .bind(started_before)
        .bind(max_pages)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<StuckUnit> {
                Ok(StuckUnit {
                    unit_id: row.try_get("id")?,
                    document_id: row.try_get("document_id")?,
                    stage_title: row.try_get("stage_title")?,
                    processing_started_at: row.try_get("processing_started_at")?,
                    page_count: row.try_get("page_count")?,
                })
            })
            .collect()
    }

    async fn insert_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            sqlx::query(&format!(
                "INSERT INTO chunks ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                CHUNK_COLUMNS
            ))
            .bind(&chunk.id)
            .bind(&chunk.document_id)
            .bind(chunk.chunk_index)
            .bind(chunk.total_chunks)
            .bind(chunk.start_page)
            .bind(chunk.end_page)
            .bind(&chunk.storage_path)
            .bind(chunk.byte_size)
            .bind(&chunk.remote_name)
            .bind(&chunk.remote_uri)
            .bind(chunk.remote_state.as_str())
            .bind(chunk.expires_at)
            .bind(chunk.upload_attempts)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM chunks WHERE document_id = ? ORDER BY chunk_index",
            CHUNK_COLUMNS
        ))
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    async fn update_chunk_remote(&self, chunk_id: &str, update: &RemoteUpdate) -> Result<()> {
        if update.remote_uri.is_some() && update.remote_state != RemoteFileState::Active {
            bail!("remote uri may only be set on an active chunk");
        }
        sqlx::query(
            r#"
            UPDATE chunks
            SET remote_name = ?, remote_uri = ?, remote_state = ?, expires_at = ?,
                upload_attempts = ?
            WHERE id = ?
            "#,
        )
        .bind(&update.remote_name)
        .bind(&update.remote_uri)
        .bind(update.remote_state.as_str())
        .bind(update.expires_at)
        .bind(update.upload_attempts)
        .bind(chunk_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_all_chunks(&self, document_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE chunks SET remote_state = 'failed', remote_uri = NULL WHERE document_id = ?",
        )
        .bind(document_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_queue_items(&self, document_id: &str) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_items WHERE document_id = ?")
            .bind(document_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }

    async fn insert_queue_items(&self, items: &[QueueItem]) -> Result<usize> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0usize;
        for item in items {
            let result = sqlx::query(&format!(
                "INSERT OR IGNORE INTO queue_items ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                QUEUE_COLUMNS
            ))
            .bind(&item.id)
            .bind(&item.document_id)
            .bind(&item.chunk_id)
            .bind(item.chunk_index)
            .bind(&item.unit_id)
            .bind(item.priority)
            .bind(item.status.as_str())
            .bind(item.attempt_count)
            .bind(item.max_attempts)
            .bind(&item.partial_result)
            .bind(item.tokens_used)
            .bind(&item.last_error)
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected() as usize;
        }
        tx.commit().await?;
        Ok(inserted)
    }

    async fn list_queue_items(&self, unit_id: &str) -> Result<Vec<QueueItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM queue_items WHERE unit_id = ? ORDER BY chunk_index",
            QUEUE_COLUMNS
        ))
        .bind(unit_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_queue_item).collect()
    }

    async fn start_queue_item(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE queue_items SET status = 'processing', attempt_count = attempt_count + 1 WHERE id = ?",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete_queue_item(
        &self,
        id: &str,
        partial_result: &str,
        tokens_used: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE queue_items
            SET status = 'completed', partial_result = ?, tokens_used = ?, last_error = NULL
            WHERE id = ?
            "#,
        )
        .bind(partial_result)
        .bind(tokens_used)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_queue_item(&self, id: &str, error: &str) -> Result<()> {
        sqlx::query("UPDATE queue_items SET status = 'failed', last_error = ? WHERE id = ?")
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_attempt(&self, attempt: &ModelAttempt) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO model_attempts (id, document_id, unit_id, chunk_index, phase, model_id,
                                        attempt_number, outcome, error_code, error_message,
                                        duration_ms, tokens_used, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&attempt.id)
        .bind(&attempt.document_id)
        .bind(&attempt.unit_id)
        .bind(attempt.chunk_index)
        .bind(attempt.phase.as_str())
        .bind(&attempt.model_id)
        .bind(attempt.attempt_number)
        .bind(attempt.outcome.as_str())
        .bind(&attempt.error_code)
        .bind(&attempt.error_message)
        .bind(attempt.duration_ms)
        .bind(attempt.tokens_used)
        .bind(attempt.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_attempts(&self, document_id: &str) -> Result<Vec<ModelAttempt>> {
        let rows = sqlx::query(
            r#"
            SELECT id, document_id, unit_id, chunk_index, phase, model_id, attempt_number,
                   outcome, error_code, error_message, duration_ms, tokens_used, created_at
            FROM model_attempts
            WHERE document_id = ?
            ORDER BY rowid
            "#,
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_attempt).collect()
    }

    async fn recent_stuck_notification(
        &self,
        document_id: &str,
        since: i64,
    ) -> Result<Option<StuckNotification>> {
        let row = sqlx::query(
            r#"
            SELECT id, document_id, chunk_id, unit_id, minutes_stuck, sent_at, resolved_at
            FROM stuck_notifications
            WHERE document_id = ? AND sent_at >= ?
            ORDER BY sent_at DESC
            LIMIT 1
            "#,
        )
        .bind(document_id)
        .bind(since)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_notification).transpose()
    }

    async fn record_stuck_notification(&self, n: &StuckNotification) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stuck_notifications (id, document_id, chunk_id, unit_id, minutes_stuck,
                                             sent_at, resolved_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&n.id)
        .bind(&n.document_id)
        .bind(&n.chunk_id)
        .bind(&n.unit_id)
        .bind(n.minutes_stuck)
        .bind(n.sent_at)
        .bind(n.resolved_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn resolve_stuck_notifications(&self, now: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE stuck_notifications
            SET resolved_at = ?
            WHERE resolved_at IS NULL
              AND unit_id IN (SELECT id FROM analysis_units WHERE status = 'completed')
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
