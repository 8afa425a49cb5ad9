use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Idempotent.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Create documents table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            file_name TEXT NOT NULL,
            storage_path TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            byte_size INTEGER NOT NULL,
            page_count INTEGER NOT NULL,
            is_chunked INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'created',
            error_reason TEXT,
            preparing_since INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create analysis units table: one row per (document, stage)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analysis_units (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            stage_title TEXT NOT NULL,
            execution_order INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            prompt TEXT NOT NULL,
            system_instruction TEXT NOT NULL DEFAULT '',
            result_json TEXT,
            execution_time_ms INTEGER,
            tokens_used INTEGER,
            model_used TEXT,
            last_error TEXT,
            error_diagnostics TEXT,
            processing_started_at INTEGER,
            completed_at INTEGER,
            created_at INTEGER NOT NULL,
            UNIQUE(document_id, execution_order),
            FOREIGN KEY (document_id) REFERENCES documents(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create chunks table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            total_chunks INTEGER NOT NULL,
            start_page INTEGER NOT NULL,
            end_page INTEGER NOT NULL,
            storage_path TEXT NOT NULL,
            byte_size INTEGER NOT NULL,
            remote_name TEXT,
            remote_uri TEXT,
            remote_state TEXT NOT NULL DEFAULT 'uploading',
            expires_at INTEGER,
            upload_attempts INTEGER NOT NULL DEFAULT 0,
            UNIQUE(document_id, chunk_index),
            FOREIGN KEY (document_id) REFERENCES documents(id),
            CHECK (remote_uri IS NULL OR remote_state = 'active')
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create queue items table: one row per (chunk, unit)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS queue_items (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            chunk_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            unit_id TEXT NOT NULL,
            priority INTEGER NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempt_count INTEGER NOT NULL DEFAULT 0,
            max_attempts INTEGER NOT NULL,
            partial_result TEXT,
            tokens_used INTEGER,
            last_error TEXT,
            UNIQUE(chunk_id, unit_id),
            FOREIGN KEY (chunk_id) REFERENCES chunks(id),
            FOREIGN KEY (unit_id) REFERENCES analysis_units(id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Append-only attempt ledger
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS model_attempts (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            unit_id TEXT NOT NULL,
            chunk_index INTEGER,
            phase TEXT NOT NULL,
            model_id TEXT NOT NULL,
            attempt_number INTEGER NOT NULL,
            outcome TEXT NOT NULL,
            error_code TEXT,
            error_message TEXT,
            duration_ms INTEGER NOT NULL,
            tokens_used INTEGER,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS stuck_notifications (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            chunk_id TEXT,
            unit_id TEXT NOT NULL,
            minutes_stuck INTEGER NOT NULL,
            sent_at INTEGER NOT NULL,
            resolved_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_units_claim ON analysis_units(document_id, status, execution_order)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_units_processing ON analysis_units(status, processing_started_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_document_id ON chunks(document_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_queue_unit ON queue_items(unit_id, chunk_index)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_attempts_unit ON model_attempts(unit_id, created_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_stuck_document ON stuck_notifications(document_id, sent_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
