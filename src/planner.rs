//! Chunk planning.
//!
//! Oversized documents are partitioned into contiguous page ranges. The
//! number of pages per chunk comes from the average bytes per page against
//! the target chunk size, capped by `max_pages_per_chunk`. Pages are then
//! spread evenly over the resulting chunk count, so for the same page count,
//! byte size and configuration the plan is always the same.

use std::sync::Arc;

use crate::config::ChunkingConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{Chunk, Document, RemoteFileState};
use crate::pdf;
use crate::storage::{chunk_key, ObjectStorage};
use crate::store::UnitStore;

/// Inclusive, 1-based page range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRange {
    pub start: i64,
    pub end: i64,
}

pub fn plan_chunks(page_count: i64, byte_size: i64, config: &ChunkingConfig) -> Vec<PageRange> {
    if page_count <= 0 {
        return Vec::new();
    }

    let bytes_per_page = (byte_size / page_count).max(1);
    let pages_by_bytes = (config.target_chunk_bytes / bytes_per_page).max(1);
    let pages_per_chunk = pages_by_bytes.min(config.max_pages_per_chunk).max(1);
    let chunk_count = (page_count + pages_per_chunk - 1) / pages_per_chunk;

    let base = page_count / chunk_count;
    let remainder = page_count % chunk_count;
    let mut ranges = Vec::with_capacity(chunk_count as usize);
    let mut start = 1;
    for i in 0..chunk_count {
        let len = base + i64::from(i < remainder);
        ranges.push(PageRange {
            start,
            end: start + len - 1,
        });
        start += len;
    }
    ranges
}

pub struct ChunkPlanner {
    store: Arc<dyn UnitStore>,
    storage: Arc<dyn ObjectStorage>,
    config: ChunkingConfig,
}

impl ChunkPlanner {
    pub fn new(
        store: Arc<dyn UnitStore>,
        storage: Arc<dyn ObjectStorage>,
        config: ChunkingConfig,
    ) -> Self {
        Self {
            store,
            storage,
            config,
        }
    }

    /// Plan, materialize and persist the chunks of `doc`.
    ///
    /// A document that already has chunk rows gets those rows back untouched.
    pub async fn plan(&self, doc: &Document) -> PipelineResult<Vec<Chunk>> {
        let existing = self.store.list_chunks(&doc.id).await?;
        if !existing.is_empty() {
            tracing::debug!(document_id = %doc.id, chunks = existing.len(), "reusing existing chunk plan");
            return Ok(existing);
        }

        let ranges = plan_chunks(doc.page_count, doc.byte_size, &self.config);
        if ranges.is_empty() {
            return Err(PipelineError::InvalidState(format!(
                "document {} has no pages to chunk",
                doc.id
            )));
        }

        let source = self
            .storage
            .download(&doc.storage_path)
            .await
            .map_err(|e| PipelineError::Storage(format!("{:#}", e)))?;

        let spans: Vec<(i64, i64)> = ranges.iter().map(|r| (r.start, r.end)).collect();
        let blobs = tokio::task::spawn_blocking(move || pdf::split_pages(&source, &spans))
            .await
            .map_err(|e| PipelineError::Pdf(e.to_string()))?
            .map_err(|e| PipelineError::Pdf(format!("{:#}", e)))?;

        let total = ranges.len() as i64;
        let mut chunks = Vec::with_capacity(ranges.len());
        for (i, (range, blob)) in ranges.iter().zip(blobs).enumerate() {
            let index = i as i64;
            let key = chunk_key(&doc.id, index);
            self.storage
                .upload(&key, &blob)
                .await
                .map_err(|e| PipelineError::Storage(format!("{:#}", e)))?;
            chunks.push(Chunk {
                id: uuid::Uuid::new_v4().to_string(),
                document_id: doc.id.clone(),
                chunk_index: index,
                total_chunks: total,
                start_page: range.start,
                end_page: range.end,
                storage_path: key,
                byte_size: blob.len() as i64,
                remote_name: None,
                remote_uri: None,
                remote_state: RemoteFileState::Uploading,
                expires_at: None,
                upload_attempts: 0,
            });
        }

        self.store.insert_chunks(&chunks).await?;
        self.store
            .set_document_chunked(&doc.id, true, chrono::Utc::now().timestamp())
            .await?;

        tracing::info!(document_id = %doc.id, chunks = chunks.len(), pages = doc.page_count, "planned chunks");
        Ok(chunks)
    }
}
