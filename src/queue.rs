//! (chunk, stage) work queue.
//!
//! One item per chunk per analysis unit, prioritized by the unit's execution
//! order. Map passes cache their partial results on the item so that a
//! re-run of the same unit skips chunks already analyzed.

use crate::error::PipelineResult;
use crate::models::{AnalysisUnit, Chunk, QueueItem, QueueStatus};
use crate::store::UnitStore;

/// Create the queue for a chunked document. Returns the number of new items.
///
/// Safe to call repeatedly: when items already exist nothing is inserted,
/// and the store ignores duplicate (chunk, unit) pairs in any case.
pub async fn create_queue(
    store: &dyn UnitStore,
    document_id: &str,
    chunks: &[Chunk],
    units: &[AnalysisUnit],
    max_attempts: i64,
) -> PipelineResult<usize> {
    let existing = store.count_queue_items(document_id).await?;
    if existing > 0 {
        tracing::debug!(document_id, existing, "queue already created");
        return Ok(0);
    }

    let items: Vec<QueueItem> = units
        .iter()
        .flat_map(|unit| {
            chunks.iter().map(move |chunk| QueueItem {
                id: uuid::Uuid::new_v4().to_string(),
                document_id: document_id.to_string(),
                chunk_id: chunk.id.clone(),
                chunk_index: chunk.chunk_index,
                unit_id: unit.id.clone(),
                priority: unit.execution_order,
                status: QueueStatus::Pending,
                attempt_count: 0,
                max_attempts,
                partial_result: None,
                tokens_used: None,
                last_error: None,
            })
        })
        .collect();

    let inserted = store.insert_queue_items(&items).await?;
    tracing::info!(
        document_id,
        chunks = chunks.len(),
        units = units.len(),
        inserted,
        "queue created"
    );
    Ok(inserted)
}
