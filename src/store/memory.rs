//! In-memory [`UnitStore`] implementation for tests.
//!
//! All state lives behind one `std::sync::Mutex`, which makes every
//! operation (including the claim) trivially atomic. Lock guards are never
//! held across an `.await`.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::models::{
    AnalysisUnit, Chunk, Document, DocumentStatus, ModelAttempt, QueueItem, QueueStatus,
    RemoteFileState, StuckNotification, StuckUnit, UnitCounts, UnitStatus,
};

use super::{RemoteUpdate, UnitCompletion, UnitFailure, UnitStore};

#[derive(Default)]
struct State {
    documents: HashMap<String, Document>,
    /// Preparation lease start per document.
    preparing: HashMap<String, i64>,
    units: Vec<AnalysisUnit>,
    chunks: Vec<Chunk>,
    queue: Vec<QueueItem>,
    attempts: Vec<ModelAttempt>,
    notifications: Vec<StuckNotification>,
}

/// In-memory store for tests.
#[derive(Default)]
pub struct InMemoryUnitStore {
    state: Mutex<State>,
}

impl InMemoryUnitStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("in-memory store mutex poisoned"))
    }
}

#[async_trait]
impl UnitStore for InMemoryUnitStore {
    async fn insert_document(&self, doc: &Document) -> Result<()> {
        let mut state = self.lock()?;
        if state.documents.contains_key(&doc.id) {
            bail!("document {} already exists", doc.id);
        }
        state.documents.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.lock()?.documents.get(id).cloned())
    }

    async fn find_document_by_hash(&self, content_hash: &str) -> Result<Option<Document>> {
        let state = self.lock()?;
        Ok(state
            .documents
            .values()
            .filter(|d| d.content_hash == content_hash)
            .min_by_key(|d| d.created_at)
            .cloned())
    }

    async fn set_document_status(
        &self,
        id: &str,
        status: DocumentStatus,
        error_reason: Option<&str>,
        now: i64,
    ) -> Result<()> {
        let mut state = self.lock()?;
        let doc = state
            .documents
            .get_mut(id)
            .ok_or_else(|| anyhow!("document {} not found", id))?;
        doc.status = status;
        doc.error_reason = error_reason.map(str::to_string);
        doc.updated_at = now;
        Ok(())
    }

    async fn set_document_chunked(&self, id: &str, is_chunked: bool, now: i64) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(doc) = state.documents.get_mut(id) {
            doc.is_chunked = is_chunked;
            doc.updated_at = now;
        }
        Ok(())
    }

    async fn begin_preparation(&self, id: &str, now: i64, stale_before: i64) -> Result<bool> {
        let mut state = self.lock()?;
        let created = state
            .documents
            .get(id)
            .is_some_and(|d| d.status == DocumentStatus::Created);
        let free = state
            .preparing
            .get(id)
            .map_or(true, |since| *since < stale_before);
        if !(created && free) {
            return Ok(false);
        }
        state.preparing.insert(id.to_string(), now);
        Ok(true)
    }

    async fn release_preparation(&self, id: &str) -> Result<()> {
        self.lock()?.preparing.remove(id);
        Ok(())
    }

    async fn finish_preparation(&self, id: &str, now: i64) -> Result<bool> {
        let mut state = self.lock()?;
        state.preparing.remove(id);
        match state.documents.get_mut(id) {
            Some(doc) if doc.status == DocumentStatus::Created => {
                doc.status = DocumentStatus::Analyzing;
                doc.error_reason = None;
                doc.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn create_units(&self, units: &[AnalysisUnit]) -> Result<usize> {
        let mut state = self.lock()?;
        let mut inserted = 0;
        for unit in units {
            let exists = state.units.iter().any(|u| {
                u.id == unit.id
                    || (u.document_id == unit.document_id
                        && u.execution_order == unit.execution_order)
            });
            if !exists {
                state.units.push(unit.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn get_unit(&self, id: &str) -> Result<Option<AnalysisUnit>> {
        Ok(self.lock()?.units.iter().find(|u| u.id == id).cloned())
    }

    async fn list_units(&self, document_id: &str) -> Result<Vec<AnalysisUnit>> {
        let state = self.lock()?;
        let mut units: Vec<AnalysisUnit> = state
            .units
            .iter()
            .filter(|u| u.document_id == document_id)
            .cloned()
            .collect();
        units.sort_by_key(|u| u.execution_order);
        Ok(units)
    }

    async fn claim_next_unit(&self, document_id: &str, now: i64) -> Result<Option<AnalysisUnit>> {
        let mut state = self.lock()?;
        let next = state
            .units
            .iter_mut()
            .filter(|u| u.document_id == document_id && u.status == UnitStatus::Pending)
            .min_by_key(|u| u.execution_order);
        Ok(next.map(|unit| {
            unit.status = UnitStatus::Processing;
            unit.processing_started_at = Some(now);
            unit.last_error = None;
            unit.clone()
        }))
    }

    async fn complete_unit(&self, unit_id: &str, completion: &UnitCompletion) -> Result<()> {
        let mut state = self.lock()?;
        let unit = state
            .units
            .iter_mut()
            .find(|u| u.id == unit_id && u.status == UnitStatus::Processing)
            .ok_or_else(|| anyhow!("unit {} is not processing; refusing to complete it", unit_id))?;
        unit.status = UnitStatus::Completed;
        unit.result_json = Some(completion.result_json.clone());
        unit.tokens_used = Some(completion.tokens_used);
        unit.model_used = Some(completion.model_used.clone());
        unit.execution_time_ms = Some(completion.execution_time_ms);
        unit.completed_at = Some(completion.completed_at);
        unit.last_error = None;
        unit.error_diagnostics = None;
        Ok(())
    }

    async fn fail_unit(&self, unit_id: &str, failure: &UnitFailure) -> Result<()> {
        let mut state = self.lock()?;
        let unit = state
            .units
            .iter_mut()
            .find(|u| u.id == unit_id && u.status == UnitStatus::Processing)
            .ok_or_else(|| anyhow!("unit {} is not processing; refusing to fail it", unit_id))?;
        unit.status = UnitStatus::Failed;
        unit.last_error = Some(failure.message.clone());
        unit.error_diagnostics = failure.diagnostics.clone();
        unit.execution_time_ms = Some(failure.execution_time_ms);
        Ok(())
    }

    async fn unit_counts(&self, document_id: &str) -> Result<UnitCounts> {
        let state = self.lock()?;
        let mut counts = UnitCounts::default();
        for unit in state.units.iter().filter(|u| u.document_id == document_id) {
            match unit.status {
                UnitStatus::Pending => counts.pending += 1,
                UnitStatus::Processing => counts.processing += 1,
                UnitStatus::Completed => counts.completed += 1,
                UnitStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn list_stuck_units(
        &self,
        started_before: i64,
        max_pages: i64,
    ) -> Result<Vec<StuckUnit>> {
        let state = self.lock()?;
        let mut stuck: Vec<StuckUnit> = state
            .units
            .iter()
            .filter(|u| u.status == UnitStatus::Processing)
            .filter_map(|u| {
                let started = u.processing_started_at?;
                let doc = state.documents.get(&u.document_id)?;
                (started < started_before && doc.page_count < max_pages).then(|| StuckUnit {
                    unit_id: u.id.clone(),
                    document_id: u.document_id.clone(),
                    stage_title: u.stage_title.clone(),
                    processing_started_at: started,
                    page_count: doc.page_count,
                })
            })
            .collect();
        stuck.sort_by_key(|s| s.processing_started_at);
        Ok(stuck)
    }

    async fn insert_chunks(&self, chunks: &[Chunk]) -> Result<()> {
        let mut state = self.lock()?;
        for chunk in chunks {
            let dup = state.chunks.iter().any(|c| {
                c.document_id == chunk.document_id && c.chunk_index == chunk.chunk_index
            });
            if dup {
                bail!(
                    "chunk {} of document {} already exists",
                    chunk.chunk_index,
                    chunk.document_id
                );
            }
        }
        state.chunks.extend(chunks.iter().cloned());
        Ok(())
    }

    async fn list_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let state = self.lock()?;
        let mut chunks: Vec<Chunk> = state
            .chunks
            .iter()
            .filter(|c| c.document_id == document_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.chunk_index);
        Ok(chunks)
    }

    async fn update_chunk_remote(&self, chunk_id: &str, update: &RemoteUpdate) -> Result<()> {
        if update.remote_uri.is_some() && update.remote_state != RemoteFileState::Active {
            bail!("remote uri may only be set on an active chunk");
        }
        let mut state = self.lock()?;
        let chunk = state
            .chunks
            .iter_mut()
            .find(|c| c.id == chunk_id)
            .ok_or_else(|| anyhow!("chunk {} not found", chunk_id))?;
        chunk.remote_name = update.remote_name.clone();
        chunk.remote_uri = update.remote_uri.clone();
        chunk.remote_state = update.remote_state;
        chunk.expires_at = update.expires_at;
        chunk.upload_attempts = update.upload_attempts;
        Ok(())
    }

    async fn fail_all_chunks(&self, document_id: &str) -> Result<()> {
        let mut state = self.lock()?;
        for chunk in state
            .chunks
            .iter_mut()
            .filter(|c| c.document_id == document_id)
        {
            chunk.remote_state = RemoteFileState::Failed;
            chunk.remote_uri = None;
        }
        Ok(())
    }

    async fn count_queue_items(&self, document_id: &str) -> Result<i64> {
        let state = self.lock()?;
        Ok(state
            .queue
            .iter()
            .filter(|q| q.document_id == document_id)
            .count() as i64)
    }

    async fn insert_queue_items(&self, items: &[QueueItem]) -> Result<usize> {
        let mut state = self.lock()?;
        let mut inserted = 0;
        for item in items {
            let exists = state
                .queue
                .iter()
                .any(|q| q.chunk_id == item.chunk_id && q.unit_id == item.unit_id);
            if !exists {
                state.queue.push(item.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn list_queue_items(&self, unit_id: &str) -> Result<Vec<QueueItem>> {
        let state = self.lock()?;
        let mut items: Vec<QueueItem> = state
            .queue
            .iter()
            .filter(|q| q.unit_id == unit_id)
            .cloned()
            .collect();
        items.sort_by_key(|q| q.chunk_index);
        Ok(items)
    }

    async fn start_queue_item(&self, id: &str) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(item) = state.queue.iter_mut().find(|q| q.id == id) {
            item.status = QueueStatus::Processing;
            item.attempt_count += 1;
        }
        Ok(())
    }

    async fn complete_queue_item(
        &self,
        id: &str,
        partial_result: &str,
        tokens_used: i64,
    ) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(item) = state.queue.iter_mut().find(|q| q.id == id) {
            item.status = QueueStatus::Completed;
            item.partial_result = Some(partial_result.to_string());
            item.tokens_used = Some(tokens_used);
            item.last_error = None;
        }
        Ok(())
    }

    async fn fail_queue_item(&self, id: &str, error: &str) -> Result<()> {
        let mut state = self.lock()?;
        if let Some(item) = state.queue.iter_mut().find(|q| q.id == id) {
            item.status = QueueStatus::Failed;
            item.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn record_attempt(&self, attempt: &ModelAttempt) -> Result<()> {
        self.lock()?.attempts.push(attempt.clone());
        Ok(())
    }

    async fn list_attempts(&self, document_id: &str) -> Result<Vec<ModelAttempt>> {
        let state = self.lock()?;
        Ok(state
            .attempts
            .iter()
            .filter(|a| a.document_id == document_id)
            .cloned()
            .collect())
    }

    async fn recent_stuck_notification(
        &self,
        document_id: &str,
        since: i64,
    ) -> Result<Option<StuckNotification>> {
        let state = self.lock()?;
        Ok(state
            .notifications
            .iter()
            .filter(|n| n.document_id == document_id && n.sent_at >= since)
            .max_by_key(|n| n.sent_at)
            .cloned())
    }

    async fn record_stuck_notification(&self, notification: &StuckNotification) -> Result<()> {
        self.lock()?.notifications.push(notification.clone());
        Ok(())
    }

    async fn resolve_stuck_notifications(&self, now: i64) -> Result<u64> {
        let mut guard = self.lock()?;
        let state = &mut *guard;
        let mut resolved = 0;
        for n in state
            .notifications
            .iter_mut()
            .filter(|n| n.resolved_at.is_none())
        {
            let completed = state
                .units
                .iter()
                .any(|u| u.id == n.unit_id && u.status == UnitStatus::Completed);
            if completed {
                n.resolved_at = Some(now);
                resolved += 1;
            }
        }
        Ok(resolved)
    }
}
