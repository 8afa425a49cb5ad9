//! Map-reduce execution for chunked documents.
//!
//! **Map**: the stage prompt runs once per chunk, in chunk order, against the
//! chunk's remote file. A queue item already `completed` contributes its
//! cached partial instead of a new model call. A chunk whose models are all
//! exhausted is retried until its queue item has used `max_attempts`; a
//! chunk that runs out of attempts aborts the stage.
//!
//! **Reduce**: the partials are merged by one more model call whose prompt
//! wraps each partial in an explicit separator:
//!
//! ```text
//! === CHUNK 2/4 (pages 251-500) ===
//! ```
//!
//! Token usage of the stage is the sum of every map and reduce call.

use std::collections::HashMap;

use crate::error::{PipelineError, PipelineResult};
use crate::executor::{ExecutionContext, FallbackExecutor, ModelOutput, ModelRequest};
use crate::models::{AnalysisUnit, Chunk, QueueItem, QueueStatus};
use crate::provider::Part;
use crate::store::UnitStore;

/// Output of one chunk's map pass.
#[derive(Debug, Clone)]
pub struct Partial {
    pub chunk_index: i64,
    pub total_chunks: i64,
    pub start_page: i64,
    pub end_page: i64,
    pub text: String,
    pub tokens_used: i64,
    pub cached: bool,
}

pub struct ChunkConsolidator<'a> {
    executor: &'a FallbackExecutor,
    store: &'a dyn UnitStore,
}

impl<'a> ChunkConsolidator<'a> {
    pub fn new(executor: &'a FallbackExecutor, store: &'a dyn UnitStore) -> Self {
        Self { executor, store }
    }

    /// Run map then reduce for `unit` over `chunks`.
    pub async fn run(
        &self,
        unit: &AnalysisUnit,
        chunks: &[Chunk],
        max_output_tokens: u32,
        ctx: &mut ExecutionContext,
    ) -> PipelineResult<ModelOutput> {
        let partials = self.map(unit, chunks, max_output_tokens, ctx).await?;
        let map_tokens: i64 = partials.iter().map(|p| p.tokens_used).sum();

        ctx.for_reduce();
        let request = ModelRequest {
            system_instruction: unit.system_instruction.clone(),
            prompt: build_reduce_prompt(&unit.prompt, &partials),
            parts: Vec::new(),
            max_output_tokens,
        };
        let reduced = self.executor.execute(&request, ctx).await?;

        tracing::info!(
            document_id = %unit.document_id,
            unit_id = %unit.id,
            chunks = partials.len(),
            cached = partials.iter().filter(|p| p.cached).count(),
            map_tokens,
            reduce_tokens = reduced.tokens_used,
            "stage consolidated"
        );

        Ok(ModelOutput {
            text: reduced.text,
            tokens_used: map_tokens + reduced.tokens_used,
            model_used: reduced.model_used,
        })
    }

    async fn map(
        &self,
        unit: &AnalysisUnit,
        chunks: &[Chunk],
        max_output_tokens: u32,
        ctx: &mut ExecutionContext,
    ) -> PipelineResult<Vec<Partial>> {
        let items: HashMap<String, QueueItem> = self
            .store
            .list_queue_items(&unit.id)
            .await?
            .into_iter()
            .map(|item| (item.chunk_id.clone(), item))
            .collect();

        let mut ordered: Vec<&Chunk> = chunks.iter().collect();
        ordered.sort_by_key(|c| c.chunk_index);

        let mut partials = Vec::with_capacity(ordered.len());
        for chunk in ordered {
            let item = items.get(&chunk.id);

            if let Some(QueueItem {
                status: QueueStatus::Completed,
                partial_result: Some(text),
                tokens_used,
                ..
            }) = item
            {
                partials.push(partial(chunk, text.clone(), tokens_used.unwrap_or(0), true));
                continue;
            }

            let max_attempts = item.map_or(1, |i| i.max_attempts.max(1));
            let mut attempts = item.map_or(0, |i| i.attempt_count);
            loop {
                if let Some(item) = item {
                    self.store.start_queue_item(&item.id).await?;
                }
                attempts += 1;

                match self.map_chunk(unit, chunk, max_output_tokens, ctx).await {
                    Ok(output) => {
                        if let Some(item) = item {
                            self.store
                                .complete_queue_item(&item.id, &output.text, output.tokens_used)
                                .await?;
                        }
                        partials.push(partial(chunk, output.text, output.tokens_used, false));
                        break;
                    }
                    Err(e) => {
                        if let Some(item) = item {
                            self.store.fail_queue_item(&item.id, &e.to_string()).await?;
                        }
                        let retryable = matches!(e, PipelineError::ModelExhausted { .. });
                        if retryable && attempts < max_attempts {
                            tracing::warn!(
                                document_id = %unit.document_id,
                                unit_id = %unit.id,
                                chunk_index = chunk.chunk_index,
                                attempt = attempts,
                                max_attempts,
                                error = %e,
                                "map attempt failed; retrying chunk"
                            );
                            continue;
                        }
                        tracing::error!(
                            document_id = %unit.document_id,
                            unit_id = %unit.id,
                            chunk_index = chunk.chunk_index,
                            attempts,
                            error = %e,
                            "map pass failed; aborting stage"
                        );
                        return Err(e);
                    }
                }
            }
        }
        Ok(partials)
    }

    async fn map_chunk(
        &self,
        unit: &AnalysisUnit,
        chunk: &Chunk,
        max_output_tokens: u32,
        ctx: &mut ExecutionContext,
    ) -> PipelineResult<ModelOutput> {
        let uri = chunk.remote_uri.as_ref().ok_or_else(|| {
            PipelineError::InvalidState(format!(
                "chunk {} of document {} has no active remote file",
                chunk.chunk_index, chunk.document_id
            ))
        })?;
        ctx.for_map(chunk.chunk_index);
        let request = ModelRequest {
            system_instruction: unit.system_instruction.clone(),
            prompt: build_map_prompt(&unit.prompt, chunk),
            parts: vec![Part::pdf_file(uri.clone())],
            max_output_tokens,
        };
        self.executor.execute(&request, ctx).await
    }
}

fn partial(chunk: &Chunk, text: String, tokens_used: i64, cached: bool) -> Partial {
    Partial {
        chunk_index: chunk.chunk_index,
        total_chunks: chunk.total_chunks,
        start_page: chunk.start_page,
        end_page: chunk.end_page,
        text,
        tokens_used,
        cached,
    }
}

/// Separator line for one partial. Chunk numbers are 1-based.
pub fn chunk_separator(partial: &Partial) -> String {
    format!(
        "=== CHUNK {}/{} (pages {}-{}) ===",
        partial.chunk_index + 1,
        partial.total_chunks,
        partial.start_page,
        partial.end_page
    )
}

fn build_map_prompt(stage_prompt: &str, chunk: &Chunk) -> String {
    format!(
        "{}\n\nThe attached file is part {} of {} of the process, covering pages {} to {}. \
         Analyze only this part. Its result will later be merged with the other parts.",
        stage_prompt,
        chunk.chunk_index + 1,
        chunk.total_chunks,
        chunk.start_page,
        chunk.end_page
    )
}

pub fn build_reduce_prompt(stage_prompt: &str, partials: &[Partial]) -> String {
    let mut prompt = format!(
        "{}\n\nThe process was analyzed in {} parts. Merge the partial analyses below into one \
         final JSON report for the whole process. Remove duplicates and keep every distinct fact.\n",
        stage_prompt,
        partials.len()
    );
    for p in partials {
        prompt.push('\n');
        prompt.push_str(&chunk_separator(p));
        prompt.push('\n');
        prompt.push_str(p.text.trim());
        prompt.push('\n');
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::models::{RemoteFileState, UnitStatus};
    use crate::notify::MemoryNotifier;
    use crate::provider::{GenerateRequest, GenerateResponse, ProviderError, ScriptedProvider};
    use crate::queue::create_queue;
    use crate::store::memory::InMemoryUnitStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn chunk(i: i64) -> Chunk {
        Chunk {
            id: format!("c{}", i),
            document_id: "doc".into(),
            chunk_index: i,
            total_chunks: 3,
            start_page: i * 100 + 1,
            end_page: i * 100 + 100,
            storage_path: String::new(),
            byte_size: 0,
            remote_name: Some(format!("files/{}", i)),
            remote_uri: Some(format!("uri-{}", i)),
            remote_state: RemoteFileState::Active,
            expires_at: None,
            upload_attempts: 1,
        }
    }

    fn unit() -> AnalysisUnit {
        AnalysisUnit {
            id: "u1".into(),
            document_id: "doc".into(),
            stage_title: "Riscos".into(),
            execution_order: 1,
            status: UnitStatus::Processing,
            prompt: "List the risks".into(),
            system_instruction: String::new(),
            result_json: None,
            execution_time_ms: None,
            tokens_used: None,
            model_used: None,
            last_error: None,
            error_diagnostics: None,
            processing_started_at: Some(0),
            completed_at: None,
            created_at: 0,
        }
    }

    fn file_uri(req: &GenerateRequest) -> Option<String> {
        req.parts.iter().find_map(|p| match p {
            Part::FileData { file_uri, .. } => Some(file_uri.clone()),
            _ => None,
        })
    }

    /// Map calls cost 100/150/120 tokens by chunk, reduce costs 80.
    fn token_script(req: &GenerateRequest) -> Result<GenerateResponse, ProviderError> {
        let tokens = match file_uri(req).as_deref() {
            Some("uri-0") => 100,
            Some("uri-1") => 150,
            Some("uri-2") => 120,
            Some(other) => return Err(ProviderError::new("client_error", other.to_string())),
            None => 80,
        };
        Ok(GenerateResponse {
            text: format!("{{\"tokens\":{}}}", tokens),
            tokens_used: tokens,
        })
    }

    fn executor(provider: Arc<ScriptedProvider>, store: Arc<InMemoryUnitStore>) -> FallbackExecutor {
        FallbackExecutor::new(
            provider,
            store,
            Arc::new(MemoryNotifier::new()),
            vec![ModelConfig {
                id: "model-a".into(),
                priority: 1,
                active: true,
                temperature: 0.2,
            }],
        )
    }

    async fn setup(store: &InMemoryUnitStore) -> Vec<Chunk> {
        let chunks = vec![chunk(0), chunk(1), chunk(2)];
        create_queue(store, "doc", &chunks, &[unit()], 3).await.unwrap();
        chunks
    }

    #[tokio::test]
    async fn tokens_sum_map_and_reduce() {
        let store = Arc::new(InMemoryUnitStore::new());
        let chunks = setup(&store).await;
        let provider = Arc::new(ScriptedProvider::new(token_script));
        let exec = executor(provider.clone(), store.clone());
        let consolidator = ChunkConsolidator::new(&exec, store.as_ref());

        let mut ctx = ExecutionContext::new("doc", "u1", "Riscos");
        let output = consolidator.run(&unit(), &chunks, 1000, &mut ctx).await.unwrap();
        assert_eq!(output.tokens_used, 450);

        let calls = provider.calls();
        assert_eq!(calls.len(), 4);
        let reduce_prompt = match calls[3].parts.last() {
            Some(Part::Text(t)) => t.clone(),
            other => panic!("unexpected part: {:?}", other),
        };
        assert!(reduce_prompt.contains("=== CHUNK 1/3 (pages 1-100) ==="));
        assert!(reduce_prompt.contains("=== CHUNK 3/3 (pages 201-300) ==="));
        let first = reduce_prompt.find("CHUNK 1/3").unwrap();
        let last = reduce_prompt.find("CHUNK 3/3").unwrap();
        assert!(first < last);

        let items = store.list_queue_items("u1").await.unwrap();
        assert!(items.iter().all(|i| i.status == QueueStatus::Completed));
    }

    #[tokio::test]
    async fn cached_partials_are_reused() {
        let store = Arc::new(InMemoryUnitStore::new());
        let chunks = setup(&store).await;
        let items = store.list_queue_items("u1").await.unwrap();
        store
            .complete_queue_item(&items[0].id, "{\"tokens\":100}", 100)
            .await
            .unwrap();

        let provider = Arc::new(ScriptedProvider::new(token_script));
        let exec = executor(provider.clone(), store.clone());
        let consolidator = ChunkConsolidator::new(&exec, store.as_ref());
        let mut ctx = ExecutionContext::new("doc", "u1", "Riscos");
        let output = consolidator.run(&unit(), &chunks, 1000, &mut ctx).await.unwrap();

        assert_eq!(output.tokens_used, 450);
        let calls = provider.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|c| file_uri(c).as_deref() != Some("uri-0")));
    }

    #[tokio::test]
    async fn map_failure_aborts_stage() {
        let store = Arc::new(InMemoryUnitStore::new());
        let mut chunks = setup(&store).await;
        chunks[1].remote_uri = Some("uri-broken".into());

        let provider = Arc::new(ScriptedProvider::new(token_script));
        let exec = executor(provider.clone(), store.clone());
        let consolidator = ChunkConsolidator::new(&exec, store.as_ref());
        let mut ctx = ExecutionContext::new("doc", "u1", "Riscos");
        let err = consolidator.run(&unit(), &chunks, 1000, &mut ctx).await.unwrap_err();

        assert!(matches!(err, PipelineError::ModelExhausted { .. }));
        // chunk 0 mapped, chunk 1 failed three times, chunk 2 and reduce never ran
        assert_eq!(provider.calls().len(), 4);
        let items = store.list_queue_items("u1").await.unwrap();
        assert_eq!(items[0].status, QueueStatus::Completed);
        assert_eq!(items[1].status, QueueStatus::Failed);
        assert_eq!(items[1].attempt_count, 3);
        assert!(items[1].last_error.as_deref().unwrap_or_default().contains("uri-broken"));
        assert_eq!(items[2].status, QueueStatus::Pending);
    }

    #[tokio::test]
    async fn failed_chunk_is_retried_before_giving_up() {
        let store = Arc::new(InMemoryUnitStore::new());
        let chunks = setup(&store).await;
        let chunk1_calls = Arc::new(AtomicU32::new(0));
        let seen = chunk1_calls.clone();
        let provider = Arc::new(ScriptedProvider::new(move |req| {
            if file_uri(req).as_deref() == Some("uri-1") && seen.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(ProviderError::new("server_error", "HTTP 503"));
            }
            token_script(req)
        }));
        let exec = executor(provider.clone(), store.clone());
        let consolidator = ChunkConsolidator::new(&exec, store.as_ref());
        let mut ctx = ExecutionContext::new("doc", "u1", "Riscos");
        let output = consolidator.run(&unit(), &chunks, 1000, &mut ctx).await.unwrap();

        assert_eq!(output.tokens_used, 450);
        assert_eq!(chunk1_calls.load(Ordering::SeqCst), 2);
        assert_eq!(provider.calls().len(), 5);
        let items = store.list_queue_items("u1").await.unwrap();
        assert!(items.iter().all(|i| i.status == QueueStatus::Completed));
        assert_eq!(items[1].attempt_count, 2);
        assert_eq!(items[0].attempt_count, 1);
    }

    #[tokio::test]
    async fn missing_remote_file_is_not_retried() {
        let store = Arc::new(InMemoryUnitStore::new());
        let mut chunks = setup(&store).await;
        chunks[0].remote_uri = None;

        let provider = Arc::new(ScriptedProvider::new(token_script));
        let exec = executor(provider.clone(), store.clone());
        let consolidator = ChunkConsolidator::new(&exec, store.as_ref());
        let mut ctx = ExecutionContext::new("doc", "u1", "Riscos");
        let err = consolidator.run(&unit(), &chunks, 1000, &mut ctx).await.unwrap_err();

        assert!(matches!(err, PipelineError::InvalidState(_)));
        assert!(provider.calls().is_empty());
        let items = store.list_queue_items("u1").await.unwrap();
        assert_eq!(items[0].attempt_count, 1);
    }
}
