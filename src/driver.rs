//! Pipeline driver.
//!
//! [`Pipeline`] wires the store, object storage, provider and notifier
//! together and exposes the three operations the CLI, HTTP API and
//! dispatcher call:
//!
//! - [`Pipeline::ingest`] registers a PDF and copies it into storage.
//! - [`Pipeline::start_analysis`] creates one unit per configured stage and,
//!   for oversized documents, plans, uploads and queues the chunks before
//!   the document enters `analyzing`.
//! - [`Pipeline::process_next`] runs exactly one driver step: claim the next
//!   pending unit, execute it (directly or map-reduce), validate the output
//!   and persist the result.
//!
//! # Document lifecycle
//!
//! ```text
//! created ──start──▶ analyzing ──every unit completed──▶ completed
//!                        │
//!                        └── upload exhausted / models exhausted / unit failed ──▶ error
//! ```
//!
//! A document completes only when a claim finds nothing pending **and** a
//! full count shows every unit `completed`. A unit still `processing` in
//! another worker keeps the document in `analyzing`.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::claim::claim_next_unit;
use crate::config::{ChunkingConfig, Config, QueueConfig, StageConfig, TokenConfig};
use crate::consolidator::ChunkConsolidator;
use crate::error::{PipelineError, PipelineResult};
use crate::executor::{ExecutionContext, FallbackExecutor, ModelOutput, ModelRequest};
use crate::models::{AnalysisUnit, Document, DocumentStatus, UnitCounts, UnitStatus};
use crate::notify::{notify_detached, Notification, Notifier, Severity};
use crate::pdf;
use crate::planner::ChunkPlanner;
use crate::provider::{LlmProvider, Part};
use crate::queue::create_queue;
use crate::stages::StageRegistry;
use crate::storage::{original_key, ObjectStorage};
use crate::store::{UnitCompletion, UnitFailure, UnitStore};
use crate::uploader::ChunkUploader;
use crate::validator::{strip_code_fences, JsonValidator};

/// Error reason set on a document whose units ended without all completing.
pub const UNITS_FAILED_REASON: &str = "units_failed";

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub document: Document,
    /// The same bytes were already registered; `document` is the earlier row.
    pub duplicate: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartOutcome {
    pub document_id: String,
    pub units_created: usize,
    pub chunked: bool,
    pub chunks: usize,
    pub queue_items_created: usize,
}

/// Result of one driver step.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    /// A unit was claimed and completed.
    UnitCompleted {
        unit_id: String,
        stage: String,
        tokens_used: i64,
        model_used: String,
    },
    /// A unit was claimed and failed.
    UnitFailed {
        unit_id: String,
        stage: String,
        code: String,
        document_failed: bool,
    },
    /// Nothing pending and every unit completed; the document is now completed.
    DocumentCompleted,
    /// Nothing pending, but some units are still processing elsewhere.
    Waiting { counts: UnitCounts },
    /// Nothing pending, nothing processing, and at least one unit failed.
    DocumentFailed { counts: UnitCounts },
    /// The document is not in `analyzing`.
    NotAnalyzing { status: DocumentStatus },
}

impl StepOutcome {
    /// Whether the dispatcher should schedule another step for the document.
    pub fn should_continue(&self) -> bool {
        match self {
            StepOutcome::UnitCompleted { .. } => true,
            StepOutcome::UnitFailed {
                document_failed, ..
            } => !document_failed,
            _ => false,
        }
    }
}

pub struct Pipeline {
    store: Arc<dyn UnitStore>,
    storage: Arc<dyn ObjectStorage>,
    notifier: Arc<dyn Notifier>,
    executor: FallbackExecutor,
    planner: ChunkPlanner,
    uploader: ChunkUploader,
    validator: JsonValidator,
    registry: StageRegistry,
    stages: Vec<StageConfig>,
    tokens: TokenConfig,
    chunking: ChunkingConfig,
    queue: QueueConfig,
}

impl Pipeline {
    pub fn new(
        config: &Config,
        store: Arc<dyn UnitStore>,
        storage: Arc<dyn ObjectStorage>,
        provider: Arc<dyn LlmProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let executor = FallbackExecutor::new(
            provider.clone(),
            store.clone(),
            notifier.clone(),
            config.active_models(),
        );
        let planner = ChunkPlanner::new(store.clone(), storage.clone(), config.chunking.clone());
        let uploader = ChunkUploader::new(
            provider,
            store.clone(),
            storage.clone(),
            config.upload.clone(),
        );
        let mut stages = config.stages.clone();
        stages.sort_by_key(|s| s.order);

        Self {
            store,
            storage,
            notifier,
            executor,
            planner,
            uploader,
            validator: JsonValidator::new(config.validation.absolute_min_length),
            registry: StageRegistry::from_stages(&config.stages),
            stages,
            tokens: config.tokens.clone(),
            chunking: config.chunking.clone(),
            queue: config.queue.clone(),
        }
    }

    pub fn store(&self) -> &Arc<dyn UnitStore> {
        &self.store
    }

    /// Register a PDF. Identical bytes map to the already-registered document.
    pub async fn ingest(&self, file_name: &str, bytes: Vec<u8>) -> PipelineResult<IngestOutcome> {
        let content_hash = hex::encode(Sha256::digest(&bytes));
        if let Some(existing) = self.store.find_document_by_hash(&content_hash).await? {
            tracing::info!(document_id = %existing.id, file_name, "document already registered");
            return Ok(IngestOutcome {
                document: existing,
                duplicate: true,
            });
        }

        let byte_size = bytes.len() as i64;
        let (bytes, page_count) = tokio::task::spawn_blocking(move || {
            let pages = pdf::count_pages(&bytes);
            (bytes, pages)
        })
        .await
        .map_err(|e| PipelineError::Pdf(e.to_string()))?;
        let page_count = page_count.map_err(|e| PipelineError::Pdf(format!("{:#}", e)))?;

        let id = uuid::Uuid::new_v4().to_string();
        let storage_path = original_key(&id);
        self.storage
            .upload(&storage_path, &bytes)
            .await
            .map_err(|e| PipelineError::Storage(format!("{:#}", e)))?;

        let now = chrono::Utc::now().timestamp();
        let document = Document {
            id,
            file_name: file_name.to_string(),
            storage_path,
            content_hash,
            byte_size,
            page_count,
            is_chunked: false,
            status: DocumentStatus::Created,
            error_reason: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_document(&document).await?;
        tracing::info!(document_id = %document.id, file_name, page_count, byte_size, "document registered");

        Ok(IngestOutcome {
            document,
            duplicate: false,
        })
    }

    /// Prepare a `created` document and move it into `analyzing`.
    ///
    /// Units, the chunk plan, uploads and queue items are all written while
    /// the document is still `created`, so no driver step can claim a unit
    /// before its chunks and queue items exist. One caller at a time holds
    /// the preparation lease; a concurrent caller gets
    /// [`PipelineError::InvalidState`]. Every preparation write is
    /// idempotent, so a caller that takes over a stale lease resumes where
    /// the previous one stopped. Calling this on an `analyzing` document
    /// returns its current shape without writing anything.
    pub async fn start_analysis(&self, document_id: &str) -> PipelineResult<StartOutcome> {
        let doc = self.load_document(document_id).await?;
        match doc.status {
            DocumentStatus::Created => {}
            DocumentStatus::Analyzing => return self.prepared_outcome(&doc).await,
            other => {
                return Err(PipelineError::InvalidState(format!(
                    "document {} is {}",
                    document_id, other
                )))
            }
        }
        if self.stages.is_empty() {
            return Err(PipelineError::InvalidState(
                "no analysis stages configured".to_string(),
            ));
        }

        let now = chrono::Utc::now().timestamp();
        let stale_before = now - self.queue.preparation_lease_secs;
        if !self
            .store
            .begin_preparation(&doc.id, now, stale_before)
            .await?
        {
            return Err(PipelineError::InvalidState(format!(
                "document {} is already being prepared",
                document_id
            )));
        }

        let outcome = match self.prepare(&doc, now).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(release) = self.store.release_preparation(&doc.id).await {
                    tracing::warn!(document_id = %doc.id, error = %release, "releasing preparation lease failed");
                }
                return Err(e);
            }
        };

        let now = chrono::Utc::now().timestamp();
        if !self.store.finish_preparation(&doc.id, now).await? {
            // A caller that took over a stale lease may have finished first.
            let current = self.load_document(document_id).await?;
            if current.status != DocumentStatus::Analyzing {
                return Err(PipelineError::InvalidState(format!(
                    "document {} is {}",
                    document_id, current.status
                )));
            }
        }

        tracing::info!(
            document_id = %doc.id,
            units = outcome.units_created,
            chunked = outcome.chunked,
            chunks = outcome.chunks,
            "analysis started"
        );
        Ok(outcome)
    }

    async fn prepare(&self, doc: &Document, now: i64) -> PipelineResult<StartOutcome> {
        let units: Vec<AnalysisUnit> = self
            .stages
            .iter()
            .map(|stage| new_unit(&doc.id, stage, now))
            .collect();
        let units_created = self.store.create_units(&units).await?;

        let mut outcome = StartOutcome {
            document_id: doc.id.clone(),
            units_created,
            chunked: false,
            chunks: 0,
            queue_items_created: 0,
        };
        if !self.chunking.requires_chunking(doc.page_count, doc.byte_size) {
            return Ok(outcome);
        }

        let chunks = self.planner.plan(doc).await?;
        let chunks = match self.uploader.upload_all(doc, &chunks).await {
            Ok(chunks) => chunks,
            Err(e) => {
                self.alert_failure(doc, None, &e, json!(null));
                return Err(e);
            }
        };
        let units = self.store.list_units(&doc.id).await?;
        outcome.chunked = true;
        outcome.chunks = chunks.len();
        outcome.queue_items_created = create_queue(
            self.store.as_ref(),
            &doc.id,
            &chunks,
            &units,
            self.queue.max_attempts,
        )
        .await?;
        Ok(outcome)
    }

    async fn prepared_outcome(&self, doc: &Document) -> PipelineResult<StartOutcome> {
        let chunks = if doc.is_chunked {
            self.store.list_chunks(&doc.id).await?.len()
        } else {
            0
        };
        Ok(StartOutcome {
            document_id: doc.id.clone(),
            units_created: 0,
            chunked: doc.is_chunked,
            chunks,
            queue_items_created: 0,
        })
    }

    /// Run one driver step for the document.
    pub async fn process_next(&self, document_id: &str) -> PipelineResult<StepOutcome> {
        let doc = self.load_document(document_id).await?;
        if doc.status != DocumentStatus::Analyzing {
            return Ok(StepOutcome::NotAnalyzing { status: doc.status });
        }

        let unit = match claim_next_unit(self.store.as_ref(), document_id).await? {
            Some(unit) => unit,
            None => return self.check_completion(&doc).await,
        };

        let started = Instant::now();
        let mut ctx = ExecutionContext::new(&doc.id, &unit.id, &unit.stage_title);
        let result = self.execute_unit(&doc, &unit, &mut ctx).await;
        let execution_time_ms = started.elapsed().as_millis() as i64;

        match result {
            Ok(output) => {
                let body = strip_code_fences(&output.text).trim().to_string();
                self.store
                    .complete_unit(
                        &unit.id,
                        &UnitCompletion {
                            result_json: body,
                            tokens_used: output.tokens_used,
                            model_used: output.model_used.clone(),
                            execution_time_ms,
                            completed_at: chrono::Utc::now().timestamp(),
                        },
                    )
                    .await?;
                tracing::info!(
                    document_id = %doc.id,
                    unit_id = %unit.id,
                    stage = %unit.stage_title,
                    model = %output.model_used,
                    tokens = output.tokens_used,
                    execution_time_ms,
                    "unit completed"
                );
                Ok(StepOutcome::UnitCompleted {
                    unit_id: unit.id,
                    stage: unit.stage_title,
                    tokens_used: output.tokens_used,
                    model_used: output.model_used,
                })
            }
            Err(e) => self.fail_unit(&doc, &unit, &ctx, e, execution_time_ms).await,
        }
    }

    async fn execute_unit(
        &self,
        doc: &Document,
        unit: &AnalysisUnit,
        ctx: &mut ExecutionContext,
    ) -> PipelineResult<ModelOutput> {
        let max_output_tokens = self.tokens.max_output_tokens_for(doc.page_count);

        let output = if doc.is_chunked {
            let mut chunks = self.store.list_chunks(&doc.id).await?;
            let now = chrono::Utc::now().timestamp();
            if chunks.iter().any(|c| !c.is_remote_ready(now)) {
                // Remote files expire; refresh the stale ones before mapping.
                chunks = self.uploader.upload_all(doc, &chunks).await?;
            }
            ChunkConsolidator::new(&self.executor, self.store.as_ref())
                .run(unit, &chunks, max_output_tokens, ctx)
                .await?
        } else {
            let bytes = self
                .storage
                .download(&doc.storage_path)
                .await
                .map_err(|e| PipelineError::Storage(format!("{:#}", e)))?;
            let request = ModelRequest {
                system_instruction: unit.system_instruction.clone(),
                prompt: unit.prompt.clone(),
                parts: vec![Part::pdf_inline(bytes)],
                max_output_tokens,
            };
            self.executor.execute(&request, ctx).await?
        };

        let schema = self.registry.lookup(&unit.stage_title);
        let validation = self.validator.validate(&output.text, &schema);
        if !validation.is_valid {
            return Err(PipelineError::Validation {
                stage: unit.stage_title.clone(),
                result: Box::new(validation),
            });
        }
        for warning in &validation.warnings {
            tracing::warn!(document_id = %doc.id, unit_id = %unit.id, stage = %unit.stage_title, "{}", warning);
        }
        Ok(output)
    }

    async fn fail_unit(
        &self,
        doc: &Document,
        unit: &AnalysisUnit,
        ctx: &ExecutionContext,
        err: PipelineError,
        execution_time_ms: i64,
    ) -> PipelineResult<StepOutcome> {
        let diagnostics = match &err {
            PipelineError::Validation { result, .. } => json!({
                "validation": result.as_ref(),
                "remediation": result.remediation(),
            }),
            _ => json!(null),
        };
        let payload = json!({
            "type": err.code(),
            "message": err.to_string(),
            "model": ctx.current_model,
            "phase": ctx.phase.as_str(),
            "chunk_index": ctx.chunk_index,
            "diagnostics": diagnostics,
        });

        self.store
            .fail_unit(
                &unit.id,
                &UnitFailure {
                    message: err.user_message(),
                    diagnostics: Some(payload.to_string()),
                    execution_time_ms,
                },
            )
            .await?;

        // Validation failures leave the remaining stages running; anything
        // else ends the document.
        let document_failed = !matches!(err, PipelineError::Validation { .. });
        if document_failed && doc.status != DocumentStatus::Error {
            self.store
                .set_document_status(
                    &doc.id,
                    DocumentStatus::Error,
                    Some(err.code()),
                    chrono::Utc::now().timestamp(),
                )
                .await?;
        }

        tracing::error!(
            document_id = %doc.id,
            unit_id = %unit.id,
            stage = %unit.stage_title,
            code = err.code(),
            error = %err,
            "unit failed"
        );
        self.alert_failure(doc, Some(unit), &err, diagnostics);

        Ok(StepOutcome::UnitFailed {
            unit_id: unit.id.clone(),
            stage: unit.stage_title.clone(),
            code: err.code().to_string(),
            document_failed,
        })
    }

    async fn check_completion(&self, doc: &Document) -> PipelineResult<StepOutcome> {
        let counts = self.store.unit_counts(&doc.id).await?;
        let now = chrono::Utc::now().timestamp();

        if counts.all_completed() {
            self.store
                .set_document_status(&doc.id, DocumentStatus::Completed, None, now)
                .await?;
            tracing::info!(document_id = %doc.id, units = counts.total(), "document completed");
            notify_detached(
                &self.notifier,
                Notification::new(
                    Severity::Info,
                    "analysis_completed",
                    "Analysis completed",
                    format!("{} ({} stages)", doc.file_name, counts.total()),
                    json!({ "document_id": doc.id, "units": counts.total() }),
                ),
            );
            return Ok(StepOutcome::DocumentCompleted);
        }

        if counts.pending == 0 && counts.processing == 0 && counts.failed > 0 {
            self.store
                .set_document_status(&doc.id, DocumentStatus::Error, Some(UNITS_FAILED_REASON), now)
                .await?;
            tracing::warn!(document_id = %doc.id, failed = counts.failed, "document finished with failed units");
            return Ok(StepOutcome::DocumentFailed { counts });
        }

        Ok(StepOutcome::Waiting { counts })
    }

    fn alert_failure(
        &self,
        doc: &Document,
        unit: Option<&AnalysisUnit>,
        err: &PipelineError,
        diagnostics: serde_json::Value,
    ) {
        notify_detached(
            &self.notifier,
            Notification::new(
                Severity::Critical,
                err.code(),
                "Analysis failure",
                err.to_string(),
                json!({
                    "document_id": doc.id,
                    "file_name": doc.file_name,
                    "page_count": doc.page_count,
                    "unit_id": unit.map(|u| u.id.as_str()),
                    "stage": unit.map(|u| u.stage_title.as_str()),
                    "diagnostics": diagnostics,
                }),
            ),
        );
    }

    async fn load_document(&self, document_id: &str) -> PipelineResult<Document> {
        self.store
            .get_document(document_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("document {}", document_id)))
    }
}

fn new_unit(document_id: &str, stage: &StageConfig, now: i64) -> AnalysisUnit {
    AnalysisUnit {
        id: uuid::Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        stage_title: stage.title.clone(),
        execution_order: stage.order,
        status: UnitStatus::Pending,
        prompt: stage.prompt.clone(),
        system_instruction: stage.system_instruction.clone(),
        result_json: None,
        execution_time_ms: None,
        tokens_used: None,
        model_used: None,
        last_error: None,
        error_diagnostics: None,
        processing_started_at: None,
        completed_at: None,
        created_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::notify::MemoryNotifier;
    use crate::provider::{GenerateResponse, ProviderError, ScriptedProvider};
    use crate::storage::FsStorage;
    use crate::store::memory::InMemoryUnitStore;
    use tempfile::TempDir;

    fn test_config(tmp: &TempDir, stages: usize) -> Config {
        let text = format!(
            "[db]\npath = \"{}\"\n[storage]\nroot = \"{}\"\n",
            tmp.path().join("db.sqlite").display(),
            tmp.path().join("store").display()
        );
        let mut config: Config = toml::from_str(&text).unwrap();
        config.models = vec![ModelConfig {
            id: "model-a".into(),
            priority: 1,
            active: true,
            temperature: 0.2,
        }];
        config.stages = (1..=stages as i64)
            .map(|order| StageConfig {
                title: format!("Stage {}", order),
                order,
                prompt: format!("Run stage {}", order),
                system_instruction: String::new(),
                kind: None,
                mandatory_keys: Some(vec!["summary".into()]),
                min_length: None,
            })
            .collect();
        config
    }

    fn ok_provider() -> ScriptedProvider {
        ScriptedProvider::new(|_| {
            Ok(GenerateResponse {
                text: "```json\n{\"summary\": \"all good\"}\n```".into(),
                tokens_used: 10,
            })
        })
    }

    async fn pipeline(
        tmp: &TempDir,
        stages: usize,
        provider: ScriptedProvider,
    ) -> (Pipeline, Arc<InMemoryUnitStore>, Document, Arc<MemoryNotifier>) {
        let config = test_config(tmp, stages);
        let store = Arc::new(InMemoryUnitStore::new());
        let storage = Arc::new(FsStorage::new(tmp.path().join("store")));
        let notifier = Arc::new(MemoryNotifier::new());
        let p = Pipeline::new(
            &config,
            store.clone(),
            storage,
            Arc::new(provider),
            notifier.clone(),
        );
        let doc = p
            .ingest("proc.pdf", pdf::blank_pdf(3))
            .await
            .unwrap()
            .document;
        (p, store, doc, notifier)
    }

    #[tokio::test]
    async fn runs_every_unit_then_completes() {
        let tmp = TempDir::new().unwrap();
        let (p, store, doc, _) = pipeline(&tmp, 3, ok_provider()).await;
        let started = p.start_analysis(&doc.id).await.unwrap();
        assert_eq!(started.units_created, 3);
        assert!(!started.chunked);

        for _ in 0..3 {
            let step = p.process_next(&doc.id).await.unwrap();
            assert!(matches!(step, StepOutcome::UnitCompleted { .. }));
        }
        assert!(matches!(
            p.process_next(&doc.id).await.unwrap(),
            StepOutcome::DocumentCompleted
        ));

        let doc = store.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Completed);
        let units = store.list_units(&doc.id).await.unwrap();
        assert_eq!(units[0].result_json.as_deref(), Some("{\"summary\": \"all good\"}"));
    }

    #[tokio::test]
    async fn unit_still_processing_blocks_completion() {
        let tmp = TempDir::new().unwrap();
        let (p, store, doc, _) = pipeline(&tmp, 5, ok_provider()).await;
        p.start_analysis(&doc.id).await.unwrap();

        for _ in 0..4 {
            p.process_next(&doc.id).await.unwrap();
        }
        // Another worker holds U5.
        let held = store
            .claim_next_unit(&doc.id, chrono::Utc::now().timestamp())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(held.execution_order, 5);

        match p.process_next(&doc.id).await.unwrap() {
            StepOutcome::Waiting { counts } => {
                assert_eq!(counts.completed, 4);
                assert_eq!(counts.processing, 1);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        let doc = store.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Analyzing);
    }

    #[tokio::test]
    async fn invalid_output_fails_unit_with_diagnostics() {
        let tmp = TempDir::new().unwrap();
        let provider = ScriptedProvider::new(|_| {
            Ok(GenerateResponse {
                text: "{\"summary\": \"cut off mid".into(),
                tokens_used: 10,
            })
        });
        let (p, store, doc, notifier) = pipeline(&tmp, 2, provider).await;
        p.start_analysis(&doc.id).await.unwrap();

        let step = p.process_next(&doc.id).await.unwrap();
        match &step {
            StepOutcome::UnitFailed {
                code,
                document_failed,
                ..
            } => {
                assert_eq!(code, "validation_failed");
                assert!(!document_failed);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(step.should_continue());

        let units = store.list_units(&doc.id).await.unwrap();
        assert_eq!(units[0].status, UnitStatus::Failed);
        let diag: serde_json::Value =
            serde_json::from_str(units[0].error_diagnostics.as_deref().unwrap()).unwrap();
        assert_eq!(diag["type"], "validation_failed");
        assert_eq!(diag["diagnostics"]["validation"]["diagnostics"]["is_truncated"], true);

        let alerts = notifier.wait_for_kind("validation_failed", 1).await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].metadata["unit_id"], units[0].id.as_str());
        assert_eq!(alerts[0].metadata["stage"], "Stage 1");
        assert_eq!(
            alerts[0].metadata["diagnostics"]["validation"]["diagnostics"]["is_truncated"],
            true
        );
        assert!(alerts[0].metadata["diagnostics"]["remediation"].is_string());

        // Second unit fails the same way, then the document ends in error.
        p.process_next(&doc.id).await.unwrap();
        assert!(matches!(
            p.process_next(&doc.id).await.unwrap(),
            StepOutcome::DocumentFailed { .. }
        ));
        let doc = store.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(doc.error_reason.as_deref(), Some(UNITS_FAILED_REASON));
    }

    #[tokio::test]
    async fn model_exhaustion_fails_document() {
        let tmp = TempDir::new().unwrap();
        let provider =
            ScriptedProvider::new(|_| Err(ProviderError::new("server_error", "HTTP 500")));
        let (p, store, doc, _) = pipeline(&tmp, 2, provider).await;
        p.start_analysis(&doc.id).await.unwrap();

        let step = p.process_next(&doc.id).await.unwrap();
        assert!(!step.should_continue());
        let doc = store.get_document(&doc.id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Error);
        assert_eq!(doc.error_reason.as_deref(), Some("model_exhausted"));
        assert!(matches!(
            p.process_next(&doc.id).await.unwrap(),
            StepOutcome::NotAnalyzing { .. }
        ));
    }

    #[tokio::test]
    async fn duplicate_ingest_returns_existing_document() {
        let tmp = TempDir::new().unwrap();
        let (p, _store, doc, _) = pipeline(&tmp, 1, ok_provider()).await;
        assert_eq!(doc.page_count, 3);

        let bytes = pdf::blank_pdf(4);
        let first = p.ingest("a.pdf", bytes.clone()).await.unwrap();
        assert!(!first.duplicate);
        let again = p.ingest("copy-of-a.pdf", bytes).await.unwrap();
        assert!(again.duplicate);
        assert_eq!(again.document.id, first.document.id);
    }

    #[tokio::test]
    async fn steps_wait_until_preparation_finishes() {
        let tmp = TempDir::new().unwrap();
        let (p, store, doc, _) = pipeline(&tmp, 2, ok_provider()).await;
        let now = chrono::Utc::now().timestamp();
        // Another caller is mid-preparation.
        assert!(store.begin_preparation(&doc.id, now, now - 3600).await.unwrap());

        assert!(matches!(
            p.process_next(&doc.id).await.unwrap(),
            StepOutcome::NotAnalyzing {
                status: DocumentStatus::Created
            }
        ));
        let err = p.start_analysis(&doc.id).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidState(_)));
        assert!(store.list_units(&doc.id).await.unwrap().is_empty());

        store.release_preparation(&doc.id).await.unwrap();
        let started = p.start_analysis(&doc.id).await.unwrap();
        assert_eq!(started.units_created, 2);
        assert!(matches!(
            p.process_next(&doc.id).await.unwrap(),
            StepOutcome::UnitCompleted { .. }
        ));
    }

    #[tokio::test]
    async fn restarting_an_analyzing_document_changes_nothing() {
        let tmp = TempDir::new().unwrap();
        let (p, store, doc, _) = pipeline(&tmp, 3, ok_provider()).await;
        p.start_analysis(&doc.id).await.unwrap();
        p.process_next(&doc.id).await.unwrap();

        let again = p.start_analysis(&doc.id).await.unwrap();
        assert_eq!(again.units_created, 0);
        assert!(!again.chunked);
        let counts = store.unit_counts(&doc.id).await.unwrap();
        assert_eq!((counts.completed, counts.pending), (1, 2));
    }
}
