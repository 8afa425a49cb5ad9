//! Model fallback executor.
//!
//! Runs one model request against the active models in ascending priority
//! order until one succeeds. Every attempt is appended to the attempt ledger
//! before the next model is tried, and each switch emits a detached
//! `model_switch` notification.
//!
//! The model currently in use is tracked on the [`ExecutionContext`] that
//! the caller threads through a unit's execution.

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;

use crate::config::ModelConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{AttemptOutcome, ExecutionPhase, ModelAttempt};
use crate::notify::{notify_detached, Notification, Notifier, Severity};
use crate::provider::{GenerateRequest, LlmProvider, Part};
use crate::store::UnitStore;

/// Where a model call belongs, plus the model currently being tried.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub document_id: String,
    pub unit_id: String,
    pub stage_title: String,
    pub phase: ExecutionPhase,
    pub chunk_index: Option<i64>,
    pub current_model: Option<String>,
}

impl ExecutionContext {
    pub fn new(document_id: &str, unit_id: &str, stage_title: &str) -> Self {
        Self {
            document_id: document_id.to_string(),
            unit_id: unit_id.to_string(),
            stage_title: stage_title.to_string(),
            phase: ExecutionPhase::Direct,
            chunk_index: None,
            current_model: None,
        }
    }

    pub fn for_map(&mut self, chunk_index: i64) {
        self.phase = ExecutionPhase::Map;
        self.chunk_index = Some(chunk_index);
    }

    pub fn for_reduce(&mut self) {
        self.phase = ExecutionPhase::Reduce;
        self.chunk_index = None;
    }
}

/// Inputs for one model call, independent of which model serves it.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system_instruction: String,
    pub prompt: String,
    /// Document payload: inline bytes or remote file references.
    pub parts: Vec<Part>,
    pub max_output_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct ModelOutput {
    pub text: String,
    pub tokens_used: i64,
    pub model_used: String,
}

pub struct FallbackExecutor {
    provider: Arc<dyn LlmProvider>,
    store: Arc<dyn UnitStore>,
    notifier: Arc<dyn Notifier>,
    models: Vec<ModelConfig>,
}

impl FallbackExecutor {
    /// `models` must already be filtered to active ones and sorted by priority.
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        store: Arc<dyn UnitStore>,
        notifier: Arc<dyn Notifier>,
        models: Vec<ModelConfig>,
    ) -> Self {
        Self {
            provider,
            store,
            notifier,
            models,
        }
    }

    pub fn models(&self) -> &[ModelConfig] {
        &self.models
    }

    pub async fn execute(
        &self,
        request: &ModelRequest,
        ctx: &mut ExecutionContext,
    ) -> PipelineResult<ModelOutput> {
        if self.models.is_empty() {
            return Err(PipelineError::NoModels);
        }

        let mut parts = request.parts.clone();
        parts.push(Part::text(request.prompt.clone()));

        let mut last_error = String::new();
        for (i, model) in self.models.iter().enumerate() {
            ctx.current_model = Some(model.id.clone());
            let generate = GenerateRequest {
                model: model.id.clone(),
                system_instruction: request.system_instruction.clone(),
                parts: parts.clone(),
                temperature: model.temperature,
                max_output_tokens: request.max_output_tokens,
            };

            let started = Instant::now();
            let result = self.provider.generate_content(&generate).await;
            let duration_ms = started.elapsed().as_millis() as i64;

            let mut attempt = ModelAttempt {
                id: uuid::Uuid::new_v4().to_string(),
                document_id: ctx.document_id.clone(),
                unit_id: ctx.unit_id.clone(),
                chunk_index: ctx.chunk_index,
                phase: ctx.phase,
                model_id: model.id.clone(),
                attempt_number: (i + 1) as i64,
                outcome: AttemptOutcome::Success,
                error_code: None,
                error_message: None,
                duration_ms,
                tokens_used: None,
                created_at: chrono::Utc::now().timestamp(),
            };

            match result {
                Ok(response) => {
                    attempt.tokens_used = Some(response.tokens_used);
                    self.store.record_attempt(&attempt).await?;
                    tracing::debug!(
                        document_id = %ctx.document_id,
                        unit_id = %ctx.unit_id,
                        model = %model.id,
                        phase = %ctx.phase,
                        tokens = response.tokens_used,
                        duration_ms,
                        "model call succeeded"
                    );
                    return Ok(ModelOutput {
                        text: response.text,
                        tokens_used: response.tokens_used,
                        model_used: model.id.clone(),
                    });
                }
                Err(e) => {
                    attempt.outcome = AttemptOutcome::Failed;
                    attempt.error_code = Some(e.code.clone());
                    attempt.error_message = Some(e.message.clone());
                    self.store.record_attempt(&attempt).await?;
                    last_error = e.to_string();

                    tracing::warn!(
                        document_id = %ctx.document_id,
                        unit_id = %ctx.unit_id,
                        model = %model.id,
                        phase = %ctx.phase,
                        error = %e,
                        "model call failed"
                    );

                    if let Some(next) = self.models.get(i + 1) {
                        ctx.current_model = Some(next.id.clone());
                        notify_detached(
                            &self.notifier,
                            Notification::new(
                                Severity::Warning,
                                "model_switch",
                                "Model switch",
                                format!("{} failed ({}); switching to {}", model.id, e.code, next.id),
                                json!({
                                    "document_id": ctx.document_id,
                                    "unit_id": ctx.unit_id,
                                    "stage": ctx.stage_title,
                                    "phase": ctx.phase.as_str(),
                                    "chunk_index": ctx.chunk_index,
                                    "previous_model": model.id,
                                    "next_model": next.id,
                                    "error_code": e.code,
                                }),
                            ),
                        );
                    }
                }
            }
        }

        Err(PipelineError::ModelExhausted {
            attempts: self.models.len(),
            last_error,
        })
    }
}
