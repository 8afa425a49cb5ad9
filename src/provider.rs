//! LLM provider abstraction and implementations.
//!
//! Defines the [`LlmProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]**: returns errors; used when no provider is configured.
//! - **[`GeminiProvider`]**: calls the Gemini REST API for generation and
//!   uses its Files API to stage large chunk PDFs.
//! - **[`ScriptedProvider`]**: answers from a closure; used by tests.
//!
//! # Error Classification
//!
//! Every failure is a [`ProviderError`] with a short machine code that ends
//! up in the attempt ledger:
//! - HTTP 429 → `rate_limited`
//! - HTTP 5xx → `server_error`
//! - other HTTP 4xx → `client_error`
//! - request timeout → `timeout`
//! - connection failure → `network`
//! - no candidates / blocked prompt → `empty_response`
//!
//! The provider itself never retries a generation call: moving to the next
//! model is the fallback executor's job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::ProviderConfig;
use crate::models::RemoteFileState;

/// One piece of model input.
#[derive(Debug, Clone)]
pub enum Part {
    Text(String),
    /// Raw bytes sent inline (small documents).
    InlineData { mime_type: String, data: Vec<u8> },
    /// Reference to a previously uploaded remote file.
    FileData { mime_type: String, file_uri: String },
}

impl Part {
    pub fn text(s: impl Into<String>) -> Self {
        Part::Text(s.into())
    }

    pub fn pdf_file(uri: impl Into<String>) -> Self {
        Part::FileData {
            mime_type: "application/pdf".to_string(),
            file_uri: uri.into(),
        }
    }

    pub fn pdf_inline(data: Vec<u8>) -> Self {
        Part::InlineData {
            mime_type: "application/pdf".to_string(),
            data,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            Part::Text(text) => json!({ "text": text }),
            Part::InlineData { mime_type, data } => json!({
                "inlineData": {
                    "mimeType": mime_type,
                    "data": base64::engine::general_purpose::STANDARD.encode(data),
                }
            }),
            Part::FileData {
                mime_type,
                file_uri,
            } => json!({
                "fileData": { "mimeType": mime_type, "fileUri": file_uri }
            }),
        }
    }
}

/// A single generation call.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: String,
    pub system_instruction: String,
    pub parts: Vec<Part>,
    pub temperature: f32,
    pub max_output_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct GenerateResponse {
    pub text: String,
    pub tokens_used: i64,
}

/// A file staged on the provider side.
#[derive(Debug, Clone)]
pub struct RemoteFile {
    pub name: String,
    pub uri: String,
    pub state: RemoteFileState,
    pub expires_at: Option<i64>,
}

#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct ProviderError {
    pub code: String,
    pub message: String,
}

impl ProviderError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    fn from_reqwest(err: reqwest::Error) -> Self {
        let code = if err.is_timeout() {
            "timeout"
        } else if err.is_connect() || err.is_request() {
            "network"
        } else if err.is_decode() {
            "decode_error"
        } else {
            "http_error"
        };
        Self::new(code, err.to_string())
    }

    fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        let code = if status.as_u16() == 429 {
            "rate_limited"
        } else if status.is_server_error() {
            "server_error"
        } else {
            "client_error"
        };
        Self::new(code, format!("HTTP {}: {}", status, body))
    }
}

/// Interface to the LLM provider.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Provider identifier, e.g. `"gemini"`.
    fn name(&self) -> &str;

    async fn generate_content(
        &self,
        request: &GenerateRequest,
    ) -> Result<GenerateResponse, ProviderError>;

    async fn upload_file(
        &self,
        bytes: Vec<u8>,
        mime_type: &str,
        display_name: &str,
    ) -> Result<RemoteFile, ProviderError>;

    async fn get_file_state(&self, name: &str) -> Result<RemoteFile, ProviderError>;
}

/// Build the provider named in configuration.
pub fn create_provider(config: &ProviderConfig) -> anyhow::Result<Arc<dyn LlmProvider>> {
    match config.kind.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "gemini" => Ok(Arc::new(GeminiProvider::new(config)?)),
        other => anyhow::bail!("Unknown provider kind: {}", other),
    }
}

// ============ Disabled Provider ============

/// A provider that fails every call.
pub struct DisabledProvider;

#[async_trait]
impl LlmProvider for DisabledProvider {
    fn name(&self) -> &str {
        "disabled"
    }

    async fn generate_content(
        &self,
        _request: &GenerateRequest,
    ) -> Result<GenerateResponse, ProviderError> {
        Err(ProviderError::new("disabled", "LLM provider is disabled"))
    }

    async fn upload_file(
        &self,
        _bytes: Vec<u8>,
        _mime_type: &str,
        _display_name: &str,
    ) -> Result<RemoteFile, ProviderError> {
        Err(ProviderError::new("disabled", "LLM provider is disabled"))
    }

    async fn get_file_state(&self, _name: &str) -> Result<RemoteFile, ProviderError> {
        Err(ProviderError::new("disabled", "LLM provider is disabled"))
    }
}

// ============ Gemini Provider ============

/// Gemini REST API client.
///
/// Requires the API key in the environment variable named by
/// `provider.api_key_env` (default `GEMINI_API_KEY`).
pub struct GeminiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl GeminiProvider {
    pub fn new(config: &ProviderConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            anyhow::anyhow!("{} environment variable not set", config.api_key_env)
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    async fn send_json(&self, builder: reqwest::RequestBuilder) -> Result<Value, ProviderError> {
        let response = builder
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, body));
        }
        response.json().await.map_err(ProviderError::from_reqwest)
    }
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn generate_content(
        &self,
        request: &GenerateRequest,
    ) -> Result<GenerateResponse, ProviderError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, request.model
        );
        let body = build_generate_body(request);
        let json = self.send_json(self.client.post(&url).json(&body)).await?;
        parse_generate_response(&json)
    }

    async fn upload_file(
        &self,
        bytes: Vec<u8>,
        mime_type: &str,
        display_name: &str,
    ) -> Result<RemoteFile, ProviderError> {
        // Resumable upload: start a session, then send the bytes and finalize.
        let start_url = format!("{}/upload/v1beta/files", self.base_url);
        let start = self
            .client
            .post(&start_url)
            .header("x-goog-api-key", &self.api_key)
            .header("X-Goog-Upload-Protocol", "resumable")
            .header("X-Goog-Upload-Command", "start")
            .header("X-Goog-Upload-Header-Content-Length", bytes.len().to_string())
            .header("X-Goog-Upload-Header-Content-Type", mime_type)
            .json(&json!({ "file": { "display_name": display_name } }))
            .send()
            .await
            .map_err(ProviderError::from_reqwest)?;

        let status = start.status();
        if !status.is_success() {
            let body = start.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, body));
        }
        let upload_url = start
            .headers()
            .get("x-goog-upload-url")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| {
                ProviderError::new("upload_error", "missing x-goog-upload-url header")
            })?;

        let json = self
            .send_json(
                self.client
                    .post(&upload_url)
                    .header("X-Goog-Upload-Offset", "0")
                    .header("X-Goog-Upload-Command", "upload, finalize")
                    .body(bytes),
            )
            .await?;
        let file = json
            .get("file")
            .ok_or_else(|| ProviderError::new("upload_error", "response missing file object"))?;
        parse_remote_file(file)
    }

    async fn get_file_state(&self, name: &str) -> Result<RemoteFile, ProviderError> {
        let url = format!("{}/v1beta/{}", self.base_url, name);
        let json = self.send_json(self.client.get(&url)).await?;
        parse_remote_file(&json)
    }
}

// ============ Scripted Provider ============

type Responder = dyn Fn(&GenerateRequest) -> Result<GenerateResponse, ProviderError> + Send + Sync;

/// A provider whose generation results come from a closure.
///
/// Uploaded files report `PROCESSING` for a configurable number of polls
/// before turning `ACTIVE`. The first `upload_failures` uploads fail with
/// `server_error`.
pub struct ScriptedProvider {
    responder: Box<Responder>,
    upload_failures: AtomicU32,
    polls_until_active: u32,
    files: Mutex<HashMap<String, u32>>,
    calls: Mutex<Vec<GenerateRequest>>,
    uploads: AtomicU32,
}

impl ScriptedProvider {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&GenerateRequest) -> Result<GenerateResponse, ProviderError> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            upload_failures: AtomicU32::new(0),
            polls_until_active: 0,
            files: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            uploads: AtomicU32::new(0),
        }
    }

    pub fn with_upload_failures(self, failures: u32) -> Self {
        self.upload_failures.store(failures, Ordering::SeqCst);
        self
    }

    pub fn with_polls_until_active(mut self, polls: u32) -> Self {
        self.polls_until_active = polls;
        self
    }

    /// Generation requests received so far.
    pub fn calls(&self) -> Vec<GenerateRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Upload calls received so far, failed ones included.
    pub fn upload_count(&self) -> u32 {
        self.uploads.load(Ordering::SeqCst)
    }

    fn file_state(&self, name: &str, polls: u32) -> RemoteFile {
        let state = if polls >= self.polls_until_active {
            RemoteFileState::Active
        } else {
            RemoteFileState::Processing
        };
        RemoteFile {
            name: name.to_string(),
            uri: format!("scripted://{}", name),
            state,
            expires_at: None,
        }
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate_content(
        &self,
        request: &GenerateRequest,
    ) -> Result<GenerateResponse, ProviderError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }
        (self.responder)(request)
    }

    async fn upload_file(
        &self,
        _bytes: Vec<u8>,
        _mime_type: &str,
        display_name: &str,
    ) -> Result<RemoteFile, ProviderError> {
        let n = self.uploads.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .upload_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| f.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ProviderError::new("server_error", "scripted upload failure"));
        }
        let name = format!("files/{}-{}", display_name, n);
        let mut files = self
            .files
            .lock()
            .map_err(|_| ProviderError::new("internal", "file table poisoned"))?;
        files.insert(name.clone(), 0);
        Ok(self.file_state(&name, 0))
    }

    async fn get_file_state(&self, name: &str) -> Result<RemoteFile, ProviderError> {
        let mut files = self
            .files
            .lock()
            .map_err(|_| ProviderError::new("internal", "file table poisoned"))?;
        let polls = files
            .get_mut(name)
            .ok_or_else(|| ProviderError::new("client_error", format!("unknown file {}", name)))?;
        *polls += 1;
        Ok(self.file_state(name, *polls))
    }
}

fn build_generate_body(request: &GenerateRequest) -> Value {
    let parts: Vec<Value> = request.parts.iter().map(Part::to_json).collect();
    let mut body = json!({
        "contents": [{ "role": "user", "parts": parts }],
        "generationConfig": {
            "temperature": request.temperature,
            "maxOutputTokens": request.max_output_tokens,
            "responseMimeType": "application/json",
        }
    });
    if !request.system_instruction.trim().is_empty() {
        body["systemInstruction"] = json!({ "parts": [{ "text": request.system_instruction }] });
    }
    body
}

/// Extract the concatenated candidate text and total token count.
fn parse_generate_response(json: &Value) -> Result<GenerateResponse, ProviderError> {
    let candidate = json
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| {
            let reason = json
                .pointer("/promptFeedback/blockReason")
                .and_then(|r| r.as_str())
                .unwrap_or("no candidates returned");
            ProviderError::new("empty_response", reason)
        })?;

    let text: String = candidate
        .pointer("/content/parts")
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect()
        })
        .unwrap_or_default();

    if text.is_empty() {
        let reason = candidate
            .get("finishReason")
            .and_then(|r| r.as_str())
            .unwrap_or("UNKNOWN");
        return Err(ProviderError::new(
            "empty_response",
            format!("candidate has no text (finishReason={})", reason),
        ));
    }

    let tokens_used = json
        .pointer("/usageMetadata/totalTokenCount")
        .and_then(|t| t.as_i64())
        .unwrap_or(0);

    Ok(GenerateResponse { text, tokens_used })
}

fn parse_remote_file(json: &Value) -> Result<RemoteFile, ProviderError> {
    let field = |key: &str| json.get(key).and_then(|v| v.as_str());
    let name = field("name")
        .ok_or_else(|| ProviderError::new("decode_error", "file object missing name"))?;
    let state = match field("state").unwrap_or("PROCESSING") {
        "ACTIVE" => RemoteFileState::Active,
        "FAILED" => RemoteFileState::Failed,
        _ => RemoteFileState::Processing,
    };
    let expires_at = field("expirationTime")
        .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.timestamp());
    Ok(RemoteFile {
        name: name.to_string(),
        uri: field("uri").unwrap_or_default().to_string(),
        state,
        expires_at,
    })
}
