//! Chunk uploader.
//!
//! Pushes each chunk blob to the provider's file staging area and polls
//! until the provider reports it `ACTIVE`. Each chunk gets up to
//! `upload.max_attempts` tries with linear backoff (`attempt × backoff_secs`).
//! Chunks that already hold a live remote handle are skipped. Chunks of one
//! document upload concurrently.
//!
//! If any chunk exhausts its attempts, every chunk of the document is marked
//! `failed` and the document moves to `error` with reason `upload_failed`.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tokio::time::{sleep, Instant};

use crate::config::UploadConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{Chunk, Document, DocumentStatus, RemoteFileState};
use crate::provider::{LlmProvider, RemoteFile};
use crate::storage::ObjectStorage;
use crate::store::{RemoteUpdate, UnitStore};

pub const UPLOAD_FAILED_REASON: &str = "upload_failed";

pub struct ChunkUploader {
    provider: Arc<dyn LlmProvider>,
    store: Arc<dyn UnitStore>,
    storage: Arc<dyn ObjectStorage>,
    config: UploadConfig,
}

impl ChunkUploader {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        store: Arc<dyn UnitStore>,
        storage: Arc<dyn ObjectStorage>,
        config: UploadConfig,
    ) -> Self {
        Self {
            provider,
            store,
            storage,
            config,
        }
    }

    /// Make every chunk of `doc` remote-ready. Returns the refreshed chunk rows.
    pub async fn upload_all(&self, doc: &Document, chunks: &[Chunk]) -> PipelineResult<Vec<Chunk>> {
        let now = chrono::Utc::now().timestamp();
        let pending: Vec<&Chunk> = chunks.iter().filter(|c| !c.is_remote_ready(now)).collect();
        if pending.is_empty() {
            return Ok(chunks.to_vec());
        }

        tracing::info!(
            document_id = %doc.id,
            uploading = pending.len(),
            skipped = chunks.len() - pending.len(),
            "uploading chunks"
        );

        let results = join_all(pending.iter().map(|c| self.upload_chunk(c))).await;
        let failures: Vec<String> = results.into_iter().filter_map(|r| r.err()).collect();

        if !failures.is_empty() {
            let message = failures.join("; ");
            tracing::error!(document_id = %doc.id, failed = failures.len(), error = %message, "chunk upload exhausted");
            self.store.fail_all_chunks(&doc.id).await?;
            self.store
                .set_document_status(
                    &doc.id,
                    DocumentStatus::Error,
                    Some(UPLOAD_FAILED_REASON),
                    chrono::Utc::now().timestamp(),
                )
                .await?;
            return Err(PipelineError::Upload {
                document_id: doc.id.clone(),
                message,
            });
        }

        Ok(self.store.list_chunks(&doc.id).await?)
    }

    async fn upload_chunk(&self, chunk: &Chunk) -> Result<(), String> {
        let bytes = self
            .storage
            .download(&chunk.storage_path)
            .await
            .map_err(|e| format!("chunk {}: {:#}", chunk.chunk_index, e))?;
        let display_name = format!("{}-chunk-{}", chunk.document_id, chunk.chunk_index);

        let mut last_error = String::new();
        for attempt in 1..=self.config.max_attempts {
            self.write_state(chunk, None, RemoteFileState::Uploading, attempt)
                .await?;

            match self.try_upload(chunk, bytes.clone(), &display_name, attempt).await {
                Ok(file) => {
                    self.store
                        .update_chunk_remote(
                            &chunk.id,
                            &RemoteUpdate {
                                remote_name: Some(file.name.clone()),
                                remote_uri: Some(file.uri.clone()),
                                remote_state: RemoteFileState::Active,
                                expires_at: file.expires_at,
                                upload_attempts: i64::from(attempt),
                            },
                        )
                        .await
                        .map_err(|e| format!("{:#}", e))?;
                    tracing::debug!(
                        document_id = %chunk.document_id,
                        chunk_index = chunk.chunk_index,
                        attempt,
                        remote = %file.name,
                        "chunk active"
                    );
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(
                        document_id = %chunk.document_id,
                        chunk_index = chunk.chunk_index,
                        attempt,
                        error = %e,
                        "chunk upload attempt failed"
                    );
                    last_error = e;
                    if attempt < self.config.max_attempts {
                        let delay = self.config.backoff_secs * u64::from(attempt);
                        sleep(Duration::from_secs(delay)).await;
                    }
                }
            }
        }

        Err(format!(
            "chunk {} failed after {} attempts: {}",
            chunk.chunk_index, self.config.max_attempts, last_error
        ))
    }

    async fn try_upload(
        &self,
        chunk: &Chunk,
        bytes: Vec<u8>,
        display_name: &str,
        attempt: u32,
    ) -> Result<RemoteFile, String> {
        let file = self
            .provider
            .upload_file(bytes, "application/pdf", display_name)
            .await
            .map_err(|e| e.to_string())?;
        self.wait_until_active(chunk, file, attempt).await
    }

    /// Poll on a fixed interval until the file is active, failed, or the
    /// hard timeout elapses.
    async fn wait_until_active(
        &self,
        chunk: &Chunk,
        mut file: RemoteFile,
        attempt: u32,
    ) -> Result<RemoteFile, String> {
        let started = Instant::now();
        let timeout = Duration::from_secs(self.config.poll_timeout_secs);
        let interval = Duration::from_secs(self.config.poll_interval_secs);

        loop {
            match file.state {
                RemoteFileState::Active => return Ok(file),
                RemoteFileState::Failed => {
                    return Err(format!("provider marked {} as failed", file.name))
                }
                _ => {}
            }
            if started.elapsed() >= timeout {
                return Err(format!(
                    "{} not active after {}s",
                    file.name, self.config.poll_timeout_secs
                ));
            }
            self.write_state(chunk, Some(&file.name), RemoteFileState::Processing, attempt)
                .await?;
            sleep(interval).await;
            file = self
                .provider
                .get_file_state(&file.name)
                .await
                .map_err(|e| e.to_string())?;
        }
    }

    async fn write_state(
        &self,
        chunk: &Chunk,
        remote_name: Option<&str>,
        state: RemoteFileState,
        attempt: u32,
    ) -> Result<(), String> {
        self.store
            .update_chunk_remote(
                &chunk.id,
                &RemoteUpdate {
                    remote_name: remote_name.map(str::to_string),
                    remote_uri: None,
                    remote_state: state,
                    expires_at: None,
                    upload_attempts: i64::from(attempt),
                },
            )
            .await
            .map_err(|e| format!("{:#}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ProviderError, ScriptedProvider};
    use crate::storage::{chunk_key, FsStorage};
    use crate::store::memory::InMemoryUnitStore;
    use tempfile::TempDir;

    fn quick_config() -> UploadConfig {
        UploadConfig {
            max_attempts: 3,
            backoff_secs: 0,
            poll_interval_secs: 0,
            poll_timeout_secs: 5,
        }
    }

    async fn fixture(tmp: &TempDir, chunks: i64) -> (Arc<InMemoryUnitStore>, Arc<FsStorage>, Document, Vec<Chunk>) {
        let store = Arc::new(InMemoryUnitStore::new());
        let storage = Arc::new(FsStorage::new(tmp.path()));
        let doc = Document {
            id: "doc".into(),
            file_name: "big.pdf".into(),
            storage_path: "doc/original.pdf".into(),
            content_hash: "h".into(),
            byte_size: 100,
            page_count: chunks * 10,
            is_chunked: true,
            status: DocumentStatus::Analyzing,
            error_reason: None,
            created_at: 0,
            updated_at: 0,
        };
        store.insert_document(&doc).await.unwrap();
        let mut rows = Vec::new();
        for i in 0..chunks {
            let key = chunk_key("doc", i);
            storage.upload(&key, b"%PDF-1.5 chunk").await.unwrap();
            rows.push(Chunk {
                id: format!("chunk-{}", i),
                document_id: "doc".into(),
                chunk_index: i,
                total_chunks: chunks,
                start_page: i * 10 + 1,
                end_page: i * 10 + 10,
                storage_path: key,
                byte_size: 14,
                remote_name: None,
                remote_uri: None,
                remote_state: RemoteFileState::Uploading,
                expires_at: None,
                upload_attempts: 0,
            });
        }
        store.insert_chunks(&rows).await.unwrap();
        (store, storage, doc, rows)
    }

    fn never_generates() -> ScriptedProvider {
        ScriptedProvider::new(|_| Err(ProviderError::new("unused", "unused")))
    }

    #[tokio::test]
    async fn uploads_and_waits_for_active() {
        let tmp = TempDir::new().unwrap();
        let (store, storage, doc, chunks) = fixture(&tmp, 3).await;
        let provider = Arc::new(never_generates().with_polls_until_active(2));
        let uploader = ChunkUploader::new(provider.clone(), store.clone(), storage, quick_config());

        let ready = uploader.upload_all(&doc, &chunks).await.unwrap();
        assert_eq!(ready.len(), 3);
        assert!(ready.iter().all(|c| c.remote_state == RemoteFileState::Active));
        assert!(ready.iter().all(|c| c.remote_uri.is_some()));
        assert_eq!(provider.upload_count(), 3);

        // Second pass skips chunks that are already active.
        uploader.upload_all(&doc, &ready).await.unwrap();
        assert_eq!(provider.upload_count(), 3);
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let tmp = TempDir::new().unwrap();
        let (store, storage, doc, chunks) = fixture(&tmp, 1).await;
        let provider = Arc::new(never_generates().with_upload_failures(2));
        let uploader = ChunkUploader::new(provider.clone(), store.clone(), storage, quick_config());

        let ready = uploader.upload_all(&doc, &chunks).await.unwrap();
        assert_eq!(ready[0].upload_attempts, 3);
        assert_eq!(ready[0].remote_state, RemoteFileState::Active);
    }

    #[tokio::test]
    async fn exhaustion_fails_document() {
        let tmp = TempDir::new().unwrap();
        let (store, storage, doc, chunks) = fixture(&tmp, 2).await;
        let provider = Arc::new(never_generates().with_upload_failures(100));
        let uploader = ChunkUploader::new(provider.clone(), store.clone(), storage, quick_config());

        let err = uploader.upload_all(&doc, &chunks).await.unwrap_err();
        assert!(matches!(err, PipelineError::Upload { .. }));
        assert_eq!(provider.upload_count(), 6);

        let doc = store.get_document("doc").await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Error);
        assert_eq!(doc.error_reason.as_deref(), Some(UPLOAD_FAILED_REASON));
        let chunks = store.list_chunks("doc").await.unwrap();
        assert!(chunks.iter().all(|c| c.remote_state == RemoteFileState::Failed));
    }

    #[tokio::test]
    async fn processing_past_timeout_counts_as_failure() {
        let tmp = TempDir::new().unwrap();
        let (store, storage, doc, chunks) = fixture(&tmp, 1).await;
        let provider = Arc::new(never_generates().with_polls_until_active(u32::MAX));
        let config = UploadConfig {
            max_attempts: 1,
            poll_timeout_secs: 0,
            ..quick_config()
        };
        let uploader = ChunkUploader::new(provider, store.clone(), storage, config);

        let err = uploader.upload_all(&doc, &chunks).await.unwrap_err();
        assert!(err.to_string().contains("not active"));
    }
}
