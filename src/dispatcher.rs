//! Work dispatcher.
//!
//! Document ids travel through a tokio mpsc channel shared by a fixed pool of
//! worker tasks. A worker takes one id, runs one [`Pipeline::process_next`]
//! step and, if the step made progress, puts the id back on the queue. Claim
//! errors re-enqueue the id after `claim_backoff_secs` instead of retrying
//! immediately.
//!
//! [`Dispatcher::wait_idle`] resolves once no document is queued, being
//! processed, or waiting out a backoff.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::config::DispatcherConfig;
use crate::driver::{Pipeline, StepOutcome};
use crate::error::PipelineError;

struct Shared {
    pipeline: Arc<Pipeline>,
    tx: mpsc::UnboundedSender<String>,
    in_flight: AtomicUsize,
    idle: Notify,
    claim_backoff: Duration,
}

impl Shared {
    fn enqueue(&self, document_id: String) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(document_id).is_err() {
            self.finish_one();
        }
    }

    fn finish_one(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn step(self: &Arc<Self>, document_id: String) {
        match self.pipeline.process_next(&document_id).await {
            Ok(outcome) => {
                if outcome.should_continue() {
                    self.enqueue(document_id);
                } else {
                    log_final(&document_id, &outcome);
                }
            }
            Err(e @ PipelineError::Claim { .. }) => {
                tracing::warn!(
                    document_id = %document_id,
                    backoff_secs = self.claim_backoff.as_secs(),
                    error = %e,
                    "claim failed; backing off"
                );
                // Counted as in flight until the delayed send happens.
                self.in_flight.fetch_add(1, Ordering::SeqCst);
                let shared = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(shared.claim_backoff).await;
                    if shared.tx.send(document_id).is_err() {
                        shared.finish_one();
                    }
                });
            }
            Err(e) => {
                tracing::error!(document_id = %document_id, error = %e, "driver step failed");
            }
        }
    }
}

fn log_final(document_id: &str, outcome: &StepOutcome) {
    match outcome {
        StepOutcome::DocumentCompleted => {
            tracing::info!(document_id, "dispatcher: document completed")
        }
        StepOutcome::Waiting { counts } => {
            tracing::debug!(document_id, processing = counts.processing, "dispatcher: waiting on other workers")
        }
        other => tracing::info!(document_id, outcome = ?other, "dispatcher: document stopped"),
    }
}

pub struct Dispatcher {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawn the worker pool. Must be called inside a tokio runtime.
    pub fn start(pipeline: Arc<Pipeline>, config: &DispatcherConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        let rx = Arc::new(Mutex::new(rx));
        let shared = Arc::new(Shared {
            pipeline,
            tx,
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            claim_backoff: Duration::from_secs(config.claim_backoff_secs),
        });

        let workers = (0..config.workers.max(1))
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let shared = Arc::clone(&shared);
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(document_id) = next else { break };
                        tracing::trace!(worker, document_id = %document_id, "dispatching step");
                        shared.step(document_id).await;
                        shared.finish_one();
                    }
                })
            })
            .collect();

        Self { shared, workers }
    }

    /// Schedule driver steps for a document.
    pub fn enqueue(&self, document_id: &str) {
        self.shared.enqueue(document_id.to_string());
    }

    /// Number of documents queued, running, or waiting out a backoff.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn shutdown(self) {
        for worker in self.workers {
            worker.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ModelConfig, StageConfig};
    use crate::models::DocumentStatus;
    use crate::notify::MemoryNotifier;
    use crate::provider::{GenerateResponse, ScriptedProvider};
    use crate::storage::FsStorage;
    use crate::store::memory::InMemoryUnitStore;
    use crate::store::UnitStore;
    use tempfile::TempDir;

    fn config(tmp: &TempDir) -> Config {
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
        config.stages = (1..=4)
            .map(|order| StageConfig {
                title: format!("Stage {}", order),
                order,
                prompt: "Analyze".into(),
                system_instruction: String::new(),
                kind: None,
                mandatory_keys: None,
                min_length: None,
            })
            .collect();
        config.dispatcher.workers = 3;
        config
    }

    #[tokio::test]
    async fn drives_documents_to_completion() {
        let tmp = TempDir::new().unwrap();
        let config = config(&tmp);
        let store = Arc::new(InMemoryUnitStore::new());
        let pipeline = Arc::new(Pipeline::new(
            &config,
            store.clone(),
            Arc::new(FsStorage::new(tmp.path().join("store"))),
            Arc::new(ScriptedProvider::new(|_| {
                Ok(GenerateResponse {
                    text: "{\"result\": \"ok\"}".into(),
                    tokens_used: 5,
                })
            })),
            Arc::new(MemoryNotifier::new()),
        ));

        let mut ids = Vec::new();
        for pages in [2, 3] {
            let doc = pipeline
                .ingest("p.pdf", crate::pdf::blank_pdf(pages))
                .await
                .unwrap()
                .document;
            pipeline.start_analysis(&doc.id).await.unwrap();
            ids.push(doc.id);
        }

        let dispatcher = Dispatcher::start(pipeline.clone(), &config.dispatcher);
        for id in &ids {
            dispatcher.enqueue(id);
            dispatcher.enqueue(id);
        }
        tokio::time::timeout(Duration::from_secs(10), dispatcher.wait_idle())
            .await
            .unwrap();

        for id in &ids {
            let doc = store.get_document(id).await.unwrap().unwrap();
            assert_eq!(doc.status, DocumentStatus::Completed);
            let counts = store.unit_counts(id).await.unwrap();
            assert_eq!(counts.completed, 4);
        }
        assert_eq!(dispatcher.in_flight(), 0);
        dispatcher.shutdown();
    }
}
