//! Operator notifications.
//!
//! The pipeline emits alerts (model switches, validation failures, exhausted
//! models, stuck units, finished documents) through the [`Notifier`] trait.
//! Delivery is never on the critical path: [`notify_detached`] spawns the
//! send and only logs a failure.
//!
//! # Implementations
//!
//! - [`LogNotifier`]: writes alerts to the `tracing` log.
//! - [`WebhookNotifier`]: POSTs JSON to a URL, signed with HMAC-SHA256 in
//!   the `X-Dossier-Signature` header when a secret is configured.
//! - [`MemoryNotifier`]: keeps alerts in memory; used by tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;

use crate::config::NotifyConfig;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub severity: Severity,
    /// Machine-readable kind, e.g. `model_switch` or `stuck_unit`.
    pub kind: String,
    pub title: String,
    pub message: String,
    pub metadata: Value,
}

impl Notification {
    pub fn new(
        severity: Severity,
        kind: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
        metadata: Value,
    ) -> Self {
        Self {
            severity,
            kind: kind.into(),
            title: title.into(),
            message: message.into(),
            metadata,
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Build the notifier named in configuration.
pub fn create_notifier(config: &NotifyConfig) -> Result<Arc<dyn Notifier>> {
    match config.kind.as_str() {
        "log" => Ok(Arc::new(LogNotifier)),
        "webhook" => {
            let url = match &config.url {
                Some(url) => url.clone(),
                None => bail!("notify.url must be set when notify.kind is 'webhook'"),
            };
            let secret = std::env::var(&config.secret_env).ok();
            Ok(Arc::new(WebhookNotifier::new(url, secret)?))
        }
        other => bail!("Unknown notify kind: {}", other),
    }
}

/// Send without waiting. Failures are logged and otherwise ignored.
pub fn notify_detached(notifier: &Arc<dyn Notifier>, notification: Notification) {
    let notifier = Arc::clone(notifier);
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                if let Err(e) = notifier.notify(&notification).await {
                    tracing::warn!(kind = %notification.kind, error = %e, "notification delivery failed");
                }
            });
        }
        Err(_) => {
            tracing::warn!(kind = %notification.kind, "no async runtime; notification dropped");
        }
    }
}

pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, n: &Notification) -> Result<()> {
        match n.severity {
            Severity::Info => {
                tracing::info!(kind = %n.kind, metadata = %n.metadata, "{}: {}", n.title, n.message)
            }
            Severity::Warning => {
                tracing::warn!(kind = %n.kind, metadata = %n.metadata, "{}: {}", n.title, n.message)
            }
            Severity::Critical => {
                tracing::error!(kind = %n.kind, metadata = %n.metadata, "{}: {}", n.title, n.message)
            }
        }
        Ok(())
    }
}

pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    secret: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: String, secret: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url,
            secret,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, n: &Notification) -> Result<()> {
        let body = serde_json::to_vec(n)?;
        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json");
        if let Some(secret) = &self.secret {
            request = request.header("X-Dossier-Signature", sign(secret.as_bytes(), &body)?);
        }
        let response = request.body(body).send().await?;
        if !response.status().is_success() {
            bail!("webhook returned HTTP {}", response.status());
        }
        Ok(())
    }
}

/// `sha256=<hex hmac>` over the request body.
pub fn sign(secret: &[u8], body: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| anyhow::anyhow!("invalid webhook secret: {}", e))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Collects notifications in memory.
#[derive(Default)]
pub struct MemoryNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn count_kind(&self, kind: &str) -> usize {
        self.sent().iter().filter(|n| n.kind == kind).count()
    }

    /// Notifications of `kind` once at least `count` have arrived, or
    /// whatever arrived within about a quarter second. Detached deliveries
    /// land asynchronously.
    pub async fn wait_for_kind(&self, kind: &str, count: usize) -> Vec<Notification> {
        for _ in 0..50 {
            if self.count_kind(kind) >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.sent().into_iter().filter(|n| n.kind == kind).collect()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, n: &Notification) -> Result<()> {
        self.sent
            .lock()
            .map_err(|_| anyhow::anyhow!("notifier lock poisoned"))?
            .push(n.clone());
        Ok(())
    }
}
