//! Stuck-unit monitor.
//!
//! Periodically looks for units that have been `processing` longer than
//! `monitor.stuck_after_minutes` on documents below `monitor.max_pages`
//! pages. At most one alert per document is sent per
//! `monitor.throttle_minutes`; each alert leaves a throttle row behind.
//! The monitor only detects and alerts. It never resets or re-runs a unit.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use serde_json::json;

use crate::config::MonitorConfig;
use crate::models::StuckNotification;
use crate::notify::{Notification, Notifier, Severity};
use crate::store::UnitStore;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub stuck: usize,
    pub alerted: usize,
    pub throttled: usize,
}

pub struct StuckMonitor {
    store: Arc<dyn UnitStore>,
    notifier: Arc<dyn Notifier>,
    config: MonitorConfig,
}

impl StuckMonitor {
    pub fn new(store: Arc<dyn UnitStore>, notifier: Arc<dyn Notifier>, config: MonitorConfig) -> Self {
        Self {
            store,
            notifier,
            config,
        }
    }

    /// One detection pass at time `now` (unix seconds).
    pub async fn scan(&self, now: i64) -> Result<ScanReport> {
        let threshold = now - self.config.stuck_after_minutes * 60;
        let stuck = self
            .store
            .list_stuck_units(threshold, self.config.max_pages)
            .await?;

        let mut report = ScanReport {
            stuck: stuck.len(),
            ..Default::default()
        };

        let throttle_since = now - self.config.throttle_minutes * 60;
        for unit in stuck {
            if self
                .store
                .recent_stuck_notification(&unit.document_id, throttle_since)
                .await?
                .is_some()
            {
                report.throttled += 1;
                continue;
            }

            let minutes_stuck = (now - unit.processing_started_at) / 60;
            let notification = Notification::new(
                Severity::Warning,
                "stuck_unit",
                "Analysis stuck",
                format!(
                    "'{}' has been processing for {} minutes",
                    unit.stage_title, minutes_stuck
                ),
                json!({
                    "document_id": unit.document_id,
                    "unit_id": unit.unit_id,
                    "stage": unit.stage_title,
                    "minutes_stuck": minutes_stuck,
                    "page_count": unit.page_count,
                }),
            );
            if let Err(e) = self.notifier.notify(&notification).await {
                tracing::warn!(document_id = %unit.document_id, error = %e, "stuck alert not delivered");
                continue;
            }

            self.store
                .record_stuck_notification(&StuckNotification {
                    id: uuid::Uuid::new_v4().to_string(),
                    document_id: unit.document_id.clone(),
                    chunk_id: None,
                    unit_id: unit.unit_id.clone(),
                    minutes_stuck,
                    sent_at: now,
                    resolved_at: None,
                })
                .await?;
            report.alerted += 1;
            tracing::warn!(
                document_id = %unit.document_id,
                unit_id = %unit.unit_id,
                stage = %unit.stage_title,
                minutes_stuck,
                "stuck unit alerted"
            );
        }

        Ok(report)
    }

    /// Close open alerts whose unit completed.
    pub async fn resolve_completed(&self, now: i64) -> Result<u64> {
        let resolved = self.store.resolve_stuck_notifications(now).await?;
        if resolved > 0 {
            tracing::info!(resolved, "stuck alerts resolved");
        }
        Ok(resolved)
    }

    /// Scan and resolve every `interval_secs` until the task is dropped.
    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        loop {
            ticker.tick().await;
            let now = chrono::Utc::now().timestamp();
            match self.scan(now).await {
                Ok(report) if report.stuck > 0 => {
                    tracing::info!(stuck = report.stuck, alerted = report.alerted, throttled = report.throttled, "monitor scan")
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "monitor scan failed"),
            }
            if let Err(e) = self.resolve_completed(now).await {
                tracing::error!(error = %e, "resolving stuck alerts failed");
            }
        }
    }
}
