//! Core data models used throughout the dossier pipeline.
//!
//! These types represent the documents, analysis units, chunks, queue items
//! and audit records that flow through claiming, execution, consolidation
//! and monitoring.

use serde::{Deserialize, Serialize};

/// Declares a string-backed status enum with `as_str` / `parse` helpers
/// matching the TEXT columns in SQLite.
macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }

            pub fn parse(s: &str) -> anyhow::Result<Self> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => anyhow::bail!(
                        "unknown {} value: '{}'",
                        stringify!($name),
                        other
                    ),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

text_enum!(
    /// Lifecycle of an uploaded process file.
    ///
    /// `created → analyzing → completed`, with `error` reachable from
    /// `analyzing` when uploads or unit execution are exhausted.
    DocumentStatus {
        Created => "created",
        Analyzing => "analyzing",
        Completed => "completed",
        Error => "error",
    }
);

text_enum!(
    /// Status of one (document, stage) unit.
    UnitStatus {
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
    }
);

text_enum!(
    /// State of a chunk's file on the provider's staging area.
    RemoteFileState {
        Uploading => "uploading",
        Processing => "processing",
        Active => "active",
        Failed => "failed",
    }
);

text_enum!(
    /// Status of a planned (chunk, stage) work item.
    QueueStatus {
        Pending => "pending",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
    }
);

text_enum!(
    AttemptOutcome {
        Success => "success",
        Failed => "failed",
    }
);

text_enum!(
    /// Which kind of model call an attempt belonged to.
    ExecutionPhase {
        Direct => "direct",
        Map => "map",
        Reduce => "reduce",
    }
);

/// One uploaded process file.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub file_name: String,
    pub storage_path: String,
    pub content_hash: String,
    pub byte_size: i64,
    pub page_count: i64,
    pub is_chunked: bool,
    pub status: DocumentStatus,
    /// Short, user-facing failure reason. Full diagnostics go to alerts.
    pub error_reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One (document, analysis stage) pair.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisUnit {
    pub id: String,
    pub document_id: String,
    pub stage_title: String,
    pub execution_order: i64,
    pub status: UnitStatus,
    pub prompt: String,
    pub system_instruction: String,
    pub result_json: Option<String>,
    pub execution_time_ms: Option<i64>,
    pub tokens_used: Option<i64>,
    pub model_used: Option<String>,
    pub last_error: Option<String>,
    pub error_diagnostics: Option<String>,
    pub processing_started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub created_at: i64,
}

/// A contiguous page range of a document.
#[derive(Debug, Clone, Serialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub total_chunks: i64,
    /// First page, 1-based, inclusive.
    pub start_page: i64,
    /// Last page, 1-based, inclusive.
    pub end_page: i64,
    pub storage_path: String,
    pub byte_size: i64,
    pub remote_name: Option<String>,
    /// Set only while `remote_state` is `Active`.
    pub remote_uri: Option<String>,
    pub remote_state: RemoteFileState,
    pub expires_at: Option<i64>,
    pub upload_attempts: i64,
}

impl Chunk {
    pub fn page_count(&self) -> i64 {
        self.end_page - self.start_page + 1
    }

    /// Whether the chunk already carries a usable remote handle at `now`.
    pub fn is_remote_ready(&self, now: i64) -> bool {
        self.remote_state == RemoteFileState::Active
            && self.remote_uri.is_some()
            && self.expires_at.map_or(true, |exp| exp > now)
    }
}

/// A planned (chunk, stage) work item.
#[derive(Debug, Clone, Serialize)]
pub struct QueueItem {
    pub id: String,
    pub document_id: String,
    pub chunk_id: String,
    pub chunk_index: i64,
    pub unit_id: String,
    pub priority: i64,
    pub status: QueueStatus,
    pub attempt_count: i64,
    pub max_attempts: i64,
    pub partial_result: Option<String>,
    pub tokens_used: Option<i64>,
    pub last_error: Option<String>,
}

/// Append-only record of one model invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ModelAttempt {
    pub id: String,
    pub document_id: String,
    pub unit_id: String,
    pub chunk_index: Option<i64>,
    pub phase: ExecutionPhase,
    pub model_id: String,
    pub attempt_number: i64,
    pub outcome: AttemptOutcome,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: i64,
    pub tokens_used: Option<i64>,
    pub created_at: i64,
}

/// Throttle record for stuck-unit alerts.
#[derive(Debug, Clone, Serialize)]
pub struct StuckNotification {
    pub id: String,
    pub document_id: String,
    pub chunk_id: Option<String>,
    pub unit_id: String,
    pub minutes_stuck: i64,
    pub sent_at: i64,
    pub resolved_at: Option<i64>,
}

/// A unit found in `processing` for longer than the monitor threshold.
#[derive(Debug, Clone)]
pub struct StuckUnit {
    pub unit_id: String,
    pub document_id: String,
    pub stage_title: String,
    pub processing_started_at: i64,
    pub page_count: i64,
}

/// Per-status unit counts for one document.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UnitCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

impl UnitCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed
    }

    /// All units completed and at least one exists.
    pub fn all_completed(&self) -> bool {
        self.total() > 0 && self.completed == self.total()
    }
}
