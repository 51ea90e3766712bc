use serde::{Deserialize, Serialize};
use std::fmt;

/// Acquisition stages tracked per target in the relational store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Metadata,
    Audio,
    Transcript,
}

impl Stage {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Metadata => "metadata",
            Self::Audio => "audio",
            Self::Transcript => "transcript",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single stage for a single target.
///
/// Upserted on every transition; this record, not scheduler memory, is the
/// authoritative answer to "has this been acquired".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Queued,
    InProgress,
    Completed,
    Failed,
    Blocked,
}

impl StageState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "blocked" => Some(Self::Blocked),
            _ => None,
        }
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input for a stage-status upsert.
#[derive(Debug, Clone)]
pub struct StageStatusInput {
    pub target_id: String,
    pub stage: Stage,
    pub status: StageState,
    pub assigned_worker: Option<String>,
    /// Free-form JSON blob (local file path, error text, ...).
    pub metadata: Option<serde_json::Value>,
}

impl StageStatusInput {
    #[must_use]
    pub fn new(target_id: impl Into<String>, stage: Stage, status: StageState) -> Self {
        Self {
            target_id: target_id.into(),
            stage,
            status,
            assigned_worker: None,
            metadata: None,
        }
    }

    #[must_use]
    pub fn worker(mut self, worker: impl Into<String>) -> Self {
        self.assigned_worker = Some(worker.into());
        self
    }

    #[must_use]
    pub fn metadata(mut self, value: serde_json::Value) -> Self {
        self.metadata = Some(value);
        self
    }
}
