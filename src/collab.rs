//! Collaborators the orchestrator talks to but does not own: the approval
//! gate in front of a run and the learning sink behind it.

use crate::failure::StructuredFailure;
use crate::orchestrator::ExecutionResult;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const HISTORY_FILE: &str = ".cosmos/forge/history.jsonl";

// ═══════════════════════════════════════════════════════════════════════════
//  Approval
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub task_id: String,
    pub instruction: String,
    /// Edit targets that do not exist yet although the task did not ask for new files.
    pub new_files: Vec<PathBuf>,
    pub explicit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Aborted { reason: String },
}

#[async_trait]
pub trait ApprovalGate: Send + Sync {
    async fn await_decision(&self, request: &ApprovalRequest) -> ApprovalDecision;
}

pub struct AutoApprove;

#[async_trait]
impl ApprovalGate for AutoApprove {
    async fn await_decision(&self, request: &ApprovalRequest) -> ApprovalDecision {
        tracing::debug!(task_id = %request.task_id, "auto-approved");
        ApprovalDecision::Approved
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  Learning
// ═══════════════════════════════════════════════════════════════════════════

/// One finished run, as handed to the learning store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningRecord {
    pub task_id: String,
    pub recorded_at: DateTime<Utc>,
    pub result: ExecutionResult,
    pub failure: Option<StructuredFailure>,
    /// Edit targets the caller expected to change.
    pub predicted_files: Vec<PathBuf>,
    /// Files the run actually wrote.
    pub actual_files: Vec<PathBuf>,
}

impl LearningRecord {
    pub fn from_result(result: &ExecutionResult, predicted_files: Vec<PathBuf>) -> Self {
        Self {
            task_id: result.task_id.clone(),
            recorded_at: Utc::now(),
            failure: result.failure.clone(),
            actual_files: result.touched_files(),
            predicted_files,
            result: result.clone(),
        }
    }

    /// Predicted files the run never touched.
    pub fn missed(&self) -> Vec<&PathBuf> {
        self.predicted_files
            .iter()
            .filter(|p| !self.actual_files.contains(p))
            .collect()
    }
}

pub trait LearningSink: Send + Sync {
    fn record(&self, record: &LearningRecord) -> anyhow::Result<()>;
}

pub struct NullLearningSink;

impl LearningSink for NullLearningSink {
    fn record(&self, _record: &LearningRecord) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Appends one JSON line per run to `.cosmos/forge/history.jsonl`.
pub struct JsonlLearningSink {
    path: PathBuf,
}

impl JsonlLearningSink {
    pub fn new(repo_root: &Path) -> Self {
        Self {
            path: repo_root.join(HISTORY_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> anyhow::Result<Vec<LearningRecord>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to read {}", self.path.display()))
            }
        };
        // Skip lines a crashed writer may have left half-written.
        Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}

impl LearningSink for JsonlLearningSink {
    fn record(&self, record: &LearningRecord) -> anyhow::Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let mut line = serde_json::to_string(record).context("Failed to serialize record")?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        file.lock_exclusive()
            .with_context(|| format!("Failed to lock {}", self.path.display()))?;
        let written = file.write_all(line.as_bytes());
        let _ = FileExt::unlock(&file);
        written.with_context(|| format!("Failed to append to {}", self.path.display()))
    }
}
