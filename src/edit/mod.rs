//! The edit protocol spoken between the generation oracle and the applier.
//!
//! A response is a JSON object with a `files` list; every entry is one of
//! `create`, `modify` (full overwrite) or `edit` (ordered search/replace).
//! Parsing is strict: anything that does not deserialize into
//! [`EditResponse`] is rejected as a typed [`ProtocolError`].

pub mod apply;

pub use apply::{ApplyError, ApplyFailure, ApplyOutcome, EditApplier, MatchPolicy};

use crate::budget::{BudgetPlan, ExtractionLevel};
use crate::failure::{FailureCode, StructuredFailure};
use crate::util::{normalize_relative_path, truncate};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

const BINARY_FILE_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "ico", "bmp", "pdf", "zip", "gz", "tar", "tgz", "7z",
    "woff", "woff2", "ttf", "otf", "mp3", "mp4", "mov", "wasm", "so", "dylib", "dll", "exe",
    "class", "jar", "bin",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchReplace {
    pub search: String,
    pub replace: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum FileOperation {
    Create { path: PathBuf, content: String },
    Modify { path: PathBuf, content: String },
    Edit { path: PathBuf, edits: Vec<SearchReplace> },
}

impl FileOperation {
    pub fn path(&self) -> &Path {
        match self {
            FileOperation::Create { path, .. }
            | FileOperation::Modify { path, .. }
            | FileOperation::Edit { path, .. } => path,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            FileOperation::Create { .. } => "create",
            FileOperation::Modify { .. } => "modify",
            FileOperation::Edit { .. } => "edit",
        }
    }

    fn normalize_path(&mut self) {
        let path = match self {
            FileOperation::Create { path, .. }
            | FileOperation::Modify { path, .. }
            | FileOperation::Edit { path, .. } => path,
        };
        *path = normalize_relative_path(&path.to_string_lossy());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditResponse {
    pub files: Vec<FileOperation>,
    #[serde(default)]
    pub explanation: String,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("response is not valid edit-protocol JSON: {0}")]
    Unparseable(String),
    #[error("response contains no file operations")]
    Empty,
    #[error("{0} appears more than once in one response")]
    DuplicatePath(PathBuf),
    #[error("edit for {0} has no search/replace pairs")]
    EmptyEdits(PathBuf),
    #[error("edit {index} for {path} has an empty search string")]
    EmptySearch { path: PathBuf, index: usize },
    #[error("{action} would overwrite {path}, which was only shown as {seen}")]
    UnsafeOverwrite {
        path: PathBuf,
        action: &'static str,
        seen: &'static str,
    },
    #[error("{0} is outside the files this round may change")]
    OutOfScope(PathBuf),
    #[error("path {path} rejected: {reason}")]
    PathRejected { path: PathBuf, reason: String },
}

impl From<&ProtocolError> for StructuredFailure {
    fn from(err: &ProtocolError) -> Self {
        let code = match err {
            ProtocolError::Unparseable(_) => FailureCode::CodegenUnparseableResponse,
            ProtocolError::Empty => FailureCode::CodegenEmptyResponse,
            ProtocolError::DuplicatePath(_)
            | ProtocolError::EmptyEdits(_)
            | ProtocolError::EmptySearch { .. } => FailureCode::CodegenProtocolViolation,
            ProtocolError::UnsafeOverwrite { .. } => FailureCode::CodegenUnsafeOverwrite,
            ProtocolError::OutOfScope(_) => FailureCode::CodegenScopeViolation,
            ProtocolError::PathRejected { .. } => FailureCode::FilePathRejected,
        };
        StructuredFailure::new(code, err.to_string())
    }
}

/// Strip markdown code fences from a response
fn strip_markdown_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let clean = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    let clean = clean.trim_end();
    clean.strip_suffix("```").unwrap_or(clean).trim()
}

/// Parse an oracle reply into an [`EditResponse`].
///
/// Fenced JSON and leading/trailing prose around a single top-level object
/// are tolerated. Nothing inside the object is rewritten.
pub fn parse_response(raw: &str) -> Result<EditResponse, ProtocolError> {
    let clean = strip_markdown_fences(raw);
    if clean.is_empty() {
        return Err(ProtocolError::Empty);
    }
    let json = match (clean.find('{'), clean.rfind('}')) {
        (Some(start), Some(end)) if start <= end => &clean[start..=end],
        _ => {
            return Err(ProtocolError::Unparseable(format!(
                "no JSON object found in {:?}",
                truncate(clean, 120)
            )))
        }
    };
    let mut response: EditResponse =
        serde_json::from_str(json).map_err(|e| ProtocolError::Unparseable(e.to_string()))?;
    for op in &mut response.files {
        op.normalize_path();
    }
    Ok(response)
}

/// What the oracle has been shown, for deciding which overwrites are safe.
#[derive(Debug, Clone, Default)]
pub struct ProtocolContext {
    repo_root: PathBuf,
    delivered: HashMap<PathBuf, ExtractionLevel>,
    scope: Option<HashSet<PathBuf>>,
}

impl ProtocolContext {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            ..Self::default()
        }
    }

    pub fn from_plan(repo_root: impl Into<PathBuf>, plan: &BudgetPlan) -> Self {
        let mut ctx = Self::new(repo_root);
        for allocation in &plan.allocations {
            ctx.mark_delivered(allocation.candidate.path.clone(), allocation.level());
        }
        ctx
    }

    /// Record that `path` was shown at `level`. A higher level wins.
    pub fn mark_delivered(&mut self, path: impl Into<PathBuf>, level: ExtractionLevel) {
        let entry = self.delivered.entry(path.into()).or_insert(level);
        if level > *entry {
            *entry = level;
        }
    }

    /// Restrict the next response to `paths`.
    pub fn restrict_to<I, P>(&mut self, paths: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.scope = Some(paths.into_iter().map(Into::into).collect());
    }

    pub fn delivered_level(&self, path: &Path) -> Option<ExtractionLevel> {
        self.delivered.get(path).copied()
    }

    fn exists(&self, path: &Path) -> bool {
        self.repo_root.join(path).exists()
    }

    /// Check a parsed response before anything is written.
    pub fn check(&self, response: &EditResponse) -> Result<(), ProtocolError> {
        if response.files.is_empty() {
            return Err(ProtocolError::Empty);
        }

        let mut seen = HashSet::new();
        for op in &response.files {
            let path = op.path();
            check_path_shape(path)?;
            if !seen.insert(path.to_path_buf()) {
                return Err(ProtocolError::DuplicatePath(path.to_path_buf()));
            }
            if let Some(scope) = &self.scope {
                if !scope.contains(path) {
                    return Err(ProtocolError::OutOfScope(path.to_path_buf()));
                }
            }

            match op {
                FileOperation::Edit { edits, .. } => {
                    if edits.is_empty() {
                        return Err(ProtocolError::EmptyEdits(path.to_path_buf()));
                    }
                    if let Some(index) = edits.iter().position(|e| e.search.is_empty()) {
                        return Err(ProtocolError::EmptySearch {
                            path: path.to_path_buf(),
                            index: index + 1,
                        });
                    }
                }
                FileOperation::Modify { .. } | FileOperation::Create { .. } => {
                    let level = self.delivered_level(path);
                    let seen_full = level == Some(ExtractionLevel::Full);
                    if !seen_full && self.exists(path) {
                        return Err(ProtocolError::UnsafeOverwrite {
                            path: path.to_path_buf(),
                            action: op.action(),
                            seen: level.map(|l| l.label()).unwrap_or("nothing"),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

fn check_path_shape(path: &Path) -> Result<(), ProtocolError> {
    let reject = |reason: &str| ProtocolError::PathRejected {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };
    if path.as_os_str().is_empty() {
        return Err(reject("empty path"));
    }
    if path.is_absolute() {
        return Err(reject("absolute paths are not allowed"));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(reject("parent traversal is not allowed"));
    }
    if is_binary_extension(path) {
        return Err(reject("binary files cannot be written"));
    }
    Ok(())
}

pub fn is_binary_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| BINARY_FILE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
