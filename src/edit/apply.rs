//! Applies checked file operations to the working tree.
//!
//! Every file is all-or-nothing: an edit set is validated in full against an
//! in-memory working copy before the single write, and writes go through a
//! temp file plus rename. Files are applied in response order; a failure
//! stops the run and reports which files were already written.

use super::{is_binary_extension, FileOperation, SearchReplace};
use crate::failure::{FailureCode, StructuredFailure};
use crate::util::{resolve_repo_path_allow_new, truncate};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

const LOCK_FILE: &str = ".cosmos/forge.lock";
const LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const LOCK_RETRY: Duration = Duration::from_millis(50);
const PREVIEW_CHARS: usize = 100;

/// What to do when a search string occurs more than once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    /// Replace the first occurrence.
    #[default]
    FirstOccurrence,
    /// Reject the file's edit set.
    RequireUnique,
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("edit {index}: search string not found in {path}\nSearched for: {preview:?}")]
    NoMatch {
        path: PathBuf,
        index: usize,
        preview: String,
    },
    #[error("edit {index}: search string matches {count} times in {path} (must be unique)\nSearched for: {preview:?}")]
    Ambiguous {
        path: PathBuf,
        index: usize,
        count: usize,
        preview: String,
    },
    #[error("edit {index}: search string is empty for non-empty {path}")]
    EmptySearch { path: PathBuf, index: usize },
    #[error("file not found: {0}")]
    NotFound(PathBuf),
    #[error("path {path} rejected: {reason}")]
    PathRejected { path: PathBuf, reason: String },
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to take the working tree lock: {0}")]
    Lock(String),
}

impl ApplyError {
    pub fn path(&self) -> Option<&Path> {
        match self {
            ApplyError::NoMatch { path, .. }
            | ApplyError::Ambiguous { path, .. }
            | ApplyError::EmptySearch { path, .. }
            | ApplyError::PathRejected { path, .. }
            | ApplyError::Read { path, .. }
            | ApplyError::Write { path, .. } => Some(path),
            ApplyError::NotFound(path) => Some(path),
            ApplyError::Lock(_) => None,
        }
    }
}

impl From<&ApplyError> for StructuredFailure {
    fn from(err: &ApplyError) -> Self {
        let (code, remediation) = match err {
            ApplyError::NoMatch { .. } => (
                FailureCode::FileEditNoMatch,
                Some("Copy the search text verbatim from the current file, including whitespace."),
            ),
            ApplyError::Ambiguous { .. } => (
                FailureCode::FileEditAmbiguous,
                Some("Extend the search text with surrounding lines until it is unique."),
            ),
            ApplyError::EmptySearch { .. } => (FailureCode::CodegenProtocolViolation, None),
            ApplyError::NotFound(_) => (FailureCode::FileNotFound, None),
            ApplyError::PathRejected { .. } => (FailureCode::FilePathRejected, None),
            ApplyError::Read { .. } => (FailureCode::InfraIo, None),
            ApplyError::Write { .. } => (FailureCode::FileWriteFailed, None),
            ApplyError::Lock(_) => (FailureCode::InfraIo, None),
        };
        let failure = StructuredFailure::new(code, err.to_string());
        match remediation {
            Some(text) => failure.with_remediation(text),
            None => failure,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub created: Vec<PathBuf>,
    pub modified: Vec<PathBuf>,
    pub edited: Vec<PathBuf>,
}

impl ApplyOutcome {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.modified.is_empty() && self.edited.is_empty()
    }

    /// Every path written, in apply order per kind.
    pub fn touched(&self) -> Vec<PathBuf> {
        self.created
            .iter()
            .chain(&self.modified)
            .chain(&self.edited)
            .cloned()
            .collect()
    }

    /// Fold a later round into this one. A path keeps its first kind.
    pub fn absorb(&mut self, later: ApplyOutcome) {
        let known: std::collections::HashSet<PathBuf> = self.touched().into_iter().collect();
        let fresh = |paths: Vec<PathBuf>| -> Vec<PathBuf> {
            paths.into_iter().filter(|p| !known.contains(p)).collect()
        };
        self.created.extend(fresh(later.created));
        self.modified.extend(fresh(later.modified));
        self.edited.extend(fresh(later.edited));
    }
}

/// An apply run that stopped early. `applied` lists files already written.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct ApplyFailure {
    pub applied: ApplyOutcome,
    #[source]
    pub error: ApplyError,
}

pub struct EditApplier {
    repo_root: PathBuf,
    policy: MatchPolicy,
}

struct TreeLock {
    file: fs::File,
}

impl Drop for TreeLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl EditApplier {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            policy: MatchPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: MatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> MatchPolicy {
        self.policy
    }

    pub fn apply(&self, operations: &[FileOperation]) -> Result<ApplyOutcome, ApplyFailure> {
        let mut outcome = ApplyOutcome::default();
        let _lock = match self.lock() {
            Ok(lock) => lock,
            Err(error) => {
                return Err(ApplyFailure {
                    applied: outcome,
                    error,
                })
            }
        };

        for op in operations {
            match self.apply_one(op) {
                Ok(false) => {
                    tracing::debug!(path = %op.path().display(), "content unchanged, nothing written");
                }
                Ok(true) => {
                    let path = op.path().to_path_buf();
                    match op {
                        FileOperation::Create { .. } => outcome.created.push(path),
                        FileOperation::Modify { .. } => outcome.modified.push(path),
                        FileOperation::Edit { .. } => outcome.edited.push(path),
                    }
                }
                Err(error) => {
                    tracing::warn!(
                        path = %op.path().display(),
                        action = op.action(),
                        applied = outcome.touched().len(),
                        error = %error,
                        "apply stopped"
                    );
                    return Err(ApplyFailure {
                        applied: outcome,
                        error,
                    });
                }
            }
        }
        tracing::debug!(files = outcome.touched().len(), "apply complete");
        Ok(outcome)
    }

    /// Returns false when the result is identical to the file on disk.
    fn apply_one(&self, op: &FileOperation) -> Result<bool, ApplyError> {
        let rel = op.path();
        if is_binary_extension(rel) {
            return Err(ApplyError::PathRejected {
                path: rel.to_path_buf(),
                reason: "binary files cannot be written".to_string(),
            });
        }
        let resolved = resolve_repo_path_allow_new(&self.repo_root, rel).map_err(|reason| {
            ApplyError::PathRejected {
                path: rel.to_path_buf(),
                reason,
            }
        })?;
        let absolute = resolved.absolute;

        let original = match fs::read_to_string(&absolute) {
            Ok(content) => Some(content),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(source) => {
                return Err(ApplyError::Read {
                    path: rel.to_path_buf(),
                    source,
                })
            }
        };

        let next = match op {
            FileOperation::Create { content, .. } | FileOperation::Modify { content, .. } => {
                match &original {
                    Some(before) => normalize_generated_content(before, content.clone(), false),
                    None => content.clone(),
                }
            }
            FileOperation::Edit { edits, .. } => {
                let Some(before) = &original else {
                    return Err(ApplyError::NotFound(rel.to_path_buf()));
                };
                apply_edits(before, edits, self.policy, rel)?
            }
        };

        if original.as_deref() == Some(next.as_str()) {
            return Ok(false);
        }
        write_atomic(&absolute, &next).map_err(|source| ApplyError::Write {
            path: rel.to_path_buf(),
            source,
        })?;
        Ok(true)
    }

    fn lock(&self) -> Result<TreeLock, ApplyError> {
        let lock_path = self.repo_root.join(LOCK_FILE);
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).map_err(|e| ApplyError::Lock(e.to_string()))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| ApplyError::Lock(e.to_string()))?;

        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => return Ok(TreeLock { file }),
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    if start.elapsed() >= LOCK_TIMEOUT {
                        return Err(ApplyError::Lock(format!(
                            "timed out after {}s",
                            LOCK_TIMEOUT.as_secs()
                        )));
                    }
                    std::thread::sleep(LOCK_RETRY);
                }
                Err(err) => return Err(ApplyError::Lock(err.to_string())),
            }
        }
    }
}

fn preview(search: &str) -> String {
    truncate(search, PREVIEW_CHARS)
}

/// Apply ordered search/replace pairs to `content` in memory.
///
/// Each pair is matched against the working copy produced by the pairs
/// before it. Nothing is returned unless every pair matched.
pub fn apply_edits(
    content: &str,
    edits: &[SearchReplace],
    policy: MatchPolicy,
    path: &Path,
) -> Result<String, ApplyError> {
    let mut working = content.to_string();
    for (i, edit) in edits.iter().enumerate() {
        let index = i + 1;
        if edit.search.is_empty() {
            return Err(ApplyError::EmptySearch {
                path: path.to_path_buf(),
                index,
            });
        }

        let count = working.matches(edit.search.as_str()).count();
        if count == 0 {
            return Err(ApplyError::NoMatch {
                path: path.to_path_buf(),
                index,
                preview: preview(&edit.search),
            });
        }
        if count > 1 && policy == MatchPolicy::RequireUnique {
            return Err(ApplyError::Ambiguous {
                path: path.to_path_buf(),
                index,
                count,
                preview: preview(&edit.search),
            });
        }

        working = working.replacen(edit.search.as_str(), &edit.replace, 1);
    }
    Ok(working)
}

/// Keep the original file's trailing-newline convention.
pub fn normalize_generated_content(original: &str, content: String, is_new_file: bool) -> String {
    if is_new_file {
        return content;
    }

    let mut normalized = content;
    if original.ends_with('\n') {
        if !normalized.ends_with('\n') {
            if original.ends_with("\r\n") {
                normalized.push_str("\r\n");
            } else {
                normalized.push('\n');
            }
        }
    } else {
        while normalized.ends_with('\n') {
            let cut = if normalized.ends_with("\r\n") { 2 } else { 1 };
            normalized.truncate(normalized.len() - cut);
        }
    }
    normalized
}

fn write_atomic(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = path.with_file_name(format!(".{}.forge-tmp", file_name));
    fs::write(&tmp_path, content)?;

    // Keep the mode of the file being replaced.
    #[cfg(unix)]
    {
        if let Ok(meta) = fs::metadata(path) {
            let _ = fs::set_permissions(&tmp_path, meta.permissions());
        }
    }

    #[cfg(windows)]
    {
        if path.exists() {
            if let Err(err) = fs::remove_file(path) {
                let _ = fs::remove_file(&tmp_path);
                return Err(err);
            }
        }
    }

    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn edit(search: &str, replace: &str) -> SearchReplace {
        SearchReplace {
            search: search.to_string(),
            replace: replace.to_string(),
        }
    }

    #[test]
    fn pairs_see_earlier_replacements() {
        let out = apply_edits(
            "let a = 1;\n",
            &[edit("a = 1", "b = 1"), edit("b = 1", "b = 2")],
            MatchPolicy::FirstOccurrence,
            Path::new("x.ts"),
        )
        .unwrap();
        assert_eq!(out, "let b = 2;\n");
    }

    #[test]
    fn first_occurrence_only() {
        let out = apply_edits(
            "x(); x();",
            &[edit("x()", "y()")],
            MatchPolicy::FirstOccurrence,
            Path::new("a.js"),
        )
        .unwrap();
        assert_eq!(out, "y(); x();");
    }

    #[test]
    fn require_unique_rejects_repeats() {
        let err = apply_edits(
            "x(); x();",
            &[edit("x()", "y()")],
            MatchPolicy::RequireUnique,
            Path::new("a.js"),
        )
        .unwrap_err();
        assert!(matches!(err, ApplyError::Ambiguous { count: 2, .. }));
        assert_eq!(
            StructuredFailure::from(&err).code,
            FailureCode::FileEditAmbiguous
        );
    }

    #[test]
    fn missing_search_leaves_file_untouched() {
        let dir = tempdir().unwrap();
        let original = "const a = 1;\nconst b = 2;\n";
        std::fs::write(dir.path().join("a.ts"), original).unwrap();
        let applier = EditApplier::new(dir.path());
        let failure = applier
            .apply(&[FileOperation::Edit {
                path: PathBuf::from("a.ts"),
                edits: vec![edit("const a = 1;", "const a = 10;"), edit("const c", "x")],
            }])
            .unwrap_err();
        assert!(failure.applied.is_empty());
        assert!(matches!(failure.error, ApplyError::NoMatch { index: 2, .. }));
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.ts")).unwrap(),
            original
        );
    }

    #[test]
    fn second_application_of_same_edits_fails() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.ts"), "greet('hi');\n").unwrap();
        let applier = EditApplier::new(dir.path());
        let ops = [FileOperation::Edit {
            path: PathBuf::from("a.ts"),
            edits: vec![edit("greet('hi')", "greet('hello')")],
        }];
        let first = applier.apply(&ops).unwrap();
        assert_eq!(first.edited, vec![PathBuf::from("a.ts")]);
        let second = applier.apply(&ops).unwrap_err();
        assert_eq!(
            StructuredFailure::from(&second.error).code,
            FailureCode::FileEditNoMatch
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.ts")).unwrap(),
            "greet('hello');\n"
        );
    }

    #[test]
    fn earlier_files_stay_applied_when_a_later_file_fails() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("b.ts"), "b\n").unwrap();
        let applier = EditApplier::new(dir.path());
        let failure = applier
            .apply(&[
                FileOperation::Create {
                    path: PathBuf::from("src/new.ts"),
                    content: "export {};\n".into(),
                },
                FileOperation::Edit {
                    path: PathBuf::from("b.ts"),
                    edits: vec![edit("missing", "x")],
                },
            ])
            .unwrap_err();
        assert_eq!(failure.applied.created, vec![PathBuf::from("src/new.ts")]);
        assert!(dir.path().join("src/new.ts").exists());
        assert_eq!(std::fs::read_to_string(dir.path().join("b.ts")).unwrap(), "b\n");
    }

    #[test]
    fn edit_on_missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let failure = EditApplier::new(dir.path())
            .apply(&[FileOperation::Edit {
                path: PathBuf::from("nope.ts"),
                edits: vec![edit("a", "b")],
            }])
            .unwrap_err();
        assert_eq!(
            StructuredFailure::from(&failure.error).code,
            FailureCode::FileNotFound
        );
    }

    #[test]
    fn modify_keeps_trailing_newline_convention() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("w.ts"), "a\r\n").unwrap();
        EditApplier::new(dir.path())
            .apply(&[FileOperation::Modify {
                path: PathBuf::from("w.ts"),
                content: "b".into(),
            }])
            .unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("w.ts")).unwrap(), "b\r\n");
    }

    #[test]
    fn identical_content_is_not_reported_as_written() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("same.ts"), "export const a = 1;\n").unwrap();
        std::fs::write(dir.path().join("other.ts"), "let b = 1;\n").unwrap();
        let outcome = EditApplier::new(dir.path())
            .apply(&[
                FileOperation::Modify {
                    path: PathBuf::from("same.ts"),
                    content: "export const a = 1;\n".into(),
                },
                FileOperation::Edit {
                    path: PathBuf::from("other.ts"),
                    edits: vec![edit("b = 1", "b = 1")],
                },
            ])
            .unwrap();
        assert!(outcome.is_empty(), "{:?}", outcome);
        assert!(outcome.touched().is_empty());
    }

    #[test]
    fn normalize_strips_added_newlines() {
        assert_eq!(normalize_generated_content("a", "b\n\n".into(), false), "b");
        assert_eq!(normalize_generated_content("a", "b\n".into(), true), "b\n");
    }

    #[test]
    fn outcome_absorb_keeps_first_kind() {
        let mut outcome = ApplyOutcome {
            created: vec![PathBuf::from("a.ts")],
            ..ApplyOutcome::default()
        };
        outcome.absorb(ApplyOutcome {
            edited: vec![PathBuf::from("a.ts"), PathBuf::from("b.ts")],
            ..ApplyOutcome::default()
        });
        assert_eq!(outcome.created, vec![PathBuf::from("a.ts")]);
        assert_eq!(outcome.edited, vec![PathBuf::from("b.ts")]);
    }
}
