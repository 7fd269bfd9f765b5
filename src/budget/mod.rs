//! Token-budgeted context allocation
//!
//! Decides, per candidate file, how much of it the generator sees. The output
//! reserve is carved off first, high-priority files share up to `high_tier_ratio`
//! of what remains, medium files take the remainder, low files take leftovers.
//! Edit targets are then forced back to full fidelity regardless of their
//! slice: search/replace edits only work against exact original text.

pub mod extract;
pub mod tokens;

pub use extract::{ContentExtractor, ExtractedFile, ExtractionLevel};
pub use tokens::{TextKind, TokenEstimator};

use crate::failure::{FailureCode, StructuredFailure};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Priority {
    const TIERS: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileRole {
    EditTarget,
    Reference,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCandidate {
    pub path: PathBuf,
    /// Size on disk in bytes (0 for files that do not exist yet).
    #[serde(default)]
    pub raw_size: u64,
    pub priority: Priority,
    pub role: FileRole,
}

impl FileCandidate {
    pub fn edit_target(path: impl Into<PathBuf>, priority: Priority) -> Self {
        Self {
            path: path.into(),
            raw_size: 0,
            priority,
            role: FileRole::EditTarget,
        }
    }

    pub fn reference(path: impl Into<PathBuf>, priority: Priority) -> Self {
        Self {
            path: path.into(),
            raw_size: 0,
            priority,
            role: FileRole::Reference,
        }
    }

    pub fn is_edit_target(&self) -> bool {
        self.role == FileRole::EditTarget
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub output_reserve_ratio: f64,
    pub high_tier_ratio: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            output_reserve_ratio: 0.20,
            high_tier_ratio: 0.80,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetCaps {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
    /// Tokens spent on edit targets in the final plan.
    pub edit_targets: usize,
    /// Tokens spent on reference files in the final plan.
    pub references: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAllocation {
    pub candidate: FileCandidate,
    /// Fair-share slice the file was offered in the initial pass.
    pub slice_tokens: usize,
    pub full_tokens: usize,
    /// False when the file does not exist yet (new edit target).
    pub exists: bool,
    /// True when the edit-target override re-expanded this file to full.
    pub forced_full: bool,
    pub extracted: ExtractedFile,
}

impl FileAllocation {
    pub fn level(&self) -> ExtractionLevel {
        self.extracted.level
    }

    pub fn tokens(&self) -> usize {
        self.extracted.tokens
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetPlan {
    pub total_tokens: usize,
    /// Effective reserve after any borrowing by the edit-target override.
    pub output_reserve: usize,
    pub borrowed_from_reserve: usize,
    pub caps: BudgetCaps,
    pub allocations: Vec<FileAllocation>,
    /// Reference files that could not be delivered at any level.
    pub omitted: Vec<PathBuf>,
}

impl BudgetPlan {
    pub fn allocated_tokens(&self) -> usize {
        self.allocations.iter().map(|a| a.tokens()).sum()
    }

    pub fn get(&self, path: &Path) -> Option<&FileAllocation> {
        self.allocations.iter().find(|a| a.candidate.path == path)
    }

    pub fn level_for(&self, path: &Path) -> Option<ExtractionLevel> {
        self.get(path).map(|a| a.level())
    }

    pub fn delivered_full(&self, path: &Path) -> bool {
        self.level_for(path) == Some(ExtractionLevel::Full)
    }

    pub fn edit_targets(&self) -> impl Iterator<Item = &FileAllocation> {
        self.allocations
            .iter()
            .filter(|a| a.candidate.is_edit_target())
    }
}

#[derive(Debug, Error)]
pub enum CapacityError {
    #[error("edit targets need {required} tokens at full fidelity but the budget is {total}")]
    EditTargetsExceedBudget { required: usize, total: usize },
    #[error("cannot load candidate {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<&CapacityError> for StructuredFailure {
    fn from(err: &CapacityError) -> Self {
        match err {
            CapacityError::EditTargetsExceedBudget { .. } => {
                StructuredFailure::new(FailureCode::PrepBudgetCapacity, err.to_string())
            }
            CapacityError::Unreadable { .. } => {
                StructuredFailure::new(FailureCode::PrepFileRead, err.to_string())
            }
        }
    }
}

/// A candidate with its content read for this request.
struct Loaded {
    candidate: FileCandidate,
    content: String,
    exists: bool,
    full_tokens: usize,
}

pub struct ContextBudgetAllocator {
    repo_root: PathBuf,
    config: BudgetConfig,
    extractor: ContentExtractor,
}

impl ContextBudgetAllocator {
    pub fn new(repo_root: impl Into<PathBuf>, config: BudgetConfig) -> Self {
        Self {
            repo_root: repo_root.into(),
            config,
            extractor: ContentExtractor,
        }
    }

    pub fn allocate(
        &self,
        files: &[FileCandidate],
        total_budget: usize,
    ) -> Result<BudgetPlan, CapacityError> {
        let loaded = self.load_all(files)?;

        let required: usize = loaded
            .iter()
            .filter(|l| l.candidate.is_edit_target())
            .map(|l| l.full_tokens)
            .sum();
        if required > total_budget {
            return Err(CapacityError::EditTargetsExceedBudget {
                required,
                total: total_budget,
            });
        }

        let reserve = ratio_of(total_budget, self.config.output_reserve_ratio);
        let file_budget = total_budget - reserve;
        let high_cap = ratio_of(file_budget, self.config.high_tier_ratio);

        let mut caps = BudgetCaps::default();
        let mut used = 0usize;
        let mut placed: Vec<(usize, FileAllocation)> = Vec::new();
        let mut unplaced: Vec<usize> = Vec::new();

        for tier in Priority::TIERS {
            let cap = match tier {
                Priority::High => high_cap,
                Priority::Medium | Priority::Low => file_budget - used,
            };
            match tier {
                Priority::High => caps.high = cap,
                Priority::Medium => caps.medium = cap,
                Priority::Low => caps.low = cap,
            }

            let mut members: Vec<usize> = loaded
                .iter()
                .enumerate()
                .filter(|(_, l)| l.candidate.priority == tier)
                .map(|(i, _)| i)
                .collect();
            members.sort_by(|&a, &b| {
                loaded[a]
                    .full_tokens
                    .cmp(&loaded[b].full_tokens)
                    .then_with(|| loaded[a].candidate.path.cmp(&loaded[b].candidate.path))
            });

            let mut remaining = cap;
            let count = members.len();
            for (visited, idx) in members.into_iter().enumerate() {
                let slice = remaining / (count - visited);
                let item = &loaded[idx];
                match self.fit(item, slice) {
                    Some(extracted) => {
                        remaining -= extracted.tokens;
                        placed.push((
                            idx,
                            FileAllocation {
                                candidate: item.candidate.clone(),
                                slice_tokens: slice,
                                full_tokens: item.full_tokens,
                                exists: item.exists,
                                forced_full: false,
                                extracted,
                            },
                        ));
                    }
                    None => unplaced.push(idx),
                }
            }
            used += cap - remaining;
        }

        // Edit-target override.
        for (idx, allocation) in placed.iter_mut() {
            let item = &loaded[*idx];
            if item.candidate.is_edit_target() && allocation.level() != ExtractionLevel::Full {
                tracing::debug!(
                    path = %item.candidate.path.display(),
                    from = allocation.level().label(),
                    "forcing edit target to full"
                );
                allocation.extracted = self.extractor.full(&item.candidate.path, &item.content);
                allocation.forced_full = true;
            }
        }
        let mut omitted = Vec::new();
        for idx in unplaced {
            let item = &loaded[idx];
            if item.candidate.is_edit_target() {
                placed.push((
                    idx,
                    FileAllocation {
                        candidate: item.candidate.clone(),
                        slice_tokens: 0,
                        full_tokens: item.full_tokens,
                        exists: item.exists,
                        forced_full: true,
                        extracted: self.extractor.full(&item.candidate.path, &item.content),
                    },
                ));
            } else {
                omitted.push(item.candidate.path.clone());
            }
        }

        // Recover any overage from references, lowest priority first.
        let mut allocated: usize = placed.iter().map(|(_, a)| a.tokens()).sum();
        while allocated > file_budget {
            let Some(pos) = Self::downgrade_candidate(&placed) else {
                break;
            };
            let (idx, allocation) = &mut placed[pos];
            let item = &loaded[*idx];
            let before = allocation.tokens();
            match self.downgrade(item, &allocation.extracted) {
                Some(lower) => {
                    allocated = allocated - before + lower.tokens;
                    allocation.extracted = lower;
                }
                None => {
                    allocated -= before;
                    omitted.push(item.candidate.path.clone());
                    placed.remove(pos);
                }
            }
        }

        let borrowed = allocated.saturating_sub(file_budget);
        let output_reserve = reserve - borrowed;
        if borrowed > 0 {
            tracing::info!(
                borrowed,
                output_reserve,
                "edit targets borrowed from the output reserve"
            );
        }

        // Candidate order is the caller's order; keep it stable in the plan.
        placed.sort_by_key(|(idx, _)| *idx);
        let allocations: Vec<FileAllocation> = placed.into_iter().map(|(_, a)| a).collect();
        caps.edit_targets = allocations
            .iter()
            .filter(|a| a.candidate.is_edit_target())
            .map(|a| a.tokens())
            .sum();
        caps.references = allocations
            .iter()
            .filter(|a| !a.candidate.is_edit_target())
            .map(|a| a.tokens())
            .sum();

        let plan = BudgetPlan {
            total_tokens: total_budget,
            output_reserve,
            borrowed_from_reserve: borrowed,
            caps,
            allocations,
            omitted,
        };
        tracing::debug!(
            total = plan.total_tokens,
            allocated = plan.allocated_tokens(),
            reserve = plan.output_reserve,
            files = plan.allocations.len(),
            omitted = plan.omitted.len(),
            "budget plan ready"
        );
        Ok(plan)
    }

    fn load_all(&self, files: &[FileCandidate]) -> Result<Vec<Loaded>, CapacityError> {
        let results: Vec<Result<Option<Loaded>, CapacityError>> =
            files.par_iter().map(|c| self.load(c)).collect();
        let mut loaded = Vec::with_capacity(files.len());
        for result in results {
            if let Some(item) = result? {
                loaded.push(item);
            }
        }
        Ok(loaded)
    }

    fn load(&self, candidate: &FileCandidate) -> Result<Option<Loaded>, CapacityError> {
        let absolute = self.repo_root.join(&candidate.path);
        match std::fs::read_to_string(&absolute) {
            Ok(content) => {
                let full_tokens = TokenEstimator::estimate(Some(&candidate.path), &content);
                Ok(Some(Loaded {
                    candidate: candidate.clone(),
                    content,
                    exists: true,
                    full_tokens,
                }))
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound && candidate.is_edit_target() => {
                Ok(Some(Loaded {
                    candidate: candidate.clone(),
                    content: String::new(),
                    exists: false,
                    full_tokens: 0,
                }))
            }
            Err(err) if candidate.is_edit_target() => Err(CapacityError::Unreadable {
                path: candidate.path.clone(),
                source: err,
            }),
            Err(err) => {
                tracing::warn!(path = %candidate.path.display(), error = %err, "skipping unreadable reference");
                Ok(None)
            }
        }
    }

    /// Highest-fidelity level of `item` that fits in `slice`.
    fn fit(&self, item: &Loaded, slice: usize) -> Option<ExtractedFile> {
        let path = &item.candidate.path;
        if item.full_tokens <= slice {
            return Some(self.extractor.full(path, &item.content));
        }
        let signatures = self.extractor.signatures(path, &item.content);
        if signatures.tokens <= slice && signatures.tokens < item.full_tokens {
            return Some(signatures);
        }
        if let Some(truncated) = self.extractor.truncated(path, &item.content, slice) {
            if truncated.tokens < item.full_tokens {
                return Some(truncated);
            }
        }
        let summary = self.extractor.summary(path, &item.content);
        (summary.tokens <= slice).then_some(summary)
    }

    /// The next cheaper rendering of `current`, or `None` to omit the file.
    fn downgrade(&self, item: &Loaded, current: &ExtractedFile) -> Option<ExtractedFile> {
        let path = &item.candidate.path;
        let mut level = current.level.lower();
        while let Some(next) = level {
            let candidate = match next {
                ExtractionLevel::Full => None,
                ExtractionLevel::Signatures => {
                    Some(self.extractor.signatures(path, &item.content))
                }
                ExtractionLevel::Truncated => {
                    self.extractor
                        .truncated(path, &item.content, current.tokens / 2)
                }
                ExtractionLevel::Summary => Some(self.extractor.summary(path, &item.content)),
            };
            if let Some(candidate) = candidate {
                if candidate.tokens < current.tokens {
                    return Some(candidate);
                }
            }
            level = next.lower();
        }
        None
    }

    /// Reference allocation to shrink next: lowest priority, then largest.
    fn downgrade_candidate(placed: &[(usize, FileAllocation)]) -> Option<usize> {
        placed
            .iter()
            .enumerate()
            .filter(|(_, (_, a))| !a.candidate.is_edit_target())
            .max_by(|(_, (_, a)), (_, (_, b))| {
                priority_rank(a.candidate.priority)
                    .cmp(&priority_rank(b.candidate.priority))
                    .then_with(|| a.tokens().cmp(&b.tokens()))
            })
            .map(|(pos, _)| pos)
    }
}

fn priority_rank(priority: Priority) -> u8 {
    match priority {
        Priority::High => 0,
        Priority::Medium => 1,
        Priority::Low => 2,
    }
}

fn ratio_of(total: usize, ratio: f64) -> usize {
    let ratio = ratio.clamp(0.0, 1.0);
    ((total as f64) * ratio).floor() as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn ts_module(functions: usize) -> String {
        let mut out = String::from("import { db } from './db';\n\n");
        for i in 0..functions {
            out.push_str(&format!(
                "export function handler{i}(req: Request): Response {{\n  const row = db.find({i});\n  return new Response(JSON.stringify(row));\n}}\n\n"
            ));
        }
        out
    }

    #[test]
    fn small_files_are_delivered_full() {
        let dir = tempdir().unwrap();
        write(dir.path(), "src/a.ts", "export const A = 1;\n");
        write(dir.path(), "src/b.ts", "export const B = 2;\n");
        let allocator = ContextBudgetAllocator::new(dir.path(), BudgetConfig::default());
        let plan = allocator
            .allocate(
                &[
                    FileCandidate::edit_target("src/a.ts", Priority::High),
                    FileCandidate::reference("src/b.ts", Priority::Low),
                ],
                10_000,
            )
            .unwrap();
        assert_eq!(plan.output_reserve, 2_000);
        assert!(plan.delivered_full(Path::new("src/a.ts")));
        assert!(plan.delivered_full(Path::new("src/b.ts")));
        assert!(plan.allocated_tokens() <= plan.total_tokens - plan.output_reserve);
    }

    #[test]
    fn capacity_error_when_edit_targets_exceed_budget() {
        let dir = tempdir().unwrap();
        write(dir.path(), "src/big.ts", &ts_module(100));
        let allocator = ContextBudgetAllocator::new(dir.path(), BudgetConfig::default());
        let err = allocator
            .allocate(&[FileCandidate::edit_target("src/big.ts", Priority::High)], 500)
            .unwrap_err();
        assert!(matches!(err, CapacityError::EditTargetsExceedBudget { .. }));
        let failure = StructuredFailure::from(&err);
        assert_eq!(failure.code, FailureCode::PrepBudgetCapacity);
    }

    #[test]
    fn references_degrade_under_pressure() {
        let dir = tempdir().unwrap();
        write(dir.path(), "src/ref.ts", &ts_module(60));
        let allocator = ContextBudgetAllocator::new(dir.path(), BudgetConfig::default());
        let plan = allocator
            .allocate(&[FileCandidate::reference("src/ref.ts", Priority::High)], 1_500)
            .unwrap();
        let level = plan.level_for(Path::new("src/ref.ts")).unwrap();
        assert!(level < ExtractionLevel::Full);
        assert!(plan.allocated_tokens() <= 1_500);
    }

    #[test]
    fn missing_edit_target_is_a_new_empty_file() {
        let dir = tempdir().unwrap();
        let allocator = ContextBudgetAllocator::new(dir.path(), BudgetConfig::default());
        let plan = allocator
            .allocate(&[FileCandidate::edit_target("src/new.ts", Priority::High)], 1_000)
            .unwrap();
        let allocation = plan.get(Path::new("src/new.ts")).unwrap();
        assert!(!allocation.exists);
        assert_eq!(allocation.level(), ExtractionLevel::Full);
        assert_eq!(allocation.tokens(), 0);
    }

    #[test]
    fn missing_reference_is_skipped() {
        let dir = tempdir().unwrap();
        let allocator = ContextBudgetAllocator::new(dir.path(), BudgetConfig::default());
        let plan = allocator
            .allocate(&[FileCandidate::reference("src/gone.ts", Priority::High)], 1_000)
            .unwrap();
        assert!(plan.allocations.is_empty());
    }

    #[test]
    fn overage_is_recovered_from_lowest_priority_reference_first() {
        let dir = tempdir().unwrap();
        write(dir.path(), "src/target.ts", &ts_module(40));
        write(dir.path(), "src/high_ref.ts", &ts_module(10));
        write(dir.path(), "src/low_ref.ts", &ts_module(10));
        let allocator = ContextBudgetAllocator::new(dir.path(), BudgetConfig::default());
        let target_full = TokenEstimator::estimate(
            Some(Path::new("src/target.ts")),
            &ts_module(40),
        );
        let plan = allocator
            .allocate(
                &[
                    FileCandidate::edit_target("src/target.ts", Priority::Low),
                    FileCandidate::reference("src/high_ref.ts", Priority::High),
                    FileCandidate::reference("src/low_ref.ts", Priority::Low),
                ],
                target_full + 400,
            )
            .unwrap();
        assert!(plan.delivered_full(Path::new("src/target.ts")));
        assert!(plan.get(Path::new("src/target.ts")).unwrap().forced_full);
        assert!(plan.allocated_tokens() <= plan.total_tokens);
        assert!(plan.allocated_tokens() <= plan.total_tokens - plan.output_reserve);
        let high = plan.level_for(Path::new("src/high_ref.ts"));
        let low = plan.level_for(Path::new("src/low_ref.ts"));
        // The low-priority reference never ends up better off than the high one.
        assert!(low <= high);
    }
}
