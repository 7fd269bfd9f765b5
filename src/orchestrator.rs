//! Execution orchestrator
//!
//! Runs one task end to end: approval, budgeting, baseline, then the
//! generate → apply → validate loop driven by [`HealMachine`], and finally
//! the run report and the learning record. Every exit path produces an
//! [`ExecutionResult`]; a failed result always carries a [`StructuredFailure`].

use crate::budget::{
    BudgetPlan, ContextBudgetAllocator, ExtractionLevel, FileCandidate, FileRole, Priority,
};
use crate::collab::{
    ApprovalDecision, ApprovalGate, ApprovalRequest, AutoApprove, JsonlLearningSink,
    LearningRecord, LearningSink, NullLearningSink,
};
use crate::config::ForgeConfig;
use crate::edit::{
    parse_response, ApplyError, ApplyOutcome, EditApplier, EditResponse, ProtocolContext,
    ProtocolError,
};
use crate::failure::{Classifier, FailureCode, PatternClassifier, StructuredFailure};
use crate::heal::{Effect, Generation, HealEvent, HealMachine, HealOutcome};
use crate::oracle::{
    merge_usage, GenerationOracle, GenerationRequest, OracleError, RequestFile, Usage,
};
use crate::util::{dedup_preserve_order, tail_chars};
use crate::validate::diagnostics::error_paths;
use crate::validate::{Baseline, Diagnostic, ValidationGate, ValidationResult};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

pub const RUNS_DIR: &str = ".cosmos/forge/runs";

/// Characters of raw checker output carried into a repair prompt when the
/// output had nothing parseable.
const UNSTRUCTURED_ERROR_CHARS: usize = 2_000;

fn new_task_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ═══════════════════════════════════════════════════════════════════════════
//  Task and result
// ═══════════════════════════════════════════════════════════════════════════

/// Everything one invocation needs. Built per run and passed down by
/// reference; nothing holds on to it afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskContext {
    #[serde(default = "new_task_id")]
    pub task_id: String,
    #[serde(alias = "instruction")]
    pub description: String,
    #[serde(default)]
    pub candidates: Vec<FileCandidate>,
    /// Project conventions the change must follow.
    #[serde(default)]
    pub constraints: Option<String>,
    /// Implementation plan produced upstream, if any.
    #[serde(default)]
    pub plan: Option<String>,
    /// Overrides `token_budget` from config.
    #[serde(default)]
    pub budget: Option<usize>,
    #[serde(default)]
    pub require_approval: bool,
    /// The task declares that new files are expected.
    #[serde(default)]
    pub allow_new_files: bool,
}

impl TaskContext {
    pub fn new(description: impl Into<String>, candidates: Vec<FileCandidate>) -> Self {
        Self {
            task_id: new_task_id(),
            description: description.into(),
            candidates,
            constraints: None,
            plan: None,
            budget: None,
            require_approval: false,
            allow_new_files: false,
        }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read task file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse task file {}", path.display()))
    }

    pub fn edit_targets(&self) -> Vec<PathBuf> {
        self.candidates
            .iter()
            .filter(|c| c.is_edit_target())
            .map(|c| c.path.clone())
            .collect()
    }

    fn instruction(&self) -> String {
        match self.plan.as_deref().map(str::trim).filter(|p| !p.is_empty()) {
            Some(plan) => format!("{}\n\nPLAN:\n{}", self.description.trim(), plan),
            None => self.description.trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetLine {
    pub path: PathBuf,
    pub role: FileRole,
    pub level: ExtractionLevel,
    pub tokens: usize,
    pub forced_full: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetSummary {
    pub total_tokens: usize,
    pub output_reserve: usize,
    pub borrowed_from_reserve: usize,
    pub allocated_tokens: usize,
    pub files: Vec<BudgetLine>,
    pub omitted: Vec<PathBuf>,
}

impl From<&BudgetPlan> for BudgetSummary {
    fn from(plan: &BudgetPlan) -> Self {
        Self {
            total_tokens: plan.total_tokens,
            output_reserve: plan.output_reserve,
            borrowed_from_reserve: plan.borrowed_from_reserve,
            allocated_tokens: plan.allocated_tokens(),
            files: plan
                .allocations
                .iter()
                .map(|a| BudgetLine {
                    path: a.candidate.path.clone(),
                    role: a.candidate.role,
                    level: a.level(),
                    tokens: a.tokens(),
                    forced_full: a.forced_full,
                })
                .collect(),
            omitted: plan.omitted.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: String,
    pub success: bool,
    pub files_created: Vec<PathBuf>,
    pub files_modified: Vec<PathBuf>,
    pub files_edited: Vec<PathBuf>,
    pub validation: Option<ValidationResult>,
    pub baseline_diagnostic_count: usize,
    pub self_heal_attempts: u32,
    pub self_heal_succeeded_at: Option<u32>,
    pub failure: Option<StructuredFailure>,
    pub elapsed_ms: u64,
    pub usage: Option<Usage>,
    pub budget: Option<BudgetSummary>,
    /// The oracle's explanation from the last accepted response.
    #[serde(default)]
    pub explanation: String,
}

impl ExecutionResult {
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            ..Self::default()
        }
    }

    pub fn touched_files(&self) -> Vec<PathBuf> {
        dedup_preserve_order(
            self.files_created
                .iter()
                .chain(&self.files_modified)
                .chain(&self.files_edited)
                .cloned()
                .collect(),
        )
    }

    fn absorb_outcome(&mut self, outcome: &ApplyOutcome) {
        self.files_created = outcome.created.clone();
        self.files_modified = outcome.modified.clone();
        self.files_edited = outcome.edited.clone();
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  Progress
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stage {
    AwaitingApproval,
    Allocating,
    CapturingBaseline,
    Generating { attempt: u32 },
    Applying,
    Validating,
    Finished { success: bool },
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::AwaitingApproval => write!(f, "Waiting for approval"),
            Stage::Allocating => write!(f, "Selecting context"),
            Stage::CapturingBaseline => write!(f, "Checking the project before changes"),
            Stage::Generating { attempt: 0 } => write!(f, "Generating changes"),
            Stage::Generating { attempt } => write!(f, "Generating fix (attempt {})", attempt),
            Stage::Applying => write!(f, "Applying changes"),
            Stage::Validating => write!(f, "Validating"),
            Stage::Finished { success: true } => write!(f, "Done"),
            Stage::Finished { success: false } => write!(f, "Failed"),
        }
    }
}

pub type ProgressFn = Arc<dyn Fn(&Stage) + Send + Sync>;

// ═══════════════════════════════════════════════════════════════════════════
//  Orchestrator
// ═══════════════════════════════════════════════════════════════════════════

pub struct ExecutionOrchestrator {
    repo_root: PathBuf,
    config: ForgeConfig,
    oracle: Arc<dyn GenerationOracle>,
    classifier: Box<dyn Classifier>,
    approval: Box<dyn ApprovalGate>,
    learning: Box<dyn LearningSink>,
    gate: ValidationGate,
    progress: Option<ProgressFn>,
}

/// Per-run state the effect handlers share.
struct Run<'a> {
    task: &'a TaskContext,
    plan: &'a BudgetPlan,
    budget: usize,
    baseline: Option<Baseline>,
    pending: Option<EditResponse>,
    applied: ApplyOutcome,
    validation: Option<ValidationResult>,
    usage: Option<Usage>,
    explanation: String,
}

impl ExecutionOrchestrator {
    pub fn new(
        repo_root: impl Into<PathBuf>,
        config: ForgeConfig,
        oracle: Arc<dyn GenerationOracle>,
    ) -> Self {
        let repo_root = repo_root.into();
        let gate = ValidationGate::detect(
            repo_root.clone(),
            config.check_command.as_deref(),
            config.check_timeout(),
        );
        let learning: Box<dyn LearningSink> = if config.record_history {
            Box::new(JsonlLearningSink::new(&repo_root))
        } else {
            Box::new(NullLearningSink)
        };
        Self {
            repo_root,
            config,
            oracle,
            classifier: Box::new(PatternClassifier::default()),
            approval: Box::new(AutoApprove),
            learning,
            gate,
            progress: None,
        }
    }

    pub fn with_classifier(mut self, classifier: impl Classifier + 'static) -> Self {
        self.classifier = Box::new(classifier);
        self
    }

    pub fn with_approval(mut self, approval: impl ApprovalGate + 'static) -> Self {
        self.approval = Box::new(approval);
        self
    }

    pub fn with_learning_sink(mut self, sink: impl LearningSink + 'static) -> Self {
        self.learning = Box::new(sink);
        self
    }

    pub fn with_validation_gate(mut self, gate: ValidationGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_progress<F>(mut self, progress: F) -> Self
    where
        F: Fn(&Stage) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(progress));
        self
    }

    pub fn repo_root(&self) -> &Path {
        &self.repo_root
    }

    fn report(&self, stage: Stage) {
        tracing::debug!(stage = %stage, "stage");
        if let Some(progress) = &self.progress {
            progress(&stage);
        }
    }

    /// Run `task` to completion. Never returns an error: failures are
    /// reported inside the result.
    pub async fn execute(&self, task: TaskContext) -> ExecutionResult {
        let span = tracing::info_span!("task", task_id = %task.task_id);
        async {
            let started = Instant::now();
            let mut result = self.run_task(&task, started).await;
            if !result.success && result.failure.is_none() {
                result.failure = Some(StructuredFailure::new(
                    FailureCode::InfraUnknown,
                    "run ended without success or a recorded failure",
                ));
            }
            result.elapsed_ms = started.elapsed().as_millis() as u64;
            self.report(Stage::Finished {
                success: result.success,
            });
            tracing::info!(
                success = result.success,
                heal_attempts = result.self_heal_attempts,
                failure = %result.failure.as_ref().map(|f| f.tag()).unwrap_or_default(),
                elapsed_ms = result.elapsed_ms,
                "task finished"
            );

            if self.config.write_reports {
                if let Err(err) = write_run_report(&self.repo_root, &result) {
                    tracing::warn!(error = %err, "failed to write run report");
                }
            }
            let record = LearningRecord::from_result(&result, task.edit_targets());
            if let Err(err) = self.learning.record(&record) {
                tracing::warn!(error = %err, "failed to record run history");
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run_task(&self, task: &TaskContext, started: Instant) -> ExecutionResult {
        let mut result = ExecutionResult::new(&task.task_id);

        if let Some(failure) = self.approve(task).await {
            result.failure = Some(failure);
            return result;
        }

        self.report(Stage::Allocating);
        let budget = task.budget.unwrap_or(self.config.token_budget);
        let allocator = ContextBudgetAllocator::new(self.repo_root.clone(), self.config.budget.clone());
        let plan = match allocator.allocate(&task.candidates, budget) {
            Ok(plan) => plan,
            Err(err) => {
                tracing::warn!(error = %err, "budget allocation failed");
                result.failure = Some(StructuredFailure::from(&err));
                return result;
            }
        };
        result.budget = Some(BudgetSummary::from(&plan));

        self.report(Stage::CapturingBaseline);
        let scope: Vec<PathBuf> = plan.edit_targets().map(|a| a.candidate.path.clone()).collect();
        let baseline = match self.gate.capture_baseline(&scope).await {
            Ok(baseline) => baseline,
            Err(err) => {
                result.failure = Some(StructuredFailure::from(&err));
                return result;
            }
        };
        result.baseline_diagnostic_count = baseline.as_ref().map(Baseline::error_count).unwrap_or(0);

        let mut run = Run {
            task,
            plan: &plan,
            budget,
            baseline,
            pending: None,
            applied: ApplyOutcome::default(),
            validation: None,
            usage: None,
            explanation: String::new(),
        };
        let outcome = self.drive(&mut run, scope, started).await;

        result.success = outcome.success;
        result.self_heal_attempts = outcome.heal_attempts;
        result.self_heal_succeeded_at = outcome.healed_at;
        result.failure = outcome.failure;
        result.absorb_outcome(&run.applied);
        result.validation = run.validation;
        result.usage = run.usage;
        result.explanation = run.explanation;
        result
    }

    async fn approve(&self, task: &TaskContext) -> Option<StructuredFailure> {
        let new_files: Vec<PathBuf> = task
            .edit_targets()
            .into_iter()
            .filter(|p| !self.repo_root.join(p).exists())
            .collect();
        let needs_approval = task.require_approval || (!new_files.is_empty() && !task.allow_new_files);
        if !needs_approval {
            return None;
        }
        self.report(Stage::AwaitingApproval);
        let request = ApprovalRequest {
            task_id: task.task_id.clone(),
            instruction: task.description.clone(),
            new_files,
            explicit: task.require_approval,
        };
        match self.approval.await_decision(&request).await {
            ApprovalDecision::Approved => None,
            ApprovalDecision::Aborted { reason } => Some(StructuredFailure::new(
                FailureCode::PrepApprovalAborted,
                format!("approval aborted: {}", reason),
            )),
        }
    }

    /// Feed effects from the heal machine until it finishes.
    async fn drive(&self, run: &mut Run<'_>, scope: Vec<PathBuf>, started: Instant) -> HealOutcome {
        let deadline = self.config.task_deadline();
        let (mut machine, mut effects) = HealMachine::new(self.config.heal, scope).start();

        loop {
            let Some(effect) = effects.pop() else {
                return HealOutcome {
                    success: false,
                    generations: machine.generations(),
                    heal_attempts: machine.heal_attempts(),
                    healed_at: None,
                    failure: Some(StructuredFailure::new(
                        FailureCode::InfraUnknown,
                        "heal loop stopped without an outcome",
                    )),
                };
            };

            let event = match effect {
                Effect::Finish(outcome) => return outcome,
                Effect::CallOracle(generation) => {
                    if matches!(generation, Generation::FollowUp(_)) && started.elapsed() >= deadline {
                        let generations = machine.generations().saturating_sub(1);
                        return abandoned(
                            &machine,
                            StructuredFailure::new(
                                FailureCode::InfraTaskTimeout,
                                format!(
                                    "task deadline of {}s exceeded after {} generation(s)",
                                    deadline.as_secs(),
                                    generations
                                ),
                            ),
                        );
                    }
                    match self.build_request(run, &generation) {
                        Ok((request, protocol)) => self.generate(run, request, protocol).await,
                        Err(failure) => return abandoned(&machine, failure),
                    }
                }
                Effect::Apply => self.apply(run).await,
                Effect::Validate { changed } => self.validate(run, &changed).await,
            };

            let (next, next_effects) = machine.on(event);
            machine = next;
            effects = next_effects;
        }
    }

    /// Assemble the request for one generation. Follow-ups are re-budgeted:
    /// files under repair become full-fidelity edit targets read from disk,
    /// the rest of the plan competes for what is left.
    fn build_request(
        &self,
        run: &Run<'_>,
        generation: &Generation,
    ) -> Result<(GenerationRequest, ProtocolContext), StructuredFailure> {
        let (replanned, follow_up) = match generation {
            Generation::Initial => (None, None),
            Generation::FollowUp(follow_up) => {
                let candidates = follow_up_candidates(run.plan, &follow_up.allowed_files);
                let allocator =
                    ContextBudgetAllocator::new(self.repo_root.clone(), self.config.budget.clone());
                let plan = allocator.allocate(&candidates, run.budget).map_err(|err| {
                    tracing::warn!(error = %err, attempt = follow_up.attempt, "follow-up does not fit the budget");
                    StructuredFailure::from(&err)
                })?;
                (Some(plan), Some(follow_up.clone()))
            }
        };
        let plan = replanned.as_ref().unwrap_or(run.plan);

        let mut protocol = ProtocolContext::from_plan(self.repo_root.clone(), plan);
        if let Some(follow_up) = &follow_up {
            protocol.restrict_to(follow_up.allowed_files.iter().cloned());
        }
        let files = plan
            .allocations
            .iter()
            .map(|a| RequestFile {
                path: a.candidate.path.clone(),
                role: a.candidate.role,
                level: a.level(),
                exists: a.exists,
                content: a.extracted.content.clone(),
            })
            .collect();

        let request = GenerationRequest {
            task_id: run.task.task_id.clone(),
            instruction: run.task.instruction(),
            constraints: run.task.constraints.clone(),
            files,
            follow_up,
            max_output_tokens: self.config.max_output_tokens,
        };
        Ok((request, protocol))
    }

    async fn generate(
        &self,
        run: &mut Run<'_>,
        request: GenerationRequest,
        protocol: ProtocolContext,
    ) -> HealEvent {
        let attempt = request.follow_up.as_ref().map(|f| f.attempt).unwrap_or(0);
        self.report(Stage::Generating { attempt });

        let timeout = self.config.generation_timeout();
        let reply = match tokio::time::timeout(timeout, self.oracle.generate(&request)).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => return generation_failed(&err),
            Err(_) => return generation_failed(&OracleError::Timeout(timeout)),
        };
        run.usage = merge_usage(run.usage.take(), reply.usage.clone());
        tracing::debug!(model = %reply.model, oracle = self.oracle.name(), attempt, "generation received");

        let checked = parse_response(&reply.content).and_then(|response| {
            protocol.check(&response)?;
            Ok(response)
        });
        match checked {
            Ok(response) => {
                run.explanation = response.explanation.clone();
                run.pending = Some(response);
                HealEvent::Generated
            }
            Err(err) => {
                tracing::warn!(error = %err, attempt, "response rejected");
                HealEvent::GenerationFailed {
                    failure: StructuredFailure::from(&err),
                    implicated: protocol_paths(&err),
                }
            }
        }
    }

    async fn apply(&self, run: &mut Run<'_>) -> HealEvent {
        self.report(Stage::Applying);
        let Some(response) = run.pending.take() else {
            return HealEvent::ApplyFailed {
                applied: Vec::new(),
                failure: StructuredFailure::new(FailureCode::InfraUnknown, "no response to apply"),
                implicated: Vec::new(),
            };
        };
        let applier = EditApplier::new(self.repo_root.clone()).with_policy(self.config.match_policy);
        // The applier waits on a file lock; keep it off the async workers.
        let applied = tokio::task::spawn_blocking(move || applier.apply(&response.files)).await;
        match applied {
            Ok(Ok(outcome)) => {
                let touched = outcome.touched();
                tracing::info!(files = touched.len(), "changes applied");
                run.applied.absorb(outcome);
                HealEvent::Applied { touched }
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err.error, applied = err.applied.touched().len(), "apply stopped");
                let applied = err.applied.touched();
                run.applied.absorb(err.applied);
                HealEvent::ApplyFailed {
                    applied,
                    failure: StructuredFailure::from(&err.error),
                    implicated: match &err.error {
                        ApplyError::PathRejected { .. } => Vec::new(),
                        other => other.path().map(Path::to_path_buf).into_iter().collect(),
                    },
                }
            }
            Err(join) => HealEvent::ApplyFailed {
                applied: Vec::new(),
                failure: StructuredFailure::new(
                    FailureCode::InfraUnknown,
                    format!("apply task did not complete: {}", join),
                ),
                implicated: Vec::new(),
            },
        }
    }

    async fn validate(&self, run: &mut Run<'_>, changed: &[PathBuf]) -> HealEvent {
        self.report(Stage::Validating);
        let validation = match self.gate.validate(changed, run.baseline.as_ref()).await {
            Ok(validation) => validation,
            Err(err) => {
                return HealEvent::Validated {
                    passed: false,
                    failure: Some(StructuredFailure::from(&err)),
                    errors: Vec::new(),
                }
            }
        };
        if validation.passed {
            run.validation = Some(validation);
            return HealEvent::Validated {
                passed: true,
                failure: None,
                errors: Vec::new(),
            };
        }

        let failure = self.classify_validation(&validation);
        tracing::info!(
            failure = %failure.tag(),
            files = ?error_paths(&validation.new_diagnostics),
            "validation failed"
        );
        let errors = if validation.new_diagnostics.is_empty() {
            vec![tail_chars(&validation.raw_output, UNSTRUCTURED_ERROR_CHARS)]
        } else {
            validation
                .new_diagnostics
                .iter()
                .take(self.config.heal.max_diagnostics)
                .map(Diagnostic::render)
                .collect()
        };
        run.validation = Some(validation);
        HealEvent::Validated {
            passed: false,
            failure: Some(failure),
            errors,
        }
    }

    fn classify_validation(&self, validation: &ValidationResult) -> StructuredFailure {
        if validation.timed_out {
            return StructuredFailure::new(
                FailureCode::ValidationTimeout,
                format!("check command `{}` timed out", validation.command),
            );
        }
        let text = validation
            .new_diagnostics
            .first()
            .map(Diagnostic::render)
            .unwrap_or_else(|| tail_chars(&validation.raw_output, 600));
        let failure = self.classifier.classify(&text);
        if failure.code == FailureCode::InfraUnknown {
            return StructuredFailure::new(FailureCode::ValidationCheckFailed, failure.message);
        }
        failure
    }
}

/// End the run before the next generation, reporting only the calls made.
fn abandoned(machine: &HealMachine, failure: StructuredFailure) -> HealOutcome {
    let generations = machine.generations().saturating_sub(1);
    HealOutcome {
        success: false,
        generations,
        heal_attempts: generations.saturating_sub(1),
        healed_at: None,
        failure: Some(failure),
    }
}

/// Candidates for a repair round: the files it may change as edit targets,
/// everything else the first round saw as references.
fn follow_up_candidates(plan: &BudgetPlan, allowed: &[PathBuf]) -> Vec<FileCandidate> {
    let mut candidates: Vec<FileCandidate> = allowed
        .iter()
        .map(|path| {
            let priority = plan
                .get(path)
                .map(|a| a.candidate.priority)
                .unwrap_or(Priority::High);
            FileCandidate::edit_target(path.clone(), priority)
        })
        .collect();
    candidates.extend(
        plan.allocations
            .iter()
            .filter(|a| a.exists && !allowed.contains(&a.candidate.path))
            .map(|a| FileCandidate::reference(a.candidate.path.clone(), a.candidate.priority)),
    );
    candidates
}

fn generation_failed(err: &OracleError) -> HealEvent {
    tracing::warn!(error = %err, "generation failed");
    HealEvent::GenerationFailed {
        failure: StructuredFailure::from(err),
        implicated: Vec::new(),
    }
}

fn protocol_paths(err: &ProtocolError) -> Vec<PathBuf> {
    match err {
        ProtocolError::UnsafeOverwrite { path, .. }
        | ProtocolError::EmptySearch { path, .. }
        | ProtocolError::EmptyEdits(path)
        | ProtocolError::DuplicatePath(path) => vec![path.clone()],
        _ => Vec::new(),
    }
}

fn report_file_name(task_id: &str) -> String {
    let safe: String = task_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{}.json", safe)
}

/// Write `.cosmos/forge/runs/<task_id>.json`, replacing an earlier report
/// for the same task.
pub fn write_run_report(repo_root: &Path, result: &ExecutionResult) -> anyhow::Result<PathBuf> {
    let dir = repo_root.join(RUNS_DIR);
    std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let path = dir.join(report_file_name(&result.task_id));
    let json = serde_json::to_string_pretty(result).context("Failed to serialize run report")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
    if let Err(err) = std::fs::rename(&tmp, &path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(err).with_context(|| format!("Failed to write {}", path.display()));
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::Priority;
    use crate::oracle::ScriptedOracle;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::tempdir;

    fn config() -> ForgeConfig {
        ForgeConfig {
            write_reports: false,
            record_history: false,
            ..ForgeConfig::default()
        }
    }

    fn orchestrator(root: &Path, oracle: Arc<ScriptedOracle>, config: ForgeConfig) -> ExecutionOrchestrator {
        ExecutionOrchestrator::new(root, config, oracle)
            .with_validation_gate(ValidationGate::new(root, None, Duration::from_secs(5)))
    }

    #[test]
    fn task_file_uses_defaults() {
        let task: TaskContext = serde_json::from_str(
            r#"{"instruction": "Add a flag", "candidates": [{"path": "src/a.ts", "priority": "high", "role": "edit-target"}]}"#,
        )
        .unwrap();
        assert_eq!(task.description, "Add a flag");
        assert!(uuid::Uuid::parse_str(&task.task_id).is_ok());
        assert_eq!(task.edit_targets(), vec![PathBuf::from("src/a.ts")]);
        assert!(!task.allow_new_files);
    }

    #[test]
    fn plan_is_appended_to_instruction() {
        let mut task = TaskContext::new("Do the thing", vec![]);
        task.plan = Some("1. first\n2. second".into());
        assert_eq!(task.instruction(), "Do the thing\n\nPLAN:\n1. first\n2. second");
    }

    #[test]
    fn report_names_are_filesystem_safe() {
        assert_eq!(report_file_name("a/b:c"), "a_b_c.json");
        assert_eq!(report_file_name("task-1_x"), "task-1_x.json");
    }

    #[tokio::test]
    async fn reports_stages_in_order() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello\n").unwrap();
        let oracle = Arc::new(ScriptedOracle::new([
            r#"{"files":[{"path":"a.txt","action":"edit","edits":[{"search":"hello","replace":"hi"}]}]}"#,
        ]));
        let stages = Arc::new(Mutex::new(Vec::new()));
        let sink = stages.clone();
        let orch = orchestrator(dir.path(), oracle, config())
            .with_progress(move |stage| sink.lock().unwrap().push(stage.clone()));

        let task = TaskContext::new("greet", vec![FileCandidate::edit_target("a.txt", Priority::High)]);
        let result = orch.execute(task).await;

        assert!(result.success, "{:?}", result.failure);
        assert_eq!(result.files_edited, vec![PathBuf::from("a.txt")]);
        assert_eq!(
            *stages.lock().unwrap(),
            vec![
                Stage::Allocating,
                Stage::CapturingBaseline,
                Stage::Generating { attempt: 0 },
                Stage::Applying,
                Stage::Validating,
                Stage::Finished { success: true },
            ]
        );
    }

    #[tokio::test]
    async fn generation_timeout_is_not_retried() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello\n").unwrap();
        let oracle = Arc::new(ScriptedOracle::default());
        oracle.push_slow_reply(Duration::from_secs(5), "{}");
        let cfg = ForgeConfig {
            generation_timeout_secs: 0,
            ..config()
        };
        let orch = orchestrator(dir.path(), oracle.clone(), cfg);
        let task = TaskContext::new("greet", vec![FileCandidate::edit_target("a.txt", Priority::High)]);
        let result = orch.execute(task).await;

        assert!(!result.success);
        assert_eq!(result.failure.unwrap().code, FailureCode::CodegenTimeout);
        assert_eq!(oracle.calls(), 1);
    }

    #[tokio::test]
    async fn unapproved_new_file_aborts() {
        struct Deny;
        #[async_trait::async_trait]
        impl ApprovalGate for Deny {
            async fn await_decision(&self, _request: &ApprovalRequest) -> ApprovalDecision {
                ApprovalDecision::Aborted {
                    reason: "not today".into(),
                }
            }
        }

        let dir = tempdir().unwrap();
        let oracle = Arc::new(ScriptedOracle::default());
        let orch = orchestrator(dir.path(), oracle.clone(), config()).with_approval(Deny);
        let task = TaskContext::new("add", vec![FileCandidate::edit_target("new.ts", Priority::High)]);
        let result = orch.execute(task).await;

        let failure = result.failure.unwrap();
        assert_eq!(failure.code, FailureCode::PrepApprovalAborted);
        assert!(failure.message.contains("not today"));
        assert_eq!(oracle.calls(), 0);
    }

    #[tokio::test]
    async fn injected_classifier_and_learning_sink_are_used() {
        #[derive(Clone, Default)]
        struct Capture(Arc<Mutex<Vec<LearningRecord>>>);
        impl LearningSink for Capture {
            fn record(&self, record: &LearningRecord) -> anyhow::Result<()> {
                self.0.lock().unwrap().push(record.clone());
                Ok(())
            }
        }

        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello\n").unwrap();
        let oracle = Arc::new(ScriptedOracle::new([
            r#"{"files":[{"path":"a.txt","action":"edit","edits":[{"search":"hello","replace":"hi"}]}]}"#,
        ]));
        let gate = ValidationGate::new(
            dir.path(),
            Some(crate::validate::CheckCommand::Shell(
                "if grep -q '^hi$' a.txt; then echo 'lint: greeting too short'; exit 1; fi; exit 0".into(),
            )),
            Duration::from_secs(10),
        );
        let classifier = PatternClassifier::default()
            .with_rule(r"greeting too short", FailureCode::ValidationCheckFailed, Some("Use a longer greeting."))
            .unwrap();
        let sink = Capture::default();
        let cfg = ForgeConfig {
            heal: crate::heal::HealConfig {
                max_attempts: 0,
                ..crate::heal::HealConfig::default()
            },
            ..config()
        };
        let orch = orchestrator(dir.path(), oracle, cfg)
            .with_validation_gate(gate)
            .with_classifier(classifier)
            .with_learning_sink(sink.clone());
        let task = TaskContext::new("greet", vec![FileCandidate::edit_target("a.txt", Priority::High)]);
        let result = orch.execute(task).await;

        let failure = result.failure.unwrap();
        assert_eq!(failure.code, FailureCode::ValidationCheckFailed);
        assert_eq!(failure.remediation.as_deref(), Some("Use a longer greeting."));
        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].actual_files, vec![PathBuf::from("a.txt")]);
    }

    #[tokio::test]
    async fn writes_run_report_when_enabled() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "hello\n").unwrap();
        let oracle = Arc::new(ScriptedOracle::new([
            r#"{"files":[{"path":"a.txt","action":"edit","edits":[{"search":"hello","replace":"hi"}]}]}"#,
        ]));
        let cfg = ForgeConfig {
            write_reports: true,
            ..config()
        };
        let orch = orchestrator(dir.path(), oracle, cfg);
        let mut task = TaskContext::new("greet", vec![FileCandidate::edit_target("a.txt", Priority::High)]);
        task.task_id = "report-me".into();
        orch.execute(task).await;

        let report = dir.path().join(RUNS_DIR).join("report-me.json");
        let saved: ExecutionResult =
            serde_json::from_str(&std::fs::read_to_string(report).unwrap()).unwrap();
        assert!(saved.success);
        assert_eq!(saved.task_id, "report-me");
    }
}
