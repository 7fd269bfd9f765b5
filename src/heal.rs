//! Bounded generate → apply → validate loop, as a pure state machine.
//!
//! [`HealMachine::on`] consumes the machine and an event and returns the
//! next machine plus the effects the driver must perform. The machine never
//! performs I/O, so every retry path is testable without an oracle.

use crate::failure::{FailureCode, StructuredFailure};
use crate::util::{dedup_preserve_order, truncate};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealConfig {
    /// Follow-up generations allowed after the first one.
    pub max_attempts: u32,
    /// Diagnostics carried into each follow-up prompt.
    pub max_diagnostics: usize,
}

impl Default for HealConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            max_diagnostics: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealPhase {
    Idle,
    Generating,
    Applying,
    Validating,
    Succeeded,
    Failed,
}

/// A restricted repair request for the next generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowUp {
    /// 1-based heal attempt number.
    pub attempt: u32,
    pub allowed_files: Vec<PathBuf>,
    pub failure: StructuredFailure,
    /// Exact error lines, at most `max_diagnostics` of them.
    pub errors: Vec<String>,
}

impl FollowUp {
    /// Prompt section describing what to fix and what may be touched.
    pub fn render(&self) -> String {
        let files = self
            .allowed_files
            .iter()
            .map(|p| format!("- {}", p.display()))
            .collect::<Vec<_>>()
            .join("\n");
        let errors = if self.errors.is_empty() {
            truncate(&self.failure.message, 1_200)
        } else {
            self.errors.join("\n")
        };
        let mut out = format!(
            "Repair request (attempt {}):\n- Failure: {}\n- Errors:\n{}\n\nFiles you may change:\n{}\n\nRules:\n- Modify only the files listed above.\n- Fix the reported errors and nothing else.\n- Keep the diff minimal and avoid unrelated reformatting.\n- Use `edit` with search strings copied from the current file content shown below.",
            self.attempt,
            self.failure.tag(),
            errors,
            files
        );
        if let Some(remediation) = &self.failure.remediation {
            out.push_str(&format!("\n- Hint: {}", remediation));
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Generation {
    Initial,
    FollowUp(FollowUp),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealOutcome {
    pub success: bool,
    /// Generation calls made, including the first.
    pub generations: u32,
    pub heal_attempts: u32,
    /// The heal attempt that produced a passing result, if any.
    pub healed_at: Option<u32>,
    pub failure: Option<StructuredFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Effect {
    CallOracle(Generation),
    Apply,
    Validate { changed: Vec<PathBuf> },
    Finish(HealOutcome),
}

#[derive(Debug, Clone, PartialEq)]
pub enum HealEvent {
    /// The oracle replied with a response that passed protocol checks.
    Generated,
    /// The oracle call failed or its response was rejected.
    GenerationFailed {
        failure: StructuredFailure,
        implicated: Vec<PathBuf>,
    },
    Applied { touched: Vec<PathBuf> },
    ApplyFailed {
        applied: Vec<PathBuf>,
        failure: StructuredFailure,
        implicated: Vec<PathBuf>,
    },
    Validated {
        passed: bool,
        failure: Option<StructuredFailure>,
        errors: Vec<String>,
    },
}

impl HealEvent {
    fn name(&self) -> &'static str {
        match self {
            HealEvent::Generated => "generated",
            HealEvent::GenerationFailed { .. } => "generation_failed",
            HealEvent::Applied { .. } => "applied",
            HealEvent::ApplyFailed { .. } => "apply_failed",
            HealEvent::Validated { .. } => "validated",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealMachine {
    config: HealConfig,
    phase: HealPhase,
    generations: u32,
    initial_scope: Vec<PathBuf>,
    touched: Vec<PathBuf>,
    last_failure: Option<StructuredFailure>,
}

impl HealMachine {
    /// `initial_scope` is used for a follow-up when nothing was touched yet.
    pub fn new(config: HealConfig, initial_scope: Vec<PathBuf>) -> Self {
        Self {
            config,
            phase: HealPhase::Idle,
            generations: 0,
            initial_scope,
            touched: Vec::new(),
            last_failure: None,
        }
    }

    pub fn phase(&self) -> HealPhase {
        self.phase
    }

    pub fn generations(&self) -> u32 {
        self.generations
    }

    pub fn heal_attempts(&self) -> u32 {
        self.generations.saturating_sub(1)
    }

    pub fn touched(&self) -> &[PathBuf] {
        &self.touched
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.phase, HealPhase::Succeeded | HealPhase::Failed)
    }

    /// Hard ceiling on oracle calls.
    pub fn max_generations(&self) -> u32 {
        self.config.max_attempts + 1
    }

    pub fn start(mut self) -> (Self, Vec<Effect>) {
        if self.phase != HealPhase::Idle {
            return self.invalid("start");
        }
        self.phase = HealPhase::Generating;
        self.generations = 1;
        (self, vec![Effect::CallOracle(Generation::Initial)])
    }

    pub fn on(mut self, event: HealEvent) -> (Self, Vec<Effect>) {
        match (self.phase, event) {
            (HealPhase::Generating, HealEvent::Generated) => {
                self.phase = HealPhase::Applying;
                (self, vec![Effect::Apply])
            }
            (
                HealPhase::Generating,
                HealEvent::GenerationFailed {
                    failure,
                    implicated,
                },
            ) => self.retry_or_fail(failure, implicated, Vec::new()),
            (HealPhase::Applying, HealEvent::Applied { touched }) => {
                self.record_touched(touched);
                self.phase = HealPhase::Validating;
                let changed = self.touched.clone();
                (self, vec![Effect::Validate { changed }])
            }
            (
                HealPhase::Applying,
                HealEvent::ApplyFailed {
                    applied,
                    failure,
                    implicated,
                },
            ) => {
                self.record_touched(applied);
                self.retry_or_fail(failure, implicated, Vec::new())
            }
            (HealPhase::Validating, HealEvent::Validated { passed: true, .. }) => {
                self.phase = HealPhase::Succeeded;
                self.last_failure = None;
                let outcome = self.outcome(true);
                (self, vec![Effect::Finish(outcome)])
            }
            (
                HealPhase::Validating,
                HealEvent::Validated {
                    passed: false,
                    failure,
                    errors,
                },
            ) => {
                let failure = failure.unwrap_or_else(|| {
                    StructuredFailure::new(
                        FailureCode::ValidationCheckFailed,
                        "validation failed without a classified error",
                    )
                });
                self.retry_or_fail(failure, Vec::new(), errors)
            }
            (_, event) => self.invalid(event.name()),
        }
    }

    fn record_touched(&mut self, paths: Vec<PathBuf>) {
        let mut all = std::mem::take(&mut self.touched);
        all.extend(paths);
        self.touched = dedup_preserve_order(all);
    }

    fn retry_or_fail(
        mut self,
        failure: StructuredFailure,
        implicated: Vec<PathBuf>,
        errors: Vec<String>,
    ) -> (Self, Vec<Effect>) {
        let can_retry = failure.is_retryable() && self.generations < self.max_generations();
        tracing::debug!(
            failure = %failure.tag(),
            generations = self.generations,
            can_retry,
            "heal decision"
        );
        if !can_retry {
            self.last_failure = Some(failure);
            return self.fail();
        }

        let mut allowed_files = self.touched.clone();
        allowed_files.extend(implicated);
        let mut allowed_files = dedup_preserve_order(allowed_files);
        if allowed_files.is_empty() {
            allowed_files = self.initial_scope.clone();
        }
        let errors: Vec<String> = errors
            .into_iter()
            .take(self.config.max_diagnostics)
            .collect();

        self.generations += 1;
        self.phase = HealPhase::Generating;
        self.last_failure = Some(failure.clone());
        let follow_up = FollowUp {
            attempt: self.generations - 1,
            allowed_files,
            failure,
            errors,
        };
        (self, vec![Effect::CallOracle(Generation::FollowUp(follow_up))])
    }

    fn fail(mut self) -> (Self, Vec<Effect>) {
        self.phase = HealPhase::Failed;
        let outcome = self.outcome(false);
        (self, vec![Effect::Finish(outcome)])
    }

    fn invalid(mut self, event: &str) -> (Self, Vec<Effect>) {
        let message = format!(
            "heal loop received `{}` while {:?}",
            event, self.phase
        );
        tracing::error!("{}", message);
        if self.is_finished() {
            return (self, Vec::new());
        }
        self.last_failure = Some(StructuredFailure::new(FailureCode::InfraUnknown, message));
        self.fail()
    }

    fn outcome(&self, success: bool) -> HealOutcome {
        let heal_attempts = self.heal_attempts();
        HealOutcome {
            success,
            generations: self.generations,
            heal_attempts,
            healed_at: (success && heal_attempts > 0).then_some(heal_attempts),
            failure: if success {
                None
            } else {
                self.last_failure.clone()
            },
        }
    }
}
