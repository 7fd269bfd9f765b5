//! Structured failure taxonomy
//!
//! Every failure the pipeline reports is a closed `(phase, code)` pair with a
//! human-readable message and, where we know one, a suggested remediation.
//! Components that detect a failure build the `StructuredFailure` directly;
//! free-form error text (provider errors, compiler output, anyhow chains) goes
//! through a [`Classifier`].

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePhase {
    Preparation,
    CodeGeneration,
    FileOperation,
    Compilation,
    Validation,
    Infrastructure,
}

impl FailurePhase {
    pub fn label(&self) -> &'static str {
        match self {
            FailurePhase::Preparation => "preparation",
            FailurePhase::CodeGeneration => "code_generation",
            FailurePhase::FileOperation => "file_operation",
            FailurePhase::Compilation => "compilation",
            FailurePhase::Validation => "validation",
            FailurePhase::Infrastructure => "infrastructure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    // preparation
    PrepBudgetCapacity,
    PrepFileRead,
    PrepInvalidTask,
    PrepApprovalAborted,
    // code_generation
    CodegenTimeout,
    CodegenUnparseableResponse,
    CodegenProtocolViolation,
    CodegenUnsafeOverwrite,
    CodegenScopeViolation,
    CodegenToolNotCalled,
    CodegenEmptyResponse,
    CodegenProviderError,
    // file_operation
    FileEditNoMatch,
    FileEditAmbiguous,
    FileNotFound,
    FileWriteFailed,
    FilePathRejected,
    // compilation
    CompileTypeError,
    CompileSyntaxError,
    CompileModuleNotFound,
    // validation
    ValidationCheckFailed,
    ValidationTimeout,
    // infrastructure
    InfraTaskTimeout,
    InfraIo,
    InfraUnknown,
}

impl FailureCode {
    pub const ALL: [FailureCode; 25] = [
        FailureCode::PrepBudgetCapacity,
        FailureCode::PrepFileRead,
        FailureCode::PrepInvalidTask,
        FailureCode::PrepApprovalAborted,
        FailureCode::CodegenTimeout,
        FailureCode::CodegenUnparseableResponse,
        FailureCode::CodegenProtocolViolation,
        FailureCode::CodegenUnsafeOverwrite,
        FailureCode::CodegenScopeViolation,
        FailureCode::CodegenToolNotCalled,
        FailureCode::CodegenEmptyResponse,
        FailureCode::CodegenProviderError,
        FailureCode::FileEditNoMatch,
        FailureCode::FileEditAmbiguous,
        FailureCode::FileNotFound,
        FailureCode::FileWriteFailed,
        FailureCode::FilePathRejected,
        FailureCode::CompileTypeError,
        FailureCode::CompileSyntaxError,
        FailureCode::CompileModuleNotFound,
        FailureCode::ValidationCheckFailed,
        FailureCode::ValidationTimeout,
        FailureCode::InfraTaskTimeout,
        FailureCode::InfraIo,
        FailureCode::InfraUnknown,
    ];

    /// Each code belongs to exactly one phase.
    pub fn phase(&self) -> FailurePhase {
        use FailureCode::*;
        match self {
            PrepBudgetCapacity | PrepFileRead | PrepInvalidTask | PrepApprovalAborted => {
                FailurePhase::Preparation
            }
            CodegenTimeout
            | CodegenUnparseableResponse
            | CodegenProtocolViolation
            | CodegenUnsafeOverwrite
            | CodegenScopeViolation
            | CodegenToolNotCalled
            | CodegenEmptyResponse
            | CodegenProviderError => FailurePhase::CodeGeneration,
            FileEditNoMatch | FileEditAmbiguous | FileNotFound | FileWriteFailed
            | FilePathRejected => FailurePhase::FileOperation,
            CompileTypeError | CompileSyntaxError | CompileModuleNotFound => {
                FailurePhase::Compilation
            }
            ValidationCheckFailed | ValidationTimeout => FailurePhase::Validation,
            InfraTaskTimeout | InfraIo | InfraUnknown => FailurePhase::Infrastructure,
        }
    }

    pub fn label(&self) -> &'static str {
        use FailureCode::*;
        match self {
            PrepBudgetCapacity => "prep_budget_capacity",
            PrepFileRead => "prep_file_read",
            PrepInvalidTask => "prep_invalid_task",
            PrepApprovalAborted => "prep_approval_aborted",
            CodegenTimeout => "codegen_timeout",
            CodegenUnparseableResponse => "codegen_unparseable_response",
            CodegenProtocolViolation => "codegen_protocol_violation",
            CodegenUnsafeOverwrite => "codegen_unsafe_overwrite",
            CodegenScopeViolation => "codegen_scope_violation",
            CodegenToolNotCalled => "codegen_tool_not_called",
            CodegenEmptyResponse => "codegen_empty_response",
            CodegenProviderError => "codegen_provider_error",
            FileEditNoMatch => "file_edit_no_match",
            FileEditAmbiguous => "file_edit_ambiguous",
            FileNotFound => "file_not_found",
            FileWriteFailed => "file_write_failed",
            FilePathRejected => "file_path_rejected",
            CompileTypeError => "compile_type_error",
            CompileSyntaxError => "compile_syntax_error",
            CompileModuleNotFound => "compile_module_not_found",
            ValidationCheckFailed => "validation_check_failed",
            ValidationTimeout => "validation_timeout",
            InfraTaskTimeout => "infra_task_timeout",
            InfraIo => "infra_io",
            InfraUnknown => "infra_unknown",
        }
    }

    /// Whether a self-heal round can plausibly fix this failure.
    ///
    /// Request-construction problems (budget, protocol shape, scope) and
    /// infrastructure failures surface immediately.
    pub fn is_retryable(&self) -> bool {
        use FailureCode::*;
        matches!(
            self,
            FileEditNoMatch
                | FileEditAmbiguous
                | FileNotFound
                | FileWriteFailed
                | CompileTypeError
                | CompileSyntaxError
                | CompileModuleNotFound
                | ValidationCheckFailed
                | CodegenUnsafeOverwrite
                | CodegenUnparseableResponse
        )
    }

    fn default_remediation(&self) -> &'static str {
        use FailureCode::*;
        match self {
            PrepBudgetCapacity => {
                "Raise the token budget or split the task so fewer files are edit targets."
            }
            PrepFileRead => "Check that candidate files exist and are readable UTF-8.",
            PrepInvalidTask => "Provide a task description and at least one candidate file.",
            PrepApprovalAborted => "The task was declined at the approval step.",
            CodegenTimeout => "Retry later or raise generation_timeout_secs.",
            CodegenUnparseableResponse => {
                "Respond with a single JSON object matching the edit protocol."
            }
            CodegenProtocolViolation => {
                "Use one entry per path and non-empty search strings in edit operations."
            }
            CodegenUnsafeOverwrite => {
                "Use `edit` with search/replace pairs for files that were not shown in full."
            }
            CodegenScopeViolation => "Only modify files that were touched in the prior attempt.",
            CodegenToolNotCalled => "Return the structured edit response instead of prose.",
            CodegenEmptyResponse => "Return at least one file operation.",
            CodegenProviderError => "Check the API key and provider status.",
            FileEditNoMatch => {
                "Copy the search text verbatim from the current file, including whitespace."
            }
            FileEditAmbiguous => "Include more surrounding context so the search text is unique.",
            FileNotFound => "Use `create` for new files or correct the path.",
            FileWriteFailed => "Check file permissions and free disk space.",
            FilePathRejected => "Use repo-relative paths without `..` and avoid binary files.",
            CompileTypeError => "Fix the reported type errors in the touched files.",
            CompileSyntaxError => "Fix the syntax error at the reported location.",
            CompileModuleNotFound => "Fix the import path or add the missing module.",
            ValidationCheckFailed => "Inspect the check output and fix the reported problems.",
            ValidationTimeout => "Raise check_timeout_secs or scope the check command.",
            InfraTaskTimeout => "Raise task_deadline_secs or reduce max_heal_attempts.",
            InfraIo => "Check filesystem access for the repository.",
            InfraUnknown => "Unclassified failure; add a classifier rule for this message.",
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A classified failure. `success = false` results always carry one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredFailure {
    pub phase: FailurePhase,
    pub code: FailureCode,
    pub message: String,
    #[serde(default)]
    pub remediation: Option<String>,
}

impl StructuredFailure {
    pub fn new(code: FailureCode, message: impl Into<String>) -> Self {
        Self {
            phase: code.phase(),
            code,
            message: message.into(),
            remediation: Some(code.default_remediation().to_string()),
        }
    }

    pub fn with_remediation(mut self, remediation: impl Into<String>) -> Self {
        self.remediation = Some(remediation.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// `phase:code`, the form used in logs and reports.
    pub fn tag(&self) -> String {
        format!("{}:{}", self.phase.label(), self.code.label())
    }
}

impl fmt::Display for StructuredFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.tag(), self.message)
    }
}

/// Maps raw error text to a structured failure. Must be total and deterministic.
pub trait Classifier: Send + Sync {
    fn classify(&self, raw: &str) -> StructuredFailure;
}

struct Rule {
    pattern: Regex,
    code: FailureCode,
    remediation: Option<String>,
}

/// Ordered list of regex rules; first match wins, no match is `infra_unknown`.
pub struct PatternClassifier {
    rules: Vec<Rule>,
}

const BUILTIN_RULES: &[(&str, FailureCode)] = &[
    (r"(?i)search string not found|old_string not found|search text not found", FailureCode::FileEditNoMatch),
    (r"(?i)matches \d+ times|search (string|text) is not unique", FailureCode::FileEditAmbiguous),
    (r"(?i)budget capacity|exceeds? (the )?(token )?budget|edit targets? need", FailureCode::PrepBudgetCapacity),
    (r"(?i)approval (was )?(aborted|declined|denied)", FailureCode::PrepApprovalAborted),
    (r"(?i)cannot load candidate", FailureCode::PrepFileRead),
    (r"(?i)working tree lock|could not be run|failed to read ", FailureCode::InfraIo),
    (r"(?i)failed to write ", FailureCode::FileWriteFailed),
    (r"\bTS2307\b|(?i)cannot find module|unresolved import|E0432|E0433|no module named|could not import", FailureCode::CompileModuleNotFound),
    (r"\bTS1\d{3}\b|(?i)syntax ?error|unexpected token|expected one of|parse error", FailureCode::CompileSyntaxError),
    (r"\bTS\d{4}\b|\bE0\d{3}\b|(?i)type error|mismatched types|is not assignable", FailureCode::CompileTypeError),
    (r"(?i)tool[_ ]schema|did not call (the )?tool|no tool call|tool_use missing", FailureCode::CodegenToolNotCalled),
    (r"(?i)generation (call )?timed out|oracle timed out|request timed out", FailureCode::CodegenTimeout),
    (r"(?i)full overwrite|unsafe overwrite|was only (delivered|shown) as", FailureCode::CodegenUnsafeOverwrite),
    (r"(?i)outside (the )?(allowed )?scope|outside the files this round may change|not touched in the prior attempt", FailureCode::CodegenScopeViolation),
    (r"(?i)protocol violation|duplicate path|appears more than once|has no search/replace pairs|empty search string|search string is empty", FailureCode::CodegenProtocolViolation),
    (r"(?i)no json|invalid json|not valid (edit-protocol )?json|expected value at line|unparseable|eof while parsing|unknown variant", FailureCode::CodegenUnparseableResponse),
    (r"(?i)no file operations|empty response", FailureCode::CodegenEmptyResponse),
    (r"(?i)api key|rate limited|openrouter|status 5\d\d|provider error|request to provider|provider payload|no reply left", FailureCode::CodegenProviderError),
    (r"(?i)\bpath .*rejected:|parent traversal|absolute paths are not allowed|escapes repository|binary file", FailureCode::FilePathRejected),
    (r"(?i)no such file or directory|file not found|os error 2\b", FailureCode::FileNotFound),
    (r"(?i)permission denied|read-only file system|no space left|failed to write", FailureCode::FileWriteFailed),
    (r"(?i)check (command )?timed out", FailureCode::ValidationTimeout),
    (r"(?i)check (command )?failed|lint error|tests? failed", FailureCode::ValidationCheckFailed),
    (r"(?i)task deadline|deadline exceeded", FailureCode::InfraTaskTimeout),
    (r"(?i)broken pipe|connection reset|i/o error|io error", FailureCode::InfraIo),
];

static BUILTIN: LazyLock<Vec<(Regex, FailureCode)>> = LazyLock::new(|| {
    BUILTIN_RULES
        .iter()
        .map(|(pattern, code)| (Regex::new(pattern).expect("builtin classifier rule"), *code))
        .collect()
});

impl Default for PatternClassifier {
    fn default() -> Self {
        Self {
            rules: BUILTIN
                .iter()
                .map(|(pattern, code)| Rule {
                    pattern: pattern.clone(),
                    code: *code,
                    remediation: None,
                })
                .collect(),
        }
    }
}

impl PatternClassifier {
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Prepend a rule so it takes priority over the built-ins.
    pub fn with_rule(
        mut self,
        pattern: &str,
        code: FailureCode,
        remediation: Option<&str>,
    ) -> anyhow::Result<Self> {
        let pattern = Regex::new(pattern)?;
        self.rules.insert(
            0,
            Rule {
                pattern,
                code,
                remediation: remediation.map(str::to_string),
            },
        );
        Ok(self)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

impl Classifier for PatternClassifier {
    fn classify(&self, raw: &str) -> StructuredFailure {
        let message = crate::util::truncate(raw.trim(), 600);
        for rule in &self.rules {
            if rule.pattern.is_match(raw) {
                let failure = StructuredFailure::new(rule.code, message);
                return match &rule.remediation {
                    Some(r) => failure.with_remediation(r.clone()),
                    None => failure,
                };
            }
        }
        tracing::warn!(
            target: "cosmos_forge::failure",
            message = %crate::util::truncate(raw.trim(), 200),
            "unclassified failure; consider adding a classifier rule"
        );
        StructuredFailure::new(FailureCode::InfraUnknown, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_code_has_a_single_phase_and_label() {
        let mut labels = std::collections::HashSet::new();
        for code in FailureCode::ALL {
            assert!(labels.insert(code.label()));
            let _ = code.phase();
        }
        assert_eq!(labels.len(), FailureCode::ALL.len());
    }

    #[test]
    fn classifies_search_mismatch() {
        let c = PatternClassifier::default();
        let f = c.classify("Edit 1: search string not found in src/app.ts");
        assert_eq!(f.code, FailureCode::FileEditNoMatch);
        assert_eq!(f.phase, FailurePhase::FileOperation);
        assert_eq!(f.tag(), "file_operation:file_edit_no_match");
    }

    #[test]
    fn classifies_typescript_codes() {
        let c = PatternClassifier::default();
        assert_eq!(
            c.classify("src/a.ts(3,1): error TS2322: Type 'x' is not assignable")
                .code,
            FailureCode::CompileTypeError
        );
        assert_eq!(
            c.classify("src/a.ts(1,19): error TS2307: Cannot find module './missing'")
                .code,
            FailureCode::CompileModuleNotFound
        );
        assert_eq!(
            c.classify("src/a.ts(1,1): error TS1005: ';' expected.").code,
            FailureCode::CompileSyntaxError
        );
    }

    #[test]
    fn classifies_tool_schema_violation() {
        let c = PatternClassifier::default();
        let f = c.classify("model did not call the tool: tool_schema mismatch");
        assert_eq!(f.code, FailureCode::CodegenToolNotCalled);
    }

    #[test]
    fn unmatched_text_is_infra_unknown() {
        let c = PatternClassifier::default();
        let f = c.classify("the flux capacitor hiccuped");
        assert_eq!(f.code, FailureCode::InfraUnknown);
        assert_eq!(f.phase, FailurePhase::Infrastructure);
        assert!(f.remediation.is_some());
    }

    #[test]
    fn classification_is_total_and_deterministic() {
        let c = PatternClassifier::default();
        for input in ["", "   ", "\u{0}", "TS2307", "random words", "错误"] {
            let a = c.classify(input);
            let b = c.classify(input);
            assert_eq!(a.code, b.code);
            assert_eq!(a.phase, b.phase);
        }
    }

    #[test]
    fn custom_rules_take_priority() {
        let c = PatternClassifier::default()
            .with_rule(r"flux capacitor", FailureCode::InfraIo, Some("Recalibrate."))
            .unwrap();
        assert_eq!(c.rule_count(), PatternClassifier::default().rule_count() + 1);
        let f = c.classify("the flux capacitor hiccuped");
        assert_eq!(f.code, FailureCode::InfraIo);
        assert_eq!(f.remediation.as_deref(), Some("Recalibrate."));
    }

    #[test]
    fn own_error_texts_classify_like_their_typed_codes() {
        use crate::budget::CapacityError;
        use crate::edit::{ApplyError, ProtocolError};
        use crate::oracle::OracleError;
        use crate::validate::ValidationError;
        use std::io::{Error as IoError, ErrorKind};
        use std::path::PathBuf;
        use std::time::Duration;

        let path = || PathBuf::from("src/app.ts");
        let denied = || IoError::new(ErrorKind::PermissionDenied, "permission denied");

        let mut typed: Vec<StructuredFailure> = Vec::new();
        for err in [
            ProtocolError::Unparseable("expected value at line 1 column 1".into()),
            ProtocolError::Empty,
            ProtocolError::DuplicatePath(path()),
            ProtocolError::EmptyEdits(path()),
            ProtocolError::EmptySearch { path: path(), index: 2 },
            ProtocolError::UnsafeOverwrite {
                path: path(),
                action: "modify",
                seen: "signatures",
            },
            ProtocolError::OutOfScope(path()),
            ProtocolError::PathRejected {
                path: PathBuf::from("/etc/passwd"),
                reason: "absolute paths are not allowed".into(),
            },
            ProtocolError::PathRejected {
                path: PathBuf::new(),
                reason: "empty path".into(),
            },
        ] {
            typed.push(StructuredFailure::from(&err));
        }
        for err in [
            ApplyError::NoMatch {
                path: path(),
                index: 1,
                preview: "foo".into(),
            },
            ApplyError::Ambiguous {
                path: path(),
                index: 1,
                count: 2,
                preview: "foo".into(),
            },
            ApplyError::EmptySearch { path: path(), index: 1 },
            ApplyError::NotFound(path()),
            ApplyError::PathRejected {
                path: PathBuf::from("logo.png"),
                reason: "binary files cannot be written".into(),
            },
            ApplyError::Read {
                path: path(),
                source: denied(),
            },
            ApplyError::Write {
                path: path(),
                source: denied(),
            },
            ApplyError::Lock("timed out after 30s".into()),
        ] {
            typed.push(StructuredFailure::from(&err));
        }
        for err in [
            CapacityError::EditTargetsExceedBudget {
                required: 9_000,
                total: 500,
            },
            CapacityError::Unreadable {
                path: path(),
                source: denied(),
            },
        ] {
            typed.push(StructuredFailure::from(&err));
        }
        for err in [
            OracleError::Timeout(Duration::from_secs(5)),
            OracleError::MissingApiKey,
            OracleError::Provider {
                status: 503,
                message: "upstream overloaded".into(),
            },
            OracleError::Transport("connection refused".into()),
            OracleError::Payload("missing choices".into()),
            OracleError::Exhausted,
        ] {
            typed.push(StructuredFailure::from(&err));
        }
        typed.push(StructuredFailure::from(&ValidationError::Spawn {
            command: "npx tsc --noEmit".into(),
            reason: "No such file or directory (os error 2)".into(),
        }));

        let c = PatternClassifier::default();
        for failure in typed {
            assert_eq!(
                c.classify(&failure.message).code,
                failure.code,
                "{}",
                failure.message
            );
        }
    }

    #[test]
    fn retry_policy_matches_propagation_rules() {
        assert!(FailureCode::FileEditNoMatch.is_retryable());
        assert!(FailureCode::CompileTypeError.is_retryable());
        assert!(!FailureCode::PrepBudgetCapacity.is_retryable());
        assert!(!FailureCode::CodegenProtocolViolation.is_retryable());
        assert!(!FailureCode::CodegenTimeout.is_retryable());
        assert!(!FailureCode::InfraUnknown.is_retryable());
    }
}
