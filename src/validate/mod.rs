//! Compile/type-check gate.
//!
//! Runs the project's checker, parses what it prints, and compares the
//! errors against a baseline captured before any edits were applied so a
//! repository that was already red can still accept a clean change.

pub mod diagnostics;

pub use diagnostics::{parse_diagnostics, Diagnostic, DiagnosticKey, Severity};

use crate::failure::{FailureCode, StructuredFailure};
use crate::util::{run_command_with_timeout, tail_chars};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

pub const CHECK_COMMAND_ENV: &str = "COSMOS_FORGE_CHECK_CMD";
pub const OUTPUT_TAIL_CHARS: usize = 4_000;
const FILES_PLACEHOLDER: &str = "{files}";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckCommand {
    Shell(String),
    Program { program: String, args: Vec<String> },
}

impl CheckCommand {
    pub fn display(&self) -> String {
        match self {
            CheckCommand::Shell(cmd) => cmd.clone(),
            CheckCommand::Program { program, args } => {
                if args.is_empty() {
                    program.clone()
                } else {
                    format!("{} {}", program, args.join(" "))
                }
            }
        }
    }

    fn program(program: &str, args: &[&str]) -> Self {
        CheckCommand::Program {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Build the process, substituting `{files}` with the existing changed files.
    fn build(&self, repo_root: &Path, changed: &[PathBuf]) -> Command {
        let files: Vec<String> = changed
            .iter()
            .filter(|p| repo_root.join(p).exists())
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .collect();

        let mut command = match self {
            CheckCommand::Shell(cmd) => {
                let quoted = files
                    .iter()
                    .map(|f| shell_quote(f))
                    .collect::<Vec<_>>()
                    .join(" ");
                let script = cmd.replace(FILES_PLACEHOLDER, &quoted);
                shell_command(&script)
            }
            CheckCommand::Program { program, args } => {
                let mut command = Command::new(program);
                for arg in args {
                    if arg == FILES_PLACEHOLDER {
                        command.args(&files);
                    } else {
                        command.arg(arg);
                    }
                }
                command
            }
        };
        command.current_dir(repo_root);
        command.env("NO_COLOR", "1");
        command
    }
}

#[cfg(unix)]
fn shell_command(script: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(script);
    command
}

#[cfg(windows)]
fn shell_command(script: &str) -> Command {
    let mut command = Command::new("cmd");
    command.arg("/C").arg(script);
    command
}

fn shell_quote(raw: &str) -> String {
    if raw
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-'))
    {
        raw.to_string()
    } else {
        format!("'{}'", raw.replace('\'', r"'\''"))
    }
}

/// Pick the check command: explicit config, then the environment, then
/// whatever the repository layout suggests.
pub fn detect_check_command(repo_root: &Path, configured: Option<&str>) -> Option<CheckCommand> {
    if let Some(cmd) = configured.filter(|c| !c.trim().is_empty()) {
        return Some(CheckCommand::Shell(cmd.to_string()));
    }
    if let Ok(cmd) = std::env::var(CHECK_COMMAND_ENV) {
        if !cmd.trim().is_empty() {
            return Some(CheckCommand::Shell(cmd));
        }
    }

    if repo_root.join("tsconfig.json").exists() {
        return Some(CheckCommand::program("npx", &["tsc", "--noEmit", "-p", "."]));
    }

    if let Some(script) = package_json_typecheck_script(repo_root) {
        return Some(js_script_command(repo_root, &script));
    }

    if repo_root.join("Cargo.toml").exists() {
        return Some(CheckCommand::program(
            "cargo",
            &["check", "--message-format", "short"],
        ));
    }

    if repo_root.join("go.mod").exists() {
        return Some(CheckCommand::program("go", &["vet", "./..."]));
    }

    if repo_root.join("pyproject.toml").exists() || repo_root.join("setup.py").exists() {
        return Some(CheckCommand::program("python", &["-m", "compileall", "-q", "."]));
    }

    None
}

fn package_json_typecheck_script(repo_root: &Path) -> Option<String> {
    let content = std::fs::read_to_string(repo_root.join("package.json")).ok()?;
    let parsed: serde_json::Value = serde_json::from_str(&content).ok()?;
    let scripts = parsed.get("scripts")?.as_object()?;
    ["typecheck", "type-check", "tsc"]
        .into_iter()
        .find(|name| scripts.contains_key(*name))
        .map(str::to_string)
}

fn js_script_command(repo_root: &Path, script: &str) -> CheckCommand {
    if repo_root.join("pnpm-lock.yaml").exists() {
        return CheckCommand::program("pnpm", &[script]);
    }
    if repo_root.join("yarn.lock").exists() {
        return CheckCommand::program("yarn", &[script]);
    }
    if repo_root.join("bun.lockb").exists() || repo_root.join("bun.lock").exists() {
        return CheckCommand::program("bun", &["run", script]);
    }
    CheckCommand::program("npm", &["run", script, "--silent"])
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("check command `{command}` could not be run: {reason}")]
    Spawn { command: String, reason: String },
}

impl From<&ValidationError> for StructuredFailure {
    fn from(err: &ValidationError) -> Self {
        StructuredFailure::new(FailureCode::InfraIo, err.to_string())
            .with_remediation("Check that the configured check command is installed.")
    }
}

/// Checker state before the task touched anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Baseline {
    pub passed: bool,
    pub diagnostics: Vec<Diagnostic>,
}

impl Baseline {
    pub fn error_count(&self) -> usize {
        self.diagnostics.iter().filter(|d| d.is_error()).count()
    }

    /// The checker failed without printing any error it could parse.
    pub fn failed_unparsed(&self) -> bool {
        !self.passed && self.error_count() == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub passed: bool,
    /// True when no check command was available.
    #[serde(default)]
    pub skipped: bool,
    #[serde(default)]
    pub timed_out: bool,
    pub command: String,
    pub exit_code: Option<i32>,
    /// Tail of the combined checker output.
    pub raw_output: String,
    pub diagnostics: Vec<Diagnostic>,
    /// Error diagnostics not present in the baseline.
    pub new_diagnostics: Vec<Diagnostic>,
    pub duration_ms: u64,
}

impl ValidationResult {
    pub fn skipped() -> Self {
        Self {
            passed: true,
            skipped: true,
            command: "(none)".to_string(),
            ..Self::default()
        }
    }

    /// The first `limit` new errors, one per line, or the output tail when
    /// nothing structured was found.
    pub fn error_text(&self, limit: usize) -> String {
        if self.new_diagnostics.is_empty() {
            return self.raw_output.clone();
        }
        self.new_diagnostics
            .iter()
            .take(limit)
            .map(Diagnostic::render)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Errors in `current` beyond those in `baseline`, counted per key so a
/// second copy of a pre-existing error still shows up as new.
pub fn new_errors(current: &[Diagnostic], baseline: &[Diagnostic]) -> Vec<Diagnostic> {
    let mut remaining: HashMap<DiagnosticKey, usize> = HashMap::new();
    for diag in baseline.iter().filter(|d| d.is_error()) {
        *remaining.entry(diag.key()).or_default() += 1;
    }
    let mut out = Vec::new();
    for diag in current.iter().filter(|d| d.is_error()) {
        match remaining.get_mut(&diag.key()) {
            Some(count) if *count > 0 => *count -= 1,
            _ => out.push(diag.clone()),
        }
    }
    out
}

pub struct ValidationGate {
    repo_root: PathBuf,
    command: Option<CheckCommand>,
    timeout: Duration,
}

struct CheckRun {
    command: String,
    success: bool,
    timed_out: bool,
    exit_code: Option<i32>,
    output: String,
    duration: Duration,
}

impl ValidationGate {
    pub fn new(repo_root: impl Into<PathBuf>, command: Option<CheckCommand>, timeout: Duration) -> Self {
        Self {
            repo_root: repo_root.into(),
            command,
            timeout,
        }
    }

    pub fn detect(repo_root: impl Into<PathBuf>, configured: Option<&str>, timeout: Duration) -> Self {
        let repo_root = repo_root.into();
        let command = detect_check_command(&repo_root, configured);
        match &command {
            Some(cmd) => tracing::debug!(command = %cmd.display(), "check command selected"),
            None => tracing::warn!(repo = %repo_root.display(), "no check command detected; validation will be skipped"),
        }
        Self::new(repo_root, command, timeout)
    }

    pub fn command(&self) -> Option<&CheckCommand> {
        self.command.as_ref()
    }

    async fn run(&self, changed: &[PathBuf]) -> Result<Option<CheckRun>, ValidationError> {
        let Some(check) = &self.command else {
            return Ok(None);
        };
        let label = check.display();
        let mut command = check.build(&self.repo_root, changed);
        let result = run_command_with_timeout(&mut command, self.timeout)
            .await
            .map_err(|reason| ValidationError::Spawn {
                command: label.clone(),
                reason,
            })?;
        Ok(Some(CheckRun {
            command: label,
            success: result.success(),
            timed_out: result.timed_out,
            exit_code: result.exit_code(),
            output: result.combined_output(),
            duration: result.duration,
        }))
    }

    /// Run the checker on the untouched tree. `None` when there is no checker.
    pub async fn capture_baseline(&self, scope: &[PathBuf]) -> Result<Option<Baseline>, ValidationError> {
        let Some(run) = self.run(scope).await? else {
            return Ok(None);
        };
        let diagnostics = parse_diagnostics(&run.output);
        let baseline = Baseline {
            passed: run.success && !run.timed_out,
            diagnostics,
        };
        tracing::info!(
            command = %run.command,
            passed = baseline.passed,
            errors = baseline.error_count(),
            "baseline captured"
        );
        Ok(Some(baseline))
    }

    pub async fn validate(
        &self,
        changed: &[PathBuf],
        baseline: Option<&Baseline>,
    ) -> Result<ValidationResult, ValidationError> {
        let Some(run) = self.run(changed).await? else {
            return Ok(ValidationResult::skipped());
        };

        let diagnostics = parse_diagnostics(&run.output);
        let new_diagnostics = match baseline {
            Some(b) => new_errors(&diagnostics, &b.diagnostics),
            None => diagnostics.iter().filter(|d| d.is_error()).cloned().collect(),
        };
        let has_structured = diagnostics.iter().any(Diagnostic::is_error);

        let passed = if run.timed_out {
            false
        } else if has_structured {
            new_diagnostics.is_empty()
        } else {
            // Nothing parseable: judge by exit status, tolerating a checker
            // that was already failing the same unparseable way before the task.
            run.success || baseline.map(Baseline::failed_unparsed).unwrap_or(false)
        };

        tracing::info!(
            command = %run.command,
            passed,
            timed_out = run.timed_out,
            errors = diagnostics.iter().filter(|d| d.is_error()).count(),
            new_errors = new_diagnostics.len(),
            "validation finished"
        );

        Ok(ValidationResult {
            passed,
            skipped: false,
            timed_out: run.timed_out,
            command: run.command,
            exit_code: run.exit_code,
            raw_output: tail_chars(&run.output, OUTPUT_TAIL_CHARS),
            diagnostics,
            new_diagnostics,
            duration_ms: run.duration.as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn diag(file: &str, line: u32, code: &str, msg: &str) -> Diagnostic {
        Diagnostic {
            file: Some(PathBuf::from(file)),
            line: Some(line),
            column: Some(1),
            code: Some(code.to_string()),
            message: msg.to_string(),
            severity: Severity::Error,
        }
    }

    #[test]
    fn new_errors_ignore_shifted_lines() {
        let baseline = vec![diag("a.ts", 3, "TS2304", "Cannot find name 'x'.")];
        let current = vec![
            diag("a.ts", 9, "TS2304", "Cannot find name 'x'."),
            diag("b.ts", 1, "TS2307", "Cannot find module './m'."),
        ];
        let fresh = new_errors(&current, &baseline);
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].file.as_deref(), Some(Path::new("b.ts")));
    }

    #[test]
    fn new_errors_count_duplicates() {
        let baseline = vec![diag("a.ts", 3, "TS2304", "x")];
        let current = vec![diag("a.ts", 3, "TS2304", "x"), diag("a.ts", 8, "TS2304", "x")];
        assert_eq!(new_errors(&current, &baseline).len(), 1);
    }

    #[test]
    fn detection_prefers_config_then_layout() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[package]\n").unwrap();
        assert_eq!(
            detect_check_command(dir.path(), Some("make check")),
            Some(CheckCommand::Shell("make check".into()))
        );
        if std::env::var(CHECK_COMMAND_ENV).is_err() {
            let detected = detect_check_command(dir.path(), None).unwrap();
            assert_eq!(detected.display(), "cargo check --message-format short");
            std::fs::write(dir.path().join("tsconfig.json"), "{}").unwrap();
            let detected = detect_check_command(dir.path(), None).unwrap();
            assert_eq!(detected.display(), "npx tsc --noEmit -p .");
        }
    }

    #[test]
    fn typecheck_script_uses_lockfile_manager() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"scripts":{"typecheck":"tsc --noEmit"}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("pnpm-lock.yaml"), "").unwrap();
        if std::env::var(CHECK_COMMAND_ENV).is_err() {
            assert_eq!(
                detect_check_command(dir.path(), None).unwrap().display(),
                "pnpm typecheck"
            );
        }
    }

    #[tokio::test]
    async fn missing_checker_skips() {
        let dir = tempdir().unwrap();
        let gate = ValidationGate::new(dir.path(), None, Duration::from_secs(5));
        let result = gate.validate(&[], None).await.unwrap();
        assert!(result.passed && result.skipped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn baseline_errors_do_not_fail_the_gate() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("old.ts"), "x").unwrap();
        let script = "echo \"old.ts(1,1): error TS2304: Cannot find name 'x'.\"; \
                      if [ -f new.ts ]; then echo \"new.ts(2,1): error TS2322: Type 'a' is not assignable to type 'b'.\"; fi; exit 2";
        let gate = ValidationGate::new(
            dir.path(),
            Some(CheckCommand::Shell(script.to_string())),
            Duration::from_secs(10),
        );
        let baseline = gate.capture_baseline(&[]).await.unwrap().unwrap();
        assert!(!baseline.passed);
        assert_eq!(baseline.error_count(), 1);

        let unchanged = gate.validate(&[], Some(&baseline)).await.unwrap();
        assert!(unchanged.passed);

        std::fs::write(dir.path().join("new.ts"), "y").unwrap();
        let broken = gate
            .validate(&[PathBuf::from("new.ts")], Some(&baseline))
            .await
            .unwrap();
        assert!(!broken.passed);
        assert_eq!(broken.new_diagnostics.len(), 1);
        assert!(broken.error_text(10).starts_with("new.ts(2,1): error TS2322"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_status_fallback_respects_baseline() {
        let dir = tempdir().unwrap();
        let gate = ValidationGate::new(
            dir.path(),
            Some(CheckCommand::Shell("echo broken; exit 1".into())),
            Duration::from_secs(10),
        );
        let failing = Baseline {
            passed: false,
            diagnostics: vec![],
        };
        assert!(gate.validate(&[], Some(&failing)).await.unwrap().passed);
        let clean = Baseline {
            passed: true,
            diagnostics: vec![],
        };
        let result = gate.validate(&[], Some(&clean)).await.unwrap();
        assert!(!result.passed);
        assert!(result.raw_output.contains("broken"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn crash_after_edit_fails_even_with_baseline_errors() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("app.ts"), "x").unwrap();
        let script = "if [ -f crashed ]; then echo 'Segmentation fault'; exit 139; fi; \
                      echo \"src/app.ts(1,1): error TS2304: Cannot find name 'x'.\"; exit 2";
        let gate = ValidationGate::new(
            dir.path(),
            Some(CheckCommand::Shell(script.to_string())),
            Duration::from_secs(10),
        );
        let baseline = gate.capture_baseline(&[]).await.unwrap().unwrap();
        assert!(!baseline.passed);
        assert_eq!(baseline.error_count(), 1);
        assert!(!baseline.failed_unparsed());

        std::fs::write(dir.path().join("crashed"), "").unwrap();
        let result = gate
            .validate(&[PathBuf::from("app.ts")], Some(&baseline))
            .await
            .unwrap();
        assert_eq!(result.exit_code, Some(139));
        assert!(result.new_diagnostics.is_empty());
        assert!(!result.passed, "a crashed checker must not pass");
        assert!(result.error_text(10).contains("Segmentation fault"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn files_placeholder_is_substituted() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a b.ts"), "x").unwrap();
        let gate = ValidationGate::new(
            dir.path(),
            Some(CheckCommand::Shell("for f in {files}; do echo \"seen:$f\"; done".into())),
            Duration::from_secs(10),
        );
        let result = gate
            .validate(&[PathBuf::from("a b.ts"), PathBuf::from("gone.ts")], None)
            .await
            .unwrap();
        assert!(result.passed);
        assert!(result.raw_output.contains("seen:a b.ts"));
        assert!(!result.raw_output.contains("gone.ts"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_checker_times_out() {
        let dir = tempdir().unwrap();
        let gate = ValidationGate::new(
            dir.path(),
            Some(CheckCommand::Shell("sleep 5".into())),
            Duration::from_millis(200),
        );
        let result = gate.validate(&[], None).await.unwrap();
        assert!(result.timed_out);
        assert!(!result.passed);
    }
}
