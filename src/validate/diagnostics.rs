//! Parsing checker output into structured diagnostics.

use crate::util::{normalize_relative_path, strip_ansi_sequences};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Component, PathBuf};
use std::sync::LazyLock;

// src/foo.ts(12,34): error TS2304: Cannot find name 'X'.
static TSC_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?P<path>[^\s:(][^():]*)\((?P<line>\d+),(?P<col>\d+)\):\s*(?P<sev>error|warning)\s*(?P<code>TS\d+):\s*(?P<msg>.+)$",
    )
    .expect("tsc line regex")
});

// src/foo.ts:12:34 - error TS2304: Cannot find name 'X'.
static TSC_PRETTY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:\./)?(?P<path>[^\s:]+?\.[A-Za-z0-9]+):(?P<line>\d+):(?P<col>\d+)\s+-\s+(?P<sev>error|warning)\s+(?P<code>TS\d+):\s*(?P<msg>.+)$",
    )
    .expect("tsc pretty regex")
});

// src/lib.rs:3:5: error[E0425]: cannot find value `x`
// main.c:4:1: error: expected ';'
static COLON_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:\./)?(?P<path>[^\s:]+?\.[A-Za-z0-9]+):(?P<line>\d+):(?:(?P<col>\d+):)?\s*(?P<sev>error|warning|fatal error)(?:\[(?P<code>[A-Za-z]*\d+)\])?:\s*(?P<msg>.+)$",
    )
    .expect("colon diagnostic regex")
});

// error[E0425]: cannot find value `x` in this scope
static RUSTC_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<sev>error|warning)(?:\[(?P<code>E\d+)\])?:\s*(?P<msg>.+)$")
        .expect("rustc header regex")
});

//   --> src/lib.rs:3:5
static RUSTC_LOCATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*-->\s*(?P<path>[^\s:]+):(?P<line>\d+):(?P<col>\d+)").expect("rustc location regex")
});

// ./main.go:10:2: undefined: x
static GO_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:\./)?(?P<path>[^\s:]+?\.go):(?P<line>\d+):(?P<col>\d+):\s*(?P<msg>.+)$")
        .expect("go diagnostic regex")
});

//   File "./pkg/mod.py", line 3
static PY_LOCATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^\s*File "(?P<path>[^"]+\.py)", line (?P<line>\d+)"#).expect("python location regex")
});

// SyntaxError: invalid syntax
static PY_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<code>[A-Z][A-Za-z]*(?:Error|Exception)):\s*(?P<msg>.*)$").expect("python error regex")
});

// ./path/file.ts:12:34 (followed by "Type error: ...")
static BARE_LOCATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:\./)?(?P<path>[^\s:]+?\.[A-Za-z0-9]+):(?P<line>\d+):(?P<col>\d+)\s*$")
        .expect("bare location regex")
});

/// rustc/cargo summary lines that change with the error count.
const NOISE_PREFIXES: &[&str] = &[
    "aborting due to",
    "could not compile",
    "build failed",
    "Some errors have detailed explanations",
    "For more information about",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Diagnostic {
    pub file: Option<PathBuf>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub code: Option<String>,
    pub message: String,
    pub severity: Severity,
}

/// Identity used when diffing against a baseline. Line numbers are left out
/// because edits above a pre-existing error shift it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DiagnosticKey {
    pub file: Option<PathBuf>,
    pub code: Option<String>,
    pub message: String,
}

impl Diagnostic {
    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    pub fn key(&self) -> DiagnosticKey {
        DiagnosticKey {
            file: self.file.clone(),
            code: self.code.clone(),
            message: self.message.clone(),
        }
    }

    /// One line, tsc-style, for prompts and failure messages.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(file) = &self.file {
            out.push_str(&file.display().to_string());
            match (self.line, self.column) {
                (Some(l), Some(c)) => out.push_str(&format!("({},{})", l, c)),
                (Some(l), None) => out.push_str(&format!("({})", l)),
                _ => {}
            }
            out.push_str(": ");
        }
        out.push_str(match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        });
        if let Some(code) = &self.code {
            out.push(' ');
            out.push_str(code);
        }
        out.push_str(": ");
        out.push_str(&self.message);
        out
    }
}

fn parse_severity(raw: &str) -> Severity {
    if raw.contains("error") {
        Severity::Error
    } else {
        Severity::Warning
    }
}

fn safe_path(raw: &str) -> Option<PathBuf> {
    let path = normalize_relative_path(raw);
    if path.as_os_str().is_empty() || path.is_absolute() {
        return None;
    }
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        .then_some(path)
}

fn num(caps: &regex::Captures<'_>, name: &str) -> Option<u32> {
    caps.name(name).and_then(|m| m.as_str().parse().ok())
}

fn from_located(caps: &regex::Captures<'_>, severity: Severity) -> Option<Diagnostic> {
    Some(Diagnostic {
        file: safe_path(caps.name("path")?.as_str()),
        line: num(caps, "line"),
        column: num(caps, "col"),
        code: caps.name("code").map(|m| m.as_str().to_string()),
        message: caps.name("msg")?.as_str().trim().to_string(),
        severity,
    })
}

fn is_noise(message: &str) -> bool {
    NOISE_PREFIXES.iter().any(|p| message.starts_with(p))
}

/// Parse every recognizable diagnostic out of raw checker output.
pub fn parse_diagnostics(output: &str) -> Vec<Diagnostic> {
    let clean = strip_ansi_sequences(output);
    let lines: Vec<&str> = clean.lines().collect();
    let mut out = Vec::new();
    let mut i = 0usize;

    while i < lines.len() {
        let line = lines[i];
        let trimmed = line.trim();

        if let Some(caps) = TSC_LINE.captures(trimmed) {
            out.extend(from_located(&caps, parse_severity(&caps["sev"])));
        } else if let Some(caps) = TSC_PRETTY.captures(trimmed) {
            out.extend(from_located(&caps, parse_severity(&caps["sev"])));
        } else if let Some(caps) = COLON_LINE.captures(trimmed) {
            if !is_noise(&caps["msg"]) {
                out.extend(from_located(&caps, parse_severity(&caps["sev"])));
            }
        } else if let Some(caps) = RUSTC_HEADER.captures(line) {
            let message = caps["msg"].trim().to_string();
            if !is_noise(&message) {
                let location = lines[i + 1..]
                    .iter()
                    .take(3)
                    .find_map(|l| RUSTC_LOCATION.captures(l));
                out.push(Diagnostic {
                    file: location.as_ref().and_then(|c| safe_path(&c["path"])),
                    line: location.as_ref().and_then(|c| num(c, "line")),
                    column: location.as_ref().and_then(|c| num(c, "col")),
                    code: caps.name("code").map(|m| m.as_str().to_string()),
                    message,
                    severity: parse_severity(&caps["sev"]),
                });
            }
        } else if let Some(caps) = GO_LINE.captures(trimmed) {
            out.extend(from_located(&caps, Severity::Error));
        } else if let Some(caps) = PY_LOCATION.captures(line) {
            let error = lines[i + 1..]
                .iter()
                .take(6)
                .find_map(|l| PY_ERROR.captures(l.trim()));
            if let Some(err) = error {
                out.push(Diagnostic {
                    file: safe_path(&caps["path"]),
                    line: num(&caps, "line"),
                    column: None,
                    code: Some(err["code"].to_string()),
                    message: err["msg"].trim().to_string(),
                    severity: Severity::Error,
                });
            }
        } else if let Some(caps) = BARE_LOCATION.captures(trimmed) {
            let next = lines.get(i + 1).map(|l| l.trim()).unwrap_or("");
            if let Some(message) = next.strip_prefix("Type error:") {
                out.push(Diagnostic {
                    file: safe_path(&caps["path"]),
                    line: num(&caps, "line"),
                    column: num(&caps, "col"),
                    code: None,
                    message: message.trim().to_string(),
                    severity: Severity::Error,
                });
                i += 1;
            }
        }
        i += 1;
    }
    out
}

/// Distinct files named by error diagnostics, in first-seen order.
pub fn error_paths(diagnostics: &[Diagnostic]) -> Vec<PathBuf> {
    crate::util::dedup_preserve_order(
        diagnostics
            .iter()
            .filter(|d| d.is_error())
            .filter_map(|d| d.file.clone())
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn parses_tsc_plain_and_pretty() {
        let out = "src/app.ts(1,19): error TS2307: Cannot find module './missing'.\n\
                   \x1b[96msrc/util.ts\x1b[0m:4:7 - error TS2322: Type 'string' is not assignable to type 'number'.\n\
                   Found 2 errors.";
        let diags = parse_diagnostics(out);
        assert_eq!(diags.len(), 2);
        assert_eq!(diags[0].file.as_deref(), Some(Path::new("src/app.ts")));
        assert_eq!(diags[0].code.as_deref(), Some("TS2307"));
        assert_eq!(diags[0].line, Some(1));
        assert_eq!(diags[1].file.as_deref(), Some(Path::new("src/util.ts")));
        assert_eq!(diags[1].column, Some(7));
    }

    #[test]
    fn parses_rustc_short_and_long() {
        let short = "src/lib.rs:3:5: error[E0425]: cannot find value `x` in this scope\n\
                     error: could not compile `demo` (lib) due to 1 previous error";
        let diags = parse_diagnostics(short);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].code.as_deref(), Some("E0425"));

        let long = "error[E0308]: mismatched types\n  --> src/main.rs:10:13\n   |\n\
                    warning: unused variable: `y`\n  --> src/main.rs:2:9\n\
                    error: aborting due to 1 previous error";
        let diags = parse_diagnostics(long);
        assert_eq!(diags.len(), 2);
        assert!(diags[0].is_error());
        assert_eq!(diags[0].file.as_deref(), Some(Path::new("src/main.rs")));
        assert_eq!(diags[0].line, Some(10));
        assert_eq!(diags[1].severity, Severity::Warning);
    }

    #[test]
    fn parses_go_and_python() {
        let go = "# example\n./main.go:10:2: undefined: helper";
        let diags = parse_diagnostics(go);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].file.as_deref(), Some(Path::new("main.go")));

        let py = "*** Error compiling './pkg/mod.py'...\n  File \"./pkg/mod.py\", line 3\n    def (\n        ^\nSyntaxError: invalid syntax";
        let diags = parse_diagnostics(py);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].code.as_deref(), Some("SyntaxError"));
        assert_eq!(diags[0].file.as_deref(), Some(Path::new("pkg/mod.py")));
    }

    #[test]
    fn parses_next_style_type_errors() {
        let out = "Failed to compile.\n./app/page.tsx:12:34\nType error: Cannot find name 'X'.";
        let diags = parse_diagnostics(out);
        assert_eq!(diags.len(), 1);
        assert_eq!(diags[0].message, "Cannot find name 'X'.");
    }

    #[test]
    fn rejects_paths_outside_the_repo() {
        let diags = parse_diagnostics("../other/x.ts(1,1): error TS2304: Cannot find name 'y'.");
        assert_eq!(diags.len(), 1);
        assert!(diags[0].file.is_none());
    }

    #[test]
    fn render_is_tsc_style() {
        let diags = parse_diagnostics("src/app.ts(1,19): error TS2307: Cannot find module './missing'.");
        assert_eq!(
            diags[0].render(),
            "src/app.ts(1,19): error TS2307: Cannot find module './missing'."
        );
        assert_eq!(error_paths(&diags), vec![PathBuf::from("src/app.ts")]);
    }
}
