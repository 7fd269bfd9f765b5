//! Fidelity levels for file content delivered to the generator.

use super::tokens::TokenEstimator;
use crate::index::parser::outline_file;
use crate::index::{Language, Outline};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

const MAX_SUMMARY_EXPORTS: usize = 40;
const MAX_DESCRIPTION_CHARS: usize = 160;

/// Declaration-looking lines for languages without a grammar.
static DECLARATION_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:export\s+|pub(?:\([^)]*\))?\s+|async\s+|public\s+|private\s+|protected\s+|static\s+)*(?:import|from|use|package|#include|require|def|class|fn|func|function|const|let|var|type|interface|struct|enum|trait|impl|module|namespace)\b",
    )
    .expect("declaration line regex")
});

static DECLARED_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:fn|func|function|def|class|struct|enum|trait|interface|type|const)\s+([A-Za-z_][\w]*)")
        .expect("declared name regex")
});

/// Fidelity tiers, ordered from least to most faithful.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionLevel {
    Summary,
    Truncated,
    Signatures,
    Full,
}

impl ExtractionLevel {
    pub fn label(&self) -> &'static str {
        match self {
            ExtractionLevel::Full => "full",
            ExtractionLevel::Signatures => "signatures",
            ExtractionLevel::Truncated => "truncated",
            ExtractionLevel::Summary => "summary",
        }
    }

    /// One step down in fidelity; `None` below summary.
    pub fn lower(&self) -> Option<ExtractionLevel> {
        match self {
            ExtractionLevel::Full => Some(ExtractionLevel::Signatures),
            ExtractionLevel::Signatures => Some(ExtractionLevel::Truncated),
            ExtractionLevel::Truncated => Some(ExtractionLevel::Summary),
            ExtractionLevel::Summary => None,
        }
    }
}

/// File content at a given fidelity, as it will appear in the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedFile {
    pub path: PathBuf,
    pub content: String,
    pub level: ExtractionLevel,
    pub tokens: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ContentExtractor;

impl ContentExtractor {
    pub fn full(&self, path: &Path, content: &str) -> ExtractedFile {
        self.build(path, content.to_string(), ExtractionLevel::Full)
    }

    pub fn signatures(&self, path: &Path, content: &str) -> ExtractedFile {
        let outline = self.outline(path, content);
        self.build(path, outline.text, ExtractionLevel::Signatures)
    }

    /// Head + tail of the file cut at structural boundaries, sized to fit
    /// `max_tokens`. `None` when not even one line fits.
    pub fn truncated(&self, path: &Path, content: &str, max_tokens: usize) -> Option<ExtractedFile> {
        let kind = TokenEstimator::kind_for(Some(path), content);
        let language = Language::from_path(path);
        let lines: Vec<&str> = content.lines().collect();
        if lines.is_empty() || max_tokens == 0 {
            return None;
        }

        let mut char_budget = TokenEstimator::chars_for(max_tokens, kind);
        for _ in 0..6 {
            let candidate = truncate_lines(&lines, char_budget, language)?;
            let tokens = TokenEstimator::estimate_kind(&candidate, kind);
            if tokens <= max_tokens {
                return Some(ExtractedFile {
                    path: path.to_path_buf(),
                    content: candidate,
                    level: ExtractionLevel::Truncated,
                    tokens,
                });
            }
            char_budget = char_budget * 9 / 10;
        }
        None
    }

    /// Path, one-line description, and export list.
    pub fn summary(&self, path: &Path, content: &str) -> ExtractedFile {
        let language = Language::from_path(path);
        let description = describe(content, language);
        let outline = self.outline(path, content);
        let mut text = format!("{}: {}", path.display(), description);
        if !outline.exports.is_empty() {
            let shown: Vec<&str> = outline
                .exports
                .iter()
                .take(MAX_SUMMARY_EXPORTS)
                .map(String::as_str)
                .collect();
            let more = outline.exports.len().saturating_sub(shown.len());
            text.push_str(&format!("\nexports: {}", shown.join(", ")));
            if more > 0 {
                text.push_str(&format!(" (+{} more)", more));
            }
        }
        self.build(path, text, ExtractionLevel::Summary)
    }

    fn outline(&self, path: &Path, content: &str) -> Outline {
        let language = Language::from_path(path);
        if language != Language::Unknown {
            match outline_file(path, content, language) {
                Ok(outline) if !outline.text.trim().is_empty() => return outline,
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(path = %path.display(), error = %err, "outline failed; using line filter");
                }
            }
        }
        line_filter_outline(content)
    }

    fn build(&self, path: &Path, content: String, level: ExtractionLevel) -> ExtractedFile {
        let tokens = TokenEstimator::estimate(Some(path), &content);
        ExtractedFile {
            path: path.to_path_buf(),
            content,
            level,
            tokens,
        }
    }
}

fn line_filter_outline(content: &str) -> Outline {
    let mut lines = Vec::new();
    let mut exports = Vec::new();
    for line in content.lines() {
        if !DECLARATION_LINE.is_match(line) {
            continue;
        }
        lines.push(line.trim_end().to_string());
        let exported = line.trim_start().starts_with("export") || line.trim_start().starts_with("pub");
        if exported {
            if let Some(caps) = DECLARED_NAME.captures(line) {
                exports.push(caps[1].to_string());
            }
        }
    }
    Outline {
        text: lines.join("\n"),
        exports,
    }
}

fn is_boundary(line: &str) -> bool {
    line.trim().is_empty() || !line.starts_with(char::is_whitespace)
}

fn omission_marker(language: Language, omitted: usize) -> String {
    let comment = match language {
        Language::Python => "#",
        _ => "//",
    };
    format!("{} ... [{} lines omitted] ...", comment, omitted)
}

fn truncate_lines(lines: &[&str], char_budget: usize, language: Language) -> Option<String> {
    let marker_reserve = omission_marker(language, lines.len()).chars().count() + 2;
    let usable = char_budget.checked_sub(marker_reserve)?;
    let head_budget = usable / 2;
    let tail_budget = usable - head_budget;

    let mut head = 0usize;
    let mut used = 0usize;
    while head < lines.len() {
        let cost = lines[head].chars().count() + 1;
        if used + cost > head_budget {
            break;
        }
        used += cost;
        head += 1;
    }

    let mut tail_start = lines.len();
    used = 0;
    while tail_start > head {
        let cost = lines[tail_start - 1].chars().count() + 1;
        if used + cost > tail_budget {
            break;
        }
        used += cost;
        tail_start -= 1;
    }

    if tail_start <= head {
        // Everything fits.
        return Some(lines.join("\n"));
    }

    // Snap the head cut back to a structural boundary in its second half.
    if let Some(cut) = (head / 2 + 1..=head).rev().find(|&i| i < lines.len() && is_boundary(lines[i])) {
        head = cut;
    }
    // Snap the tail start forward to a top-level line in its first half.
    let tail_len = lines.len() - tail_start;
    if let Some(start) =
        (tail_start..tail_start + tail_len / 2).find(|&i| !lines[i].trim().is_empty() && is_boundary(lines[i]))
    {
        tail_start = start;
    }

    if head == 0 && tail_start == lines.len() {
        return None;
    }

    let omitted = tail_start - head;
    let mut out = lines[..head].join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out.push_str(&omission_marker(language, omitted));
    if tail_start < lines.len() {
        out.push('\n');
        out.push_str(&lines[tail_start..].join("\n"));
    }
    Some(out)
}

fn describe(content: &str, language: Language) -> String {
    let line_count = content.lines().count();
    for raw in content.lines().take(30) {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        let stripped = line
            .strip_prefix("//!")
            .or_else(|| line.strip_prefix("///"))
            .or_else(|| line.strip_prefix("/**"))
            .or_else(|| line.strip_prefix("//"))
            .or_else(|| line.strip_prefix("\"\"\""))
            .or_else(|| line.strip_prefix("# "))
            .or_else(|| line.strip_prefix("* "));
        if let Some(text) = stripped {
            let text = text.trim().trim_end_matches("*/").trim_end_matches("\"\"\"").trim();
            if !text.is_empty() && !text.starts_with('!') {
                return crate::util::truncate(text, MAX_DESCRIPTION_CHARS);
            }
        }
    }
    format!("{} source, {} lines", language.name(), line_count)
}
