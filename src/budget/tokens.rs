//! Token estimation without a tokenizer.
//!
//! Source code is denser in punctuation than prose, so it gets ~3 chars per
//! token instead of ~4.

use std::path::Path;

const CODE_CHARS_PER_TOKEN: usize = 3;
const PROSE_CHARS_PER_TOKEN: usize = 4;

/// Punctuation share above which unknown text is treated as code.
const CODE_PUNCTUATION_RATIO: f64 = 0.08;

const CODE_EXTENSIONS: &[&str] = &[
    "rs", "ts", "tsx", "js", "jsx", "mjs", "cjs", "py", "go", "java", "kt", "c", "h", "cc",
    "cpp", "hpp", "cs", "rb", "php", "swift", "scala", "sh", "json", "toml", "yaml", "yml",
    "css", "scss", "html", "vue", "svelte", "sql",
];

const PROSE_EXTENSIONS: &[&str] = &["md", "markdown", "txt", "rst", "adoc"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextKind {
    Code,
    Prose,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokenEstimator;

impl TokenEstimator {
    pub fn kind_for(path: Option<&Path>, text: &str) -> TextKind {
        if let Some(ext) = path
            .and_then(|p| p.extension())
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
        {
            if CODE_EXTENSIONS.contains(&ext.as_str()) {
                return TextKind::Code;
            }
            if PROSE_EXTENSIONS.contains(&ext.as_str()) {
                return TextKind::Prose;
            }
        }
        Self::sniff(text)
    }

    fn sniff(text: &str) -> TextKind {
        let mut total = 0usize;
        let mut punct = 0usize;
        for ch in text.chars().filter(|c| !c.is_whitespace()) {
            total += 1;
            if matches!(
                ch,
                '{' | '}' | '(' | ')' | '[' | ']' | ';' | '=' | '<' | '>' | ':' | '&' | '|'
            ) {
                punct += 1;
            }
        }
        if total > 0 && (punct as f64 / total as f64) >= CODE_PUNCTUATION_RATIO {
            TextKind::Code
        } else {
            TextKind::Prose
        }
    }

    pub fn estimate_kind(text: &str, kind: TextKind) -> usize {
        let chars = text.chars().count();
        let per_token = match kind {
            TextKind::Code => CODE_CHARS_PER_TOKEN,
            TextKind::Prose => PROSE_CHARS_PER_TOKEN,
        };
        chars.div_ceil(per_token)
    }

    /// Estimate tokens for file content, using the path to pick code vs prose.
    pub fn estimate(path: Option<&Path>, text: &str) -> usize {
        Self::estimate_kind(text, Self::kind_for(path, text))
    }

    /// Inverse of `estimate_kind`: how many chars fit in `tokens`.
    pub fn chars_for(tokens: usize, kind: TextKind) -> usize {
        match kind {
            TextKind::Code => tokens.saturating_mul(CODE_CHARS_PER_TOKEN),
            TextKind::Prose => tokens.saturating_mul(PROSE_CHARS_PER_TOKEN),
        }
    }
}
