//! Language detection and AST-backed outlines for the content extractor.

pub mod parser;

use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Rust,
    JavaScript,
    TypeScript,
    Python,
    Go,
    Unknown,
}

impl Language {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "rs" => Language::Rust,
            "js" | "jsx" | "mjs" | "cjs" => Language::JavaScript,
            "ts" | "tsx" | "mts" | "cts" => Language::TypeScript,
            "py" | "pyi" => Language::Python,
            "go" => Language::Go,
            _ => Language::Unknown,
        }
    }

    pub fn from_path(path: &Path) -> Self {
        path.extension()
            .and_then(|e| e.to_str())
            .map(Self::from_extension)
            .unwrap_or(Language::Unknown)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Language::Rust => "Rust",
            Language::JavaScript => "JavaScript",
            Language::TypeScript => "TypeScript",
            Language::Python => "Python",
            Language::Go => "Go",
            Language::Unknown => "text",
        }
    }

    /// Placeholder written where a function body was elided.
    pub fn elided_body(&self) -> &'static str {
        match self {
            Language::Python => " ...",
            _ => " { ... }",
        }
    }
}

/// A signature-level view of a file: declarations kept, bodies elided.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outline {
    pub text: String,
    /// Public/exported names, in source order.
    pub exports: Vec<String>,
}
