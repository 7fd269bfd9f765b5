//! Tree-sitter based outlines for multi-language signature extraction

use super::{Language, Outline};
use regex::Regex;
use std::cell::RefCell;
use std::path::Path;
use std::sync::LazyLock;
use tree_sitter::{Node, Parser};

// ═══════════════════════════════════════════════════════════════════════════
//  THREAD-LOCAL PARSER POOL
// ═══════════════════════════════════════════════════════════════════════════
//
// Tree-sitter parsers are expensive to create but can be reused for multiple
// files of the same language. Each rayon worker gets its own set.

thread_local! {
    static RUST_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        // Ignore error here - will be caught at parse time if language fails
        let _ = p.set_language(&tree_sitter_rust::LANGUAGE.into());
        p
    });

    static JS_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_javascript::LANGUAGE.into());
        p
    });

    static TS_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into());
        p
    });

    static TSX_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_typescript::LANGUAGE_TSX.into());
        p
    });

    static PYTHON_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_python::LANGUAGE.into());
        p
    });

    static GO_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_go::LANGUAGE.into());
        p
    });
}

/// `app.get(...)`, `router.post(...)`, `server.route(...)` and friends.
static ROUTE_REGISTRATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:await\s+)?[A-Za-z_$][\w$]*\.(?:get|post|put|patch|delete|head|options|all|use|route)\s*\(")
        .expect("route registration regex")
});

/// Parse content using a thread-local parser for the given language
fn parse_with_pooled_parser(
    content: &str,
    language: Language,
    path: Option<&Path>,
) -> anyhow::Result<tree_sitter::Tree> {
    let parse_result = match language {
        Language::Rust => RUST_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Language::JavaScript => JS_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Language::TypeScript => {
            let use_tsx = path
                .and_then(|p| p.extension())
                .and_then(|ext| ext.to_str())
                .map(|ext| ext.eq_ignore_ascii_case("tsx"))
                .unwrap_or(false);
            if use_tsx {
                TSX_PARSER.with(|p| p.borrow_mut().parse(content, None))
            } else {
                TS_PARSER.with(|p| p.borrow_mut().parse(content, None))
            }
        }
        Language::Python => PYTHON_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Language::Go => GO_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Language::Unknown => return Err(anyhow::anyhow!("Unknown language")),
    };

    parse_result.ok_or_else(|| anyhow::anyhow!("Failed to parse file"))
}

/// Build a signature outline of a file.
///
/// Keeps imports, exports, type declarations, module-level constants and
/// route registrations verbatim; functions and methods are reduced to their
/// signatures.
pub fn outline_file(path: &Path, content: &str, language: Language) -> anyhow::Result<Outline> {
    let tree = parse_with_pooled_parser(content, language, Some(path))?;
    let root = tree.root_node();
    let mut writer = OutlineWriter::new(content, language);

    for node in named_children(root) {
        match language {
            Language::Rust => writer.rust_item(node),
            Language::JavaScript | Language::TypeScript => writer.ts_item(node),
            Language::Python => writer.python_item(node, 0),
            Language::Go => writer.go_item(node),
            Language::Unknown => {}
        }
    }

    Ok(writer.finish())
}

fn named_children(node: Node<'_>) -> Vec<Node<'_>> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor).collect()
}

struct OutlineWriter<'a> {
    src: &'a str,
    language: Language,
    lines: Vec<String>,
    exports: Vec<String>,
}

impl<'a> OutlineWriter<'a> {
    fn new(src: &'a str, language: Language) -> Self {
        Self {
            src,
            language,
            lines: Vec::new(),
            exports: Vec::new(),
        }
    }

    fn finish(self) -> Outline {
        Outline {
            text: self.lines.join("\n"),
            exports: crate::util::dedup_preserve_order(self.exports),
        }
    }

    fn text(&self, node: Node<'_>) -> &'a str {
        self.slice(node.start_byte(), node.end_byte())
    }

    fn slice(&self, start: usize, end: usize) -> &'a str {
        &self.src[start..end]
    }

    fn push(&mut self, indent: usize, text: &str) {
        let pad = "    ".repeat(indent);
        self.lines.push(format!("{}{}", pad, text.trim_end()));
    }

    fn push_full(&mut self, indent: usize, node: Node<'_>) {
        let text = self.text(node);
        self.push(indent, text);
    }

    /// Everything from `outer` up to the start of `body`, then an elided body.
    fn push_signature(&mut self, indent: usize, outer: Node<'_>, body: Node<'_>) {
        let header = self.slice(outer.start_byte(), body.start_byte()).trim_end();
        let line = format!("{}{}", header, self.language.elided_body());
        self.push(indent, &line);
    }

    fn push_export_name(&mut self, node: Node<'_>) {
        if let Some(name) = node.child_by_field_name("name") {
            let name = self.text(name).to_string();
            self.exports.push(name);
        }
    }

    // ─── Rust ────────────────────────────────────────────────────────────

    fn rust_item(&mut self, node: Node<'_>) {
        let is_pub = self.text(node).starts_with("pub");
        match node.kind() {
            "use_declaration" | "extern_crate_declaration" | "attribute_item"
            | "inner_attribute_item" => self.push_full(0, node),
            "const_item" | "static_item" | "type_item" | "struct_item" | "enum_item"
            | "union_item" | "trait_item" => {
                self.push_full(0, node);
                if is_pub {
                    self.push_export_name(node);
                }
            }
            "function_item" => {
                match node.child_by_field_name("body") {
                    Some(body) => self.push_signature(0, node, body),
                    None => self.push_full(0, node),
                }
                if is_pub {
                    self.push_export_name(node);
                }
            }
            "function_signature_item" => self.push_full(0, node),
            "mod_item" => match node.child_by_field_name("body") {
                Some(body) => self.push_signature(0, node, body),
                None => self.push_full(0, node),
            },
            "impl_item" => {
                let Some(body) = node.child_by_field_name("body") else {
                    self.push_full(0, node);
                    return;
                };
                let header = self.slice(node.start_byte(), body.start_byte()).trim_end();
                self.push(0, &format!("{} {{", header));
                for member in named_children(body) {
                    match member.kind() {
                        "function_item" => match member.child_by_field_name("body") {
                            Some(member_body) => self.push_signature(1, member, member_body),
                            None => self.push_full(1, member),
                        },
                        "const_item" | "type_item" | "attribute_item" => self.push_full(1, member),
                        _ => {}
                    }
                }
                self.push(0, "}");
            }
            _ => {}
        }
    }

    // ─── JavaScript / TypeScript ─────────────────────────────────────────

    fn ts_item(&mut self, node: Node<'_>) {
        match node.kind() {
            "import_statement" => self.push_full(0, node),
            "export_statement" => {
                if let Some(decl) = node.child_by_field_name("declaration") {
                    self.ts_declaration(node, decl, true);
                } else if node.child_by_field_name("value").is_some()
                    && self.text(node).chars().count() > 400
                {
                    // `export default <large expression>`: first line only
                    let first = self.text(node).lines().next().unwrap_or_default();
                    self.push(0, &format!("{} ...", first));
                } else {
                    self.push_full(0, node);
                }
            }
            "expression_statement" => {
                if ROUTE_REGISTRATION.is_match(self.text(node)) {
                    self.push_full(0, node);
                }
            }
            "function_declaration" | "generator_function_declaration" | "class_declaration"
            | "abstract_class_declaration" | "interface_declaration"
            | "type_alias_declaration" | "enum_declaration" | "lexical_declaration"
            | "variable_declaration" | "ambient_declaration" | "function_signature"
            | "module" | "internal_module" => self.ts_declaration(node, node, false),
            _ => {}
        }
    }

    /// `outer` is the export statement when exported, otherwise `decl` itself.
    fn ts_declaration(&mut self, outer: Node<'_>, decl: Node<'_>, exported: bool) {
        match decl.kind() {
            "function_declaration" | "generator_function_declaration" => {
                match decl.child_by_field_name("body") {
                    Some(body) => self.push_signature(0, outer, body),
                    None => self.push_full(0, outer),
                }
                if exported {
                    self.push_export_name(decl);
                }
            }
            "class_declaration" | "abstract_class_declaration" => {
                let Some(body) = decl.child_by_field_name("body") else {
                    self.push_full(0, outer);
                    return;
                };
                let header = self.slice(outer.start_byte(), body.start_byte()).trim_end();
                self.push(0, &format!("{} {{", header));
                for member in named_children(body) {
                    match member.kind() {
                        "method_definition" => match member.child_by_field_name("body") {
                            Some(member_body) => self.push_signature(1, member, member_body),
                            None => self.push_full(1, member),
                        },
                        "method_signature" | "abstract_method_signature"
                        | "public_field_definition" | "field_definition" => {
                            self.push_full(1, member)
                        }
                        _ => {}
                    }
                }
                self.push(0, "}");
                if exported {
                    self.push_export_name(decl);
                }
            }
            "lexical_declaration" | "variable_declaration" => {
                // Module-level constants are common edit anchors: keep bodies.
                self.push_full(0, outer);
                if exported {
                    for declarator in named_children(decl) {
                        if declarator.kind() == "variable_declarator" {
                            self.push_export_name(declarator);
                        }
                    }
                }
            }
            _ => {
                self.push_full(0, outer);
                if exported {
                    self.push_export_name(decl);
                }
            }
        }
    }

    // ─── Python ──────────────────────────────────────────────────────────

    fn python_item(&mut self, node: Node<'_>, indent: usize) {
        match node.kind() {
            "import_statement" | "import_from_statement" | "future_import_statement" => {
                self.push_full(indent, node)
            }
            "function_definition" => {
                match node.child_by_field_name("body") {
                    Some(body) => self.push_signature(indent, node, body),
                    None => self.push_full(indent, node),
                }
                if indent == 0 {
                    self.push_python_public_name(node);
                }
            }
            "class_definition" => {
                let Some(body) = node.child_by_field_name("body") else {
                    self.push_full(indent, node);
                    return;
                };
                let header = self.slice(node.start_byte(), body.start_byte()).trim_end();
                self.push(indent, header);
                for member in named_children(body) {
                    match member.kind() {
                        "function_definition" | "decorated_definition" => {
                            self.python_item(member, indent + 1)
                        }
                        "expression_statement" if Self::is_assignment(member) => {
                            self.push_full(indent + 1, member)
                        }
                        _ => {}
                    }
                }
                if indent == 0 {
                    self.push_python_public_name(node);
                }
            }
            "decorated_definition" => {
                let Some(definition) = node.child_by_field_name("definition") else {
                    self.push_full(indent, node);
                    return;
                };
                let decorators = self.slice(node.start_byte(), definition.start_byte()).trim_end();
                for line in decorators.lines() {
                    self.push(indent, line.trim());
                }
                self.python_item(definition, indent);
            }
            "expression_statement" if indent == 0 && Self::is_assignment(node) => {
                self.push_full(0, node)
            }
            _ => {}
        }
    }

    fn is_assignment(node: Node<'_>) -> bool {
        named_children(node)
            .first()
            .map(|child| matches!(child.kind(), "assignment" | "augmented_assignment"))
            .unwrap_or(false)
    }

    fn push_python_public_name(&mut self, node: Node<'_>) {
        if let Some(name) = node.child_by_field_name("name") {
            let name = self.text(name);
            if !name.starts_with('_') {
                self.exports.push(name.to_string());
            }
        }
    }

    // ─── Go ──────────────────────────────────────────────────────────────

    fn go_item(&mut self, node: Node<'_>) {
        match node.kind() {
            "package_clause" | "import_declaration" | "type_declaration"
            | "const_declaration" | "var_declaration" => self.push_full(0, node),
            "function_declaration" | "method_declaration" => {
                match node.child_by_field_name("body") {
                    Some(body) => self.push_signature(0, node, body),
                    None => self.push_full(0, node),
                }
                if let Some(name) = node.child_by_field_name("name") {
                    let name = self.text(name);
                    if name.chars().next().is_some_and(|c| c.is_uppercase()) {
                        self.exports.push(name.to_string());
                    }
                }
            }
            _ => {}
        }
    }
}
