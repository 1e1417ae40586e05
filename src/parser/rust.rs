//! Tree-sitter-based Rust parser.
//!
//! Rust gets syntax validation only; deep name resolution is the job of
//! rust-analyzer behind the LSP manager.

use super::{CodeParser, SemanticFindings, SyntaxCheck};
use std::collections::HashSet;
use tree_sitter::{Node, Parser};

pub struct RustParser;

impl RustParser {
    pub fn new() -> Self {
        Self
    }

    fn parse(&self, code: &str) -> Option<tree_sitter::Tree> {
        let mut parser = Parser::new();
        parser
            .set_language(tree_sitter_rust::language())
            .expect("rust grammar version mismatch");
        parser.parse(code, None)
    }
}

impl Default for RustParser {
    fn default() -> Self {
        Self::new()
    }
}

fn find_first_problem(root: Node<'_>) -> Option<String> {
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        if node.kind() == "ERROR" {
            return Some(format!(
                "syntax error at line {}",
                node.start_position().row + 1
            ));
        }
        if node.is_missing() {
            return Some(format!(
                "missing {} at line {}",
                node.kind(),
                node.start_position().row + 1
            ));
        }
        for i in (0..node.child_count()).rev() {
            if let Some(child) = node.child(i) {
                stack.push(child);
            }
        }
    }
    None
}

impl CodeParser for RustParser {
    fn language(&self) -> &'static str {
        "rust"
    }

    fn extensions(&self) -> &'static [&'static str] {
        &["rs"]
    }

    fn check_syntax(&self, code: &str) -> SyntaxCheck {
        let Some(tree) = self.parse(code) else {
            return SyntaxCheck::invalid("parser produced no tree");
        };
        match find_first_problem(tree.root_node()) {
            Some(error) => SyntaxCheck::invalid(error),
            None => SyntaxCheck::valid(),
        }
    }

    fn analyze(&self, _code: &str, _known_modules: &HashSet<String>) -> Option<SemanticFindings> {
        // Name resolution is delegated to rust-analyzer diagnostics.
        None
    }
}
