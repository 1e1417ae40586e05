//! Pluggable source parsers for the verification pipeline.
//!
//! The pipeline never touches tree-sitter directly; it sees only
//! [`SyntaxCheck`] booleans and structured [`SemanticFindings`]. Languages
//! without a registered parser degrade to pass-through results upstream.

mod python;
mod rust;

pub use python::PythonParser;
pub use rust::RustParser;

use std::collections::HashSet;

/// Result of a syntax validation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxCheck {
    /// Whether the source parsed without ERROR or missing nodes
    pub valid: bool,
    /// Description of the first problem found
    pub error: Option<String>,
}

impl SyntaxCheck {
    pub fn valid() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(error.into()),
        }
    }
}

/// A name the analyzer flagged, with its 1-indexed line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameFinding {
    pub name: String,
    pub line: usize,
}

impl NameFinding {
    pub fn new(name: impl Into<String>, line: usize) -> Self {
        Self {
            name: name.into(),
            line,
        }
    }
}

/// Structured output of deep name analysis.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SemanticFindings {
    /// Names referenced in load context with no visible definition.
    /// Each one is an error.
    pub undefined_names: Vec<NameFinding>,
    /// Top-level imports not discoverable via the active toolchain.
    /// Each one is a warning.
    pub unresolved_imports: Vec<NameFinding>,
}

impl SemanticFindings {
    pub fn has_errors(&self) -> bool {
        !self.undefined_names.is_empty()
    }
}

/// A language-specific source parser.
pub trait CodeParser: Send + Sync {
    /// Language identifier, e.g. `"python"`.
    fn language(&self) -> &'static str;

    /// File extensions this parser handles, lowercased without dots.
    fn extensions(&self) -> &'static [&'static str];

    /// Validate syntax. ERROR or missing nodes fail the check.
    fn check_syntax(&self, code: &str) -> SyntaxCheck;

    /// Deep name/import analysis, when the language supports it.
    ///
    /// `known_modules` supplements the language's own module knowledge
    /// with workspace-local modules. Returns `None` for languages where
    /// deep analysis is delegated to a language server.
    fn analyze(&self, code: &str, known_modules: &HashSet<String>) -> Option<SemanticFindings>;
}

/// Registry of parsers, looked up by file extension.
pub struct ParserRegistry {
    parsers: Vec<Box<dyn CodeParser>>,
}

impl ParserRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            parsers: Vec::new(),
        }
    }

    /// Registry with the built-in Python and Rust parsers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(PythonParser::new()));
        registry.register(Box::new(RustParser::new()));
        registry
    }

    /// Add a parser.
    pub fn register(&mut self, parser: Box<dyn CodeParser>) {
        self.parsers.push(parser);
    }

    /// Find a parser by file extension (without the dot, any case).
    pub fn for_extension(&self, extension: &str) -> Option<&dyn CodeParser> {
        let ext = extension.to_lowercase();
        self.parsers
            .iter()
            .find(|p| p.extensions().contains(&ext.as_str()))
            .map(|p| p.as_ref())
    }

    /// Find a parser by language identifier.
    pub fn for_language(&self, language: &str) -> Option<&dyn CodeParser> {
        self.parsers
            .iter()
            .find(|p| p.language() == language)
            .map(|p| p.as_ref())
    }

    /// Languages this registry can parse.
    pub fn languages(&self) -> Vec<&'static str> {
        self.parsers.iter().map(|p| p.language()).collect()
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
