//! Value types for the language-server pool.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Diagnostic severity, mirroring the LSP numeric scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSeverity {
    Error,
    Warning,
    Information,
    Hint,
}

impl DiagnosticSeverity {
    /// Map the LSP wire value (1..=4). Unknown values read as Information.
    pub fn from_lsp(value: i64) -> Self {
        match value {
            1 => Self::Error,
            2 => Self::Warning,
            4 => Self::Hint,
            _ => Self::Information,
        }
    }
}

/// A single diagnostic reported by a language server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: DiagnosticSeverity,
    pub message: String,
    /// 0-indexed line
    pub line: u32,
    /// 0-indexed column
    pub column: u32,
    /// Server-specific diagnostic code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl Diagnostic {
    pub fn is_error(&self) -> bool {
        self.severity == DiagnosticSeverity::Error
    }
}

/// A source location returned by definition/references queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LspLocation {
    pub path: String,
    /// 0-indexed line
    pub line: u32,
    /// 0-indexed column
    pub column: u32,
}

/// Hover contents at a position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoverInfo {
    pub contents: String,
}

/// Health of one language-server session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerHealth {
    Starting,
    Running,
    Failed,
}

/// Configuration for one language server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguageServerConfig {
    /// Command and arguments to spawn the server
    pub command: Vec<String>,
    /// File extensions handled (lowercased, no dots)
    pub extensions: Vec<String>,
    /// LSP `languageId` for document sync
    pub language_id: String,
}

impl LanguageServerConfig {
    pub fn new(
        command: Vec<String>,
        extensions: Vec<String>,
        language_id: impl Into<String>,
    ) -> Self {
        Self {
            command,
            extensions,
            language_id: language_id.into(),
        }
    }

    /// Executable name with `~`/env expansion applied.
    pub fn executable(&self) -> Option<String> {
        let raw = self.command.first()?;
        Some(shellexpand::full(raw).map_or_else(|_| raw.clone(), |s| s.into_owned()))
    }
}

/// Default language-server configurations.
pub fn default_servers() -> HashMap<String, LanguageServerConfig> {
    let mut servers = HashMap::new();
    servers.insert(
        "python".to_string(),
        LanguageServerConfig::new(
            vec!["pyright-langserver".into(), "--stdio".into()],
            vec!["py".into(), "pyi".into()],
            "python",
        ),
    );
    servers.insert(
        "typescript".to_string(),
        LanguageServerConfig::new(
            vec!["typescript-language-server".into(), "--stdio".into()],
            vec!["ts".into(), "tsx".into()],
            "typescript",
        ),
    );
    servers.insert(
        "javascript".to_string(),
        LanguageServerConfig::new(
            vec!["typescript-language-server".into(), "--stdio".into()],
            vec!["js".into(), "jsx".into()],
            "javascript",
        ),
    );
    servers.insert(
        "rust".to_string(),
        LanguageServerConfig::new(
            vec!["rust-analyzer".into()],
            vec!["rs".into()],
            "rust",
        ),
    );
    servers
}

/// Snapshot of the manager's pool state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LspStatus {
    pub root_path: String,
    pub configured: Vec<String>,
    pub running: Vec<String>,
    pub failed: Vec<String>,
}
