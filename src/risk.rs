//! Pattern-based action risk assessment.
//!
//! Classifies a proposed [`Action`] into a risk level using only its type
//! and content. Pure function, no I/O: the same action always yields the
//! same [`ActionRisk`].

use crate::action::{Action, ActionType};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Risk level of a proposed action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Boilerplate and read-only work
    Low,
    /// Ordinary code changes
    Medium,
    /// Destructive, security-sensitive, or privileged work
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        };
        write!(f, "{}", s)
    }
}

/// Risk classification of a single action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRisk {
    /// Highest matched risk bucket
    pub level: RiskLevel,
    /// All matched factor tags, across buckets
    pub factors: Vec<String>,
    /// Whether this action should be verified at all
    pub requires_verification: bool,
    /// Whether verification of this action may be deferred into a batch
    pub can_batch: bool,
}

impl ActionRisk {
    /// Whether a specific factor tag was matched.
    pub fn has_factor(&self, tag: &str) -> bool {
        self.factors.iter().any(|f| f == tag)
    }

    /// True if any factor is a boilerplate tag.
    pub fn is_boilerplate(&self) -> bool {
        self.factors.iter().any(|f| f.starts_with("boilerplate_"))
    }

    /// True if any factor is a security tag.
    pub fn is_security_sensitive(&self) -> bool {
        self.factors.iter().any(|f| f.starts_with("security_"))
    }
}

// High-risk patterns. Any match forces HIGH regardless of other factors.

static DESTRUCTIVE_RM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\brm\s+(-[a-z]*[rf][a-z]*\s+)+|\brmdir\b|\bshutil\.rmtree\b")
        .expect("invalid regex")
});

static DESTRUCTIVE_SQL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bDROP\s+(TABLE|DATABASE|SCHEMA|INDEX)\b|\bTRUNCATE\s+TABLE\b")
        .expect("invalid regex")
});

static SECURITY_PASSWORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bpassword\b|\bpasswd\b").expect("invalid regex"));

static SECURITY_API_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bapi[_ ]?key\b|\bsecret[_ ]?key\b").expect("invalid regex"));

static SECURITY_PRIVATE_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bprivate[_ ]?key\b|BEGIN (RSA|EC|OPENSSH) PRIVATE KEY").expect("invalid regex")
});

static SYSTEM_SUDO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bsudo\b|\bdoas\b").expect("invalid regex"));

static SYSTEM_CHMOD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bchmod\b|\bchown\b").expect("invalid regex"));

// No lookahead in the regex crate; loopback hosts are filtered separately.
static EXTERNAL_HTTP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"https?://[^\s'\x22]+").expect("invalid regex"));

// Low-risk patterns.

static READ_ONLY_SEARCH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(ls|cat|grep|rg|find|head|tail|pwd|wc|which|git\s+(status|log|diff))\b")
        .expect("invalid regex")
});

static BOILERPLATE_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(import\s+[\w.]+|from\s+[\w.]+\s+import\s+[\w.*, ]+|use\s+[\w:]+;?)\s*$")
        .expect("invalid regex")
});

static BOILERPLATE_DUNDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*(__\w+__\s*=|if\s+__name__\s*==|@\w+)"#).expect("invalid regex")
});

static BOILERPLATE_DOCSTRING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\s*("""|''')"#).expect("invalid regex"));

static BOILERPLATE_PRINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*(print\(|println!\(|eprintln!\()"#).expect("invalid regex")
});

fn is_loopback_url(content: &str) -> bool {
    EXTERNAL_HTTP.find_iter(content).all(|m| {
        let url = m.as_str();
        url.contains("localhost")
            || url.contains("127.0.0.1")
            || url.contains("0.0.0.0")
            || url.contains("[::1]")
    })
}

/// True when every non-empty line of `content` is boilerplate
/// (imports, dunders/decorators, docstring delimiters, plain prints).
pub fn is_boilerplate(content: &str) -> bool {
    let mut in_docstring = false;
    let mut saw_line = false;

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        saw_line = true;

        if in_docstring {
            if trimmed.ends_with("\"\"\"") || trimmed.ends_with("'''") {
                in_docstring = false;
            }
            continue;
        }
        if BOILERPLATE_DOCSTRING.is_match(trimmed) {
            // A one-line docstring closes on the same line.
            let closed = trimmed.len() >= 6
                && (trimmed.ends_with("\"\"\"") || trimmed.ends_with("'''"));
            in_docstring = !closed;
            continue;
        }
        if BOILERPLATE_IMPORT.is_match(trimmed)
            || BOILERPLATE_DUNDER.is_match(trimmed)
            || BOILERPLATE_PRINT.is_match(trimmed)
        {
            continue;
        }
        return false;
    }

    saw_line
}

/// Classify an action into an [`ActionRisk`].
///
/// Total and deterministic: never fails, and `assess(a) == assess(a)`.
/// Factor tags accumulate across buckets; the highest matched bucket wins
/// the level (a HIGH match beats any LOW match).
pub fn assess(action: &Action) -> ActionRisk {
    let content = action.content.as_str();
    let mut factors: Vec<String> = Vec::new();

    // High bucket
    if DESTRUCTIVE_RM.is_match(content) {
        factors.push("destructive_rm".into());
    }
    if DESTRUCTIVE_SQL.is_match(content) {
        factors.push("destructive_sql".into());
    }
    if SECURITY_PASSWORD.is_match(content) {
        factors.push("security_password".into());
    }
    if SECURITY_API_KEY.is_match(content) {
        factors.push("security_api_key".into());
    }
    if SECURITY_PRIVATE_KEY.is_match(content) {
        factors.push("security_private_key".into());
    }
    if SYSTEM_SUDO.is_match(content) {
        factors.push("system_sudo".into());
    }
    if SYSTEM_CHMOD.is_match(content) {
        factors.push("system_chmod".into());
    }
    if EXTERNAL_HTTP.is_match(content) && !is_loopback_url(content) {
        factors.push("external_http".into());
    }

    let high = !factors.is_empty();

    // Low bucket (tags are retained even when a high factor also matched)
    let mut low = false;
    if action.action_type == ActionType::Query {
        factors.push("read_only_query".into());
        low = true;
    }
    if action.action_type == ActionType::Command && READ_ONLY_SEARCH.is_match(content) {
        factors.push("read_only_search".into());
        low = true;
    }
    if action.action_type.is_mutation() && action.action_type != ActionType::Command {
        if BOILERPLATE_IMPORT.is_match(content) {
            factors.push("boilerplate_import".into());
        }
        if BOILERPLATE_DOCSTRING.is_match(content.trim_start()) {
            factors.push("boilerplate_docstring".into());
        }
        if BOILERPLATE_DUNDER.is_match(content) {
            factors.push("boilerplate_dunder".into());
        }
        if BOILERPLATE_PRINT.is_match(content) {
            factors.push("boilerplate_print".into());
        }
        // Boilerplate tags only lower the level when nothing else is in
        // the payload.
        if factors.iter().any(|f| f.starts_with("boilerplate_")) && is_boilerplate(content) {
            low = true;
        }
    }

    let level = if high {
        RiskLevel::High
    } else if low {
        RiskLevel::Low
    } else {
        factors.push(
            match action.action_type {
                ActionType::Create => "action_type_create",
                ActionType::Edit => "action_type_edit",
                ActionType::Delete => "action_type_delete",
                ActionType::Command => "action_type_command",
                ActionType::Query => "action_type_query",
            }
            .into(),
        );
        RiskLevel::Medium
    };

    let has_boilerplate = factors.iter().any(|f| f.starts_with("boilerplate_"));

    ActionRisk {
        level,
        requires_verification: level != RiskLevel::Low || !has_boilerplate,
        can_batch: level != RiskLevel::High,
        factors,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destructive_rm_is_high() {
        let risk = assess(&Action::command("rm -rf /tmp/test"));
        assert_eq!(risk.level, RiskLevel::High);
        assert!(risk.has_factor("destructive_rm"));
        assert!(risk.requires_verification);
        assert!(!risk.can_batch);
    }

    #[test]
    fn test_sql_drop_is_high() {
        let risk = assess(&Action::command("psql -c 'DROP TABLE users'"));
        assert_eq!(risk.level, RiskLevel::High);
        assert!(risk.has_factor("destructive_sql"));
    }

    #[test]
    fn test_password_is_high() {
        let risk = assess(&Action::edit(
            "settings.py",
            "password = os.environ['DB_PASSWORD']",
        ));
        assert_eq!(risk.level, RiskLevel::High);
        assert!(risk.has_factor("security_password"));
    }

    #[test]
    fn test_api_key_is_high() {
        let risk = assess(&Action::edit("config.py", "API_KEY = 'sk-xxx'"));
        assert_eq!(risk.level, RiskLevel::High);
        assert!(risk.has_factor("security_api_key"));
    }

    #[test]
    fn test_sudo_is_high() {
        let risk = assess(&Action::command("sudo apt-get install pkg"));
        assert_eq!(risk.level, RiskLevel::High);
        assert!(risk.has_factor("system_sudo"));
    }

    #[test]
    fn test_external_http_is_high() {
        let risk = assess(&Action::edit(
            "client.py",
            "requests.get('https://api.example.com/data')",
        ));
        assert_eq!(risk.level, RiskLevel::High);
        assert!(risk.has_factor("external_http"));
    }

    #[test]
    fn test_loopback_http_is_not_high() {
        let risk = assess(&Action::edit(
            "client.py",
            "requests.get('http://localhost:8080/health')",
        ));
        assert_ne!(risk.level, RiskLevel::High);
    }

    #[test]
    fn test_query_is_low() {
        let risk = assess(&Action::query("What is the current working directory?"));
        assert_eq!(risk.level, RiskLevel::Low);
        assert!(risk.has_factor("read_only_query"));
        assert!(risk.can_batch);
    }

    #[test]
    fn test_import_is_low_boilerplate() {
        let risk = assess(&Action::edit("utils.py", "import json"));
        assert_eq!(risk.level, RiskLevel::Low);
        assert!(risk.has_factor("boilerplate_import"));
        assert!(!risk.requires_verification);
        assert!(risk.can_batch);
    }

    #[test]
    fn test_read_only_command_is_low() {
        let risk = assess(&Action::command("ls -la /tmp"));
        assert_eq!(risk.level, RiskLevel::Low);
        assert!(risk.has_factor("read_only_search"));
        // Read-only is not boilerplate, so verification stays required.
        assert!(risk.requires_verification);
    }

    #[test]
    fn test_normal_edit_is_medium() {
        let risk = assess(&Action::edit(
            "calc.py",
            "def add(a, b):\n    return a + b",
        ));
        assert_eq!(risk.level, RiskLevel::Medium);
        assert!(risk.has_factor("action_type_edit"));
        assert!(risk.requires_verification);
        assert!(risk.can_batch);
    }

    #[test]
    fn test_whitespace_content_is_medium() {
        let risk = assess(&Action::new(ActionType::Edit, "   \n  "));
        assert_eq!(risk.level, RiskLevel::Medium);
    }

    #[test]
    fn test_tie_break_high_wins_keeps_both_factors() {
        let risk = assess(&Action::edit(
            "auth.py",
            "import secrets\npassword = secrets.token_hex(16)",
        ));
        assert_eq!(risk.level, RiskLevel::High);
        assert!(risk.has_factor("security_password"));
        assert!(risk.has_factor("boilerplate_import"));
    }

    #[test]
    fn test_is_boilerplate_multi_line() {
        assert!(is_boilerplate("import os\nimport sys"));
        assert!(is_boilerplate("@dataclass\nimport typing"));
        assert!(!is_boilerplate("import os\nx = compute()"));
        assert!(!is_boilerplate("   "));
    }

    #[test]
    fn test_assess_is_idempotent() {
        let action = Action::command("rm -rf build/");
        assert_eq!(assess(&action), assess(&action));
    }
}
