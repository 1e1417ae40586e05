//! Action data model.
//!
//! An [`Action`] is the unit of work proposed by the LLM: create, edit, or
//! delete a file, run a command, or answer a query. Actions are immutable
//! once proposed; the engine validates them before classifying risk.

use serde::{Deserialize, Serialize};

/// The kind of change an action performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    /// Create a new file
    Create,
    /// Edit an existing file
    Edit,
    /// Delete a file
    Delete,
    /// Run a shell command
    Command,
    /// Answer a question without changing state
    Query,
}

impl ActionType {
    /// Whether this action type mutates the sandbox.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Self::Query)
    }

    /// Whether this action type requires a target path.
    pub fn requires_target(&self) -> bool {
        matches!(self, Self::Create | Self::Edit | Self::Delete)
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Edit => "edit",
            Self::Delete => "delete",
            Self::Command => "command",
            Self::Query => "query",
        };
        write!(f, "{}", s)
    }
}

/// Opaque structural intermediate representation carried through the
/// structural verification layer. Payload semantics belong to the
/// sandbox/proposer contract; the core only transports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuralIr {
    /// Assembled program bytes
    pub program: Vec<u8>,
    /// Human-readable listing of the program
    pub listing: String,
}

impl StructuralIr {
    /// Create a structural IR payload.
    pub fn new(program: Vec<u8>, listing: impl Into<String>) -> Self {
        Self {
            program,
            listing: listing.into(),
        }
    }

    /// Minimal well-formedness: a payload must have both forms.
    pub fn is_well_formed(&self) -> bool {
        !self.program.is_empty() && !self.listing.trim().is_empty()
    }
}

/// A single proposed change. Immutable once proposed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// What kind of change this is
    pub action_type: ActionType,
    /// Text payload (file content or command string)
    pub content: String,
    /// Target path or selector, where applicable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Optional structural IR verified by the structural layer
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structural_ir: Option<StructuralIr>,
}

impl Action {
    /// Create an action of the given type with content.
    pub fn new(action_type: ActionType, content: impl Into<String>) -> Self {
        Self {
            action_type,
            content: content.into(),
            target: None,
            structural_ir: None,
        }
    }

    /// Create-file action.
    pub fn create(target: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(ActionType::Create, content).with_target(target)
    }

    /// Edit-file action.
    pub fn edit(target: impl Into<String>, content: impl Into<String>) -> Self {
        Self::new(ActionType::Edit, content).with_target(target)
    }

    /// Delete-file action.
    pub fn delete(target: impl Into<String>) -> Self {
        Self::new(ActionType::Delete, "").with_target(target)
    }

    /// Shell command action.
    pub fn command(command: impl Into<String>) -> Self {
        Self::new(ActionType::Command, command)
    }

    /// Read-only query action.
    pub fn query(question: impl Into<String>) -> Self {
        Self::new(ActionType::Query, question)
    }

    /// Set the target path.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Attach a structural IR payload.
    pub fn with_structural_ir(mut self, ir: StructuralIr) -> Self {
        self.structural_ir = Some(ir);
        self
    }

    /// File extension of the target, lowercased, if any.
    pub fn target_extension(&self) -> Option<String> {
        let target = self.target.as_deref()?;
        let ext = std::path::Path::new(target).extension()?;
        Some(ext.to_string_lossy().to_lowercase())
    }

    /// Paths this action touches (used for behavioral test selection).
    pub fn touched_paths(&self) -> Vec<String> {
        self.target.iter().cloned().collect()
    }

    /// Validate the structural invariants of this action.
    ///
    /// Returns the list of violations; empty means valid.
    pub fn validate(&self) -> Vec<ActionViolation> {
        let mut violations = Vec::new();

        if self.action_type.requires_target() && self.target.as_deref().map_or(true, str::is_empty)
        {
            violations.push(ActionViolation::MissingTarget(self.action_type));
        }

        let needs_content = matches!(
            self.action_type,
            ActionType::Create | ActionType::Edit | ActionType::Command
        );
        if needs_content && self.content.trim().is_empty() {
            violations.push(ActionViolation::EmptyContent(self.action_type));
        }

        violations
    }

    /// True when `validate` reports no violations.
    pub fn is_valid(&self) -> bool {
        self.validate().is_empty()
    }
}

/// A violated action invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionViolation {
    /// Create/Edit/Delete without a target path
    MissingTarget(ActionType),
    /// Create/Edit/Command with empty content
    EmptyContent(ActionType),
}

impl std::fmt::Display for ActionViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingTarget(t) => write!(f, "{} action requires a target", t),
            Self::EmptyContent(t) => write!(f, "{} action requires non-empty content", t),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builders_set_fields() {
        let action = Action::edit("utils.py", "import json");
        assert_eq!(action.action_type, ActionType::Edit);
        assert_eq!(action.target.as_deref(), Some("utils.py"));
        assert_eq!(action.content, "import json");
        assert!(action.structural_ir.is_none());
    }

    #[test]
    fn test_validate_requires_target() {
        let action = Action::new(ActionType::Create, "x = 1");
        let violations = action.validate();
        assert_eq!(
            violations,
            vec![ActionViolation::MissingTarget(ActionType::Create)]
        );
    }

    #[test]
    fn test_validate_requires_content() {
        let action = Action::edit("a.py", "   ");
        assert!(matches!(
            action.validate().as_slice(),
            [ActionViolation::EmptyContent(ActionType::Edit)]
        ));
    }

    #[test]
    fn test_delete_needs_no_content() {
        let action = Action::delete("old.py");
        assert!(action.is_valid());
    }

    #[test]
    fn test_query_needs_no_target() {
        let action = Action::query("what does f do?");
        assert!(action.is_valid());
        assert!(!action.action_type.is_mutation());
    }

    #[test]
    fn test_target_extension() {
        assert_eq!(
            Action::edit("src/main.py", "pass").target_extension().as_deref(),
            Some("py")
        );
        assert_eq!(Action::command("ls").target_extension(), None);
    }

    #[test]
    fn test_structural_ir_well_formed() {
        assert!(StructuralIr::new(vec![1, 2], "PUSH 1").is_well_formed());
        assert!(!StructuralIr::new(vec![], "PUSH 1").is_well_formed());
        assert!(!StructuralIr::new(vec![1], "  ").is_well_formed());
    }
}
