//! Validation issues: rejected requests, returned as data.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCode {
    /// No handler is registered under the requested name.
    UnregisteredAction,
    /// Attributes or content did not decode into the action's shape.
    InvalidActionSchema,
    /// Well-formed, but the current state does not allow it.
    ActionExecutionRejected,
}

impl IssueCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnregisteredAction => "unregistered_action",
            Self::InvalidActionSchema => "invalid_action_schema",
            Self::ActionExecutionRejected => "action_execution_rejected",
        }
    }
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Name of the request the issue belongs to.
    pub action: String,
    pub error: IssueCode,
    /// What to change so the request succeeds next round.
    pub hint: String,
}

impl ValidationIssue {
    pub fn new(action: impl Into<String>, error: IssueCode, hint: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            error,
            hint: hint.into(),
        }
    }

    pub fn rejected(action: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::new(action, IssueCode::ActionExecutionRejected, hint)
    }
}

/// Render issues for the next controller prompt, one JSON object per line.
///
/// Returns `None` when there is nothing to report.
pub fn feedback_text(issues: &[ValidationIssue]) -> Option<String> {
    if issues.is_empty() {
        return None;
    }
    let mut out = String::from("<action_feedback>\n");
    for issue in issues {
        match serde_json::to_string(issue) {
            Ok(line) => {
                out.push_str(&line);
                out.push('\n');
            }
            Err(err) => tracing::warn!(error = %err, "failed to encode validation issue"),
        }
    }
    out.push_str("</action_feedback>");
    Some(out)
}
