//! Controller round inputs and outputs: channel payloads, the rolling
//! context the controller model sees, and prompt assembly.

use std::collections::VecDeque;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::actions::ValidationIssue;
use crate::domain::{CronJob, Task, TaskResult, TaskStatus};

/// Context entries kept between rounds before the oldest are dropped.
pub const MAX_CONTEXT_ENTRIES: usize = 40;

const PREVIEW_CHARS: usize = 160;

/// Payload of the `user-input` channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputMessage {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl InputMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source: None,
        }
    }
}

/// Payload of the `thinker-decision` channel: one record per round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRecord {
    pub inputs_cursor: u64,
    pub results_cursor: u64,
    pub output: String,
    pub applied: Vec<String>,
    pub issues: Vec<ValidationIssue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
    pub stopped: bool,
}

/// Rolling controller context plus feedback owed to the next round.
#[derive(Debug, Default)]
pub struct ControllerMemory {
    entries: VecDeque<String>,
    pub feedback: Option<String>,
}

impl ControllerMemory {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn push(&mut self, entry: String) {
        self.entries.push_back(entry);
        while self.entries.len() > MAX_CONTEXT_ENTRIES {
            self.entries.pop_front();
        }
    }

    /// Fold every entry into a single marker line.
    pub fn compress(&mut self, reason: Option<&str>) {
        let folded = self.entries.len();
        if folded == 0 {
            return;
        }
        self.entries.clear();
        let mut marker = format!("[{folded} earlier entries compressed");
        if let Some(reason) = reason.filter(|r| !r.trim().is_empty()) {
            let _ = write!(marker, ": {}", reason.trim());
        }
        marker.push(']');
        self.entries.push_back(marker);
    }
}

pub struct PromptParts<'a> {
    pub usages: &'a [&'static str],
    pub active_tasks: &'a [Task],
    pub cron_jobs: &'a [CronJob],
    pub memory: &'a ControllerMemory,
    pub inputs: &'a [InputMessage],
    pub results: &'a [TaskResult],
}

pub fn preview(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= PREVIEW_CHARS {
        return flat;
    }
    let cut: String = flat.chars().take(PREVIEW_CHARS).collect();
    format!("{cut}…")
}

pub fn describe_input(input: &InputMessage) -> String {
    format!(
        "{}: {}",
        input.source.as_deref().unwrap_or("user"),
        preview(&input.text)
    )
}

pub fn describe_result(result: &TaskResult) -> String {
    let status = TaskStatus::from(result.status);
    if result.output.is_empty() {
        format!("{} {status}", result.task_id)
    } else {
        format!("{} {status}: {}", result.task_id, preview(&result.output))
    }
}

pub fn build_prompt(parts: &PromptParts<'_>) -> String {
    let mut out = String::new();
    out.push_str(
        "You coordinate background tasks for the user. Request operations with these tags, \
         one per line; anything else you write is kept as your notes.\n",
    );
    for usage in parts.usages {
        let _ = writeln!(out, "  {usage}");
    }

    out.push_str("\n## Active tasks\n");
    if parts.active_tasks.is_empty() {
        out.push_str("(none)\n");
    }
    for task in parts.active_tasks {
        let _ = writeln!(
            out,
            "- {} [{}] {}: {}",
            task.id,
            task.status,
            if task.title.is_empty() { "untitled" } else { &task.title },
            preview(&task.prompt)
        );
    }

    if !parts.cron_jobs.is_empty() {
        out.push_str("\n## Schedules\n");
        for job in parts.cron_jobs {
            let _ = writeln!(
                out,
                "- {} {}: {}",
                job.id,
                job.schedule.identity_text(),
                preview(&job.prompt)
            );
        }
    }

    if !parts.memory.is_empty() {
        out.push_str("\n## Context\n");
        for entry in parts.memory.entries() {
            let _ = writeln!(out, "- {entry}");
        }
    }

    if let Some(feedback) = &parts.memory.feedback {
        out.push_str("\n## Rejected requests from your last round\n");
        out.push_str(feedback);
        out.push('\n');
    }

    if !parts.results.is_empty() {
        out.push_str("\n## Task results\n");
        for result in parts.results {
            let _ = writeln!(out, "- {}", describe_result(result));
        }
    }

    if !parts.inputs.is_empty() {
        out.push_str("\n## New input\n");
        for input in parts.inputs {
            let _ = writeln!(out, "{}", describe_input(input));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_is_bounded() {
        let mut memory = ControllerMemory::default();
        for i in 0..(MAX_CONTEXT_ENTRIES + 5) {
            memory.push(format!("entry {i}"));
        }
        assert_eq!(memory.len(), MAX_CONTEXT_ENTRIES);
        assert_eq!(memory.entries().next(), Some("entry 5"));
    }

    #[test]
    fn compress_folds_entries_into_marker() {
        let mut memory = ControllerMemory::default();
        memory.push("a".into());
        memory.push("b".into());
        memory.compress(Some("too long"));
        assert_eq!(memory.entries().collect::<Vec<_>>(), vec!["[2 earlier entries compressed: too long]"]);
    }

    #[test]
    fn prompt_lists_usage_feedback_and_inputs_last() {
        let mut memory = ControllerMemory::default();
        memory.feedback = Some("<action_feedback>\n{}\n</action_feedback>".into());
        let inputs = vec![InputMessage::user("please check the build")];
        let prompt = build_prompt(&PromptParts {
            usages: &["<reply>message</reply>"],
            active_tasks: &[],
            cron_jobs: &[],
            memory: &memory,
            inputs: &inputs,
            results: &[],
        });

        assert!(prompt.contains("  <reply>message</reply>"));
        assert!(prompt.contains("(none)"));
        assert!(prompt.contains("<action_feedback>"));
        assert!(prompt.trim_end().ends_with("user: please check the build"));
    }

    #[test]
    fn long_text_is_previewed() {
        let long = "word ".repeat(100);
        assert!(preview(&long).ends_with('…'));
        assert_eq!(preview("  short   text "), "short text");
    }
}
