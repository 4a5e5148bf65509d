//! Task entity, lifecycle and result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::identity;
use super::ids::TaskId;
use super::schedule::TaskSchedule;

/// Execution configuration variant; selects model options per profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskProfile {
    #[default]
    Standard,
    Specialist,
}

impl TaskProfile {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Specialist => "specialist",
        }
    }
}

impl fmt::Display for TaskProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task status.
///
/// Transitions:
/// - Pending -> Running -> Succeeded | Failed | Canceled
/// - Pending -> Canceled
///
/// Status never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Canceled)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Canceled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who asked for a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelSource {
    /// The controller model requested it through an action.
    Manager,
    /// The runtime replaced the task with newer work.
    Deferred,
    /// An operator or the runtime itself (shutdown, restart).
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelMeta {
    pub source: CancelSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CancelMeta {
    pub fn new(source: CancelSource, reason: Option<String>) -> Self {
        Self { source, reason }
    }
}

/// Token usage reported by the model port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelUsage {
    pub input: u64,
    pub output: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskResultStatus {
    Succeeded,
    Failed,
    Canceled,
}

impl From<TaskResultStatus> for TaskStatus {
    fn from(status: TaskResultStatus) -> Self {
        match status {
            TaskResultStatus::Succeeded => TaskStatus::Succeeded,
            TaskResultStatus::Failed => TaskStatus::Failed,
            TaskResultStatus::Canceled => TaskStatus::Canceled,
        }
    }
}

/// Terminal outcome of one task execution. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: TaskResultStatus,
    /// `true` for succeeded and canceled: cancellation is not a failure.
    pub ok: bool,
    pub output: String,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<ModelUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel: Option<CancelMeta>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("task {task_id}: invalid transition {from} -> {to}")]
pub struct TransitionError {
    pub task_id: TaskId,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// One unit of delegated work.
///
/// State changes go through methods so the forward-only lifecycle holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub fingerprint: String,
    pub semantic_key: String,
    pub prompt: String,
    pub title: String,
    pub profile: TaskProfile,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<ModelUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel: Option<CancelMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
}

impl Task {
    pub fn new(
        id: TaskId,
        prompt: &str,
        title: &str,
        profile: TaskProfile,
        schedule: Option<&TaskSchedule>,
        now: DateTime<Utc>,
    ) -> Self {
        let prompt = identity::normalize_text(prompt);
        let title = identity::normalize_text(title);
        Self {
            id,
            fingerprint: identity::fingerprint(&prompt, &title, profile, schedule),
            semantic_key: identity::semantic_key(&prompt, &title, profile, schedule),
            prompt,
            title,
            profile,
            status: TaskStatus::Pending,
            cron: schedule.and_then(|s| s.cron().map(str::to_string)),
            scheduled_at: schedule.and_then(TaskSchedule::scheduled_at),
            created_at: now,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            attempts: 0,
            usage: None,
            cancel: None,
            result: None,
        }
    }

    pub fn schedule(&self) -> Option<TaskSchedule> {
        match (&self.cron, self.scheduled_at) {
            (Some(expr), _) => Some(TaskSchedule::Cron(expr.clone())),
            (None, Some(at)) => Some(TaskSchedule::At(at)),
            (None, None) => None,
        }
    }

    /// Recurring/deferred definition (mirrored by a CronJob)?
    pub fn is_scheduled(&self) -> bool {
        self.cron.is_some() || self.scheduled_at.is_some()
    }

    /// Recompute the fingerprint from the identity fields.
    pub fn computed_fingerprint(&self) -> String {
        identity::fingerprint(&self.prompt, &self.title, self.profile, self.schedule().as_ref())
    }

    fn transition(&mut self, next: TaskStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                task_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.transition(TaskStatus::Running)?;
        self.started_at = Some(now);
        Ok(())
    }

    pub fn record_attempt(&mut self) {
        self.attempts += 1;
    }

    fn elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        self.started_at
            .map(|started| (now - started).num_milliseconds().max(0) as u64)
            .unwrap_or(0)
    }

    /// Cancel a pending or running task.
    ///
    /// A pending task never ran, so its duration is zero and the canceled
    /// result is synthesized right away. A running task only gets its status
    /// and duration here; the execution loop builds its result.
    pub fn mark_canceled(
        &mut self,
        meta: CancelMeta,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskResult>, TransitionError> {
        let was_pending = self.status == TaskStatus::Pending;
        self.transition(TaskStatus::Canceled)?;
        self.completed_at = Some(now);
        self.duration_ms = Some(if was_pending { 0 } else { self.elapsed_ms(now) });
        self.cancel = Some(meta);

        if was_pending {
            let result = self.build_result(TaskResultStatus::Canceled, String::new(), None, now);
            self.result = Some(result.clone());
            return Ok(Some(result));
        }
        Ok(None)
    }

    /// Finish an execution that returned (success or final failure).
    ///
    /// If the task was canceled while the call was completing, the result is
    /// `canceled` regardless of what the execution produced.
    pub fn finish(
        &mut self,
        outcome: Result<(String, Option<ModelUsage>), String>,
        now: DateTime<Utc>,
    ) -> Result<TaskResult, TransitionError> {
        if let Some(existing) = &self.result {
            return Ok(existing.clone());
        }
        if self.status == TaskStatus::Canceled {
            return Ok(self.attach_canceled_result(now));
        }

        let result = match outcome {
            Ok((output, usage)) => {
                self.transition(TaskStatus::Succeeded)?;
                self.usage = usage;
                self.build_result(TaskResultStatus::Succeeded, output, usage, now)
            }
            Err(error) => {
                self.transition(TaskStatus::Failed)?;
                self.build_result(TaskResultStatus::Failed, error, None, now)
            }
        };
        self.completed_at = Some(now);
        self.duration_ms = Some(result.duration_ms);
        self.result = Some(result.clone());
        Ok(result)
    }

    /// Attach the result for a running task whose cancellation the execution
    /// loop has observed.
    pub fn attach_canceled_result(&mut self, now: DateTime<Utc>) -> TaskResult {
        if let Some(existing) = &self.result {
            return existing.clone();
        }
        let completed_at = self.completed_at.unwrap_or(now);
        let result =
            self.build_result(TaskResultStatus::Canceled, String::new(), self.usage, completed_at);
        self.result = Some(result.clone());
        result
    }

    fn build_result(
        &self,
        status: TaskResultStatus,
        output: String,
        usage: Option<ModelUsage>,
        now: DateTime<Utc>,
    ) -> TaskResult {
        let duration_ms = match status {
            TaskResultStatus::Canceled => self.duration_ms.unwrap_or_else(|| self.elapsed_ms(now)),
            _ => self.elapsed_ms(now),
        };
        TaskResult {
            task_id: self.id,
            status,
            ok: status != TaskResultStatus::Failed,
            output,
            duration_ms,
            completed_at: now,
            usage,
            cancel: self.cancel.clone(),
        }
    }
}
