//! Schedules and the CronJob record that mirrors a recurring/deferred task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{CronJobId, TaskId};
use super::task::TaskProfile;

/// When a deferred task should run. `Cron` and `At` are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum TaskSchedule {
    Cron(String),
    At(DateTime<Utc>),
}

impl TaskSchedule {
    /// Build a schedule from the two optional request fields.
    ///
    /// Returns `Err` with a hint when both are set.
    pub fn from_parts(
        cron: Option<&str>,
        scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<Option<Self>, String> {
        let cron = cron.map(str::trim).filter(|c| !c.is_empty());
        match (cron, scheduled_at) {
            (Some(_), Some(_)) => Err(
                "`cron` and `scheduled_at` are mutually exclusive; send exactly one of them"
                    .to_string(),
            ),
            (Some(expr), None) => Ok(Some(Self::Cron(normalize_cron(expr)))),
            (None, Some(at)) => Ok(Some(Self::At(at))),
            (None, None) => Ok(None),
        }
    }

    pub fn cron(&self) -> Option<&str> {
        match self {
            Self::Cron(expr) => Some(expr),
            Self::At(_) => None,
        }
    }

    pub fn scheduled_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Cron(_) => None,
            Self::At(at) => Some(*at),
        }
    }

    /// Stable text form used by identity keys.
    pub fn identity_text(&self) -> String {
        match self {
            Self::Cron(expr) => format!("cron:{expr}"),
            Self::At(at) => format!("at:{}", at.to_rfc3339()),
        }
    }
}

fn normalize_cron(expr: &str) -> String {
    expr.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Structural check of a cron expression: 5 or 6 fields made of the usual
/// cron characters. Evaluation belongs to the scheduler tick, not here.
pub fn validate_cron(expr: &str) -> Result<(), String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if !(5..=6).contains(&fields.len()) {
        return Err(format!(
            "cron expression `{expr}` has {} fields; expected 5 (min hour dom month dow) or 6",
            fields.len()
        ));
    }
    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '*' | '/' | ',' | '-' | '?' | '#');
    if let Some(bad) = fields.iter().find(|f| !f.chars().all(allowed)) {
        return Err(format!("cron field `{bad}` contains unsupported characters"));
    }
    Ok(())
}

/// Why a CronJob stopped being enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisabledReason {
    Canceled,
    Completed,
}

/// A recurring or deferred task definition.
///
/// CronJobs are never deleted, only disabled, so the audit trail survives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: CronJobId,
    /// The mirrored pending Task entry.
    pub task_id: TaskId,
    pub fingerprint: String,
    pub semantic_key: String,
    pub prompt: String,
    pub title: String,
    pub profile: TaskProfile,
    pub schedule: TaskSchedule,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<DisabledReason>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled_at: Option<DateTime<Utc>>,
}

impl CronJob {
    /// Disable the job. Returns `false` if it was already disabled.
    pub fn disable(&mut self, reason: DisabledReason, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        self.enabled = false;
        self.disabled_reason = Some(reason);
        self.disabled_at = Some(now);
        true
    }

    /// Same `(schedule, prompt, title, profile)` as the given request?
    pub fn matches_request(
        &self,
        schedule: &TaskSchedule,
        prompt: &str,
        title: &str,
        profile: TaskProfile,
    ) -> bool {
        &self.schedule == schedule
            && self.prompt == prompt
            && self.title == title
            && self.profile == profile
    }
}
