//! The actions the controller can request.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::reconcile::CreateRequest;
use super::registry::{Action, ActionHandler, ActionRegistry, RegistryError};
use super::{ActionEnv, ActionView, ApplyFlow};
use crate::channel::Topic;
use crate::domain::events::fields;
use crate::domain::schedule::validate_cron;
use crate::domain::{
    AuditEvent, CancelMeta, CancelSource, CronJobId, DisabledReason, TaskId, TaskProfile,
    TaskSchedule,
};

/// Names of every built-in action.
pub const BUILTIN_ACTIONS: [&str; 7] = [
    CreateTask::NAME,
    ScheduleTask::NAME,
    CancelTask::NAME,
    CancelSchedule::NAME,
    Reply::NAME,
    CompressContext::NAME,
    RestartRuntime::NAME,
];

/// `compress_context` needs at least this many context entries.
pub const MIN_COMPRESSIBLE_ENTRIES: usize = 2;

pub fn register_builtin(registry: &mut ActionRegistry) -> Result<(), RegistryError> {
    registry.register::<CreateTask, _>(CreateTaskHandler)?;
    registry.register::<ScheduleTask, _>(ScheduleTaskHandler)?;
    registry.register::<CancelTask, _>(CancelTaskHandler)?;
    registry.register::<CancelSchedule, _>(CancelScheduleHandler)?;
    registry.register::<Reply, _>(ReplyHandler)?;
    registry.register::<CompressContext, _>(CompressContextHandler)?;
    registry.register::<RestartRuntime, _>(RestartRuntimeHandler)?;
    Ok(())
}

/// Shared checks for task-creating requests. Returns the schedule, if any.
fn check_request(
    prompt: &str,
    cron: Option<&str>,
    scheduled_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<Option<TaskSchedule>, String> {
    if prompt.trim().is_empty() {
        return Err("the task prompt (tag content) must not be empty".to_string());
    }
    let schedule = TaskSchedule::from_parts(cron, scheduled_at)?;
    match &schedule {
        Some(TaskSchedule::Cron(expr)) => validate_cron(expr)?,
        Some(TaskSchedule::At(at)) if *at <= now => {
            return Err(format!(
                "scheduled_at {} is not in the future (now is {}); pick a later time",
                at.to_rfc3339(),
                now.to_rfc3339()
            ));
        }
        _ => {}
    }
    Ok(schedule)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateTask {
    #[serde(rename = "content", alias = "prompt")]
    pub prompt: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub profile: TaskProfile,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl Action for CreateTask {
    const NAME: &'static str = "create_task";
    const USAGE: &'static str = r#"<create_task title="short title" profile="standard|specialist" [cron="m h dom mon dow" | scheduled_at="RFC3339"]>prompt</create_task>"#;
}

pub struct CreateTaskHandler;

#[async_trait]
impl ActionHandler<CreateTask> for CreateTaskHandler {
    fn validate(&self, action: &CreateTask, view: &ActionView<'_>) -> Result<(), String> {
        check_request(&action.prompt, action.cron.as_deref(), action.scheduled_at, view.now)
            .map(|_| ())
    }

    async fn apply(&self, action: CreateTask, env: &mut ActionEnv<'_>) -> ApplyFlow {
        let schedule = TaskSchedule::from_parts(action.cron.as_deref(), action.scheduled_at)
            .ok()
            .flatten();
        let request = CreateRequest {
            prompt: action.prompt,
            title: action.title,
            profile: action.profile,
            schedule,
        };
        let reconciler = env.reconciler;
        let outcome = reconciler.reconcile(request, env).await;
        env.round.reconciled.push(outcome);
        ApplyFlow::Continue
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleTask {
    #[serde(rename = "content", alias = "prompt")]
    pub prompt: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub profile: TaskProfile,
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl Action for ScheduleTask {
    const NAME: &'static str = "schedule_task";
    const USAGE: &'static str = r#"<schedule_task title="short title" profile="standard|specialist" cron="m h dom mon dow" | scheduled_at="RFC3339">prompt</schedule_task>"#;
}

pub struct ScheduleTaskHandler;

#[async_trait]
impl ActionHandler<ScheduleTask> for ScheduleTaskHandler {
    fn validate(&self, action: &ScheduleTask, view: &ActionView<'_>) -> Result<(), String> {
        match check_request(&action.prompt, action.cron.as_deref(), action.scheduled_at, view.now)? {
            Some(_) => Ok(()),
            None => Err("schedule_task needs exactly one of `cron` or `scheduled_at`".to_string()),
        }
    }

    async fn apply(&self, action: ScheduleTask, env: &mut ActionEnv<'_>) -> ApplyFlow {
        let schedule = TaskSchedule::from_parts(action.cron.as_deref(), action.scheduled_at)
            .ok()
            .flatten();
        let request = CreateRequest {
            prompt: action.prompt,
            title: action.title,
            profile: action.profile,
            schedule,
        };
        let reconciler = env.reconciler;
        let outcome = reconciler.reconcile(request, env).await;
        env.round.reconciled.push(outcome);
        ApplyFlow::Continue
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CancelTask {
    pub id: TaskId,
    #[serde(default, alias = "content")]
    pub reason: Option<String>,
}

impl Action for CancelTask {
    const NAME: &'static str = "cancel_task";
    const USAGE: &'static str = r#"<cancel_task id="task-<ulid>" reason="optional"/>"#;
}

pub struct CancelTaskHandler;

#[async_trait]
impl ActionHandler<CancelTask> for CancelTaskHandler {
    fn validate(&self, action: &CancelTask, view: &ActionView<'_>) -> Result<(), String> {
        let Some(task) = view.state.store.get(action.id) else {
            return Err(format!("no task with id {}", action.id));
        };
        if task.status.is_terminal() {
            return Err(format!(
                "task {} is already {}; nothing to cancel",
                action.id, task.status
            ));
        }
        Ok(())
    }

    async fn apply(&self, action: CancelTask, env: &mut ActionEnv<'_>) -> ApplyFlow {
        let meta = CancelMeta::new(CancelSource::Manager, action.reason);
        let outcome = env.dispatcher.cancel(action.id, meta).await;
        if !outcome.ok {
            // Finished between validate and apply.
            tracing::debug!(
                task_id = %action.id,
                status = outcome.status.as_str(),
                "cancel_task had nothing to cancel"
            );
        }
        ApplyFlow::Continue
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CancelSchedule {
    pub id: CronJobId,
    #[serde(default, alias = "content")]
    pub reason: Option<String>,
}

impl Action for CancelSchedule {
    const NAME: &'static str = "cancel_schedule";
    const USAGE: &'static str = r#"<cancel_schedule id="cron-<ulid>" reason="optional"/>"#;
}

pub struct CancelScheduleHandler;

#[async_trait]
impl ActionHandler<CancelSchedule> for CancelScheduleHandler {
    fn validate(&self, action: &CancelSchedule, view: &ActionView<'_>) -> Result<(), String> {
        match view.state.store.cron_job(action.id) {
            None => Err(format!("no cron job with id {}", action.id)),
            Some(job) if !job.enabled => Err(format!("cron job {} is already disabled", action.id)),
            Some(_) => Ok(()),
        }
    }

    async fn apply(&self, action: CancelSchedule, env: &mut ActionEnv<'_>) -> ApplyFlow {
        let mirror_active = {
            let mut state = env.ctx.state.lock().await;
            let Some(job) = state.store.cron_job(action.id) else {
                return ApplyFlow::Continue;
            };
            let task_id = job.task_id;
            if state
                .store
                .status_of(task_id)
                .is_some_and(|s| s.is_active())
            {
                Some(task_id)
            } else {
                if let Err(err) =
                    state
                        .store
                        .disable_cron_job(action.id, DisabledReason::Canceled, env.now)
                {
                    tracing::warn!(cron_job_id = %action.id, error = %err, "disable failed");
                }
                None
            }
        };

        match mirror_active {
            // Canceling the mirror task disables the job and audits both.
            Some(task_id) => {
                let meta = CancelMeta::new(CancelSource::Manager, action.reason);
                env.dispatcher.cancel(task_id, meta).await;
            }
            None => {
                env.ctx.persist().await;
                env.ctx
                    .audit(
                        AuditEvent::CronJobDisabled,
                        fields([
                            ("cron_job_id", json!(action.id)),
                            ("reason", json!("canceled")),
                        ]),
                    )
                    .await;
            }
        }
        ApplyFlow::Continue
    }
}

/// Payload written to the `teller-digest` channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyPayload {
    pub text: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Reply {
    #[serde(default)]
    pub content: String,
}

impl Action for Reply {
    const NAME: &'static str = "reply";
    const USAGE: &'static str = "<reply>message for the user</reply>";
}

pub struct ReplyHandler;

#[async_trait]
impl ActionHandler<Reply> for ReplyHandler {
    fn validate(&self, action: &Reply, _view: &ActionView<'_>) -> Result<(), String> {
        if action.content.trim().is_empty() {
            return Err("reply needs a non-empty message body".to_string());
        }
        Ok(())
    }

    async fn apply(&self, action: Reply, env: &mut ActionEnv<'_>) -> ApplyFlow {
        let payload = ReplyPayload {
            text: action.content,
        };
        match env.ctx.publish(Topic::TellerDigest, payload).await {
            Ok(_) => env.round.replies += 1,
            Err(err) => tracing::error!(error = %err, "failed to publish reply"),
        }
        ApplyFlow::Continue
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompressContext {
    #[serde(default, alias = "content")]
    pub reason: Option<String>,
}

impl Action for CompressContext {
    const NAME: &'static str = "compress_context";
    const USAGE: &'static str = r#"<compress_context reason="optional"/>"#;
}

pub struct CompressContextHandler;

#[async_trait]
impl ActionHandler<CompressContext> for CompressContextHandler {
    fn validate(&self, _action: &CompressContext, view: &ActionView<'_>) -> Result<(), String> {
        if view.compressible_entries < MIN_COMPRESSIBLE_ENTRIES {
            return Err(format!(
                "only {} context entries; compress_context needs at least {MIN_COMPRESSIBLE_ENTRIES}",
                view.compressible_entries
            ));
        }
        Ok(())
    }

    async fn apply(&self, action: CompressContext, env: &mut ActionEnv<'_>) -> ApplyFlow {
        env.round.compress_requested = Some(action.reason);
        ApplyFlow::Continue
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RestartRuntime {
    #[serde(default, alias = "content")]
    pub reason: Option<String>,
}

impl Action for RestartRuntime {
    const NAME: &'static str = "restart_runtime";
    const USAGE: &'static str = r#"<restart_runtime reason="optional"/>"#;
}

pub struct RestartRuntimeHandler;

#[async_trait]
impl ActionHandler<RestartRuntime> for RestartRuntimeHandler {
    fn validate(&self, _action: &RestartRuntime, _view: &ActionView<'_>) -> Result<(), String> {
        Ok(())
    }

    async fn apply(&self, action: RestartRuntime, env: &mut ActionEnv<'_>) -> ApplyFlow {
        tracing::info!(reason = ?action.reason, "restart requested by controller");
        env.round.restart_requested = Some(action.reason);
        ApplyFlow::Stop
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rstest::rstest;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
    }

    #[rstest]
    #[case::plain("do it", None, None, true)]
    #[case::blank_prompt("   ", None, None, false)]
    #[case::cron("do it", Some("0 9 * * *"), None, true)]
    #[case::bad_cron("do it", Some("every day"), None, false)]
    #[case::future("do it", None, Some(now() + Duration::minutes(5)), true)]
    #[case::past("do it", None, Some(now() - Duration::seconds(5)), false)]
    #[case::exactly_now("do it", None, Some(now()), false)]
    #[case::both("do it", Some("0 9 * * *"), Some(now() + Duration::minutes(5)), false)]
    fn request_checks(
        #[case] prompt: &str,
        #[case] cron: Option<&str>,
        #[case] at: Option<DateTime<Utc>>,
        #[case] ok: bool,
    ) {
        assert_eq!(check_request(prompt, cron, at, now()).is_ok(), ok);
    }

    #[test]
    fn past_schedule_hint_names_the_constraint() {
        let err = check_request("p", None, Some(now() - Duration::seconds(5)), now()).unwrap_err();
        assert!(err.contains("not in the future"));
    }

    #[test]
    fn builtin_names_are_unique() {
        let mut registry = ActionRegistry::new();
        register_builtin(&mut registry).unwrap();
        assert_eq!(registry.registered_names().len(), BUILTIN_ACTIONS.len());
    }
}
