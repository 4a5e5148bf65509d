//! One round of requests: look up, validate, apply, collect issues.

use serde_json::json;

use super::issue::{IssueCode, ValidationIssue};
use super::parser::ParsedAction;
use super::reconcile::Reconciler;
use super::registry::ActionRegistry;
use super::{ActionEnv, ActionView, ApplyFlow, RoundEffects};
use crate::app::RuntimeContext;
use crate::dispatch::Dispatcher;
use crate::domain::AuditEvent;
use crate::domain::events::fields;

#[derive(Debug)]
pub struct RoundReport {
    /// Names of applied actions, in order.
    pub applied: Vec<String>,
    pub issues: Vec<ValidationIssue>,
    /// Actions left unprocessed because an earlier one returned `Stop`.
    pub skipped: Vec<String>,
    pub flow: ApplyFlow,
    pub effects: RoundEffects,
}

pub struct ActionPipeline {
    registry: ActionRegistry,
    reconciler: Reconciler,
}

impl ActionPipeline {
    pub fn new(registry: ActionRegistry, reconciler: Reconciler) -> Self {
        Self {
            registry,
            reconciler,
        }
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// Process `actions` in order.
    ///
    /// Each action is validated right before it is applied, so it sees the
    /// effects of the actions before it. Only actions without issues are
    /// applied.
    ///
    /// Validation and apply take the state lock separately, and workers keep
    /// running in between. Handlers re-read the state they act on and treat a
    /// task that finished in the gap as a no-op.
    pub async fn run(
        &self,
        actions: &[ParsedAction],
        ctx: &RuntimeContext,
        dispatcher: &Dispatcher,
        compressible_entries: usize,
    ) -> RoundReport {
        let now = ctx.now();
        let mut effects = RoundEffects::default();
        let mut applied = Vec::new();
        let mut issues = Vec::new();
        let mut flow = ApplyFlow::Continue;
        let mut skipped = Vec::new();

        for (index, parsed) in actions.iter().enumerate() {
            let Some(action) = self.registry.get(&parsed.name) else {
                let hint = format!(
                    "unknown action `{}`; available: {}",
                    parsed.name,
                    self.registry.registered_names().join(", ")
                );
                let issue = ValidationIssue::new(&parsed.name, IssueCode::UnregisteredAction, hint);
                reject(ctx, &issue).await;
                issues.push(issue);
                continue;
            };

            let issue = {
                let state = ctx.state.lock().await;
                let view = ActionView {
                    state: &state,
                    now,
                    compressible_entries,
                };
                action.validate_dyn(parsed, &view)
            };
            if let Some(issue) = issue {
                reject(ctx, &issue).await;
                issues.push(issue);
                continue;
            }

            let mut env = ActionEnv {
                ctx,
                dispatcher,
                reconciler: &self.reconciler,
                now,
                round: &mut effects,
            };
            let step = action.apply_dyn(parsed, &mut env).await;
            tracing::debug!(action = %parsed.name, ?step, "action applied");
            applied.push(parsed.name.clone());

            if step == ApplyFlow::Stop {
                flow = ApplyFlow::Stop;
                skipped = actions[index + 1..]
                    .iter()
                    .map(|a| a.name.clone())
                    .collect();
                break;
            }
        }

        RoundReport {
            applied,
            issues,
            skipped,
            flow,
            effects,
        }
    }
}

async fn reject(ctx: &RuntimeContext, issue: &ValidationIssue) {
    tracing::info!(action = %issue.action, error = %issue.error, hint = %issue.hint, "action rejected");
    ctx.audit(
        AuditEvent::ActionRejected,
        fields([
            ("action", json!(issue.action)),
            ("error", json!(issue.error)),
            ("hint", json!(issue.hint)),
        ]),
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::builtin::{CancelTask, CancelTaskHandler, register_builtin};
    use crate::actions::{ActionHandler, ReconcileOutcome, parse_actions};
    use crate::app::test_support::Harness;
    use crate::domain::{TaskStatus, TaskResultStatus};
    use crate::impls::Step;
    use std::time::Duration;

    fn pipeline(debounce: Duration) -> ActionPipeline {
        let mut registry = ActionRegistry::new();
        register_builtin(&mut registry).unwrap();
        ActionPipeline::new(registry, Reconciler::new(debounce))
    }

    #[tokio::test]
    async fn unregistered_action_is_reported_not_applied() {
        let h = Harness::new(Step::Hang);
        let report = pipeline(Duration::ZERO)
            .run(&parse_actions("<launch_rockets/>"), &h.ctx, &h.dispatcher, 0)
            .await;
        assert!(report.applied.is_empty());
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].error, IssueCode::UnregisteredAction);
        assert!(report.issues[0].hint.contains("create_task"));
    }

    #[tokio::test]
    async fn schema_error_carries_usage() {
        let h = Harness::new(Step::Hang);
        let report = pipeline(Duration::ZERO)
            .run(&parse_actions(r#"<cancel_task task="x"/>"#), &h.ctx, &h.dispatcher, 0)
            .await;
        assert_eq!(report.issues[0].error, IssueCode::InvalidActionSchema);
        assert!(report.issues[0].hint.contains("usage:"));
    }

    #[tokio::test]
    async fn past_scheduled_at_is_rejected_without_cron_job() {
        let h = Harness::new(Step::Hang);
        let at = (h.now() - chrono::Duration::seconds(5)).to_rfc3339();
        let text = format!(r#"<schedule_task title="ping" scheduled_at="{at}">ping me</schedule_task>"#);
        let report = pipeline(Duration::ZERO)
            .run(&parse_actions(&text), &h.ctx, &h.dispatcher, 0)
            .await;

        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].error, IssueCode::ActionExecutionRejected);
        let state = h.ctx.state.lock().await;
        assert_eq!(state.store.cron_jobs().count(), 0);
        assert_eq!(state.store.tasks().count(), 0);
    }

    #[tokio::test]
    async fn future_schedule_creates_cron_job_and_undispatched_mirror() {
        let h = Harness::new(Step::Reply("done".into()));
        let at = (h.now() + chrono::Duration::hours(1)).to_rfc3339();
        let text = format!(r#"<schedule_task scheduled_at="{at}">ping me</schedule_task>"#);
        let pipeline = pipeline(Duration::ZERO);
        let report = pipeline.run(&parse_actions(&text), &h.ctx, &h.dispatcher, 0).await;
        assert!(report.issues.is_empty());
        assert!(matches!(report.effects.reconciled[0], ReconcileOutcome::Scheduled { .. }));

        let again = pipeline.run(&parse_actions(&text), &h.ctx, &h.dispatcher, 0).await;
        assert!(matches!(again.effects.reconciled[0], ReconcileOutcome::ScheduleExists(_)));

        h.dispatcher.shutdown().await;
        let state = h.ctx.state.lock().await;
        assert_eq!(state.store.cron_jobs().count(), 1);
        let mirror = state.store.tasks().next().unwrap();
        assert_eq!(mirror.status, TaskStatus::Pending);
        assert_eq!(mirror.attempts, 0);
    }

    #[tokio::test]
    async fn stop_skips_the_rest_of_the_round() {
        let h = Harness::new(Step::Hang);
        let text = "<reply>bye</reply><restart_runtime/><reply>never</reply>";
        let report = pipeline(Duration::ZERO)
            .run(&parse_actions(text), &h.ctx, &h.dispatcher, 0)
            .await;
        assert_eq!(report.flow, ApplyFlow::Stop);
        assert_eq!(report.applied, vec!["reply", "restart_runtime"]);
        assert_eq!(report.skipped, vec!["reply"]);
        assert_eq!(report.effects.replies, 1);
        assert!(report.effects.restart_requested.is_some());
    }

    #[tokio::test]
    async fn compress_context_needs_enough_entries() {
        let h = Harness::new(Step::Hang);
        let actions = parse_actions("<compress_context/>");
        let p = pipeline(Duration::ZERO);

        let report = p.run(&actions, &h.ctx, &h.dispatcher, 1).await;
        assert_eq!(report.issues[0].error, IssueCode::ActionExecutionRejected);

        let report = p.run(&actions, &h.ctx, &h.dispatcher, 5).await;
        assert!(report.issues.is_empty());
        assert_eq!(report.effects.compress_requested, Some(None));
    }

    #[tokio::test]
    async fn newer_request_supersedes_stale_task() {
        let h = Harness::new(Step::Hang);
        let p = pipeline(Duration::ZERO);
        let first = p
            .run(
                &parse_actions(r#"<create_task title="Digest">summarize logs</create_task>"#),
                &h.ctx,
                &h.dispatcher,
                0,
            )
            .await;
        let ReconcileOutcome::Created(stale) = first.effects.reconciled[0] else {
            panic!("expected a created task: {:?}", first.effects.reconciled);
        };

        let second = p
            .run(
                &parse_actions(r#"<create_task title="digest">summarize logs in detail</create_task>"#),
                &h.ctx,
                &h.dispatcher,
                0,
            )
            .await;
        let ReconcileOutcome::Superseded { stale: canceled, created } = second.effects.reconciled[0]
        else {
            panic!("expected supersession: {:?}", second.effects.reconciled);
        };
        assert_eq!(canceled, stale);
        assert_ne!(created, stale);

        h.dispatcher.shutdown().await;
        let state = h.ctx.state.lock().await;
        let stale_task = state.store.get(stale).unwrap();
        assert_eq!(stale_task.status, TaskStatus::Canceled);
        let cancel = stale_task.cancel.as_ref().unwrap();
        assert_eq!(cancel.reason.as_deref(), Some("superseded_by_newer_semantic_task"));
        assert_eq!(
            stale_task.result.as_ref().map(|r| r.status),
            Some(TaskResultStatus::Canceled)
        );
    }

    #[tokio::test]
    async fn debounce_drops_repeats_and_batch_dedup_drops_copies() {
        let h = Harness::new(Step::Hang);
        let text = r#"<create_task title="A">same</create_task><create_task title="A">same</create_task>"#;

        let report = pipeline(Duration::from_secs(5))
            .run(&parse_actions(text), &h.ctx, &h.dispatcher, 0)
            .await;
        assert!(matches!(report.effects.reconciled[1], ReconcileOutcome::Debounced));

        let report = pipeline(Duration::ZERO)
            .run(&parse_actions(text), &h.ctx, &h.dispatcher, 0)
            .await;
        assert!(matches!(report.effects.reconciled[1], ReconcileOutcome::DuplicateInBatch));
        h.dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn one_title_on_two_crons_schedules_both() {
        let h = Harness::new(Step::Hang);
        let text = r#"<schedule_task title="Report" cron="0 9 * * *">send the report</schedule_task><schedule_task title="Report" cron="0 17 * * *">send the report</schedule_task>"#;
        let report = pipeline(Duration::from_millis(300))
            .run(&parse_actions(text), &h.ctx, &h.dispatcher, 0)
            .await;

        assert!(report.issues.is_empty());
        assert!(matches!(report.effects.reconciled[0], ReconcileOutcome::Scheduled { .. }));
        assert!(matches!(report.effects.reconciled[1], ReconcileOutcome::Scheduled { .. }));
        let state = h.ctx.state.lock().await;
        assert_eq!(state.store.cron_jobs().count(), 2);
    }

    #[tokio::test]
    async fn identical_request_redispatches_the_pending_task() {
        let h = Harness::new(Step::Reply("done".into()));
        let id = h.enqueue("summarize logs").await;

        let report = pipeline(Duration::ZERO)
            .run(&parse_actions("<create_task>summarize logs</create_task>"), &h.ctx, &h.dispatcher, 0)
            .await;
        assert_eq!(report.effects.reconciled, vec![ReconcileOutcome::Redispatched(id)]);

        assert_eq!(h.wait_result(id).await.status, TaskStatus::Succeeded);
        let state = h.ctx.state.lock().await;
        assert_eq!(state.store.tasks().count(), 1);
    }

    #[tokio::test]
    async fn identical_request_leaves_the_running_task_alone() {
        let h = Harness::new(Step::Hang);
        let p = pipeline(Duration::from_millis(300));
        let actions = parse_actions(r#"<create_task title="Digest">summarize logs</create_task>"#);

        let first = p.run(&actions, &h.ctx, &h.dispatcher, 0).await;
        let ReconcileOutcome::Created(id) = first.effects.reconciled[0] else {
            panic!("expected a created task: {:?}", first.effects.reconciled);
        };
        h.wait_running(id).await;

        h.clock.advance(chrono::Duration::milliseconds(301));
        let second = p.run(&actions, &h.ctx, &h.dispatcher, 0).await;
        assert_eq!(second.effects.reconciled, vec![ReconcileOutcome::AlreadyRunning(id)]);

        let task = h.task(id).await;
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.cancel.is_none());
        assert_eq!(h.ctx.state.lock().await.store.tasks().count(), 1);
        h.dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_of_a_task_that_finished_after_validation_is_a_noop() {
        let h = Harness::new(Step::Reply("done".into()));
        let id = h.enqueue("tidy up").await;
        let action = CancelTask { id, reason: None };
        {
            let state = h.ctx.state.lock().await;
            let view = ActionView {
                state: &state,
                now: h.now(),
                compressible_entries: 0,
            };
            assert!(CancelTaskHandler.validate(&action, &view).is_ok());
        }

        h.dispatcher.dispatch(id);
        assert_eq!(h.wait_result(id).await.status, TaskStatus::Succeeded);

        let p = pipeline(Duration::ZERO);
        let mut effects = RoundEffects::default();
        let mut env = ActionEnv {
            ctx: &h.ctx,
            dispatcher: &h.dispatcher,
            reconciler: &p.reconciler,
            now: h.now(),
            round: &mut effects,
        };
        assert_eq!(CancelTaskHandler.apply(action, &mut env).await, ApplyFlow::Continue);

        let task = h.task(id).await;
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert!(task.cancel.is_none());
    }
}
