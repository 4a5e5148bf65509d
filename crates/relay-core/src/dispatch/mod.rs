//! Worker Dispatcher: bounded-concurrency execution of pending tasks with
//! retry, cooperative cancellation and result publication.
//!
//! Each dispatched task runs in its own tokio task, gated by a semaphore.
//! A per-task `CancellationToken` is registered while the task runs; every
//! suspension point of the execution (the model call, the backoff sleep)
//! races against it.
//!
//! Results are appended to the `worker-result` channel before the snapshot
//! is saved. A crash in between replays the task as interrupted on restart,
//! so consumers may see a result twice but never lose one.

mod decision;
mod retry;

pub use decision::{Decider, Decision, RetryDecider};
pub use retry::RetryPolicy;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::app::{RuntimeContext, RuntimeState};
use crate::channel::Topic;
use crate::domain::events::fields;
use crate::domain::{
    AuditEvent, CancelMeta, CancelSource, ModelError, Task, TaskId, TaskResult, TaskStatus,
};
use crate::ports::ModelReply;
use crate::store::{CancelStatus, StoreCancel};

/// Answer to a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub ok: bool,
    pub status: CancelStatus,
}

/// How one dispatch of a task ended.
#[derive(Debug)]
enum Execution {
    Succeeded(ModelReply),
    Failed(String),
    Canceled,
}

#[derive(Clone)]
pub struct Dispatcher {
    ctx: Arc<RuntimeContext>,
    decider: Arc<dyn Decider>,
    slots: Arc<Semaphore>,
    tokens: Arc<Mutex<HashMap<TaskId, CancellationToken>>>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(ctx: Arc<RuntimeContext>, decider: Arc<dyn Decider>) -> Self {
        let max_concurrent = ctx.config.dispatcher.max_concurrent.max(1);
        Self {
            ctx,
            decider,
            slots: Arc::new(Semaphore::new(max_concurrent)),
            tokens: Arc::new(Mutex::new(HashMap::new())),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Dispatcher with the configured `RetryDecider`.
    pub fn with_config_policy(ctx: Arc<RuntimeContext>) -> Self {
        let decider = Arc::new(RetryDecider::new(ctx.config.retry_policy()));
        Self::new(ctx, decider)
    }

    fn tokens(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of executions holding a cancellation token.
    pub fn in_flight(&self) -> usize {
        self.tokens().len()
    }

    /// Queue a pending task for execution. Returns immediately.
    pub fn dispatch(&self, task_id: TaskId) {
        if self.shutdown.is_cancelled() {
            tracing::warn!(task_id = %task_id, "dispatcher is shut down; task stays pending");
            return;
        }
        let this = self.clone();
        self.tracker.spawn(async move {
            this.run(task_id).await;
        });
    }

    async fn run(self, task_id: TaskId) {
        let permit = tokio::select! {
            permit = Arc::clone(&self.slots).acquire_owned() => permit,
            _ = self.shutdown.cancelled() => return,
        };
        let Ok(_permit) = permit else {
            return;
        };

        let token = self.shutdown.child_token();
        let task = {
            let mut state = self.ctx.state.lock().await;
            match state.store.mark_running(task_id, self.ctx.now()) {
                Ok(task) => {
                    self.tokens().insert(task_id, token.clone());
                    task
                }
                Err(err) => {
                    tracing::debug!(task_id = %task_id, error = %err, "skipping dispatch");
                    return;
                }
            }
        };
        tracing::info!(task_id = %task_id, profile = %task.profile, "task started");
        self.ctx.persist().await;

        let execution = self.execute(&task, &token).await;
        self.finish(task_id, execution).await;
    }

    async fn execute(&self, task: &Task, token: &CancellationToken) -> Execution {
        let opts = self.ctx.config.invoke_options(task.profile);
        loop {
            if token.is_cancelled() {
                return Execution::Canceled;
            }

            let call = tokio::select! {
                biased;
                _ = token.cancelled() => Err(ModelError::Aborted),
                reply = self.ctx.model.invoke(&task.prompt, &opts, token) => reply,
            };

            let error = match call {
                Ok(reply) => {
                    self.count_attempt(task.id).await;
                    return Execution::Succeeded(reply);
                }
                Err(_) if token.is_cancelled() => return Execution::Canceled,
                Err(ModelError::Aborted) => return Execution::Canceled,
                Err(err) => err,
            };

            let attempts = self.count_attempt(task.id).await;
            tracing::warn!(
                task_id = %task.id,
                attempt = attempts,
                error = %error,
                "task attempt failed"
            );
            self.ctx.persist().await;

            match self.decider.decide(attempts, &error) {
                Decision::Retry { delay, reason } => {
                    tracing::debug!(task_id = %task.id, %reason, "retrying");
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => return Execution::Canceled,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Decision::GiveUp { reason } => {
                    tracing::debug!(task_id = %task.id, %reason, "giving up");
                    return Execution::Failed(error.to_string());
                }
            }
        }
    }

    async fn count_attempt(&self, task_id: TaskId) -> u32 {
        let mut state = self.ctx.state.lock().await;
        match state.store.record_attempt(task_id) {
            Ok(attempts) => attempts,
            Err(err) => {
                tracing::error!(task_id = %task_id, error = %err, "failed to record attempt");
                0
            }
        }
    }

    async fn finish(&self, task_id: TaskId, execution: Execution) {
        let result = {
            let mut state = self.ctx.state.lock().await;
            let now = self.ctx.now();
            let outcome = match execution {
                Execution::Succeeded(reply) => {
                    state.store.finish(task_id, Ok((reply.output, reply.usage)), now)
                }
                Execution::Failed(error) => state.store.finish(task_id, Err(error), now),
                Execution::Canceled => {
                    // Aborted by shutdown rather than by a cancel request.
                    if state.store.status_of(task_id) == Some(TaskStatus::Running) {
                        let meta = CancelMeta::new(
                            CancelSource::System,
                            Some("runtime shutdown".to_string()),
                        );
                        state.store.cancel(task_id, meta, now);
                    }
                    state.store.attach_canceled_result(task_id, now)
                }
            };
            self.tokens().remove(&task_id);
            outcome
        };

        match result {
            Ok(result) => self.publish_result(result).await,
            Err(err) => {
                tracing::error!(task_id = %task_id, error = %err, "failed to finalize task");
            }
        }
    }

    async fn publish_result(&self, result: TaskResult) {
        tracing::info!(
            task_id = %result.task_id,
            status = ?result.status,
            duration_ms = result.duration_ms,
            "task finished"
        );
        let audit = fields([
            ("task_id", json!(result.task_id)),
            ("status", json!(result.status)),
            ("duration_ms", json!(result.duration_ms)),
        ]);
        if let Err(err) = self.ctx.publish(Topic::WorkerResult, result).await {
            tracing::error!(error = %err, "failed to publish task result");
        }
        self.ctx.persist().await;
        self.ctx.audit(AuditEvent::TaskFinished, audit).await;
    }

    /// Publish results that were produced outside an execution (recovery on
    /// startup).
    pub async fn publish_recovered(&self, results: Vec<TaskResult>) {
        for result in results {
            self.publish_result(result).await;
        }
    }

    /// Cancel a task.
    ///
    /// Pending: canceled immediately with a zero-duration result. Running:
    /// marked canceled and its token triggered; the execution publishes the
    /// result once it observes the abort.
    pub async fn cancel(&self, task_id: TaskId, meta: CancelMeta) -> CancelOutcome {
        let cancel = {
            let mut state = self.ctx.state.lock().await;
            self.cancel_locked(&mut state, task_id, meta.clone())
        };
        self.settle_cancel(task_id, &meta, cancel).await
    }

    /// The state half of `cancel`, for callers already holding the runtime
    /// lock. Follow up with `settle_cancel` once the lock is released.
    pub fn cancel_locked(
        &self,
        state: &mut RuntimeState,
        task_id: TaskId,
        meta: CancelMeta,
    ) -> StoreCancel {
        let cancel = state.store.cancel(task_id, meta, self.ctx.now());
        if cancel.status == CancelStatus::AbortRequested
            && let Some(token) = self.tokens().get(&task_id)
        {
            token.cancel();
        }
        cancel
    }

    /// Publish, audit and persist after `cancel_locked`.
    pub async fn settle_cancel(
        &self,
        task_id: TaskId,
        meta: &CancelMeta,
        cancel: StoreCancel,
    ) -> CancelOutcome {
        let outcome = CancelOutcome {
            ok: cancel.status.is_ok(),
            status: cancel.status,
        };
        if !outcome.ok {
            tracing::debug!(task_id = %task_id, status = cancel.status.as_str(), "cancel ignored");
            return outcome;
        }

        tracing::info!(
            task_id = %task_id,
            status = cancel.status.as_str(),
            source = ?meta.source,
            "task canceled"
        );
        self.ctx
            .audit(
                AuditEvent::TaskCanceled,
                fields([
                    ("task_id", json!(task_id)),
                    ("source", json!(meta.source)),
                    ("reason", json!(meta.reason)),
                    ("status", json!(cancel.status)),
                ]),
            )
            .await;
        if let Some(cron_job_id) = cancel.disabled_cron_job {
            self.ctx
                .audit(
                    AuditEvent::CronJobDisabled,
                    fields([
                        ("cron_job_id", json!(cron_job_id)),
                        ("reason", json!("canceled")),
                    ]),
                )
                .await;
        }

        match cancel.result {
            Some(result) => self.publish_result(result).await,
            None => self.ctx.persist().await,
        }
        outcome
    }

    /// Cancel every registered execution, stop accepting work and wait for
    /// in-flight executions to publish their results.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::test_support::Harness;
    use crate::domain::TaskResultStatus;
    use crate::impls::{ScriptedModel, Step};
    use std::time::Duration;

    #[tokio::test]
    async fn success_publishes_result_and_counts_attempt() {
        let h = Harness::new(Step::Reply("all good".into()));
        let id = h.enqueue("say hi").await;
        h.dispatcher.dispatch(id);

        let task = h.wait_result(id).await;
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.attempts, 1);
        assert!(task.started_at.is_some());

        h.dispatcher.shutdown().await;
        let results = h.published_results().await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].output, "all good");
        assert!(results[0].ok);
        assert_eq!(h.dispatcher.in_flight(), 0);
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let model = ScriptedModel::new(
            [Step::Fail(ModelError::Transient("reset".into()))],
            Step::Reply("second time".into()),
        );
        let h = Harness::with(model, |c| c.dispatcher.max_attempts = 3);
        let id = h.enqueue("flaky").await;
        h.dispatcher.dispatch(id);

        let task = h.wait_result(id).await;
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.attempts, 2);
        assert_eq!(h.model.call_count(), 2);
        h.dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn non_retryable_failure_fails_at_once() {
        let h = Harness::new(Step::Fail(ModelError::NonRetryable("refused".into())));
        let id = h.enqueue("bad").await;
        h.dispatcher.dispatch(id);

        let task = h.wait_result(id).await;
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 1);
        let result = task.result.unwrap();
        assert!(!result.ok);
        assert!(result.output.contains("refused"));
        h.dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_running_aborts_without_counting_an_attempt() {
        let h = Harness::new(Step::Hang);
        let id = h.enqueue("long job").await;
        h.dispatcher.dispatch(id);
        h.wait_running(id).await;

        let outcome = h
            .dispatcher
            .cancel(id, CancelMeta::new(CancelSource::Manager, None))
            .await;
        assert_eq!(
            outcome,
            CancelOutcome {
                ok: true,
                status: CancelStatus::AbortRequested
            }
        );

        let task = h.wait_result(id).await;
        assert_eq!(task.status, TaskStatus::Canceled);
        assert_eq!(task.attempts, 0);
        assert_eq!(task.result.unwrap().status, TaskResultStatus::Canceled);
        h.dispatcher.shutdown().await;
        assert_eq!(h.published_results().await.len(), 1);
    }

    #[tokio::test]
    async fn task_canceled_while_queued_never_runs() {
        let h = Harness::with(ScriptedModel::always(Step::Hang), |c| {
            c.dispatcher.max_concurrent = 1
        });
        let busy = h.enqueue("occupies the only slot").await;
        let queued = h.enqueue("waits for a slot").await;
        h.dispatcher.dispatch(busy);
        h.wait_running(busy).await;
        h.dispatcher.dispatch(queued);

        let outcome = h
            .dispatcher
            .cancel(queued, CancelMeta::new(CancelSource::Manager, None))
            .await;
        assert_eq!(outcome.status, CancelStatus::Canceled);
        let task = h.task(queued).await;
        assert_eq!(task.duration_ms, Some(0));
        assert!(task.started_at.is_none());

        h.dispatcher.shutdown().await;
        assert_eq!(h.model.call_count(), 1);
        assert!(h.task(queued).await.started_at.is_none());
    }

    #[tokio::test]
    async fn cancel_during_backoff_stops_retries() {
        let h = Harness::with(
            ScriptedModel::always(Step::Fail(ModelError::Timeout { timeout_ms: 1 })),
            |c| {
                c.dispatcher.max_attempts = 5;
                c.dispatcher.backoff_ms = 10_000;
            },
        );
        let id = h.enqueue("slow").await;
        h.dispatcher.dispatch(id);

        for _ in 0..400 {
            if h.task(id).await.attempts == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        h.dispatcher
            .cancel(id, CancelMeta::new(CancelSource::Manager, None))
            .await;

        let task = h.wait_result(id).await;
        assert_eq!(task.status, TaskStatus::Canceled);
        assert_eq!(task.attempts, 1);
        assert_eq!(h.model.call_count(), 1);
        h.dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_reports_terminal_and_unknown_tasks() {
        let h = Harness::new(Step::Reply("done".into()));
        let id = h.enqueue("quick").await;
        h.dispatcher.dispatch(id);
        h.wait_result(id).await;

        let meta = CancelMeta::new(CancelSource::Manager, None);
        let done = h.dispatcher.cancel(id, meta.clone()).await;
        assert_eq!(done, CancelOutcome { ok: false, status: CancelStatus::AlreadyDone });

        let unknown = h.dispatcher.cancel(h.ctx.ids.task_id(), meta).await;
        assert_eq!(unknown.status, CancelStatus::NotFound);
        h.dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_work() {
        let h = Harness::new(Step::Hang);
        let id = h.enqueue("forever").await;
        h.dispatcher.dispatch(id);
        h.wait_running(id).await;

        h.dispatcher.shutdown().await;
        let task = h.task(id).await;
        assert_eq!(task.status, TaskStatus::Canceled);
        assert_eq!(task.cancel.unwrap().source, CancelSource::System);
        assert!(h.snapshots.save_count() > 0);
    }
}
