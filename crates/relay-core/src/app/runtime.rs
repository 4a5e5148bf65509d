//! Runtime: startup recovery and the controller loop.
//!
//! One controller round consumes new packets from `user-input` and
//! `worker-result`, asks the model what to do, runs the returned actions
//! through the pipeline and then commits the consumed cursors. Cursors are
//! committed only after the round's effects are applied, so a crash mid-round
//! replays the round instead of dropping its inputs.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::RuntimeContext;
use super::controller::{
    ControllerMemory, DecisionRecord, InputMessage, PromptParts, build_prompt, describe_input,
    describe_result, preview,
};
use crate::actions::{ActionPipeline, ApplyFlow, feedback_text, parse_actions};
use crate::channel::{ChannelCursorState, ChannelError, CursorStore, Role, Topic};
use crate::dispatch::Dispatcher;
use crate::domain::events::fields;
use crate::domain::{AuditEvent, CronJob, ErrorKind, Packet, Task, TaskResult};
use crate::observability::TaskCounts;
use crate::store::{QueueCursors, TaskStore};

/// What `start` found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartReport {
    /// A snapshot was loaded and accepted.
    pub restored: bool,
    /// Interrupted tasks finalized and republished.
    pub recovered: usize,
    /// Pending tasks handed back to the dispatcher.
    pub redispatched: usize,
}

/// Why `run` returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunExit {
    Shutdown,
    RestartRequested { reason: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Nothing new on either inbound channel.
    Idle,
    Processed {
        applied: usize,
        issues: usize,
        /// `Some` when `restart_runtime` was applied, carrying its reason.
        restart: Option<Option<String>>,
    },
    /// The controller's model call failed. Cursors only move for permanent
    /// failures; anything else is retried next round.
    ModelFailed,
}

pub struct Runtime {
    ctx: Arc<RuntimeContext>,
    dispatcher: Dispatcher,
    pipeline: ActionPipeline,
    memory: ControllerMemory,
}

impl Runtime {
    pub fn new(ctx: Arc<RuntimeContext>, dispatcher: Dispatcher, pipeline: ActionPipeline) -> Self {
        Self {
            ctx,
            dispatcher,
            pipeline,
            memory: ControllerMemory::default(),
        }
    }

    pub fn context(&self) -> &Arc<RuntimeContext> {
        &self.ctx
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn memory(&self) -> &ControllerMemory {
        &self.memory
    }

    pub async fn counts(&self) -> TaskCounts {
        self.ctx.state.lock().await.store.counts()
    }

    /// Append a message to `user-input`.
    pub async fn submit(&self, input: InputMessage) -> Result<Packet<InputMessage>, ChannelError> {
        self.ctx.publish(Topic::UserInput, input).await
    }

    /// Restore state, finalize interrupted work and redispatch pending tasks.
    ///
    /// The effective queue cursor is the smaller of the cursor record and the
    /// snapshot's, which covers a crash between compaction and the next
    /// snapshot. A snapshot that fails validation is discarded and the
    /// runtime starts empty.
    pub async fn start(&self) -> StartReport {
        let layout = &self.ctx.layout;
        let inputs_len = self.channel_len(Topic::UserInput).await;
        let results_len = self.channel_len(Topic::WorkerResult).await;
        let file_inputs = load_cursor(&layout.cursor_path(Topic::UserInput, Role::Thinker)).await;
        let file_results =
            load_cursor(&layout.cursor_path(Topic::WorkerResult, Role::Thinker)).await;
        let fallback = QueueCursors {
            inputs_cursor: file_inputs.min(inputs_len),
            results_cursor: file_results.min(results_len),
        };

        let loaded = match self.ctx.snapshots.load().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.snapshot_rejected(&err.to_string()).await;
                None
            }
        };
        let (store, queues, restored) = match loaded {
            Some(mut snapshot) => {
                snapshot.queues.inputs_cursor = snapshot.queues.inputs_cursor.min(file_inputs);
                snapshot.queues.results_cursor = snapshot.queues.results_cursor.min(file_results);
                match snapshot.validate(inputs_len, results_len) {
                    Ok(()) => {
                        let queues = snapshot.queues;
                        (TaskStore::restore(snapshot), queues, true)
                    }
                    Err(err) => {
                        self.snapshot_rejected(&err.to_string()).await;
                        (TaskStore::new(), fallback, false)
                    }
                }
            }
            None => (TaskStore::new(), fallback, false),
        };

        let now = self.ctx.now();
        let (recovered, pending) = {
            let mut state = self.ctx.state.lock().await;
            state.store = store;
            state.queues = queues;
            let recovered = state.store.recover_interrupted(now);
            let pending = state.store.dispatchable_pending();
            (recovered, pending)
        };
        self.ctx.persist().await;

        let report = StartReport {
            restored,
            recovered: recovered.len(),
            redispatched: pending.len(),
        };
        self.dispatcher.publish_recovered(recovered).await;
        for task in &pending {
            self.dispatcher.dispatch(task.id);
        }
        tracing::info!(
            restored = report.restored,
            recovered = report.recovered,
            redispatched = report.redispatched,
            inputs_cursor = queues.inputs_cursor,
            results_cursor = queues.results_cursor,
            "runtime started"
        );
        report
    }

    async fn channel_len(&self, topic: Topic) -> u64 {
        match self.ctx.channel.len(&self.ctx.layout.log_path(topic)).await {
            Ok(length) => length,
            Err(err) => {
                tracing::error!(topic = %topic, error = %err, "channel length unreadable");
                0
            }
        }
    }

    async fn snapshot_rejected(&self, reason: &str) {
        tracing::warn!(reason, "snapshot rejected; starting with an empty store");
        self.ctx
            .audit(AuditEvent::SnapshotRejected, fields([("reason", json!(reason))]))
            .await;
    }

    /// Run one controller round.
    pub async fn round(&mut self, cancel: &CancellationToken) -> Result<RoundOutcome, ChannelError> {
        let limit = Some(self.ctx.config.runtime.input_batch_limit.max(1));
        let queues = self.ctx.state.lock().await.queues;
        let inputs = self
            .ctx
            .channel
            .consume::<InputMessage>(
                &self.ctx.layout.log_path(Topic::UserInput),
                queues.inputs_cursor,
                limit,
            )
            .await?;
        let results = self
            .ctx
            .channel
            .consume::<TaskResult>(
                &self.ctx.layout.log_path(Topic::WorkerResult),
                queues.results_cursor,
                limit,
            )
            .await?;
        if inputs.is_empty() && results.is_empty() {
            return Ok(RoundOutcome::Idle);
        }

        let next = QueueCursors {
            inputs_cursor: inputs.last().map_or(queues.inputs_cursor, |p| p.cursor),
            results_cursor: results.last().map_or(queues.results_cursor, |p| p.cursor),
        };
        let inputs: Vec<InputMessage> = inputs.into_iter().map(|p| p.packet.payload).collect();
        let results: Vec<TaskResult> = results.into_iter().map(|p| p.packet.payload).collect();
        tracing::debug!(inputs = inputs.len(), results = results.len(), "controller round");

        let prompt = {
            let usages = self.pipeline.registry().usages();
            let state = self.ctx.state.lock().await;
            let active: Vec<Task> = state
                .store
                .tasks()
                .filter(|t| t.status.is_active())
                .cloned()
                .collect();
            let cron_jobs: Vec<CronJob> = state
                .store
                .cron_jobs()
                .filter(|j| j.enabled)
                .cloned()
                .collect();
            build_prompt(&PromptParts {
                usages: &usages,
                active_tasks: &active,
                cron_jobs: &cron_jobs,
                memory: &self.memory,
                inputs: &inputs,
                results: &results,
            })
        };

        let opts = self.ctx.config.invoke_options(self.ctx.config.controller.profile);
        let reply = match self.ctx.model.invoke(&prompt, &opts, cancel).await {
            Ok(reply) => reply,
            Err(err) => {
                tracing::warn!(error = %err, "controller model call failed");
                if err.kind() == ErrorKind::Permanent {
                    self.remember(&inputs, &results);
                    self.memory.push(format!("controller call failed: {err}"));
                    self.commit(next).await;
                }
                return Ok(RoundOutcome::ModelFailed);
            }
        };

        let actions = parse_actions(&reply.output);
        let report = self
            .pipeline
            .run(&actions, &self.ctx, &self.dispatcher, self.memory.len())
            .await;

        self.memory.feedback = feedback_text(&report.issues);
        self.remember(&inputs, &results);
        if !reply.output.trim().is_empty() {
            self.memory.push(format!("controller: {}", preview(&reply.output)));
        }
        if let Some(reason) = &report.effects.compress_requested {
            self.memory.compress(reason.as_deref());
        }

        let record = DecisionRecord {
            inputs_cursor: next.inputs_cursor,
            results_cursor: next.results_cursor,
            output: reply.output,
            applied: report.applied.clone(),
            issues: report.issues.clone(),
            skipped: report.skipped.clone(),
            stopped: report.flow == ApplyFlow::Stop,
        };
        if let Err(err) = self.ctx.publish(Topic::ThinkerDecision, record).await {
            tracing::error!(error = %err, "failed to record controller decision");
        }

        self.commit(next).await;
        self.compact().await;

        tracing::info!(
            applied = report.applied.len(),
            issues = report.issues.len(),
            skipped = report.skipped.len(),
            "controller round done"
        );
        Ok(RoundOutcome::Processed {
            applied: report.applied.len(),
            issues: report.issues.len(),
            restart: report.effects.restart_requested,
        })
    }

    fn remember(&mut self, inputs: &[InputMessage], results: &[TaskResult]) {
        for input in inputs {
            self.memory.push(describe_input(input));
        }
        for result in results {
            self.memory.push(format!("result {}", describe_result(result)));
        }
    }

    async fn commit(&self, next: QueueCursors) {
        for (topic, cursor) in [
            (Topic::UserInput, next.inputs_cursor),
            (Topic::WorkerResult, next.results_cursor),
        ] {
            let path = self.ctx.layout.cursor_path(topic, Role::Thinker);
            if let Err(err) = CursorStore::save(&path, ChannelCursorState { cursor }).await {
                tracing::error!(topic = %topic, cursor, error = %err, "cursor save failed");
            }
        }
        self.ctx.state.lock().await.queues = next;
        self.ctx.persist().await;
    }

    /// Truncate inbound logs the controller has fully consumed.
    async fn compact(&self) {
        let min_packets = self.ctx.config.channels.compact_min_packets;
        let queues = self.ctx.state.lock().await.queues;
        for (topic, cursor) in [
            (Topic::UserInput, queues.inputs_cursor),
            (Topic::WorkerResult, queues.results_cursor),
        ] {
            let compacted = self
                .ctx
                .channel
                .compact_if_fully_consumed(
                    &self.ctx.layout.log_path(topic),
                    &self.ctx.layout.cursor_path(topic, Role::Thinker),
                    cursor,
                    min_packets,
                )
                .await;
            match compacted {
                Ok(true) => {
                    {
                        let mut state = self.ctx.state.lock().await;
                        match topic {
                            Topic::UserInput => state.queues.inputs_cursor = 0,
                            _ => state.queues.results_cursor = 0,
                        }
                    }
                    self.ctx.persist().await;
                    self.ctx
                        .audit(
                            AuditEvent::ChannelCompacted,
                            fields([("topic", json!(topic.as_str())), ("packets", json!(cursor))]),
                        )
                        .await;
                }
                Ok(false) => {}
                Err(err) => tracing::warn!(topic = %topic, error = %err, "compaction failed"),
            }
        }
    }

    /// Poll for work until `shutdown` fires or a round requests a restart.
    /// In-flight executions are stopped before this returns.
    pub async fn run(mut self, shutdown: CancellationToken) -> RunExit {
        let poll = Duration::from_millis(self.ctx.config.runtime.poll_interval_ms.max(1));
        let exit = loop {
            if shutdown.is_cancelled() {
                break RunExit::Shutdown;
            }
            match self.round(&shutdown).await {
                Ok(RoundOutcome::Processed {
                    restart: Some(reason),
                    ..
                }) => break RunExit::RestartRequested { reason },
                Ok(RoundOutcome::Processed { .. }) => continue,
                Ok(RoundOutcome::Idle | RoundOutcome::ModelFailed) => {}
                Err(err) => tracing::error!(error = %err, "controller round failed"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => break RunExit::Shutdown,
                _ = tokio::time::sleep(poll) => {}
            }
        };
        tracing::info!(?exit, "controller loop stopped");
        self.dispatcher.shutdown().await;
        exit
    }
}

async fn load_cursor(path: &std::path::Path) -> u64 {
    match CursorStore::load(path).await {
        Ok(state) => state.cursor,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "cursor record unreadable; using 0");
            0
        }
    }
}
