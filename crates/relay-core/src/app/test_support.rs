//! Shared fixtures for in-crate tests.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;

use super::RuntimeContext;
use crate::channel::Topic;
use crate::config::RelayConfig;
use crate::dispatch::Dispatcher;
use crate::domain::{Task, TaskId, TaskProfile, TaskResult, TaskStatus};
use crate::impls::{MemorySnapshotStore, ScriptedModel, Step};
use crate::ports::{Clock, FixedClock, NoopAuditSink, UlidGenerator};

pub(crate) struct Harness {
    pub ctx: Arc<RuntimeContext>,
    pub dispatcher: Dispatcher,
    pub clock: Arc<FixedClock>,
    pub model: Arc<ScriptedModel>,
    pub snapshots: Arc<MemorySnapshotStore>,
    _dir: TempDir,
}

impl Harness {
    pub fn new(step: Step) -> Self {
        Self::with(ScriptedModel::always(step), |_| {})
    }

    pub fn with(model: ScriptedModel, configure: impl FnOnce(&mut RelayConfig)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = RelayConfig::default();
        config.runtime.data_dir = dir.path().to_path_buf();
        config.dispatcher.backoff_ms = 10;
        configure(&mut config);

        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2026, 4, 1, 9, 0, 0).unwrap(),
        ));
        let model = Arc::new(model);
        let snapshots = Arc::new(MemorySnapshotStore::new());
        let ctx = Arc::new(RuntimeContext::new(
            config,
            clock.clone(),
            Arc::new(UlidGenerator::new(clock.clone())),
            model.clone(),
            snapshots.clone(),
            Arc::new(NoopAuditSink),
        ));
        let dispatcher = Dispatcher::with_config_policy(Arc::clone(&ctx));
        Self {
            ctx,
            dispatcher,
            clock,
            model,
            snapshots,
            _dir: dir,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Enqueue an unscheduled task directly in the store.
    pub async fn enqueue(&self, prompt: &str) -> TaskId {
        let mut state = self.ctx.state.lock().await;
        state
            .store
            .enqueue_task(self.ctx.ids.as_ref(), prompt, "", TaskProfile::Standard, self.now())
            .task
            .id
    }

    pub async fn task(&self, id: TaskId) -> Task {
        let state = self.ctx.state.lock().await;
        state.store.get(id).cloned().expect("task exists")
    }

    /// Poll until the task has a result (2s cap).
    pub async fn wait_result(&self, id: TaskId) -> Task {
        for _ in 0..400 {
            let task = self.task(id).await;
            if task.result.is_some() {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {id} did not finish in time");
    }

    /// Poll until the task is running (2s cap).
    pub async fn wait_running(&self, id: TaskId) {
        for _ in 0..400 {
            if self.task(id).await.status == TaskStatus::Running {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {id} never started");
    }

    pub async fn published_results(&self) -> Vec<TaskResult> {
        self.ctx
            .channel
            .consume::<TaskResult>(&self.ctx.layout.log_path(Topic::WorkerResult), 0, None)
            .await
            .expect("worker-result readable")
            .into_iter()
            .map(|p| p.packet.payload)
            .collect()
    }
}
