use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::snapshot::{QueueCursors, RuntimeSnapshot, SNAPSHOT_VERSION};
use super::{INTERRUPTED_OUTPUT, StoreError};
use crate::domain::identity;
use crate::domain::{
    CancelMeta, CronJob, CronJobId, DisabledReason, ModelUsage, Task, TaskId, TaskProfile,
    TaskResult, TaskSchedule, TaskStatus,
};
use crate::observability::TaskCounts;
use crate::ports::IdGenerator;

/// Result of `enqueue_task`.
#[derive(Debug, Clone)]
pub struct Enqueued {
    pub task: Task,
    /// `false` when an active task with the same fingerprint already existed.
    pub created: bool,
}

/// Outcome reported by a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelStatus {
    /// A pending task was canceled and its result synthesized.
    Canceled,
    /// A running task was marked canceled; its execution is being aborted.
    AbortRequested,
    AlreadyDone,
    AlreadyCanceled,
    NotFound,
}

impl CancelStatus {
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Canceled | Self::AbortRequested)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Canceled => "canceled",
            Self::AbortRequested => "abort_requested",
            Self::AlreadyDone => "already_done",
            Self::AlreadyCanceled => "already_canceled",
            Self::NotFound => "not_found",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreCancel {
    pub status: CancelStatus,
    /// Set when the task was pending: the result to publish.
    pub result: Option<TaskResult>,
    /// Set when the task mirrored a cron job that this cancel disabled.
    pub disabled_cron_job: Option<CronJobId>,
}

impl StoreCancel {
    fn status(status: CancelStatus) -> Self {
        Self {
            status,
            result: None,
            disabled_cron_job: None,
        }
    }
}

/// In-memory tasks and cron jobs, keyed by id. ULID ids keep both maps in
/// creation order.
#[derive(Debug, Clone, Default)]
pub struct TaskStore {
    tasks: BTreeMap<TaskId, Task>,
    cron_jobs: BTreeMap<CronJobId, CronJob>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a snapshot that already passed `RuntimeSnapshot::validate`.
    pub fn restore(snapshot: RuntimeSnapshot) -> Self {
        Self {
            tasks: snapshot.tasks.into_iter().map(|t| (t.id, t)).collect(),
            cron_jobs: snapshot.cron_jobs.into_iter().map(|j| (j.id, j)).collect(),
        }
    }

    pub fn snapshot(&self, queues: QueueCursors, now: DateTime<Utc>) -> RuntimeSnapshot {
        RuntimeSnapshot {
            version: SNAPSHOT_VERSION,
            saved_at: now,
            tasks: self.tasks.values().cloned().collect(),
            cron_jobs: self.cron_jobs.values().cloned().collect(),
            queues,
        }
    }

    pub fn get(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn cron_job(&self, id: CronJobId) -> Option<&CronJob> {
        self.cron_jobs.get(&id)
    }

    pub fn cron_jobs(&self) -> impl Iterator<Item = &CronJob> {
        self.cron_jobs.values()
    }

    fn task_mut(&mut self, id: TaskId) -> Result<&mut Task, StoreError> {
        self.tasks.get_mut(&id).ok_or(StoreError::TaskNotFound(id))
    }

    fn find_active_by_fingerprint(&self, fingerprint: &str) -> Option<&Task> {
        self.tasks
            .values()
            .find(|t| t.status.is_active() && t.fingerprint == fingerprint)
    }

    /// Create a pending task unless an active one with the same fingerprint
    /// exists.
    pub fn enqueue_task(
        &mut self,
        ids: &dyn IdGenerator,
        prompt: &str,
        title: &str,
        profile: TaskProfile,
        now: DateTime<Utc>,
    ) -> Enqueued {
        let fingerprint = identity::fingerprint(prompt, title, profile, None);
        if let Some(existing) = self.find_active_by_fingerprint(&fingerprint) {
            return Enqueued {
                task: existing.clone(),
                created: false,
            };
        }

        let task = Task::new(ids.task_id(), prompt, title, profile, None, now);
        self.tasks.insert(task.id, task.clone());
        Enqueued {
            task,
            created: true,
        }
    }

    /// Most recent pending or running task with this semantic key.
    pub fn find_active_by_semantic_key(&self, semantic_key: &str) -> Option<&Task> {
        self.tasks
            .values()
            .filter(|t| t.status.is_active() && t.semantic_key == semantic_key)
            .max_by_key(|t| (t.created_at, t.id))
    }

    /// Enabled cron job with an identical request, if any.
    pub fn find_enabled_cron_job(
        &self,
        schedule: &TaskSchedule,
        prompt: &str,
        title: &str,
        profile: TaskProfile,
    ) -> Option<&CronJob> {
        let prompt = identity::normalize_text(prompt);
        let title = identity::normalize_text(title);
        self.cron_jobs
            .values()
            .find(|j| j.enabled && j.matches_request(schedule, &prompt, &title, profile))
    }

    /// The cron job mirrored by `task_id`, if it is a scheduled task.
    pub fn cron_job_for_task(&self, task_id: TaskId) -> Option<&CronJob> {
        self.cron_jobs.values().find(|j| j.task_id == task_id)
    }

    /// Create a cron job and its mirrored pending task. The task is not
    /// dispatched.
    pub fn create_scheduled(
        &mut self,
        ids: &dyn IdGenerator,
        prompt: &str,
        title: &str,
        profile: TaskProfile,
        schedule: TaskSchedule,
        now: DateTime<Utc>,
    ) -> (CronJob, Task) {
        let task = Task::new(ids.task_id(), prompt, title, profile, Some(&schedule), now);
        let job = CronJob {
            id: ids.cron_job_id(),
            task_id: task.id,
            fingerprint: task.fingerprint.clone(),
            semantic_key: task.semantic_key.clone(),
            prompt: task.prompt.clone(),
            title: task.title.clone(),
            profile,
            schedule,
            enabled: true,
            disabled_reason: None,
            created_at: now,
            disabled_at: None,
        };
        self.tasks.insert(task.id, task.clone());
        self.cron_jobs.insert(job.id, job.clone());
        (job, task)
    }

    /// Disable a cron job. Returns `Ok(false)` if it was already disabled.
    pub fn disable_cron_job(
        &mut self,
        id: CronJobId,
        reason: DisabledReason,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let job = self
            .cron_jobs
            .get_mut(&id)
            .ok_or(StoreError::CronJobNotFound(id))?;
        Ok(job.disable(reason, now))
    }

    /// Transition a pending task to running. Returns the updated task.
    pub fn mark_running(&mut self, id: TaskId, now: DateTime<Utc>) -> Result<Task, StoreError> {
        let task = self.task_mut(id)?;
        task.mark_running(now)?;
        Ok(task.clone())
    }

    /// Count one executed attempt. Returns the new total.
    pub fn record_attempt(&mut self, id: TaskId) -> Result<u32, StoreError> {
        let task = self.task_mut(id)?;
        task.record_attempt();
        Ok(task.attempts)
    }

    pub fn status_of(&self, id: TaskId) -> Option<TaskStatus> {
        self.tasks.get(&id).map(|t| t.status)
    }

    /// Cancel a task by id.
    ///
    /// Pending tasks get a synthesized result; running tasks are only marked,
    /// the caller aborts the execution. Canceling a scheduled mirror task
    /// disables its cron job.
    pub fn cancel(&mut self, id: TaskId, meta: CancelMeta, now: DateTime<Utc>) -> StoreCancel {
        let Some(task) = self.tasks.get_mut(&id) else {
            return StoreCancel::status(CancelStatus::NotFound);
        };
        let status = match task.status {
            TaskStatus::Canceled => return StoreCancel::status(CancelStatus::AlreadyCanceled),
            TaskStatus::Succeeded | TaskStatus::Failed => {
                return StoreCancel::status(CancelStatus::AlreadyDone);
            }
            TaskStatus::Pending => CancelStatus::Canceled,
            TaskStatus::Running => CancelStatus::AbortRequested,
        };
        let result = match task.mark_canceled(meta, now) {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(task_id = %id, error = %err, "cancel transition refused");
                return StoreCancel::status(CancelStatus::AlreadyDone);
            }
        };

        let mut disabled_cron_job = None;
        if let Some(job) = self.cron_jobs.values_mut().find(|j| j.task_id == id)
            && job.disable(DisabledReason::Canceled, now)
        {
            disabled_cron_job = Some(job.id);
        }

        StoreCancel {
            status,
            result,
            disabled_cron_job,
        }
    }

    /// Record the outcome of an execution. See `Task::finish`.
    pub fn finish(
        &mut self,
        id: TaskId,
        outcome: Result<(String, Option<ModelUsage>), String>,
        now: DateTime<Utc>,
    ) -> Result<TaskResult, StoreError> {
        Ok(self.task_mut(id)?.finish(outcome, now)?)
    }

    /// Attach the canceled result once the execution observed its abort.
    pub fn attach_canceled_result(
        &mut self,
        id: TaskId,
        now: DateTime<Utc>,
    ) -> Result<TaskResult, StoreError> {
        Ok(self.task_mut(id)?.attach_canceled_result(now))
    }

    /// Finalize tasks left `running` by a previous process as failed.
    pub fn recover_interrupted(&mut self, now: DateTime<Utc>) -> Vec<TaskResult> {
        let mut results = Vec::new();
        for task in self.tasks.values_mut() {
            match task.status {
                TaskStatus::Running => {
                    if let Ok(result) = task.finish(Err(INTERRUPTED_OUTPUT.to_string()), now) {
                        results.push(result);
                    }
                }
                // Canceled while running, but the process stopped before the
                // execution attached its result.
                TaskStatus::Canceled if task.result.is_none() => {
                    results.push(task.attach_canceled_result(now));
                }
                _ => {}
            }
        }
        results
    }

    /// Pending, unscheduled tasks in creation order: the ones to dispatch
    /// after a restart.
    pub fn dispatchable_pending(&self) -> Vec<Task> {
        self.tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && !t.is_scheduled())
            .cloned()
            .collect()
    }

    pub fn counts(&self) -> TaskCounts {
        let mut counts = TaskCounts::default();
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Succeeded => counts.succeeded += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Canceled => counts.canceled += 1,
            }
        }
        for job in self.cron_jobs.values() {
            if job.enabled {
                counts.cron_jobs_enabled += 1;
            } else {
                counts.cron_jobs_disabled += 1;
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CancelSource, TaskResultStatus};
    use crate::ports::{FixedClock, UlidGenerator};
    use chrono::{Duration, TimeZone};
    use rstest::rstest;
    use std::sync::Arc;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap()
    }

    fn ids() -> UlidGenerator {
        UlidGenerator::new(Arc::new(FixedClock::new(now())))
    }

    fn manager() -> CancelMeta {
        CancelMeta::new(CancelSource::Manager, None)
    }

    #[test]
    fn enqueue_dedups_active_fingerprint() {
        let ids = ids();
        let mut store = TaskStore::new();
        let first = store.enqueue_task(&ids, "build report", "Report", TaskProfile::Standard, now());
        let second =
            store.enqueue_task(&ids, "  build   report ", "Report", TaskProfile::Standard, now());

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.task.id, second.task.id);
        assert_eq!(store.counts().pending, 1);
    }

    #[test]
    fn pending_tasks_from_one_millisecond_dispatch_in_enqueue_order() {
        let ids = ids();
        let mut store = TaskStore::new();
        let enqueued: Vec<TaskId> = (0..50)
            .map(|i| {
                store
                    .enqueue_task(&ids, &format!("job {i}"), "", TaskProfile::Standard, now())
                    .task
                    .id
            })
            .collect();

        let order: Vec<TaskId> = store.dispatchable_pending().iter().map(|t| t.id).collect();
        assert_eq!(order, enqueued);
    }

    #[test]
    fn enqueue_creates_new_task_after_terminal() {
        let ids = ids();
        let mut store = TaskStore::new();
        let first = store.enqueue_task(&ids, "p", "t", TaskProfile::Standard, now());
        store.cancel(first.task.id, manager(), now());

        let second = store.enqueue_task(&ids, "p", "t", TaskProfile::Standard, now());
        assert!(second.created);
        assert_ne!(first.task.id, second.task.id);
    }

    #[test]
    fn semantic_lookup_returns_most_recent_active() {
        let ids = ids();
        let mut store = TaskStore::new();
        let older = store
            .enqueue_task(&ids, "summarize logs", "Digest", TaskProfile::Standard, now())
            .task;
        let newer = store
            .enqueue_task(
                &ids,
                "summarize logs again",
                "Digest",
                TaskProfile::Standard,
                now() + Duration::seconds(1),
            )
            .task;
        assert_eq!(older.semantic_key, newer.semantic_key);

        let found = store.find_active_by_semantic_key(&newer.semantic_key).unwrap();
        assert_eq!(found.id, newer.id);

        store.cancel(newer.id, manager(), now());
        let found = store.find_active_by_semantic_key(&newer.semantic_key).unwrap();
        assert_eq!(found.id, older.id);
    }

    #[test]
    fn cancel_pending_returns_result() {
        let ids = ids();
        let mut store = TaskStore::new();
        let task = store.enqueue_task(&ids, "p", "t", TaskProfile::Standard, now()).task;

        let cancel = store.cancel(task.id, manager(), now());
        assert_eq!(cancel.status, CancelStatus::Canceled);
        let result = cancel.result.unwrap();
        assert_eq!(result.status, TaskResultStatus::Canceled);
        assert_eq!(result.duration_ms, 0);
    }

    #[test]
    fn cancel_running_has_no_result_yet() {
        let ids = ids();
        let mut store = TaskStore::new();
        let task = store.enqueue_task(&ids, "p", "t", TaskProfile::Standard, now()).task;
        store.mark_running(task.id, now()).unwrap();

        let cancel = store.cancel(task.id, manager(), now() + Duration::milliseconds(250));
        assert_eq!(cancel.status, CancelStatus::AbortRequested);
        assert!(cancel.result.is_none());
        assert_eq!(store.get(task.id).unwrap().duration_ms, Some(250));
    }

    #[rstest]
    #[case::succeeded(Ok(("done".to_string(), None)), CancelStatus::AlreadyDone)]
    #[case::failed(Err("boom".to_string()), CancelStatus::AlreadyDone)]
    fn cancel_terminal_changes_nothing(
        #[case] outcome: Result<(String, Option<ModelUsage>), String>,
        #[case] expected: CancelStatus,
    ) {
        let ids = ids();
        let mut store = TaskStore::new();
        let task = store.enqueue_task(&ids, "p", "t", TaskProfile::Standard, now()).task;
        store.mark_running(task.id, now()).unwrap();
        store.finish(task.id, outcome, now()).unwrap();
        let before = store.get(task.id).cloned();

        let cancel = store.cancel(task.id, manager(), now());
        assert_eq!(cancel.status, expected);
        assert!(!cancel.status.is_ok());
        assert_eq!(store.get(task.id).cloned(), before);
    }

    #[test]
    fn cancel_twice_reports_already_canceled() {
        let ids = ids();
        let mut store = TaskStore::new();
        let task = store.enqueue_task(&ids, "p", "t", TaskProfile::Standard, now()).task;
        store.cancel(task.id, manager(), now());
        assert_eq!(
            store.cancel(task.id, manager(), now()).status,
            CancelStatus::AlreadyCanceled
        );
    }

    #[test]
    fn cancel_unknown_is_not_found() {
        let mut store = TaskStore::new();
        let cancel = store.cancel(ids().task_id(), manager(), now());
        assert_eq!(cancel.status, CancelStatus::NotFound);
    }

    #[test]
    fn canceling_mirror_task_disables_cron_job() {
        let ids = ids();
        let mut store = TaskStore::new();
        let schedule = TaskSchedule::Cron("0 9 * * *".into());
        let (job, task) = store.create_scheduled(
            &ids,
            "daily digest",
            "Digest",
            TaskProfile::Standard,
            schedule.clone(),
            now(),
        );
        assert!(task.is_scheduled());
        assert!(store.dispatchable_pending().is_empty());
        assert!(
            store
                .find_enabled_cron_job(&schedule, "daily  digest", "Digest", TaskProfile::Standard)
                .is_some()
        );

        let cancel = store.cancel(task.id, manager(), now());
        assert_eq!(cancel.disabled_cron_job, Some(job.id));
        let job = store.cron_job(job.id).unwrap();
        assert!(!job.enabled);
        assert_eq!(job.disabled_reason, Some(DisabledReason::Canceled));
        assert!(
            store
                .find_enabled_cron_job(&schedule, "daily digest", "Digest", TaskProfile::Standard)
                .is_none()
        );
    }

    #[test]
    fn recover_interrupted_fails_running_tasks() {
        let ids = ids();
        let mut store = TaskStore::new();
        let running = store.enqueue_task(&ids, "a", "", TaskProfile::Standard, now()).task;
        let pending = store.enqueue_task(&ids, "b", "", TaskProfile::Standard, now()).task;
        store.mark_running(running.id, now()).unwrap();

        let results = store.recover_interrupted(now() + Duration::seconds(2));
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].task_id, running.id);
        assert_eq!(results[0].status, TaskResultStatus::Failed);
        assert_eq!(results[0].output, INTERRUPTED_OUTPUT);

        let pending_ids: Vec<_> = store.dispatchable_pending().iter().map(|t| t.id).collect();
        assert_eq!(pending_ids, vec![pending.id]);
    }

    #[test]
    fn snapshot_restores_same_state() {
        let ids = ids();
        let mut store = TaskStore::new();
        store.enqueue_task(&ids, "a", "", TaskProfile::Standard, now());
        store.create_scheduled(
            &ids,
            "b",
            "",
            TaskProfile::Specialist,
            TaskSchedule::At(now() + Duration::hours(1)),
            now(),
        );
        let queues = QueueCursors {
            inputs_cursor: 3,
            results_cursor: 1,
        };

        let snapshot = store.snapshot(queues, now());
        snapshot.validate(3, 1).unwrap();
        let restored = TaskStore::restore(snapshot.clone());
        assert_eq!(restored.snapshot(queues, now()), snapshot);
        assert_eq!(restored.counts(), store.counts());
    }
}
