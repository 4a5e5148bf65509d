//! Create-task reconciliation: decides whether a `create_task` or
//! `schedule_task` request creates, reuses, supersedes or is dropped.
//!
//! Order of checks:
//! 1. same semantic key seen within the debounce window: dropped;
//! 2. same exact content earlier in this round: dropped;
//! 3. scheduled requests: reuse an identical enabled cron job, or create a
//!    cron job plus its pending mirror task (not dispatched);
//! 4. otherwise compare with the active task holding the same semantic key:
//!    none creates, a different fingerprint supersedes it, the same
//!    fingerprint redispatches a pending task or leaves a running one alone.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use super::ActionEnv;
use crate::domain::events::fields;
use crate::domain::identity;
use crate::domain::{
    AuditEvent, CancelMeta, CancelSource, CronJobId, TaskId, TaskProfile, TaskSchedule, TaskStatus,
};

/// Cancel reason recorded on a task replaced by a newer request.
pub const SUPERSEDED_REASON: &str = "superseded_by_newer_semantic_task";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateRequest {
    pub prompt: String,
    pub title: String,
    pub profile: TaskProfile,
    pub schedule: Option<TaskSchedule>,
}

impl CreateRequest {
    pub fn semantic_key(&self) -> String {
        identity::semantic_key(&self.prompt, &self.title, self.profile, self.schedule.as_ref())
    }

    pub fn fingerprint(&self) -> String {
        identity::fingerprint(&self.prompt, &self.title, self.profile, self.schedule.as_ref())
    }

    pub fn content_key(&self) -> String {
        identity::content_key(&self.prompt, &self.title, self.profile, self.schedule.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Debounced,
    DuplicateInBatch,
    Created(TaskId),
    Superseded { stale: TaskId, created: TaskId },
    Redispatched(TaskId),
    AlreadyRunning(TaskId),
    Scheduled { cron_job: CronJobId, task: TaskId },
    ScheduleExists(CronJobId),
}

/// Holds the debounce memory across rounds.
pub struct Reconciler {
    debounce: Duration,
    recent: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Reconciler {
    pub fn new(debounce: std::time::Duration) -> Self {
        Self {
            debounce: Duration::from_std(debounce).unwrap_or(Duration::zero()),
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// `true` if `semantic_key` was accepted within the window; otherwise
    /// remembers it and returns `false`.
    fn debounced(&self, semantic_key: &str, now: DateTime<Utc>) -> bool {
        if self.debounce <= Duration::zero() {
            return false;
        }
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        recent.retain(|_, seen| now - *seen < self.debounce);
        if recent.contains_key(semantic_key) {
            return true;
        }
        recent.insert(semantic_key.to_string(), now);
        false
    }

    pub async fn reconcile(
        &self,
        request: CreateRequest,
        env: &mut ActionEnv<'_>,
    ) -> ReconcileOutcome {
        let semantic_key = request.semantic_key();
        if self.debounced(&semantic_key, env.now) {
            tracing::debug!(semantic_key = %semantic_key, "create request debounced");
            return ReconcileOutcome::Debounced;
        }
        if !env.round.batch_keys.insert(request.content_key()) {
            tracing::debug!(semantic_key = %semantic_key, "duplicate create request in round");
            return ReconcileOutcome::DuplicateInBatch;
        }

        match request.schedule.clone() {
            Some(schedule) => self.schedule(request, schedule, env).await,
            None => self.create_now(request, &semantic_key, env).await,
        }
    }

    async fn schedule(
        &self,
        request: CreateRequest,
        schedule: TaskSchedule,
        env: &mut ActionEnv<'_>,
    ) -> ReconcileOutcome {
        let (job, task) = {
            let mut state = env.ctx.state.lock().await;
            if let Some(existing) = state.store.find_enabled_cron_job(
                &schedule,
                &request.prompt,
                &request.title,
                request.profile,
            ) {
                return ReconcileOutcome::ScheduleExists(existing.id);
            }
            state.store.create_scheduled(
                env.ctx.ids.as_ref(),
                &request.prompt,
                &request.title,
                request.profile,
                schedule,
                env.now,
            )
        };

        tracing::info!(cron_job_id = %job.id, task_id = %task.id, "cron job created");
        env.ctx.persist().await;
        env.ctx
            .audit(
                AuditEvent::CronJobCreated,
                fields([
                    ("cron_job_id", json!(job.id)),
                    ("task_id", json!(task.id)),
                    ("schedule", json!(job.schedule)),
                    ("profile", json!(job.profile)),
                ]),
            )
            .await;
        ReconcileOutcome::Scheduled {
            cron_job: job.id,
            task: task.id,
        }
    }

    async fn create_now(
        &self,
        request: CreateRequest,
        semantic_key: &str,
        env: &mut ActionEnv<'_>,
    ) -> ReconcileOutcome {
        let fingerprint = request.fingerprint();
        let mut state = env.ctx.state.lock().await;
        let active = state
            .store
            .find_active_by_semantic_key(semantic_key)
            .map(|t| (t.id, t.status, t.fingerprint.clone()));

        let stale = match active {
            Some((id, TaskStatus::Pending, fp)) if fp == fingerprint => {
                drop(state);
                tracing::info!(task_id = %id, "redispatching pending task");
                env.dispatcher.dispatch(id);
                env.ctx
                    .audit(AuditEvent::TaskRedispatched, fields([("task_id", json!(id))]))
                    .await;
                return ReconcileOutcome::Redispatched(id);
            }
            Some((id, _, fp)) if fp == fingerprint => {
                tracing::debug!(task_id = %id, "identical task already running");
                return ReconcileOutcome::AlreadyRunning(id);
            }
            Some((id, _, _)) => {
                let meta = CancelMeta::new(CancelSource::Deferred, Some(SUPERSEDED_REASON.into()));
                let cancel = env.dispatcher.cancel_locked(&mut state, id, meta.clone());
                Some((id, meta, cancel))
            }
            None => None,
        };

        let enqueued = state.store.enqueue_task(
            env.ctx.ids.as_ref(),
            &request.prompt,
            &request.title,
            request.profile,
            env.now,
        );
        drop(state);

        if let Some((stale_id, meta, cancel)) = &stale {
            env.dispatcher
                .settle_cancel(*stale_id, meta, cancel.clone())
                .await;
        }

        let task = enqueued.task;
        if enqueued.created {
            tracing::info!(task_id = %task.id, profile = %task.profile, "task created");
            env.ctx.persist().await;
            env.ctx
                .audit(
                    AuditEvent::TaskCreated,
                    fields([
                        ("task_id", json!(task.id)),
                        ("title", json!(task.title)),
                        ("profile", json!(task.profile)),
                        ("fingerprint", json!(task.fingerprint)),
                    ]),
                )
                .await;
        }
        env.dispatcher.dispatch(task.id);

        match stale {
            Some((stale_id, _, _)) => {
                env.ctx
                    .audit(
                        AuditEvent::TaskSuperseded,
                        fields([
                            ("task_id", json!(stale_id)),
                            ("superseded_by", json!(task.id)),
                        ]),
                    )
                    .await;
                ReconcileOutcome::Superseded {
                    stale: stale_id,
                    created: task.id,
                }
            }
            None => ReconcileOutcome::Created(task.id),
        }
    }
}
