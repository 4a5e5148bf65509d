//! Task Store: tasks and cron jobs, their identity rules and lifecycle, and
//! the snapshot form they persist as.
//!
//! `TaskStore` is plain synchronous state. The runtime keeps it behind one
//! async mutex and does every decision plus mutation inside a single lock
//! scope, never holding it across an await.

mod snapshot;
mod task_store;

pub use snapshot::{QueueCursors, RuntimeSnapshot, SNAPSHOT_VERSION, SnapshotError};
pub use task_store::{CancelStatus, Enqueued, StoreCancel, TaskStore};

use thiserror::Error;

use crate::domain::{CronJobId, TaskId, TransitionError};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("cron job not found: {0}")]
    CronJobNotFound(CronJobId),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Output recorded for tasks that were running when the process stopped.
pub const INTERRUPTED_OUTPUT: &str = "interrupted by runtime restart";
