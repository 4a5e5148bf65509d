//! Runtime snapshot: the persisted form of the task store plus the
//! controller's channel cursors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use thiserror::Error;

use crate::domain::{CronJob, CronJobId, Task, TaskId};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode snapshot: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode snapshot {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("unsupported snapshot version {found} (expected {SNAPSHOT_VERSION})")]
    UnsupportedVersion { found: u32 },

    #[error("snapshot cursor for {queue} is {cursor} but the channel only has {length} packets")]
    CursorAhead {
        queue: &'static str,
        cursor: u64,
        length: u64,
    },

    #[error("snapshot contains task {0} twice")]
    DuplicateTask(TaskId),

    #[error("snapshot task {0} has a fingerprint that does not match its identity fields")]
    FingerprintMismatch(TaskId),

    #[error("cron job {cron_job} mirrors unknown task {task}")]
    OrphanCronJob { cron_job: CronJobId, task: TaskId },
}

/// Controller cursors into its two inbound channels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCursors {
    pub inputs_cursor: u64,
    pub results_cursor: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub tasks: Vec<Task>,
    pub cron_jobs: Vec<CronJob>,
    pub queues: QueueCursors,
}

impl RuntimeSnapshot {
    /// Check the snapshot against itself and the current channel lengths.
    ///
    /// Cursors behind the channel are fine (the gap is replayed); cursors
    /// ahead of it mean the snapshot and the logs disagree, and the snapshot
    /// is rejected rather than silently truncated.
    pub fn validate(&self, inputs_len: u64, results_len: u64) -> Result<(), SnapshotError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::UnsupportedVersion {
                found: self.version,
            });
        }
        for (queue, cursor, length) in [
            ("user-input", self.queues.inputs_cursor, inputs_len),
            ("worker-result", self.queues.results_cursor, results_len),
        ] {
            if cursor > length {
                return Err(SnapshotError::CursorAhead {
                    queue,
                    cursor,
                    length,
                });
            }
        }

        let mut seen = HashSet::new();
        for task in &self.tasks {
            if !seen.insert(task.id) {
                return Err(SnapshotError::DuplicateTask(task.id));
            }
            if task.fingerprint != task.computed_fingerprint() {
                return Err(SnapshotError::FingerprintMismatch(task.id));
            }
        }
        for job in &self.cron_jobs {
            if !seen.contains(&job.task_id) {
                return Err(SnapshotError::OrphanCronJob {
                    cron_job: job.id,
                    task: job.task_id,
                });
            }
        }
        Ok(())
    }
}
