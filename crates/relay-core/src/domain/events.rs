//! Audit events emitted through the `AuditSink` port.

use serde_json::{Map, Value};

/// Names of the audit events the runtime emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    TaskCreated,
    TaskRedispatched,
    TaskSuperseded,
    TaskCanceled,
    TaskFinished,
    CronJobCreated,
    CronJobDisabled,
    ActionRejected,
    SnapshotRejected,
    ChannelCompacted,
}

impl AuditEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TaskCreated => "task_created",
            Self::TaskRedispatched => "task_redispatched",
            Self::TaskSuperseded => "task_superseded",
            Self::TaskCanceled => "task_canceled",
            Self::TaskFinished => "task_finished",
            Self::CronJobCreated => "cron_job_created",
            Self::CronJobDisabled => "cron_job_disabled",
            Self::ActionRejected => "action_rejected",
            Self::SnapshotRejected => "snapshot_rejected",
            Self::ChannelCompacted => "channel_compacted",
        }
    }
}

/// Build an audit field map from `(key, value)` pairs.
pub fn fields<I, K>(pairs: I) -> Map<String, Value>
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
