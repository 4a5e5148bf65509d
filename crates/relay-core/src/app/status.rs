//! Status - ステータスクエリ
//!
//! 保存済みスナップショットから作る読み取り専用のビューです。
//! 別プロセスがランタイムを動かしている間も使えます。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::observability::TaskCounts;
use crate::ports::SnapshotStore;
use crate::store::{QueueCursors, RuntimeSnapshot, SnapshotError, TaskStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub counts: TaskCounts,
    pub queues: QueueCursors,
    pub saved_at: DateTime<Utc>,
    /// Most recently created active tasks, newest first.
    pub active: Vec<ActiveTask>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveTask {
    pub id: String,
    pub status: String,
    pub title: String,
    pub scheduled: bool,
}

impl RuntimeStatus {
    pub fn from_snapshot(snapshot: RuntimeSnapshot) -> Self {
        let queues = snapshot.queues;
        let saved_at = snapshot.saved_at;
        let store = TaskStore::restore(snapshot);
        let mut active: Vec<_> = store.tasks().filter(|t| t.status.is_active()).collect();
        active.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        Self {
            counts: store.counts(),
            queues,
            saved_at,
            active: active
                .into_iter()
                .map(|t| ActiveTask {
                    id: t.id.to_string(),
                    status: t.status.to_string(),
                    title: t.title.clone(),
                    scheduled: t.is_scheduled(),
                })
                .collect(),
        }
    }

    /// `Ok(None)` when no snapshot has been saved yet.
    pub async fn load(store: &dyn SnapshotStore) -> Result<Option<Self>, SnapshotError> {
        Ok(store.load().await?.map(Self::from_snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CancelMeta, CancelSource, TaskProfile};
    use crate::impls::MemorySnapshotStore;
    use crate::ports::{Clock, FixedClock, UlidGenerator};
    use chrono::TimeZone;
    use std::sync::Arc;

    #[tokio::test]
    async fn status_counts_tasks_by_state() {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2026, 4, 1, 9, 0, 0).unwrap()));
        let ids = UlidGenerator::new(clock.clone());
        let mut store = TaskStore::new();
        let first = store
            .enqueue_task(&ids, "first", "one", TaskProfile::Standard, clock.now())
            .task
            .id;
        store.enqueue_task(&ids, "second", "two", TaskProfile::Standard, clock.now());
        store.cancel(first, CancelMeta::new(CancelSource::System, None), clock.now());

        let snapshot = store.snapshot(QueueCursors::default(), clock.now());
        let status = RuntimeStatus::load(&MemorySnapshotStore::with_snapshot(snapshot))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(status.counts.pending, 1);
        assert_eq!(status.counts.canceled, 1);
        assert_eq!(status.active.len(), 1);
        assert_eq!(status.active[0].title, "two");
    }

    #[tokio::test]
    async fn no_snapshot_means_no_status() {
        let status = RuntimeStatus::load(&MemorySnapshotStore::new()).await.unwrap();
        assert!(status.is_none());
    }
}
