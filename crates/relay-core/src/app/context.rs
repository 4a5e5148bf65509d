//! RuntimeContext: the collaborators and shared state every entry point gets
//! passed explicitly.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::channel::{ChannelError, ChannelLayout, DurableChannel, Topic};
use crate::config::RelayConfig;
use crate::domain::{AuditEvent, Packet};
use crate::ports::audit_sink;
use crate::ports::{AuditSink, Clock, IdGenerator, ModelClient, SnapshotStore};
use crate::store::{QueueCursors, TaskStore};

/// State guarded by the runtime lock: the task store and the controller's
/// committed channel cursors. Both land in the same snapshot.
#[derive(Debug, Default)]
pub struct RuntimeState {
    pub store: TaskStore,
    pub queues: QueueCursors,
}

pub struct RuntimeContext {
    pub config: RelayConfig,
    pub layout: ChannelLayout,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
    pub model: Arc<dyn ModelClient>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub audit: Arc<dyn AuditSink>,
    pub channel: DurableChannel,
    pub state: Mutex<RuntimeState>,
    /// Serializes snapshot writes so an older snapshot never lands after a
    /// newer one.
    persist_lock: Mutex<()>,
}

impl RuntimeContext {
    pub fn new(
        config: RelayConfig,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        model: Arc<dyn ModelClient>,
        snapshots: Arc<dyn SnapshotStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let layout = ChannelLayout::new(&config.runtime.data_dir);
        let channel = DurableChannel::new(Arc::clone(&ids), Arc::clone(&clock));
        Self {
            config,
            layout,
            clock,
            ids,
            model,
            snapshots,
            audit,
            channel,
            state: Mutex::new(RuntimeState::default()),
            persist_lock: Mutex::new(()),
        }
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Save the current state. Failures are logged; in-memory state stays.
    pub async fn persist(&self) {
        let _writer = self.persist_lock.lock().await;
        let snapshot = {
            let state = self.state.lock().await;
            state.store.snapshot(state.queues, self.clock.now())
        };
        if let Err(err) = self.snapshots.save(&snapshot).await {
            tracing::error!(error = %err, "snapshot save failed");
        }
    }

    /// Append to a topic's log.
    pub async fn publish<T: Serialize>(
        &self,
        topic: Topic,
        payload: T,
    ) -> Result<Packet<T>, ChannelError> {
        self.channel
            .append(&self.layout.log_path(topic), payload)
            .await
    }

    pub async fn audit(&self, event: AuditEvent, fields: Map<String, Value>) {
        audit_sink::record(self.audit.as_ref(), event, fields).await;
    }
}
