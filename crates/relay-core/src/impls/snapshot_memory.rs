//! MemorySnapshotStore - 最後に保存したスナップショットをメモリに保持（テスト用）

use std::sync::Mutex;

use async_trait::async_trait;

use crate::ports::SnapshotStore;
use crate::store::{RuntimeSnapshot, SnapshotError};

#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    last: Mutex<Option<RuntimeSnapshot>>,
    saves: Mutex<usize>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: RuntimeSnapshot) -> Self {
        Self {
            last: Mutex::new(Some(snapshot)),
            saves: Mutex::new(0),
        }
    }

    pub fn last(&self) -> Option<RuntimeSnapshot> {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, snapshot: &RuntimeSnapshot) -> Result<(), SnapshotError> {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.clone());
        *self.saves.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }

    async fn load(&self) -> Result<Option<RuntimeSnapshot>, SnapshotError> {
        Ok(self.last())
    }
}
