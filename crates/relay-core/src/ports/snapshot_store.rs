//! SnapshotStore port - タスクストアとコントローラ cursor の永続化

use async_trait::async_trait;

use crate::store::{RuntimeSnapshot, SnapshotError};

/// Saves and loads the whole runtime snapshot.
///
/// `save` is called after every state-changing operation; failures are logged
/// by the caller and never roll back in-memory state.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, snapshot: &RuntimeSnapshot) -> Result<(), SnapshotError>;

    /// `Ok(None)` when nothing has been saved yet.
    async fn load(&self) -> Result<Option<RuntimeSnapshot>, SnapshotError>;
}
