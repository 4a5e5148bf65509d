//! JsonFileSnapshotStore - スナップショットを 1 つの JSON ファイルに保存
//!
//! 書き込みは `<path>.tmp` に行ってから rename するため、
//! 読み手が書きかけのスナップショットを見ることはありません。

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::ports::SnapshotStore;
use crate::store::{RuntimeSnapshot, SnapshotError};

pub struct JsonFileSnapshotStore {
    path: PathBuf,
}

impl JsonFileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data_dir>/snapshot.json`
    pub fn in_data_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join("snapshot.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> SnapshotError {
        SnapshotError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl SnapshotStore for JsonFileSnapshotStore {
    async fn save(&self, snapshot: &RuntimeSnapshot) -> Result<(), SnapshotError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_err(e))?;
        }
        let body = serde_json::to_vec_pretty(snapshot).map_err(SnapshotError::Encode)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| self.io_err(e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_err(e))?;
        Ok(())
    }

    async fn load(&self) -> Result<Option<RuntimeSnapshot>, SnapshotError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_err(e)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|source| SnapshotError::Decode {
                path: self.path.clone(),
                source,
            })
    }
}
