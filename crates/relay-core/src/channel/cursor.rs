//! Persisted per-(channel, consumer) cursor.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::ChannelError;

/// Number of packets a consumer has fully processed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCursorState {
    pub cursor: u64,
}

/// Loads and saves cursor records. A missing record means cursor 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct CursorStore;

impl CursorStore {
    pub async fn load(path: &Path) -> Result<ChannelCursorState, ChannelError> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) if raw.trim().is_empty() => Ok(ChannelCursorState::default()),
            Ok(raw) => serde_json::from_str(&raw).map_err(|source| ChannelError::Decode {
                path: path.to_path_buf(),
                source,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(ChannelCursorState::default())
            }
            Err(source) => Err(ChannelError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Write-then-rename so a crash never leaves a half-written record.
    pub async fn save(path: &Path, state: ChannelCursorState) -> Result<(), ChannelError> {
        let io_err = |source| ChannelError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let body = serde_json::to_vec(&state).map_err(ChannelError::Encode)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, path).await.map_err(io_err)?;
        Ok(())
    }
}
