//! Durable channel: append-only JSONL log per topic with cursor-based reads.
//!
//! Design:
//! - One file per topic, one JSON-encoded `Packet` per line.
//! - A packet's cursor is its 1-based line position at read time.
//! - Appends to the same path are serialized by a per-path async lock, then
//!   by an advisory lock on a `<log>.lock` sidecar file so that other
//!   processes (`relay submit`) are serialized too. Both guards are dropped
//!   on error, so a failed writer never blocks the next.
//! - An append that finds the log ending in a partial line terminates that
//!   line first. The fragment keeps its cursor slot and fails to decode.
//! - Only a whole-log truncation (`compact_if_fully_consumed`) deletes data.
//!   It takes the same two locks, so it cannot race an append.

mod cursor;
mod topics;

pub use cursor::{ChannelCursorState, CursorStore};
pub use topics::{ChannelLayout, Role, Topic};

use std::collections::HashMap;
use std::ffi::OsString;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::domain::{CursoredPacket, Packet};
use crate::ports::{Clock, IdGenerator};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode packet: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

pub struct DurableChannel {
    locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl DurableChannel {
    pub fn new(ids: Arc<dyn IdGenerator>, clock: Arc<dyn Clock>) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            ids,
            clock,
        }
    }

    fn path_lock(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(path.to_path_buf()).or_default())
    }

    /// Append one packet. Write failures propagate to the caller.
    pub async fn append<T: Serialize>(
        &self,
        path: &Path,
        payload: T,
    ) -> Result<Packet<T>, ChannelError> {
        let packet = Packet {
            id: self.ids.packet_id(),
            created_at: self.clock.now(),
            payload,
        };
        let mut line = serde_json::to_vec(&packet).map_err(ChannelError::Encode)?;
        line.push(b'\n');

        let lock = self.path_lock(path);
        let _guard = lock.lock().await;
        let _file_guard = LogLock::acquire(path).await?;

        let io_err = |source| ChannelError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .await
            .map_err(io_err)?;
        let length = file.metadata().await.map_err(io_err)?.len();
        if length > 0 {
            file.seek(SeekFrom::End(-1)).await.map_err(io_err)?;
            let mut last = [0u8; 1];
            file.read_exact(&mut last).await.map_err(io_err)?;
            if last[0] != b'\n' {
                tracing::warn!(path = %path.display(), "log ends in a partial line; terminating it");
                line.insert(0, b'\n');
            }
        }
        file.write_all(&line).await.map_err(io_err)?;
        file.sync_data().await.map_err(io_err)?;

        tracing::trace!(path = %path.display(), packet_id = %packet.id, "packet appended");
        Ok(packet)
    }

    /// Read packets with cursor greater than `from_cursor`, in append order.
    ///
    /// A missing log is an empty log. Lines that fail to decode keep their
    /// cursor position but are skipped.
    pub async fn consume<T: DeserializeOwned>(
        &self,
        path: &Path,
        from_cursor: u64,
        limit: Option<usize>,
    ) -> Result<Vec<CursoredPacket<T>>, ChannelError> {
        let raw = match read_log(path).await? {
            Some(raw) => raw,
            None => return Ok(Vec::new()),
        };

        let mut out = Vec::new();
        for (index, line) in log_lines(&raw).enumerate() {
            let cursor = index as u64 + 1;
            if cursor <= from_cursor {
                continue;
            }
            if limit.is_some_and(|max| out.len() >= max) {
                break;
            }
            match serde_json::from_str::<Packet<T>>(line) {
                Ok(packet) => out.push(CursoredPacket { cursor, packet }),
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        cursor,
                        error = %err,
                        "skipping undecodable packet"
                    );
                }
            }
        }
        Ok(out)
    }

    /// Number of packets currently in the log.
    pub async fn len(&self, path: &Path) -> Result<u64, ChannelError> {
        Ok(read_log(path)
            .await?
            .map(|raw| log_lines(&raw).count() as u64)
            .unwrap_or(0))
    }

    /// Truncate the log when `cursor` covers all of it.
    ///
    /// Only the channel's owner may call this, and only with a cursor that
    /// stands for every consumer; otherwise unread packets are lost.
    /// The cursor record is reset before the log is truncated: a crash in
    /// between replays consumed packets, never skips new ones.
    /// Returns whether compaction happened.
    pub async fn compact_if_fully_consumed(
        &self,
        path: &Path,
        state_path: &Path,
        cursor: u64,
        min_packets_to_compact: u64,
    ) -> Result<bool, ChannelError> {
        let lock = self.path_lock(path);
        let _guard = lock.lock().await;
        let _file_guard = LogLock::acquire(path).await?;

        let length = self.len(path).await?;
        if length == 0 || length < min_packets_to_compact || cursor < length {
            return Ok(false);
        }

        CursorStore::save(state_path, ChannelCursorState { cursor: 0 }).await?;
        tokio::fs::write(path, b"")
            .await
            .map_err(|source| ChannelError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        tracing::info!(path = %path.display(), packets = length, "channel compacted");
        Ok(true)
    }
}

/// Exclusive advisory lock on `<log>.lock`, released on drop.
struct LogLock(std::fs::File);

impl LogLock {
    async fn acquire(log: &Path) -> Result<Self, ChannelError> {
        let mut name = OsString::from(log.as_os_str());
        name.push(".lock");
        let lock_path = PathBuf::from(name);

        let opened = lock_path.clone();
        let locked = tokio::task::spawn_blocking(move || -> std::io::Result<Self> {
            if let Some(parent) = opened.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .read(true)
                .write(true)
                .open(&opened)?;
            file.lock_exclusive()?;
            Ok(Self(file))
        })
        .await
        .map_err(std::io::Error::other)
        .and_then(|locked| locked);

        locked.map_err(|source| ChannelError::Io {
            path: lock_path,
            source,
        })
    }
}

impl Drop for LogLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.0) {
            tracing::warn!(error = %err, "failed to release channel lock");
        }
    }
}

async fn read_log(path: &Path) -> Result<Option<String>, ChannelError> {
    match tokio::fs::read(path).await {
        // A torn tail may split a multi-byte character.
        Ok(raw) => Ok(Some(String::from_utf8_lossy(&raw).into_owned())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(ChannelError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn log_lines(raw: &str) -> impl Iterator<Item = &str> {
    raw.lines().filter(|line| !line.trim().is_empty())
}
