//! JsonlAuditSink - 監査イベントを JSONL ファイルに追記

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::ports::{AuditError, AuditSink, Clock};

pub struct JsonlAuditSink {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
}

impl JsonlAuditSink {
    pub fn new(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: path.into(),
            clock,
            write_lock: Mutex::new(()),
        }
    }

    /// `<data_dir>/audit.jsonl`
    pub fn in_data_dir(data_dir: &Path, clock: Arc<dyn Clock>) -> Self {
        Self::new(data_dir.join("audit.jsonl"), clock)
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn append(&self, event: &str, fields: Map<String, Value>) -> Result<(), AuditError> {
        let mut record = Map::new();
        record.insert("ts".into(), Value::String(self.clock.now().to_rfc3339()));
        record.insert("event".into(), Value::String(event.to_string()));
        record.extend(fields);

        let mut line = serde_json::to_vec(&Value::Object(record))?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::fields;
    use crate::ports::FixedClock;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[tokio::test]
    async fn appends_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
        let sink = JsonlAuditSink::in_data_dir(dir.path(), clock);

        sink.append("task_created", fields([("task_id", json!("task-1"))]))
            .await
            .unwrap();
        sink.append("task_finished", Map::new()).await.unwrap();

        let raw = tokio::fs::read_to_string(dir.path().join("audit.jsonl"))
            .await
            .unwrap();
        let lines: Vec<Value> = raw
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "task_created");
        assert_eq!(lines[0]["task_id"], "task-1");
        assert_eq!(lines[0]["ts"], "2026-01-01T00:00:00+00:00");
        assert_eq!(lines[1]["event"], "task_finished");
    }
}
