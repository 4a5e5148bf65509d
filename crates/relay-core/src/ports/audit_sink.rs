//! AuditSink port - 監査ログの出力先（ベストエフォート）

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::domain::AuditEvent;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, event: &str, fields: Map<String, Value>) -> Result<(), AuditError>;
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn append(&self, _event: &str, _fields: Map<String, Value>) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Append an audit event; a failure is logged and swallowed.
pub async fn record(sink: &dyn AuditSink, event: AuditEvent, fields: Map<String, Value>) {
    if let Err(err) = sink.append(event.as_str(), fields).await {
        tracing::warn!(event = event.as_str(), error = %err, "audit append failed");
    }
}
