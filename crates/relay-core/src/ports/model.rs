//! Model port - 言語モデルの抽象化
//!
//! プロンプトの送信やプロバイダの切り替えはこの trait の裏側に置きます。
//! 実装は suspension point ごとに `cancel` を確認し、発火したら
//! `ModelError::Aborted` を返す必要があります。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::domain::{ModelError, ModelUsage};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokeOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelReply {
    pub output: String,
    pub usage: Option<ModelUsage>,
    pub elapsed_ms: u64,
}

impl ModelReply {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            usage: None,
            elapsed_ms: 0,
        }
    }
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn invoke(
        &self,
        prompt: &str,
        opts: &InvokeOptions,
        cancel: &CancellationToken,
    ) -> Result<ModelReply, ModelError>;
}
