//! EchoModel - プロンプトの末尾をそのまま返すオフラインモデル
//!
//! プロバイダなしで CLI のループ全体を動かすために使います。
//! コントローラ向けのプロンプトには `reply` action を返すので、
//! ユーザー向けの digest にも何かが届きます。

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::ModelError;
use crate::ports::{InvokeOptions, ModelClient, ModelReply};

const ECHO_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, Default)]
pub struct EchoModel;

#[async_trait]
impl ModelClient for EchoModel {
    async fn invoke(
        &self,
        prompt: &str,
        _opts: &InvokeOptions,
        cancel: &CancellationToken,
    ) -> Result<ModelReply, ModelError> {
        if cancel.is_cancelled() {
            return Err(ModelError::Aborted);
        }
        let last_line = prompt.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
        let echoed: String = last_line.trim().chars().take(ECHO_CHARS).collect();
        let escaped = echoed
            .replace('&', "&amp;")
            .replace('<', "&lt;")
            .replace('>', "&gt;");
        Ok(ModelReply::text(format!("<reply>echo: {escaped}</reply>")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_last_line_as_reply() {
        let reply = EchoModel
            .invoke(
                "header\nuser: hi <there>\n",
                &InvokeOptions {
                    model: None,
                    timeout_ms: 10,
                    reasoning_effort: None,
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(reply.output, "<reply>echo: user: hi &lt;there&gt;</reply>");
    }
}
