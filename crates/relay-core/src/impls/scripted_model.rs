//! ScriptedModel - 決められた手順どおりに振る舞うモデル
//!
//! テストとデモ用。呼び出しごとに次の step を取り出し、
//! 手順が尽きたら fallback の step を繰り返します。

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::ModelError;
use crate::ports::{InvokeOptions, ModelClient, ModelReply};

#[derive(Debug, Clone)]
pub enum Step {
    Reply(String),
    Fail(ModelError),
    /// Reply after a delay; aborts if canceled first.
    Delayed(Duration, String),
    /// Never replies on its own; returns `Aborted` once canceled.
    Hang,
}

pub struct ScriptedModel {
    steps: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new(steps: impl IntoIterator<Item = Step>, fallback: Step) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            fallback,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Every call behaves like `step`.
    pub fn always(step: Step) -> Self {
        Self::new([], step)
    }

    /// Prompts received so far, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn next_step(&self) -> Step {
        self.steps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn invoke(
        &self,
        prompt: &str,
        _opts: &InvokeOptions,
        cancel: &CancellationToken,
    ) -> Result<ModelReply, ModelError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt.to_string());

        match self.next_step() {
            Step::Reply(text) => Ok(ModelReply::text(text)),
            Step::Fail(err) => Err(err),
            Step::Delayed(delay, text) => tokio::select! {
                _ = cancel.cancelled() => Err(ModelError::Aborted),
                _ = tokio::time::sleep(delay) => Ok(ModelReply {
                    output: text,
                    usage: None,
                    elapsed_ms: delay.as_millis() as u64,
                }),
            },
            Step::Hang => {
                cancel.cancelled().await;
                Err(ModelError::Aborted)
            }
        }
    }
}
