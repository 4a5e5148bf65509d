//! RuntimeBuilder - ランタイムの構築とワイヤリング
//!
//! # Fail-fast
//! `expect_actions` で前提とする action を列挙すると、
//! どれかが未登録の場合 `build` はランタイムを作らずにエラーを返します。

use std::sync::Arc;
use std::time::Duration;

use super::{Runtime, RuntimeContext};
use crate::actions::builtin::register_builtin;
use crate::actions::{Action, ActionHandler, ActionPipeline, ActionRegistry, Reconciler, RegistryError};
use crate::config::RelayConfig;
use crate::dispatch::{Decider, Dispatcher, RetryDecider};
use crate::impls::{JsonFileSnapshotStore, JsonlAuditSink};
use crate::ports::{AuditSink, Clock, IdGenerator, ModelClient, SnapshotStore, SystemClock, UlidGenerator};

/// Builds a `Runtime`.
///
/// ```ignore
/// let runtime = RuntimeBuilder::new(config)
///     .model(Arc::new(EchoModel))
///     .with_builtin_actions()?
///     .expect_actions(&BUILTIN_ACTIONS)
///     .build()?;
/// ```
///
/// Unset collaborators default to the system clock, ULID ids, and a JSON
/// snapshot plus JSONL audit trail under the configured data directory. The
/// model has no default.
pub struct RuntimeBuilder {
    config: RelayConfig,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    model: Option<Arc<dyn ModelClient>>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    audit: Option<Arc<dyn AuditSink>>,
    decider: Option<Arc<dyn Decider>>,
    registry: ActionRegistry,
    expected_actions: Option<Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing actions: {0:?}; these actions were expected but not registered")]
    MissingActions(Vec<String>),

    #[error("no model client configured")]
    MissingModel,
}

impl RuntimeBuilder {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            clock: None,
            ids: None,
            model: None,
            snapshots: None,
            audit: None,
            decider: None,
            registry: ActionRegistry::new(),
            expected_actions: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn ids(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn model(mut self, model: Arc<dyn ModelClient>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn snapshots(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Replace the configured retry policy.
    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn register<A: Action, H: ActionHandler<A> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<A, H>(handler)?;
        Ok(self)
    }

    pub fn with_builtin_actions(mut self) -> Result<Self, RegistryError> {
        register_builtin(&mut self.registry)?;
        Ok(self)
    }

    pub fn expect_actions(mut self, names: &[&str]) -> Self {
        self.expected_actions = Some(names.iter().map(|n| n.to_string()).collect());
        self
    }

    /// Check expectations and wire everything together.
    ///
    /// Nothing is loaded or dispatched here; call `Runtime::start` next.
    pub fn build(self) -> Result<Runtime, BuildError> {
        if let Some(expected) = &self.expected_actions {
            let registered = self.registry.registered_names();
            let missing: Vec<String> = expected
                .iter()
                .filter(|name| !registered.contains(&name.as_str()))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingActions(missing));
            }
        }
        let model = self.model.ok_or(BuildError::MissingModel)?;

        let data_dir = self.config.runtime.data_dir.clone();
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));
        let snapshots = self
            .snapshots
            .unwrap_or_else(|| Arc::new(JsonFileSnapshotStore::in_data_dir(&data_dir)));
        let audit = self
            .audit
            .unwrap_or_else(|| Arc::new(JsonlAuditSink::in_data_dir(&data_dir, Arc::clone(&clock))));
        let debounce = Duration::from_millis(self.config.actions.debounce_ms);

        let ctx = Arc::new(RuntimeContext::new(
            self.config,
            clock,
            ids,
            model,
            snapshots,
            audit,
        ));
        let decider = self
            .decider
            .unwrap_or_else(|| Arc::new(RetryDecider::new(ctx.config.retry_policy())));
        let dispatcher = Dispatcher::new(Arc::clone(&ctx), decider);
        let pipeline = ActionPipeline::new(self.registry, Reconciler::new(debounce));

        tracing::debug!(
            data_dir = %data_dir.display(),
            actions = ?pipeline.registry().registered_names(),
            "runtime built"
        );
        Ok(Runtime::new(ctx, dispatcher, pipeline))
    }
}
