//! ActionRegistry - 型付き action と Handler の登録
//!
//! # 2 つの層
//! - **typed**: `Action`（`NAME` を持つ serde の形）と `ActionHandler<A>`
//! - **dyn**: object-safe な `DynAction`。handler を `TypedAction<A, H>` で包んで作り、
//!   registry が異なる型の action をまとめて保持できるようにします。

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use super::issue::{IssueCode, ValidationIssue};
use super::parser::ParsedAction;
use super::{ActionEnv, ActionView, ApplyFlow};

/// A request shape the controller may emit.
///
/// Attributes decode as string fields by name; the tag body decodes into a
/// field named `content`.
pub trait Action: DeserializeOwned + Send + Sync + 'static {
    const NAME: &'static str;

    /// One-line usage shown back to the model when decoding fails.
    const USAGE: &'static str;
}

#[async_trait]
pub trait ActionHandler<A: Action>: Send + Sync {
    /// Contextual checks against the current state. Must not mutate.
    fn validate(&self, action: &A, view: &ActionView<'_>) -> Result<(), String>;

    /// Apply a validated action.
    async fn apply(&self, action: A, env: &mut ActionEnv<'_>) -> ApplyFlow;
}

#[async_trait]
pub trait DynAction: Send + Sync {
    fn name(&self) -> &'static str;

    fn usage(&self) -> &'static str;

    fn validate_dyn(&self, parsed: &ParsedAction, view: &ActionView<'_>)
    -> Option<ValidationIssue>;

    async fn apply_dyn(&self, parsed: &ParsedAction, env: &mut ActionEnv<'_>) -> ApplyFlow;
}

pub struct TypedAction<A: Action, H: ActionHandler<A>> {
    handler: H,
    _marker: PhantomData<A>,
}

impl<A: Action, H: ActionHandler<A>> TypedAction<A, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

/// Decode a parsed request into its typed shape.
pub fn decode<A: Action>(parsed: &ParsedAction) -> Result<A, ValidationIssue> {
    let mut object: Map<String, Value> = parsed
        .attrs
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    if let Some(content) = &parsed.content {
        object.insert("content".to_string(), Value::String(content.clone()));
    }
    serde_json::from_value(Value::Object(object)).map_err(|err| {
        ValidationIssue::new(
            A::NAME,
            IssueCode::InvalidActionSchema,
            format!("{err}; usage: {}", A::USAGE),
        )
    })
}

#[async_trait]
impl<A: Action, H: ActionHandler<A>> DynAction for TypedAction<A, H> {
    fn name(&self) -> &'static str {
        A::NAME
    }

    fn usage(&self) -> &'static str {
        A::USAGE
    }

    fn validate_dyn(
        &self,
        parsed: &ParsedAction,
        view: &ActionView<'_>,
    ) -> Option<ValidationIssue> {
        let action = match decode::<A>(parsed) {
            Ok(action) => action,
            Err(issue) => return Some(issue),
        };
        self.handler
            .validate(&action, view)
            .err()
            .map(|hint| ValidationIssue::rejected(A::NAME, hint))
    }

    async fn apply_dyn(&self, parsed: &ParsedAction, env: &mut ActionEnv<'_>) -> ApplyFlow {
        match decode::<A>(parsed) {
            Ok(action) => self.handler.apply(action, env).await,
            Err(issue) => {
                tracing::warn!(action = A::NAME, hint = %issue.hint, "validated action failed to decode");
                ApplyFlow::Continue
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("action '{0}' is already registered")]
    AlreadyRegistered(String),
}

#[derive(Default)]
pub struct ActionRegistry {
    actions: HashMap<&'static str, Arc<dyn DynAction>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<A: Action, H: ActionHandler<A> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        if self.actions.contains_key(A::NAME) {
            return Err(RegistryError::AlreadyRegistered(A::NAME.to_string()));
        }
        self.actions
            .insert(A::NAME, Arc::new(TypedAction::<A, H>::new(handler)));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn DynAction>> {
        self.actions.get(name).cloned()
    }

    /// Usage lines of every registered action, sorted by name.
    pub fn usages(&self) -> Vec<&'static str> {
        self.registered_names()
            .into_iter()
            .filter_map(|name| self.actions.get(name).map(|a| a.usage()))
            .collect()
    }

    /// Registered names, sorted.
    pub fn registered_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.actions.keys().copied().collect();
        names.sort_unstable();
        names
    }
}
