//! Action Pipeline: requests parsed from the controller model's output,
//! validated against the current state and applied.
//!
//! Parsing is two-stage: `parser` tokenizes tags without knowing any action,
//! then each registered `Action` decodes its own shape through serde.
//! Rejections never raise; they come back as `ValidationIssue`s and are fed
//! to the model on the next round.

pub mod builtin;
mod issue;
mod parser;
mod pipeline;
mod reconcile;
mod registry;

pub use issue::{IssueCode, ValidationIssue, feedback_text};
pub use parser::{ParsedAction, parse_actions};
pub use pipeline::{ActionPipeline, RoundReport};
pub use reconcile::{CreateRequest, ReconcileOutcome, Reconciler};
pub use registry::{Action, ActionHandler, ActionRegistry, DynAction, RegistryError, decode};

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::app::{RuntimeContext, RuntimeState};
use crate::dispatch::Dispatcher;

/// What the pipeline does after an action is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyFlow {
    Continue,
    /// Skip the remaining actions of this round.
    Stop,
}

/// Read-only view handed to `validate`.
pub struct ActionView<'a> {
    pub state: &'a RuntimeState,
    pub now: DateTime<Utc>,
    /// Entries of controller context that `compress_context` could fold.
    pub compressible_entries: usize,
}

/// Collaborators and per-round scratch handed to `apply`.
pub struct ActionEnv<'a> {
    pub ctx: &'a RuntimeContext,
    pub dispatcher: &'a Dispatcher,
    pub reconciler: &'a Reconciler,
    pub now: DateTime<Utc>,
    pub round: &'a mut RoundEffects,
}

/// Side effects a round produced that the controller acts on afterwards.
#[derive(Debug, Default)]
pub struct RoundEffects {
    /// Content keys of `create_task` requests already seen this round.
    pub batch_keys: HashSet<String>,
    pub reconciled: Vec<ReconcileOutcome>,
    pub replies: usize,
    /// `Some(reason)` once `compress_context` was applied.
    pub compress_requested: Option<Option<String>>,
    /// `Some(reason)` once `restart_runtime` was applied.
    pub restart_requested: Option<Option<String>>,
}
