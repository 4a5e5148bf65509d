//! relay-core
//!
//! Task orchestration engine for an agent runtime.
//!
//! # Modules
//! - **channel**: durable append-only logs with cursor-based consumption
//! - **store**: tasks, cron jobs, identity rules and snapshots
//! - **dispatch**: bounded-concurrency execution with retry and cancellation
//! - **actions**: parsing, validation and application of controller requests
//! - **app**: wiring, the controller loop and status views
//! - **domain** / **ports** / **impls**: model, seams and in-process adapters

pub mod actions;
pub mod app;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod store;

pub use app::{Runtime, RuntimeBuilder};
pub use config::RelayConfig;
pub use error::RelayError;
