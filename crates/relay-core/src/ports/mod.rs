//! Ports - 抽象化レイヤー
//!
//! ランタイムが所有しない協調者を trait として定義します。
//! 時刻、ID 生成、言語モデル、スナップショット永続化、監査ログの 5 つです。

pub mod audit_sink;
pub mod clock;
pub mod id_generator;
pub mod model;
pub mod snapshot_store;

pub use self::audit_sink::{AuditError, AuditSink, NoopAuditSink};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::model::{InvokeOptions, ModelClient, ModelReply};
pub use self::snapshot_store::SnapshotStore;
