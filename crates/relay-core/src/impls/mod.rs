//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports のプロセス内実装を含めます。
//!
//! # 含まれる実装
//! - **JsonFileSnapshotStore** / **MemorySnapshotStore**: スナップショットの保存先
//! - **JsonlAuditSink**: 監査ログファイル
//! - **EchoModel**: CLI 用のオフラインモデル
//! - **ScriptedModel**: テスト用の決定的なモデル

pub mod audit_jsonl;
pub mod echo_model;
pub mod scripted_model;
pub mod snapshot_file;
pub mod snapshot_memory;

pub use self::audit_jsonl::JsonlAuditSink;
pub use self::echo_model::EchoModel;
pub use self::scripted_model::{ScriptedModel, Step};
pub use self::snapshot_file::JsonFileSnapshotStore;
pub use self::snapshot_memory::MemorySnapshotStore;
