//! App - アプリケーション層
//!
//! ports と各コンポーネントを組み合わせて、コントローラのループを実装します。
//!
//! # 含まれる型
//! - **RuntimeBuilder**: 協調者のワイヤリングと action の fail-fast チェック
//! - **RuntimeContext**: 共有する協調者とロック付きのランタイム状態
//! - **Runtime**: 起動時の復旧とコントローラのラウンド
//! - **RuntimeStatus**: スナップショットから作るステータス

pub mod builder;
pub mod context;
pub mod controller;
pub mod runtime;
pub mod status;

#[cfg(test)]
pub(crate) mod test_support;

pub use self::builder::{BuildError, RuntimeBuilder};
pub use self::context::{RuntimeContext, RuntimeState};
pub use self::controller::{ControllerMemory, DecisionRecord, InputMessage};
pub use self::runtime::{RoundOutcome, RunExit, Runtime, StartReport};
pub use self::status::{ActiveTask, RuntimeStatus};
