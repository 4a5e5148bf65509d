//! Channel topics, consumer roles and on-disk layout.

use std::fmt;
use std::path::{Path, PathBuf};

/// Named channels the runtime writes and reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Inbound user/system messages for the controller.
    UserInput,
    /// Task results published by the dispatcher.
    WorkerResult,
    /// Controller replies meant for the user-facing side.
    TellerDigest,
    /// One record per controller round.
    ThinkerDecision,
}

impl Topic {
    pub const ALL: [Topic; 4] = [
        Topic::UserInput,
        Topic::WorkerResult,
        Topic::TellerDigest,
        Topic::ThinkerDecision,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserInput => "user-input",
            Self::WorkerResult => "worker-result",
            Self::TellerDigest => "teller-digest",
            Self::ThinkerDecision => "thinker-decision",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Consumer role owning a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Thinker,
    Teller,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Thinker => "thinker",
            Self::Teller => "teller",
        }
    }
}

/// Where channel logs and cursor records live under the data directory.
///
/// ```text
/// <root>/channels/<topic>.jsonl
/// <root>/channels/<topic>.<role>.cursor.json
/// ```
#[derive(Debug, Clone)]
pub struct ChannelLayout {
    root: PathBuf,
}

impl ChannelLayout {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            root: data_dir.into().join("channels"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn log_path(&self, topic: Topic) -> PathBuf {
        self.root.join(format!("{}.jsonl", topic.as_str()))
    }

    pub fn cursor_path(&self, topic: Topic, role: Role) -> PathBuf {
        self.root
            .join(format!("{}.{}.cursor.json", topic.as_str(), role.as_str()))
    }
}
