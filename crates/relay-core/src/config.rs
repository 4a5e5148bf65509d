//! Runtime configuration loaded from TOML.
//!
//! Every field has a default, so an empty file (or no file) is a valid
//! configuration.
//!
//! ```toml
//! [runtime]
//! data_dir = ".relay"
//! poll_interval_ms = 500
//!
//! [dispatcher]
//! max_concurrent = 4
//! max_attempts = 3
//! backoff_ms = 1000
//!
//! [profiles.specialist]
//! model = "large"
//! timeout_ms = 300000
//! reasoning_effort = "high"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatch::RetryPolicy;
use crate::domain::TaskProfile;
use crate::ports::InvokeOptions;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub runtime: RuntimeSection,
    pub dispatcher: DispatcherSection,
    pub channels: ChannelsSection,
    pub actions: ActionsSection,
    pub controller: ControllerSection,
    pub profiles: ProfilesSection,
}

impl RelayConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Load from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        Self::from_toml_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.dispatcher.max_attempts,
            Duration::from_millis(self.dispatcher.backoff_ms),
        )
    }

    pub fn invoke_options(&self, profile: TaskProfile) -> InvokeOptions {
        let section = match profile {
            TaskProfile::Standard => &self.profiles.standard,
            TaskProfile::Specialist => &self.profiles.specialist,
        };
        InvokeOptions {
            model: section.model.clone(),
            timeout_ms: section.timeout_ms,
            reasoning_effort: section.reasoning_effort.clone(),
        }
    }
}

/// [runtime]: data directory and controller loop pacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSection {
    pub data_dir: PathBuf,
    pub poll_interval_ms: u64,
    /// Max inbound packets per channel consumed in one controller round.
    pub input_batch_limit: usize,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".relay"),
            poll_interval_ms: 500,
            input_batch_limit: 32,
        }
    }
}

/// [dispatcher]: worker pool size and retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSection {
    pub max_concurrent: usize,
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_attempts: 3,
            backoff_ms: 1_000,
        }
    }
}

/// [channels]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsSection {
    /// Fully consumed logs shorter than this are left alone.
    pub compact_min_packets: u64,
}

impl Default for ChannelsSection {
    fn default() -> Self {
        Self {
            compact_min_packets: 64,
        }
    }
}

/// [actions]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionsSection {
    /// Repeated `create_task` requests with the same semantic key inside this
    /// window are dropped.
    pub debounce_ms: u64,
}

impl Default for ActionsSection {
    fn default() -> Self {
        Self { debounce_ms: 300 }
    }
}

/// [controller]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSection {
    /// Profile whose invoke options the controller's own model call uses.
    pub profile: TaskProfile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilesSection {
    pub standard: ProfileSection,
    pub specialist: ProfileSection,
}

impl Default for ProfilesSection {
    fn default() -> Self {
        Self {
            standard: ProfileSection::default(),
            specialist: ProfileSection {
                model: None,
                timeout_ms: 600_000,
                reasoning_effort: Some("high".to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileSection {
    pub model: Option<String>,
    pub timeout_ms: u64,
    pub reasoning_effort: Option<String>,
}

impl Default for ProfileSection {
    fn default() -> Self {
        Self {
            model: None,
            timeout_ms: 120_000,
            reasoning_effort: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_all_defaults() {
        let config = RelayConfig::from_toml_str("").unwrap();
        assert_eq!(config, RelayConfig::default());
        assert_eq!(config.dispatcher.max_attempts, 3);
        assert_eq!(config.runtime.data_dir, PathBuf::from(".relay"));
        assert_eq!(config.actions.debounce_ms, 300);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = RelayConfig::from_toml_str(
            r#"
            [dispatcher]
            max_attempts = 2
            backoff_ms = 100

            [profiles.specialist]
            model = "large"
            "#,
        )
        .unwrap();
        assert_eq!(config.dispatcher.max_concurrent, 4);
        assert_eq!(
            config.retry_policy(),
            RetryPolicy::new(2, Duration::from_millis(100))
        );

        let opts = config.invoke_options(TaskProfile::Specialist);
        assert_eq!(opts.model.as_deref(), Some("large"));
        assert_eq!(opts.timeout_ms, 120_000);
    }

    #[test]
    fn unknown_profile_value_is_rejected() {
        let err = RelayConfig::from_toml_str("[controller]\nprofile = \"wizard\"\n");
        assert!(err.is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RelayConfig::load(&dir.path().join("relay.toml")).unwrap();
        assert_eq!(config, RelayConfig::default());
    }
}
