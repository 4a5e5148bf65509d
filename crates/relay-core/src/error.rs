use thiserror::Error;

use crate::actions::RegistryError;
use crate::app::BuildError;
use crate::channel::ChannelError;
use crate::config::ConfigError;
use crate::domain::ModelError;
use crate::store::{SnapshotError, StoreError};

/// Any error the crate surfaces to an embedding application.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Model(#[from] ModelError),
}
