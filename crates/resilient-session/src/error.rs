//! Process-level session errors.

use crate::config::ConfigError;
use crate::worker::BootstrapError;

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The API was used from the wrong role or more than once per process.
    #[error("{0}")]
    Misuse(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("invalid worker bootstrap: {0}")]
    Bootstrap(#[from] BootstrapError),

    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to build the health probe client: {0}")]
    ProbeClient(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SessionError {
    pub fn misuse(message: impl Into<String>) -> Self {
        Self::Misuse(message.into())
    }
}
