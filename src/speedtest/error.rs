//! Error taxonomy for probing and server selection.

use thiserror::Error;

use super::server::ServerId;

#[derive(Debug, Error)]
pub enum ProbeError {
    /// A policy value that must be at least one was zero
    #[error("invalid setting {name}: {value} (must be at least 1)")]
    InvalidSetting { name: &'static str, value: usize },

    /// Explicitly requested server is not among the candidates
    #[error("server not found: {id}")]
    ServerNotFound { id: ServerId },

    #[error("no candidate servers to select from")]
    NoServers,

    /// Connect or read failure on a single transfer
    #[error("transfer failed for {url}: {message}")]
    Transfer { url: String, message: String },

    #[error("unexpected status {status} from {url}")]
    Status { url: String, status: u16 },

    /// A transfer task panicked instead of returning a result
    #[error("task panicked: {message}")]
    TaskPanicked { message: String },

    #[error("probe cancelled")]
    Cancelled,

    #[error("probe timed out")]
    TimedOut,

    #[error("failed to load server list from '{path}': {message}")]
    ServerList { path: String, message: String },
}

impl ProbeError {
    pub fn transfer(url: impl Into<String>, err: impl std::fmt::Display) -> Self {
        ProbeError::Transfer {
            url: url.into(),
            message: err.to_string(),
        }
    }

    /// Configuration errors abort the whole operation and are never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ProbeError::InvalidSetting { .. }
                | ProbeError::ServerNotFound { .. }
                | ProbeError::NoServers
                | ProbeError::ServerList { .. }
        )
    }

    /// True when the session ended because its scope was cancelled or its
    /// deadline passed, rather than because of a network failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ProbeError::Cancelled | ProbeError::TimedOut)
    }
}
