//! Errors returned to dispatch callers.

/// Why a task could not be accepted for a host.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// No agent session is registered for the host.
    #[error("no agent session for host {host}")]
    SessionNotFound {
        /// Host the task was addressed to.
        host: String,
    },
    /// The host's session is shutting down and takes no more tasks.
    #[error("agent session for host {host} is closed")]
    SessionClosed {
        /// Host the task was addressed to.
        host: String,
    },
}

impl DispatchError {
    /// The host the failed task was addressed to.
    pub fn host(&self) -> &str {
        match self {
            Self::SessionNotFound { host } | Self::SessionClosed { host } => host,
        }
    }
}
