//! Errors that can happen while serving a free/busy request
//!
//! Every variant maps to an HTTP status with [`GatewayError::http_status`], so that the listener can
//! turn any failure into a well-formed response.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// The server URL, the username or the secret is missing
    #[error("configuration is incomplete")]
    ConfigurationIncomplete,

    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// No HTTP status could be obtained from the server (network error, timeout...)
    #[error("unable to reach the server: {0}")]
    Connectivity(String),

    /// The server answered with a status that is not recoverable
    #[error("server replied with HTTP {status}: {message}")]
    Upstream { status: u16, message: String },

    /// Something that the fallback requires is missing (e.g. our own account)
    #[error("{0}")]
    Precondition(String),

    /// The address book could not be loaded or refreshed
    #[error("address book unavailable: {0}")]
    AddressBook(String),

    #[error("listener error: {0}")]
    Listener(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// The status that should be sent to the client for this error
    pub fn http_status(&self) -> u16 {
        match self {
            Self::Upstream { status, .. } => *status,
            Self::Connectivity(_) => 502,
            Self::Precondition(_) => 412,
            Self::ConfigurationIncomplete
            | Self::InvalidConfiguration(_)
            | Self::AddressBook(_)
            | Self::Listener(_)
            | Self::Internal(_) => 500,
        }
    }

    /// The short message that is sent to the client for this error
    pub fn client_message(&self) -> String {
        match self {
            Self::Upstream { message, .. } => message.clone(),
            Self::Precondition(message) => message.clone(),
            other => other.to_string(),
        }
    }

    /// Whether a failed direct free/busy query with this error should be retried via the scheduling outbox
    pub fn is_fallback_eligible(&self) -> bool {
        match self {
            Self::Connectivity(_) => true,
            Self::Upstream { status, .. } => is_fallback_status(*status),
            _ => false,
        }
    }
}

/// HTTP statuses of a direct free/busy query that mean "this server does not let us query this way"
/// rather than "this server is broken"
pub fn is_fallback_status(status: u16) -> bool {
    matches!(status, 401 | 403 | 404 | 405 | 501)
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Listener(err.to_string())
    }
}
