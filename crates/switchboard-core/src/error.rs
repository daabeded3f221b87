//! Error types for Switchboard

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("authentication failed: {reason}")]
    AuthFailed { reason: String },

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("invalid agent address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    /// Target agent missing from the registry, or the connection to it failed.
    /// The session stays bound to its current agent.
    #[error("routing error: {target} - {reason}")]
    Routing { target: String, reason: String },

    /// Duplicate-call guard or in-flight handoff guard refused a tool call.
    #[error("call blocked: {tool} - {reason}")]
    Blocked { tool: String, reason: String },

    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session already attached: {0}")]
    SessionExists(String),

    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn auth_failed(reason: impl Into<String>) -> Self {
        Self::AuthFailed {
            reason: reason.into(),
        }
    }

    pub fn invalid_address(address: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            address: address.into(),
            reason: reason.into(),
        }
    }

    pub fn routing(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Routing {
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub fn blocked(tool: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Blocked {
            tool: tool.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_transition(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::InvalidTransition {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Wire code used when this error is reported to an agent.
    pub fn code(&self) -> crate::ErrorCode {
        use crate::ErrorCode;
        match self {
            Self::Blocked { .. } => ErrorCode::Blocked,
            Self::Routing { .. } | Self::AgentNotFound(_) | Self::ConnectionClosed(_) => {
                ErrorCode::RoutingError
            }
            Self::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            Self::AuthFailed { .. } => ErrorCode::Unauthorized,
            Self::InvalidMessage(_) | Self::InvalidAddress { .. } => ErrorCode::BadRequest,
            _ => ErrorCode::Unavailable,
        }
    }
}
