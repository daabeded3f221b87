//! Workflow error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, WorkflowError>;

#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("no edge matched at node {0} and no default edge is declared")]
    NoDefaultEdge(String),

    #[error("reasoning service failed: {0}")]
    Reasoning(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("workflow parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

impl WorkflowError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidDefinition(reason.into())
    }
}

impl From<WorkflowError> for switchboard_core::Error {
    fn from(e: WorkflowError) -> Self {
        match e {
            WorkflowError::InvalidTransition { from, to } => {
                switchboard_core::Error::invalid_transition(from, to)
            }
            WorkflowError::Io(e) => switchboard_core::Error::Io(e),
            WorkflowError::InvalidDefinition(_) | WorkflowError::Parse(_) => {
                switchboard_core::Error::Config(e.to_string())
            }
            other => switchboard_core::Error::Internal(other.to_string()),
        }
    }
}
