//! Error kinds shared by the registry, lifecycle controller and console.

use std::time::Duration;
use thiserror::Error;

use crate::server::{Operation, ServerStatus};

pub type PanelResult<T> = Result<T, PanelError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PanelError {
    /// No server with this id is registered.
    #[error("server '{0}' not found")]
    NotFound(String),

    #[error("server '{0}' already exists")]
    AlreadyExists(String),

    /// A guard rejected the request, or another transition is still in
    /// flight. Nothing was changed.
    #[error("cannot {action} server '{id}' while it is {status}")]
    InvalidTransition {
        id: String,
        status: ServerStatus,
        action: Operation,
    },

    #[error("{action} of server '{id}' timed out after {}s", after.as_secs())]
    OperationTimeout {
        id: String,
        action: Operation,
        after: Duration,
    },

    #[error("{action} on server '{id}' failed: {reason}")]
    OperationFailed {
        id: String,
        action: Operation,
        reason: String,
    },

    #[error("server '{0}' is not running")]
    NotRunning(String),

    #[error("invalid server config: {0}")]
    InvalidConfig(String),
}

/// Failure reported by an external collaborator (supervisor or command
/// channel).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct SupervisorError(pub String);
