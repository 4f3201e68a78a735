//! Error types for orchestrator operations.
//!
//! Defines error types for the major subsystems:
//! - Operation admission, lookup and cancellation
//! - Queue item construction
//! - Command execution
//! - Installing-source overlay mutations

use thiserror::Error;

use crate::context::CancelReason;
use crate::orchestrator::item::OperationIdentity;
use crate::orchestrator::worker_pool::PoolError;

/// Errors returned synchronously when an operation is admitted.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("An operation for {0} is already in progress")]
    DuplicateOperation(OperationIdentity),

    #[error("The orchestrator is not accepting new operations ({0})")]
    Disabled(CancelReason),

    #[error("Operation for {0} has no commands to run")]
    NoCommands(OperationIdentity),

    #[error("Operation for {0} requires a manifest to be listed as installing")]
    MissingManifest(OperationIdentity),

    #[error("Failed to create operation queue '{queue}': {source}")]
    QueueCreation {
        queue: String,
        #[source]
        source: PoolError,
    },

    #[error("Failed to submit work to queue '{queue}': {source}")]
    Submission {
        queue: String,
        #[source]
        source: PoolError,
    },

    #[error("Installing source error: {0}")]
    Source(#[from] SourceError),
}

impl OrchestratorError {
    /// Returns whether this error means the same operation is already running.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, OrchestratorError::DuplicateOperation(_))
    }
}

/// Errors that can occur while building a queue item.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ItemError {
    #[error("Package id is required")]
    MissingPackageId,

    #[error("Source id is required")]
    MissingSourceId,

    #[error("No command named '{0}' is registered")]
    UnknownCommand(String),
}

/// Errors produced by a command, or by the queue on its behalf.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CommandError {
    /// The command reported a failure through its return value.
    #[error("Command '{command}' failed: {message}")]
    Failed { command: String, message: String },

    /// The command panicked; the panic was caught at the worker boundary.
    #[error("Command '{command}' faulted: {message}")]
    Faulted { command: String, message: String },

    /// The command stopped because cancellation was requested.
    #[error("Command '{0}' observed cancellation")]
    Cancelled(String),
}

impl CommandError {
    /// Creates a failure for the named command.
    pub fn failed(command: impl Into<String>, message: impl Into<String>) -> Self {
        CommandError::Failed {
            command: command.into(),
            message: message.into(),
        }
    }
}

/// Errors that can occur while mutating a package source.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("Package version '{0}' not found in source")]
    NotFound(String),

    #[error("Invalid manifest: {0}")]
    InvalidManifest(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_display() {
        let id = OperationIdentity::new("Contoso.App", "community");
        let err = OrchestratorError::DuplicateOperation(id);
        assert!(err.is_duplicate());
        assert!(err.to_string().contains("already in progress"));
        assert!(err.to_string().contains("Contoso.App"));
    }

    #[test]
    fn test_command_error_display() {
        let err = CommandError::failed("install", "exit code 1603");
        assert_eq!(err.to_string(), "Command 'install' failed: exit code 1603");

        let err = CommandError::Faulted {
            command: "download".to_string(),
            message: "boom".to_string(),
        };
        assert!(err.to_string().contains("faulted"));

        let err = CommandError::Cancelled("install".to_string());
        assert!(err.to_string().contains("cancellation"));
    }

    #[test]
    fn test_source_error_converts() {
        let err: OrchestratorError = SourceError::NotFound("A.1.0".to_string()).into();
        assert!(!err.is_duplicate());
        assert!(err.to_string().contains("A.1.0"));
    }
}
