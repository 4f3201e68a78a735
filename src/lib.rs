//! pkg-orchestrator: admission, queuing and execution of package operations.
//!
//! This library provides the operation orchestrator of a package manager:
//! identity de-duplication, per-category worker queues, cooperative
//! cancellation and a searchable overlay of packages being installed.

// Core modules
pub mod cli;
pub mod command;
pub mod config;
pub mod context;
pub mod error;
pub mod orchestrator;
pub mod source;

pub use command::{Command, CommandCatalog, CommandRegistry, FnCommand};
pub use config::{ConfigError, OrchestratorConfig};
pub use context::{CancelReason, ExecutionContext, OperationStatus, TerminationResult};
pub use orchestrator::{
    OperationIdentity, OperationType, Orchestrator, QueueItem, QueueItemFactory, QueueItemState,
};
pub use source::{InstallingSource, Manifest, MutableRepositorySource, RepositorySource};

// Re-export commonly used error types
pub use error::{CommandError, ItemError, OrchestratorError, SourceError};
