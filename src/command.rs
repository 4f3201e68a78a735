//! Commands executed by queue items.
//!
//! A command is one opaque step of an operation (download, install, ...).
//! The orchestrator never looks inside a command; it only uses the name to
//! pick the queue that runs it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::context::ExecutionContext;
use crate::error::CommandError;

/// Name of the command that fetches installers.
pub const DOWNLOAD: &str = "download";
/// Name of the command that installs or upgrades a package.
pub const INSTALL: &str = "install";
/// Name of the command that removes a package.
pub const UNINSTALL: &str = "uninstall";
/// Name of the command that repairs an installed package.
pub const REPAIR: &str = "repair";

/// One step of an operation.
///
/// Implementations should call [`ExecutionContext::check_cancelled`]
/// between internal steps and report failures through the returned error
/// rather than by panicking.
pub trait Command: Send + Sync {
    /// Name used for queue routing and logging.
    fn name(&self) -> &str;

    /// Runs the command against the operation's context.
    fn execute(&self, context: &ExecutionContext) -> Result<(), CommandError>;
}

type CommandFn = dyn Fn(&ExecutionContext) -> Result<(), CommandError> + Send + Sync;

/// Command backed by a closure.
pub struct FnCommand {
    name: String,
    run: Box<CommandFn>,
}

impl FnCommand {
    pub fn new<F>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn(&ExecutionContext) -> Result<(), CommandError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            run: Box::new(run),
        }
    }

    /// Wraps the command in an `Arc` for use in catalogs and chains.
    pub fn shared(self) -> Arc<dyn Command> {
        Arc::new(self)
    }
}

impl fmt::Debug for FnCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnCommand").field("name", &self.name).finish()
    }
}

impl Command for FnCommand {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, context: &ExecutionContext) -> Result<(), CommandError> {
        (self.run)(context)
    }
}

/// Lookup of commands by name, used by the queue item factory.
pub trait CommandCatalog: Send + Sync {
    fn command(&self, name: &str) -> Option<Arc<dyn Command>>;
}

/// In-memory [`CommandCatalog`].
#[derive(Clone, Default)]
pub struct CommandRegistry {
    commands: HashMap<String, Arc<dyn Command>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a command under its own name, replacing any previous one.
    pub fn register(&mut self, command: Arc<dyn Command>) {
        self.commands.insert(command.name().to_string(), command);
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, command: Arc<dyn Command>) -> Self {
        self.register(command);
        self
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.commands.keys().collect();
        names.sort();
        f.debug_struct("CommandRegistry").field("commands", &names).finish()
    }
}

impl CommandCatalog for CommandRegistry {
    fn command(&self, name: &str) -> Option<Arc<dyn Command>> {
        self.commands.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fn_command_runs_closure() {
        let cmd = FnCommand::new(INSTALL, |ctx| {
            ctx.insert("ran", &true).map_err(|e| CommandError::failed(INSTALL, e.to_string()))
        });
        let ctx = ExecutionContext::new();

        assert_eq!(cmd.name(), INSTALL);
        assert!(cmd.execute(&ctx).is_ok());
        assert_eq!(ctx.get::<bool>("ran"), Some(true));
    }

    #[test]
    fn test_fn_command_propagates_error() {
        let cmd = FnCommand::new(DOWNLOAD, |_| {
            Err(CommandError::failed(DOWNLOAD, "hash mismatch"))
        });
        let err = cmd.execute(&ExecutionContext::new()).unwrap_err();
        assert!(err.to_string().contains("hash mismatch"));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = CommandRegistry::new()
            .with(FnCommand::new(DOWNLOAD, |_| Ok(())).shared())
            .with(FnCommand::new(INSTALL, |_| Ok(())).shared());

        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry
                .command(DOWNLOAD)
                .map(|c| c.name().to_string())
                .as_deref(),
            Some(DOWNLOAD)
        );
        assert!(registry.command(REPAIR).is_none());
    }

    #[test]
    fn test_registry_replaces_by_name() {
        let mut registry = CommandRegistry::new();
        registry.register(FnCommand::new(INSTALL, |_| Ok(())).shared());
        registry.register(
            FnCommand::new(INSTALL, |_| Err(CommandError::failed(INSTALL, "v2"))).shared(),
        );

        assert_eq!(registry.len(), 1);
        let cmd = registry.command(INSTALL).unwrap();
        assert!(cmd.execute(&ExecutionContext::new()).is_err());
    }
}
