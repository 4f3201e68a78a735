//! Queue items: one in-flight operation and the commands it still has to run.
//!
//! This module defines:
//!
//! - `OperationIdentity`: case-insensitive `(package, source)` de-duplication key
//! - `OperationType`: what kind of operation an item performs
//! - `QueueItemState`: the state machine driven by the owning queue
//! - `QueueItem`: the shared handle handed back to callers
//! - `QueueItemFactory`: builds items with the standard command chains

use std::collections::VecDeque;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::command::{self, Command, CommandCatalog};
use crate::context::{ExecutionContext, OperationStatus};
use crate::error::ItemError;

/// Identity of an operation: which package, from which source.
///
/// Comparison and hashing ignore case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationIdentity {
    package_id: String,
    source_id: String,
}

impl OperationIdentity {
    pub fn new(package_id: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            package_id: package_id.into(),
            source_id: source_id.into(),
        }
    }

    /// Creates an identity, rejecting blank fields.
    pub fn try_new(
        package_id: impl Into<String>,
        source_id: impl Into<String>,
    ) -> Result<Self, ItemError> {
        let id = Self::new(package_id, source_id);
        if id.package_id.trim().is_empty() {
            return Err(ItemError::MissingPackageId);
        }
        if id.source_id.trim().is_empty() {
            return Err(ItemError::MissingSourceId);
        }
        Ok(id)
    }

    pub fn package_id(&self) -> &str {
        &self.package_id
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }
}

impl PartialEq for OperationIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.package_id.to_lowercase() == other.package_id.to_lowercase()
            && self.source_id.to_lowercase() == other.source_id.to_lowercase()
    }
}

impl Eq for OperationIdentity {}

impl Hash for OperationIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.package_id.to_lowercase().hash(state);
        self.source_id.to_lowercase().hash(state);
    }
}

impl fmt::Display for OperationIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' from '{}'", self.package_id, self.source_id)
    }
}

/// Kind of operation a queue item performs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    #[default]
    None,
    Search,
    Install,
    Upgrade,
    Uninstall,
    Download,
    Repair,
}

impl OperationType {
    /// Install and upgrade operations are listed in the installing source.
    pub fn is_applicable_for_installing_source(self) -> bool {
        matches!(self, OperationType::Install | OperationType::Upgrade)
    }

    /// Name used in logs, matching the CLI command it corresponds to.
    pub fn command_name(self) -> &'static str {
        match self {
            OperationType::None => "unknown",
            OperationType::Search => "root:search",
            OperationType::Install => "root:install",
            OperationType::Upgrade => "root:upgrade",
            OperationType::Uninstall => "root:uninstall",
            OperationType::Download => "root:download",
            OperationType::Repair => "root:repair",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.command_name())
    }
}

/// Position of an item in its queue's state machine.
///
/// `NotQueued -> Queued -> Running -> removed`, or
/// `Queued -> Cancelled -> removed`. A running item is never moved to
/// `Cancelled`; its cancellation lives on the execution context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueItemState {
    #[default]
    NotQueued,
    Queued,
    Running,
    Cancelled,
}

impl fmt::Display for QueueItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueItemState::NotQueued => write!(f, "not_queued"),
            QueueItemState::Queued => write!(f, "queued"),
            QueueItemState::Running => write!(f, "running"),
            QueueItemState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One-shot event set when an item leaves the orchestrator.
#[derive(Debug, Default)]
pub struct CompletionSignal {
    fired: Mutex<bool>,
    condvar: Condvar,
}

impl CompletionSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the signal. Returns `false` if it had already fired.
    pub fn set(&self) -> bool {
        let mut fired = self.fired.lock();
        if *fired {
            return false;
        }
        *fired = true;
        self.condvar.notify_all();
        true
    }

    pub fn is_set(&self) -> bool {
        *self.fired.lock()
    }

    /// Blocks until the signal fires.
    pub fn wait(&self) {
        let mut fired = self.fired.lock();
        while !*fired {
            self.condvar.wait(&mut fired);
        }
    }

    /// Blocks until the signal fires or the timeout elapses.
    /// Returns whether the signal fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut fired = self.fired.lock();
        if !*fired {
            self.condvar.wait_while_for(&mut fired, |fired| !*fired, timeout);
        }
        *fired
    }
}

type CompletionHandler = Box<dyn FnOnce(&QueueItem) + Send>;

/// An operation admitted (or about to be admitted) to the orchestrator.
///
/// Callers hold it through an `Arc`; the owning queue is the only party
/// that changes its state.
pub struct QueueItem {
    instance_id: Uuid,
    id: OperationIdentity,
    operation_type: OperationType,
    context: Arc<ExecutionContext>,
    commands: Mutex<VecDeque<Arc<dyn Command>>>,
    is_first_command: AtomicBool,
    state: Mutex<QueueItemState>,
    current_queue: Mutex<Option<String>>,
    completion: CompletionSignal,
    completion_handlers: Mutex<Vec<CompletionHandler>>,
    created_at: DateTime<Utc>,
}

impl QueueItem {
    /// Creates an item with an empty command chain.
    pub fn new(
        id: OperationIdentity,
        operation_type: OperationType,
        context: impl Into<Arc<ExecutionContext>>,
    ) -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            id,
            operation_type,
            context: context.into(),
            commands: Mutex::new(VecDeque::new()),
            is_first_command: AtomicBool::new(true),
            state: Mutex::new(QueueItemState::NotQueued),
            current_queue: Mutex::new(None),
            completion: CompletionSignal::new(),
            completion_handlers: Mutex::new(Vec::new()),
            created_at: Utc::now(),
        }
    }

    /// Creates a command-less item used only as a lookup key.
    pub fn for_search(
        package_id: impl Into<String>,
        source_id: impl Into<String>,
    ) -> Result<Self, ItemError> {
        let id = OperationIdentity::try_new(package_id, source_id)?;
        Ok(Self::new(id, OperationType::Search, ExecutionContext::new()))
    }

    /// Appends a command to the chain.
    pub fn with_command(self, command: Arc<dyn Command>) -> Self {
        self.add_command(command);
        self
    }

    pub fn add_command(&self, command: Arc<dyn Command>) {
        self.commands.lock().push_back(command);
    }

    /// Unique per item, unlike [`id`](Self::id) which is reused by later
    /// operations on the same package.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn id(&self) -> &OperationIdentity {
        &self.id
    }

    pub fn operation_type(&self) -> OperationType {
        self.operation_type
    }

    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.context
    }

    pub fn state(&self) -> QueueItemState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: QueueItemState) {
        *self.state.lock() = state;
    }

    /// Name of the queue currently holding the item.
    pub fn current_queue(&self) -> Option<String> {
        self.current_queue.lock().clone()
    }

    pub(crate) fn set_current_queue(&self, queue: Option<String>) {
        *self.current_queue.lock() = queue;
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_applicable_for_installing_source(&self) -> bool {
        self.operation_type.is_applicable_for_installing_source()
    }

    /// True until the first command has been taken off the chain.
    pub fn is_on_first_command(&self) -> bool {
        self.is_first_command.load(Ordering::SeqCst)
    }

    /// Removes and returns the next command.
    pub fn pop_next_command(&self) -> Option<Arc<dyn Command>> {
        let command = self.commands.lock().pop_front();
        if command.is_some() {
            self.is_first_command.store(false, Ordering::SeqCst);
        }
        command
    }

    /// Name of the next command, if any.
    pub fn next_command_name(&self) -> Option<String> {
        self.commands
            .lock()
            .front()
            .map(|command| command.name().to_string())
    }

    pub fn remaining_commands(&self) -> usize {
        self.commands.lock().len()
    }

    /// True when no commands are left to run.
    pub fn is_complete(&self) -> bool {
        self.commands.lock().is_empty()
    }

    /// Registers a handler run once, right after the completion signal fires.
    pub fn add_completion_handler<F>(&self, handler: F)
    where
        F: FnOnce(&QueueItem) + Send + 'static,
    {
        self.completion_handlers.lock().push(Box::new(handler));
    }

    pub fn completion(&self) -> &CompletionSignal {
        &self.completion
    }

    pub fn is_done(&self) -> bool {
        self.completion.is_set()
    }

    /// Blocks until the item has left the orchestrator.
    pub fn wait(&self) {
        self.completion.wait();
    }

    /// Blocks until the item has left the orchestrator or the timeout elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.completion.wait_timeout(timeout)
    }

    /// Final outcome, once the item is done.
    pub fn status(&self) -> Option<OperationStatus> {
        self.is_done().then(|| self.context.status())
    }

    /// Fires the completion signal and runs handlers. Returns `false` when
    /// the item had already completed.
    pub(crate) fn complete(&self) -> bool {
        if !self.completion.set() {
            warn!(
                package_id = %self.id.package_id(),
                source_id = %self.id.source_id(),
                "Completion signalled more than once, ignoring"
            );
            return false;
        }

        let handlers: Vec<_> = self.completion_handlers.lock().drain(..).collect();
        for handler in handlers {
            handler(self);
        }
        true
    }
}

impl fmt::Debug for QueueItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let commands: Vec<String> = self
            .commands
            .lock()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        f.debug_struct("QueueItem")
            .field("instance_id", &self.instance_id)
            .field("id", &self.id)
            .field("operation_type", &self.operation_type)
            .field("state", &self.state())
            .field("current_queue", &self.current_queue())
            .field("commands", &commands)
            .field("done", &self.is_done())
            .finish()
    }
}

/// Builds queue items with the standard command chain for each operation.
#[derive(Clone)]
pub struct QueueItemFactory {
    catalog: Arc<dyn CommandCatalog>,
}

impl QueueItemFactory {
    pub fn new(catalog: Arc<dyn CommandCatalog>) -> Self {
        Self { catalog }
    }

    /// Download then install.
    pub fn for_install(
        &self,
        package_id: impl Into<String>,
        source_id: impl Into<String>,
        context: ExecutionContext,
    ) -> Result<QueueItem, ItemError> {
        self.build(
            package_id,
            source_id,
            context,
            OperationType::Install,
            &[command::DOWNLOAD, command::INSTALL],
        )
    }

    /// Same chain as install, listed as an upgrade.
    pub fn for_upgrade(
        &self,
        package_id: impl Into<String>,
        source_id: impl Into<String>,
        context: ExecutionContext,
    ) -> Result<QueueItem, ItemError> {
        self.build(
            package_id,
            source_id,
            context,
            OperationType::Upgrade,
            &[command::DOWNLOAD, command::INSTALL],
        )
    }

    pub fn for_uninstall(
        &self,
        package_id: impl Into<String>,
        source_id: impl Into<String>,
        context: ExecutionContext,
    ) -> Result<QueueItem, ItemError> {
        self.build(
            package_id,
            source_id,
            context,
            OperationType::Uninstall,
            &[command::UNINSTALL],
        )
    }

    pub fn for_download(
        &self,
        package_id: impl Into<String>,
        source_id: impl Into<String>,
        context: ExecutionContext,
    ) -> Result<QueueItem, ItemError> {
        self.build(
            package_id,
            source_id,
            context,
            OperationType::Download,
            &[command::DOWNLOAD],
        )
    }

    pub fn for_repair(
        &self,
        package_id: impl Into<String>,
        source_id: impl Into<String>,
        context: ExecutionContext,
    ) -> Result<QueueItem, ItemError> {
        self.build(
            package_id,
            source_id,
            context,
            OperationType::Repair,
            &[command::REPAIR],
        )
    }

    pub fn for_search(
        &self,
        package_id: impl Into<String>,
        source_id: impl Into<String>,
    ) -> Result<QueueItem, ItemError> {
        QueueItem::for_search(package_id, source_id)
    }

    fn build(
        &self,
        package_id: impl Into<String>,
        source_id: impl Into<String>,
        context: ExecutionContext,
        operation_type: OperationType,
        chain: &[&str],
    ) -> Result<QueueItem, ItemError> {
        let id = OperationIdentity::try_new(package_id, source_id)?;
        let item = QueueItem::new(id, operation_type, context);
        for name in chain {
            let command = self
                .catalog
                .command(name)
                .ok_or_else(|| ItemError::UnknownCommand(name.to_string()))?;
            item.add_command(command);
        }
        Ok(item)
    }
}

impl fmt::Debug for QueueItemFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueItemFactory").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandRegistry, FnCommand};
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn catalog() -> Arc<dyn CommandCatalog> {
        Arc::new(
            CommandRegistry::new()
                .with(FnCommand::new(command::DOWNLOAD, |_| Ok(())).shared())
                .with(FnCommand::new(command::INSTALL, |_| Ok(())).shared())
                .with(FnCommand::new(command::UNINSTALL, |_| Ok(())).shared()),
        )
    }

    #[test]
    fn test_identity_is_case_insensitive() {
        let a = OperationIdentity::new("Contoso.App", "Community");
        let b = OperationIdentity::new("contoso.app", "COMMUNITY");
        let c = OperationIdentity::new("contoso.app", "msstore");

        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_identity_requires_fields() {
        assert_eq!(
            OperationIdentity::try_new("", "community").unwrap_err(),
            ItemError::MissingPackageId
        );
        assert_eq!(
            OperationIdentity::try_new("Contoso.App", "  ").unwrap_err(),
            ItemError::MissingSourceId
        );
    }

    #[test]
    fn test_applicable_for_installing_source() {
        assert!(OperationType::Install.is_applicable_for_installing_source());
        assert!(OperationType::Upgrade.is_applicable_for_installing_source());
        assert!(!OperationType::Uninstall.is_applicable_for_installing_source());
        assert!(!OperationType::Download.is_applicable_for_installing_source());
        assert!(!OperationType::Search.is_applicable_for_installing_source());
        assert!(!OperationType::None.is_applicable_for_installing_source());
    }

    #[test]
    fn test_pop_next_command_clears_first_flag() {
        let item = QueueItem::new(
            OperationIdentity::new("A", "s"),
            OperationType::Install,
            ExecutionContext::new(),
        )
        .with_command(FnCommand::new(command::DOWNLOAD, |_| Ok(())).shared())
        .with_command(FnCommand::new(command::INSTALL, |_| Ok(())).shared());

        assert!(item.is_on_first_command());
        assert_eq!(item.next_command_name().as_deref(), Some(command::DOWNLOAD));

        let first = item.pop_next_command().unwrap();
        assert_eq!(first.name(), command::DOWNLOAD);
        assert!(!item.is_on_first_command());
        assert!(!item.is_complete());

        item.pop_next_command().unwrap();
        assert!(item.is_complete());
        assert!(item.pop_next_command().is_none());
    }

    #[test]
    fn test_factory_chains() {
        let factory = QueueItemFactory::new(catalog());

        let install = factory
            .for_install("Contoso.App", "community", ExecutionContext::new())
            .unwrap();
        assert_eq!(install.operation_type(), OperationType::Install);
        assert_eq!(install.remaining_commands(), 2);
        assert_eq!(install.state(), QueueItemState::NotQueued);

        let upgrade = factory
            .for_upgrade("Contoso.App", "community", ExecutionContext::new())
            .unwrap();
        assert_eq!(upgrade.operation_type(), OperationType::Upgrade);

        let uninstall = factory
            .for_uninstall("Contoso.App", "community", ExecutionContext::new())
            .unwrap();
        assert_eq!(uninstall.remaining_commands(), 1);
        assert_eq!(uninstall.next_command_name().as_deref(), Some(command::UNINSTALL));

        let search = factory.for_search("Contoso.App", "community").unwrap();
        assert!(search.is_complete());
        assert_eq!(search.id(), install.id());
        assert_ne!(search.instance_id(), install.instance_id());
    }

    #[test]
    fn test_factory_rejects_missing_identity() {
        let factory = QueueItemFactory::new(catalog());
        let err = factory
            .for_install("", "community", ExecutionContext::new())
            .unwrap_err();
        assert_eq!(err, ItemError::MissingPackageId);

        let err = factory.for_search("Contoso.App", "").unwrap_err();
        assert_eq!(err, ItemError::MissingSourceId);
    }

    #[test]
    fn test_factory_rejects_unknown_command() {
        let factory = QueueItemFactory::new(catalog());
        let err = factory
            .for_repair("Contoso.App", "community", ExecutionContext::new())
            .unwrap_err();
        assert_eq!(err, ItemError::UnknownCommand(command::REPAIR.to_string()));
    }

    #[test]
    fn test_completion_signal_fires_once() {
        let signal = CompletionSignal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(5)));
        assert!(signal.set());
        assert!(!signal.set());
        assert!(signal.wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn test_completion_signal_wakes_waiter() {
        let signal = Arc::new(CompletionSignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.wait())
        };

        thread::sleep(Duration::from_millis(10));
        signal.set();
        waiter.join().unwrap();
        assert!(signal.is_set());
    }

    #[test]
    fn test_complete_runs_handlers_once() {
        let item = QueueItem::new(
            OperationIdentity::new("A", "s"),
            OperationType::Uninstall,
            ExecutionContext::new(),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        item.add_completion_handler(move |done| {
            assert!(done.is_done());
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(item.status().is_none());
        assert!(item.complete());
        assert!(!item.complete());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(item.status(), Some(OperationStatus::Succeeded));
    }
}
