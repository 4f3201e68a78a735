//! Operation orchestrator.
//!
//! The orchestrator is the single entry point for running package operations.
//! It provides:
//!
//! - **Admission**: rejects an operation whose identity is already in flight
//! - **Routing**: lazily creates one [`OperationQueue`] per category and
//!   moves items between queues as their command chain progresses
//! - **Installing overlay**: lists install and upgrade operations in a
//!   searchable [`InstallingSource`]
//! - **Cancellation**: removes queued items, signals running ones
//! - **Shutdown**: blocks new work and waits for running items
//!
//! # Example
//!
//! ```ignore
//! use pkg_orchestrator::{Orchestrator, OrchestratorConfig};
//!
//! let orchestrator = Orchestrator::new(OrchestratorConfig::default())?;
//! let item = Arc::new(factory.for_install("Contoso.App", "community", context)?);
//! orchestrator.enqueue_and_run(Arc::clone(&item))?;
//! item.wait();
//! ```

pub mod item;
pub mod queue;
pub mod signal;
pub mod worker_pool;

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

pub use item::{
    CompletionSignal, OperationIdentity, OperationType, QueueItem, QueueItemFactory,
    QueueItemState,
};
pub use queue::{OperationQueue, QueueStats};
pub use signal::TerminationDispatcher;
pub use worker_pool::{PoolError, PoolStats, WorkerPool, WorkerPoolConfig};

use crate::config::{ConfigError, OrchestratorConfig};
use crate::context::{CancelReason, TerminationResult};
use crate::error::{CommandError, OrchestratorError, SourceError};
use crate::source::{InstallingSource, Manifest, MutableRepositorySource};

/// Admission bookkeeping guarded by the orchestrator lock.
#[derive(Default)]
struct Registry {
    disabled: Option<CancelReason>,
    queues: HashMap<String, Arc<OperationQueue>>,
    admitted: HashMap<OperationIdentity, Arc<QueueItem>>,
    /// Items released from `admitted` whose signal and handlers are still running.
    completing: usize,
}

impl Registry {
    fn is_idle(&self) -> bool {
        self.admitted.is_empty() && self.completing == 0
    }

    /// Frees the identity slot if this exact item still holds it.
    fn forget(&mut self, item: &QueueItem) {
        let owned = self
            .admitted
            .get(item.id())
            .is_some_and(|admitted| admitted.instance_id() == item.instance_id());
        if owned {
            self.admitted.remove(item.id());
        }
    }
}

pub(crate) struct OrchestratorInner {
    config: Arc<OrchestratorConfig>,
    registry: Mutex<Registry>,
    idle: Condvar,
    installing: OnceLock<Arc<InstallingSource>>,
    dispatcher: Arc<TerminationDispatcher>,
}

/// Handle to an orchestrator. Clones share the same queues and overlay.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    /// Creates an orchestrator with no queues. Queues start on first use.
    pub fn new(config: OrchestratorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(OrchestratorInner {
                config: Arc::new(config),
                registry: Mutex::new(Registry::default()),
                idle: Condvar::new(),
                installing: OnceLock::new(),
                dispatcher: Arc::new(TerminationDispatcher::new()),
            }),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Admits an item and schedules it on the queue of its first command.
    ///
    /// Returns once admission is done; execution happens on a worker.
    ///
    /// # Errors
    ///
    /// - `DuplicateOperation` if an item with the same identity is in flight
    /// - `Disabled` after [`block_new_work`](Self::block_new_work)
    /// - `NoCommands` / `MissingManifest` for malformed items
    /// - `QueueCreation` / `Submission` if the worker pool refuses the item
    pub fn enqueue_and_run(&self, item: Arc<QueueItem>) -> Result<(), OrchestratorError> {
        self.inner.enqueue_and_run(item)
    }

    /// Cancels the operation with this identity.
    ///
    /// A queued item is removed and completed immediately. A running item
    /// only has its context cancelled; it completes once its command
    /// returns. Returns `false` when no such operation is in flight.
    pub fn cancel(&self, id: &OperationIdentity) -> bool {
        self.inner.cancel(id)
    }

    /// Returns the in-flight item with this identity.
    pub fn get_item(&self, id: &OperationIdentity) -> Option<Arc<QueueItem>> {
        self.inner.registry.lock().admitted.get(id).cloned()
    }

    /// Number of admitted items that have not completed.
    pub fn active_count(&self) -> usize {
        self.inner.registry.lock().admitted.len()
    }

    /// Returns the queue with this name, if it has been created.
    pub fn queue(&self, name: &str) -> Option<Arc<OperationQueue>> {
        self.inner.registry.lock().queues.get(name).cloned()
    }

    /// Statistics for every queue created so far, sorted by name.
    pub fn queue_stats(&self) -> Vec<QueueStats> {
        let mut stats: Vec<_> = self
            .inner
            .queues_snapshot()
            .iter()
            .map(|queue| queue.stats())
            .collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// The overlay listing install and upgrade operations in flight.
    pub fn installing_source(&self) -> Arc<InstallingSource> {
        Arc::clone(self.inner.installing_source())
    }

    /// Lists a manifest in the installing overlay.
    pub fn add_to_overlay(&self, manifest: &Manifest) -> Result<(), SourceError> {
        self.inner.add_to_overlay(manifest)
    }

    /// Removes a manifest from the installing overlay.
    pub fn remove_from_overlay(&self, manifest: &Manifest) -> Result<(), SourceError> {
        self.inner.remove_from_overlay(manifest)
    }

    pub fn termination_dispatcher(&self) -> Arc<TerminationDispatcher> {
        Arc::clone(&self.inner.dispatcher)
    }

    /// Cancels every running operation. Returns how many were signalled.
    pub fn signal_termination(&self, reason: CancelReason) -> usize {
        self.inner.dispatcher.dispatch(reason)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.registry.lock().disabled.is_none()
    }

    /// Stops admitting new operations.
    pub fn block_new_work(&self, reason: CancelReason) {
        let mut registry = self.inner.registry.lock();
        if registry.disabled.is_none() {
            registry.disabled = Some(reason);
            info!(reason = %reason, "Orchestrator no longer accepts new operations");
        }
    }

    /// Cancels every in-flight operation and completes the ones not yet running.
    pub fn cancel_queued_items(&self, reason: CancelReason) {
        self.inner.cancel_queued_items(reason);
    }

    /// Blocks until every admitted operation has completed.
    pub fn wait_for_running_items(&self) {
        let mut registry = self.inner.registry.lock();
        while !registry.is_idle() {
            self.inner.idle.wait(&mut registry);
        }
    }

    /// Blocks new work, cancels everything, waits for running items and
    /// stops the worker pools.
    pub fn shutdown(&self, reason: CancelReason) {
        info!(reason = %reason, "Shutting down orchestrator");
        self.block_new_work(reason);
        self.cancel_queued_items(reason);
        self.wait_for_running_items();

        for queue in self.inner.queues_snapshot() {
            queue.shutdown();
        }
        info!("Orchestrator shutdown complete");
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.inner.registry.lock();
        let mut queues: Vec<_> = registry.queues.keys().collect();
        queues.sort();
        f.debug_struct("Orchestrator")
            .field("queues", &queues)
            .field("active", &registry.admitted.len())
            .field("disabled", &registry.disabled)
            .finish()
    }
}

impl OrchestratorInner {
    fn enqueue_and_run(self: &Arc<Self>, item: Arc<QueueItem>) -> Result<(), OrchestratorError> {
        let Some(first_command) = item.next_command_name() else {
            return Err(OrchestratorError::NoCommands(item.id().clone()));
        };

        let queue = {
            let mut registry = self.registry.lock();

            if let Some(reason) = registry.disabled {
                return Err(OrchestratorError::Disabled(reason));
            }

            if registry.admitted.contains_key(item.id()) {
                info!(
                    package_id = %item.id().package_id(),
                    source_id = %item.id().source_id(),
                    "Operation already in progress, rejecting duplicate"
                );
                return Err(OrchestratorError::DuplicateOperation(item.id().clone()));
            }

            let queue_name = self.config.queue_for_command(&first_command);
            let queue = self.queue_locked(&mut registry, queue_name)?;

            if item.is_applicable_for_installing_source() {
                let manifest = item
                    .context()
                    .manifest()
                    .ok_or_else(|| OrchestratorError::MissingManifest(item.id().clone()))?;
                self.add_to_overlay(manifest)?;
            }

            registry
                .admitted
                .insert(item.id().clone(), Arc::clone(&item));
            queue
        };

        if let Err(source) = queue.enqueue_and_run(Arc::clone(&item)) {
            self.release(&item);
            return Err(OrchestratorError::Submission {
                queue: queue.name().to_string(),
                source,
            });
        }

        info!(
            queue = %queue.name(),
            operation = %item.operation_type(),
            package_id = %item.id().package_id(),
            source_id = %item.id().source_id(),
            "Operation admitted"
        );
        Ok(())
    }

    fn cancel(self: &Arc<Self>, id: &OperationIdentity) -> bool {
        let Some(item) = self.registry.lock().admitted.get(id).cloned() else {
            debug!(
                package_id = %id.package_id(),
                source_id = %id.source_id(),
                "No operation to cancel"
            );
            return false;
        };

        item.context().cancel(CancelReason::Abort);

        let queue = item
            .current_queue()
            .and_then(|name| self.registry.lock().queues.get(&name).cloned());
        if let Some(queue) = queue {
            if queue.cancel_queued(&item) {
                info!(
                    queue = %queue.name(),
                    package_id = %id.package_id(),
                    "Cancelled queued operation"
                );
                self.complete_item(&item);
                return true;
            }
        }

        info!(package_id = %id.package_id(), "Requested cancellation of running operation");
        true
    }

    fn cancel_queued_items(self: &Arc<Self>, reason: CancelReason) {
        let (items, queues): (Vec<_>, Vec<_>) = {
            let registry = self.registry.lock();
            (
                registry.admitted.values().cloned().collect(),
                registry.queues.values().cloned().collect(),
            )
        };

        // Items between queues are not held by any queue; cancel them here.
        for item in &items {
            item.context().cancel(reason);
        }

        for queue in queues {
            for item in queue.cancel_all_items(reason) {
                self.complete_item(&item);
            }
        }
    }

    /// Moves an item whose next command belongs to another queue.
    ///
    /// Identity and overlay entries stay in place across the move.
    pub(crate) fn hand_off(self: &Arc<Self>, item: &Arc<QueueItem>, queue_name: &str) {
        item.set_state(QueueItemState::NotQueued);

        let queue = {
            let mut registry = self.registry.lock();
            let disabled = registry.disabled;
            match disabled {
                Some(reason) => Err(TerminationResult::Cancelled(reason)),
                None => self.queue_locked(&mut registry, queue_name).map_err(|e| {
                    TerminationResult::Failed(CommandError::failed(queue_name, e.to_string()))
                }),
            }
        };

        let submitted = queue.and_then(|queue| {
            queue.enqueue_and_run(Arc::clone(item)).map_err(|e| {
                TerminationResult::Failed(CommandError::failed(queue_name, e.to_string()))
            })
        });

        match submitted {
            Ok(()) => info!(
                queue = %queue_name,
                package_id = %item.id().package_id(),
                "Operation continues on next queue"
            ),
            Err(result) => {
                match result {
                    TerminationResult::Cancelled(reason) => item.context().cancel(reason),
                    failed => {
                        error!(
                            queue = %queue_name,
                            result = %failed,
                            "Failed to hand off operation"
                        );
                        item.context().terminate(failed);
                    }
                }
                self.complete_item(item);
            }
        }
    }

    /// Releases everything an item holds and fires its completion signal.
    ///
    /// Idle waiters are woken only after the signal and handlers have run.
    pub(crate) fn complete_item(&self, item: &Arc<QueueItem>) {
        item.set_current_queue(None);
        self.remove_listing(item);
        {
            let mut registry = self.registry.lock();
            registry.forget(item);
            registry.completing += 1;
        }

        info!(
            operation = %item.operation_type(),
            package_id = %item.id().package_id(),
            source_id = %item.id().source_id(),
            status = %item.context().status(),
            "Operation completed"
        );
        item.complete();

        let mut registry = self.registry.lock();
        registry.completing -= 1;
        if registry.is_idle() {
            self.idle.notify_all();
        }
    }

    /// Drops the overlay entry and identity slot of an item that never ran.
    fn release(&self, item: &QueueItem) {
        self.remove_listing(item);
        let mut registry = self.registry.lock();
        registry.forget(item);
        if registry.is_idle() {
            self.idle.notify_all();
        }
    }

    fn remove_listing(&self, item: &QueueItem) {
        if !item.is_applicable_for_installing_source() {
            return;
        }
        if let Some(manifest) = item.context().manifest() {
            if let Err(e) = self.remove_from_overlay(manifest) {
                warn!(
                    key = %manifest.version_key(),
                    error = %e,
                    "Installing source entry already removed"
                );
            }
        }
    }

    fn queue_locked(
        self: &Arc<Self>,
        registry: &mut Registry,
        name: &str,
    ) -> Result<Arc<OperationQueue>, OrchestratorError> {
        if let Some(queue) = registry.queues.get(name) {
            return Ok(Arc::clone(queue));
        }

        let pool_config = WorkerPoolConfig::new(name, self.config.concurrency_for(name))
            .with_thread_name_prefix(self.config.thread_name_prefix.clone());
        let pool = WorkerPool::start(pool_config).map_err(|source| {
            OrchestratorError::QueueCreation {
                queue: name.to_string(),
                source,
            }
        })?;

        let queue = Arc::new(OperationQueue::new(
            name,
            pool,
            Arc::clone(&self.config),
            Arc::clone(&self.dispatcher),
            Arc::downgrade(self),
        ));
        registry.queues.insert(name.to_string(), Arc::clone(&queue));
        info!(queue = %name, concurrency = queue.concurrency_limit(), "Created operation queue");
        Ok(queue)
    }

    fn queues_snapshot(&self) -> Vec<Arc<OperationQueue>> {
        self.registry.lock().queues.values().cloned().collect()
    }

    fn installing_source(&self) -> &Arc<InstallingSource> {
        self.installing
            .get_or_init(|| Arc::new(InstallingSource::new()))
    }

    fn add_to_overlay(&self, manifest: &Manifest) -> Result<(), SourceError> {
        self.installing_source()
            .add_package_version(manifest, &manifest.version_key())
    }

    fn remove_from_overlay(&self, manifest: &Manifest) -> Result<(), SourceError> {
        self.installing_source()
            .remove_package_version(manifest, &manifest.version_key())
    }
}

impl Drop for OrchestratorInner {
    /// Completes work that no handle can reach any more.
    ///
    /// Queued items are cancelled and completed here. Running items get a
    /// cancelled context and complete when their worker returns.
    fn drop(&mut self) {
        let registry = self.registry.get_mut();
        let queues: Vec<_> = registry.queues.drain().map(|(_, queue)| queue).collect();
        let admitted: Vec<_> = registry.admitted.drain().map(|(_, item)| item).collect();
        if admitted.is_empty() {
            return;
        }

        warn!(
            in_flight = admitted.len(),
            "Orchestrator dropped with operations in flight, cancelling them"
        );
        for item in &admitted {
            item.context().cancel(CancelReason::AppShutdown);
            self.remove_listing(item);
        }
        for queue in queues {
            for item in queue.cancel_all_items(CancelReason::AppShutdown) {
                item.set_current_queue(None);
                item.complete();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{self, FnCommand};
    use crate::context::{ExecutionContext, OperationStatus};
    use crate::source::{RepositorySource, SearchRequest};
    use std::time::Duration;

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(OrchestratorConfig::default()).unwrap()
    }

    fn install_item(package: &str, source: &str) -> Arc<QueueItem> {
        let context = ExecutionContext::new().with_manifest(Manifest::new(package, "1.0.0"));
        Arc::new(
            QueueItem::new(
                OperationIdentity::new(package, source),
                OperationType::Install,
                context,
            )
            .with_command(FnCommand::new(command::INSTALL, |_| Ok(())).shared()),
        )
    }

    #[test]
    fn test_rejects_item_without_commands() {
        let orchestrator = orchestrator();
        let item = Arc::new(QueueItem::for_search("A", "s").unwrap());
        let err = orchestrator.enqueue_and_run(item).unwrap_err();
        assert!(matches!(err, OrchestratorError::NoCommands(_)));
        assert_eq!(orchestrator.active_count(), 0);
    }

    #[test]
    fn test_install_requires_manifest() {
        let orchestrator = orchestrator();
        let item = Arc::new(
            QueueItem::new(
                OperationIdentity::new("A", "s"),
                OperationType::Install,
                ExecutionContext::new(),
            )
            .with_command(FnCommand::new(command::INSTALL, |_| Ok(())).shared()),
        );

        let err = orchestrator.enqueue_and_run(item).unwrap_err();
        assert!(matches!(err, OrchestratorError::MissingManifest(_)));
        assert_eq!(orchestrator.active_count(), 0);
        assert!(orchestrator.installing_source().is_empty());
    }

    #[test]
    fn test_completed_install_leaves_no_trace() {
        let orchestrator = orchestrator();
        let item = install_item("Contoso.App", "community");

        orchestrator.enqueue_and_run(Arc::clone(&item)).unwrap();
        assert!(item.wait_timeout(Duration::from_secs(5)));

        assert_eq!(item.status(), Some(OperationStatus::Succeeded));
        assert!(orchestrator.get_item(item.id()).is_none());
        assert!(orchestrator
            .installing_source()
            .search(&SearchRequest::by_id("Contoso.App"))
            .is_empty());
    }

    #[test]
    fn test_lazily_creates_routed_queue() {
        let orchestrator = orchestrator();
        assert!(orchestrator.queue_stats().is_empty());

        let item = install_item("A", "s");
        orchestrator.enqueue_and_run(Arc::clone(&item)).unwrap();
        item.wait_timeout(Duration::from_secs(5));

        let queue = orchestrator.queue(crate::config::OPERATION_QUEUE).unwrap();
        assert_eq!(queue.concurrency_limit(), 1);
        assert_eq!(orchestrator.queue_stats().len(), 1);
    }

    #[test]
    fn test_blocked_orchestrator_rejects_work() {
        let orchestrator = orchestrator();
        orchestrator.block_new_work(CancelReason::AppShutdown);

        assert!(!orchestrator.is_enabled());
        let err = orchestrator
            .enqueue_and_run(install_item("A", "s"))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Disabled(CancelReason::AppShutdown)));
    }

    #[test]
    fn test_wait_for_running_items_outlasts_completion_handlers() {
        let orchestrator = orchestrator();
        let item = install_item("A", "s");
        let handled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = Arc::clone(&handled);
        item.add_completion_handler(move |_| {
            std::thread::sleep(Duration::from_millis(100));
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        });

        orchestrator.enqueue_and_run(Arc::clone(&item)).unwrap();
        orchestrator.wait_for_running_items();

        assert!(item.is_done());
        assert!(handled.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn test_cancel_unknown_returns_false() {
        let orchestrator = orchestrator();
        assert!(!orchestrator.cancel(&OperationIdentity::new("missing", "s")));
    }

    #[test]
    fn test_overlay_wrappers() {
        let orchestrator = orchestrator();
        let manifest = Manifest::new("Fabrikam.Tool", "2.0");

        orchestrator.add_to_overlay(&manifest).unwrap();
        assert!(orchestrator.installing_source().contains_key("Fabrikam.Tool.2.0"));

        orchestrator.remove_from_overlay(&manifest).unwrap();
        assert!(orchestrator.installing_source().is_empty());
        assert!(orchestrator.remove_from_overlay(&manifest).is_err());
    }
}
