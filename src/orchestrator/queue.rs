//! One operation queue: FIFO admission plus bounded execution on its own pool.
//!
//! The queue is the only place item state changes. Every transition happens
//! under the queue's lock, so a worker claiming an item and a caller
//! cancelling it can never both win.

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::item::{QueueItem, QueueItemState};
use super::signal::TerminationDispatcher;
use super::worker_pool::{PoolError, PoolStats, WorkerPool};
use super::OrchestratorInner;
use crate::config::OrchestratorConfig;
use crate::context::{CancelReason, TerminationResult};
use crate::error::CommandError;

/// Snapshot of one queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub name: String,
    pub queued: usize,
    pub running: usize,
    pub pool: PoolStats,
}

/// Queue of items sharing one operation category.
pub struct OperationQueue {
    name: String,
    pool: WorkerPool,
    items: Mutex<VecDeque<Arc<QueueItem>>>,
    config: Arc<OrchestratorConfig>,
    dispatcher: Arc<TerminationDispatcher>,
    orchestrator: Weak<OrchestratorInner>,
}

impl OperationQueue {
    pub(crate) fn new(
        name: impl Into<String>,
        pool: WorkerPool,
        config: Arc<OrchestratorConfig>,
        dispatcher: Arc<TerminationDispatcher>,
        orchestrator: Weak<OrchestratorInner>,
    ) -> Self {
        Self {
            name: name.into(),
            pool,
            items: Mutex::new(VecDeque::new()),
            config,
            dispatcher,
            orchestrator,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum number of items running at once.
    pub fn concurrency_limit(&self) -> usize {
        self.pool.num_workers()
    }

    /// Number of items held, queued or running.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Number of items currently in [`QueueItemState::Running`].
    pub fn running_count(&self) -> usize {
        self.count_in_state(QueueItemState::Running)
    }

    pub fn stats(&self) -> QueueStats {
        let (queued, running) = {
            let items = self.items.lock();
            items.iter().fold((0, 0), |(q, r), item| match item.state() {
                QueueItemState::Queued => (q + 1, r),
                QueueItemState::Running => (q, r + 1),
                _ => (q, r),
            })
        };
        QueueStats {
            name: self.name.clone(),
            queued,
            running,
            pool: self.pool.stats(),
        }
    }

    /// Finds an item by its instance id.
    pub fn find(&self, instance_id: Uuid) -> Option<Arc<QueueItem>> {
        self.items
            .lock()
            .iter()
            .find(|item| item.instance_id() == instance_id)
            .cloned()
    }

    /// Appends the item as `Queued` and hands a run task to the pool.
    ///
    /// Never blocks on execution. On error the item is not left in the queue.
    /// An item whose context is already terminated is completed instead.
    pub(crate) fn enqueue_and_run(self: &Arc<Self>, item: Arc<QueueItem>) -> Result<(), PoolError> {
        let terminated = {
            let mut items = self.items.lock();
            if item.context().is_terminated() {
                item.set_state(QueueItemState::Cancelled);
                true
            } else {
                item.set_state(QueueItemState::Queued);
                item.set_current_queue(Some(self.name.clone()));
                items.push_back(Arc::clone(&item));
                false
            }
        };
        if terminated {
            debug!(
                queue = %self.name,
                package_id = %item.id().package_id(),
                "Item terminated before it was queued"
            );
            self.complete(&item);
            return Ok(());
        }

        let queue = Arc::downgrade(self);
        let instance_id = item.instance_id();
        let submitted = self.pool.submit(move || {
            if let Some(queue) = queue.upgrade() {
                queue.run_item(instance_id);
            }
        });

        if let Err(e) = submitted {
            self.remove_in_state(&item, QueueItemState::Queued);
            item.set_state(QueueItemState::NotQueued);
            item.set_current_queue(None);
            return Err(e);
        }

        debug!(
            queue = %self.name,
            package_id = %item.id().package_id(),
            instance_id = %instance_id,
            "Item queued"
        );
        Ok(())
    }

    /// Removes the item only if it is in `expected` state.
    ///
    /// Returns `false` when the item is gone or another caller changed its
    /// state first.
    pub fn remove_in_state(&self, item: &QueueItem, expected: QueueItemState) -> bool {
        let mut items = self.items.lock();
        let Some(position) = items
            .iter()
            .position(|i| i.instance_id() == item.instance_id())
        else {
            return false;
        };

        if items[position].state() != expected {
            return false;
        }
        items.remove(position);
        true
    }

    /// Removes a `Queued` item and marks it `Cancelled`.
    pub(crate) fn cancel_queued(&self, item: &QueueItem) -> bool {
        let mut items = self.items.lock();
        let Some(position) = items
            .iter()
            .position(|i| i.instance_id() == item.instance_id())
        else {
            return false;
        };

        if items[position].state() != QueueItemState::Queued {
            return false;
        }
        item.set_state(QueueItemState::Cancelled);
        items.remove(position);
        true
    }

    /// Cancels every item's context and removes the ones not yet running.
    ///
    /// Returns the removed items; the caller completes them.
    pub(crate) fn cancel_all_items(&self, reason: CancelReason) -> Vec<Arc<QueueItem>> {
        let mut items = self.items.lock();
        let mut removed = Vec::new();

        items.retain(|item| {
            item.context().cancel(reason);
            if item.state() == QueueItemState::Queued {
                item.set_state(QueueItemState::Cancelled);
                removed.push(Arc::clone(item));
                false
            } else {
                true
            }
        });

        if !removed.is_empty() {
            info!(
                queue = %self.name,
                removed = removed.len(),
                reason = %reason,
                "Cancelled queued items"
            );
        }
        removed
    }

    /// Stops the pool, letting running items finish.
    pub(crate) fn shutdown(&self) {
        self.pool.shutdown();
    }

    fn count_in_state(&self, state: QueueItemState) -> usize {
        self.items
            .lock()
            .iter()
            .filter(|item| item.state() == state)
            .count()
    }

    /// Worker entry point for one item.
    fn run_item(self: &Arc<Self>, instance_id: Uuid) {
        let item = {
            let items = self.items.lock();
            let Some(item) = items.iter().find(|i| i.instance_id() == instance_id) else {
                debug!(
                    queue = %self.name,
                    instance_id = %instance_id,
                    "Item was removed before a worker picked it up"
                );
                return;
            };
            if item.state() != QueueItemState::Queued {
                warn!(
                    queue = %self.name,
                    instance_id = %instance_id,
                    state = %item.state(),
                    "Item is not queued, skipping run"
                );
                return;
            }
            item.set_state(QueueItemState::Running);
            Arc::clone(item)
        };

        info!(
            queue = %self.name,
            operation = %item.operation_type(),
            package_id = %item.id().package_id(),
            source_id = %item.id().source_id(),
            continuation = !item.is_on_first_command(),
            "Running operation"
        );

        let mut cleanup = RunCleanup {
            queue: &**self,
            item,
            next_queue: None,
        };
        cleanup.next_queue = self.execute_commands(&cleanup.item);
    }

    /// Runs commands that belong to this queue. Returns the queue the
    /// next command belongs to when the chain continues elsewhere.
    fn execute_commands(&self, item: &QueueItem) -> Option<String> {
        let context = item.context();
        let _registration = self.dispatcher.register(Arc::clone(context));

        loop {
            if context.is_terminated() {
                return None;
            }

            let next = item.next_command_name()?;
            let target = self.config.queue_for_command(&next);
            if target != self.name {
                return Some(target.to_string());
            }

            let command = item.pop_next_command()?;
            let outcome = catch_unwind(AssertUnwindSafe(|| command.execute(context)));

            match outcome {
                Ok(Ok(())) => {
                    debug!(queue = %self.name, command = %next, "Command finished");
                }
                Ok(Err(CommandError::Cancelled(_))) => {
                    let reason = context.cancel_reason().unwrap_or(CancelReason::Abort);
                    context.terminate(TerminationResult::Cancelled(reason));
                    return None;
                }
                Ok(Err(e)) => {
                    warn!(queue = %self.name, command = %next, error = %e, "Command failed");
                    context.terminate(TerminationResult::Failed(e));
                    return None;
                }
                Err(payload) => {
                    let message = panic_message(&*payload);
                    error!(
                        queue = %self.name,
                        command = %next,
                        message = %message,
                        "Command faulted"
                    );
                    context.terminate(TerminationResult::Failed(CommandError::Faulted {
                        command: next,
                        message,
                    }));
                    return None;
                }
            }
        }
    }

    fn finish_run(&self, item: &Arc<QueueItem>, next_queue: Option<String>) {
        if !self.remove_in_state(item, QueueItemState::Running) {
            warn!(
                queue = %self.name,
                instance_id = %item.instance_id(),
                "Running item was already removed"
            );
        }

        match (next_queue, self.orchestrator.upgrade()) {
            (Some(next), Some(orchestrator)) => orchestrator.hand_off(item, &next),
            _ => self.complete(item),
        }
    }

    fn complete(&self, item: &Arc<QueueItem>) {
        match self.orchestrator.upgrade() {
            Some(orchestrator) => orchestrator.complete_item(item),
            None => {
                item.set_current_queue(None);
                item.complete();
            }
        }
    }
}

impl std::fmt::Debug for OperationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationQueue")
            .field("name", &self.name)
            .field("concurrency_limit", &self.concurrency_limit())
            .field("items", &self.len())
            .finish()
    }
}

/// Removes the running item however the worker leaves `run_item`.
struct RunCleanup<'a> {
    queue: &'a OperationQueue,
    item: Arc<QueueItem>,
    next_queue: Option<String>,
}

impl Drop for RunCleanup<'_> {
    fn drop(&mut self) {
        let next_queue = self.next_queue.take();
        self.queue.finish_run(&self.item, next_queue);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
