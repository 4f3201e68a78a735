//! Fan-out of process termination signals to running operations.
//!
//! Every item registers its execution context while its commands run. A
//! termination signal cancels all registered contexts at once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::context::{CancelReason, ExecutionContext};

/// Registry of contexts that should observe termination signals.
#[derive(Debug, Default)]
pub struct TerminationDispatcher {
    next_id: AtomicU64,
    contexts: Mutex<HashMap<u64, Arc<ExecutionContext>>>,
}

impl TerminationDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a context until the returned guard is dropped.
    pub fn register(self: &Arc<Self>, context: Arc<ExecutionContext>) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().insert(id, context);
        Registration {
            id,
            dispatcher: Arc::clone(self),
        }
    }

    /// Cancels every registered context. Returns how many were cancelled.
    pub fn dispatch(&self, reason: CancelReason) -> usize {
        // Cancel outside the lock so contexts may deregister concurrently.
        let contexts: Vec<_> = self.contexts.lock().values().cloned().collect();
        for context in &contexts {
            context.cancel(reason);
        }
        info!(reason = %reason, contexts = contexts.len(), "Dispatched termination signal");
        contexts.len()
    }

    pub fn registered(&self) -> usize {
        self.contexts.lock().len()
    }

    fn unregister(&self, id: u64) {
        self.contexts.lock().remove(&id);
    }
}

/// Keeps a context registered with a [`TerminationDispatcher`].
#[must_use = "the context is unregistered when the registration is dropped"]
pub struct Registration {
    id: u64,
    dispatcher: Arc<TerminationDispatcher>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.dispatcher.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_cancels_registered_contexts() {
        let dispatcher = Arc::new(TerminationDispatcher::new());
        let a = Arc::new(ExecutionContext::new());
        let b = Arc::new(ExecutionContext::new());

        let _ra = dispatcher.register(Arc::clone(&a));
        let _rb = dispatcher.register(Arc::clone(&b));
        assert_eq!(dispatcher.registered(), 2);

        assert_eq!(dispatcher.dispatch(CancelReason::CtrlSignal), 2);
        assert_eq!(a.cancel_reason(), Some(CancelReason::CtrlSignal));
        assert_eq!(b.cancel_reason(), Some(CancelReason::CtrlSignal));
    }

    #[test]
    fn test_dropped_registration_is_not_cancelled() {
        let dispatcher = Arc::new(TerminationDispatcher::new());
        let ctx = Arc::new(ExecutionContext::new());

        let registration = dispatcher.register(Arc::clone(&ctx));
        drop(registration);

        assert_eq!(dispatcher.registered(), 0);
        assert_eq!(dispatcher.dispatch(CancelReason::AppShutdown), 0);
        assert!(!ctx.is_cancelled());
    }
}
