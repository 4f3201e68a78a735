//! Execution context shared between the orchestrator and the commands it runs.
//!
//! The orchestrator only touches the cancellation and termination slots.
//! Commands additionally read the manifest, report progress and exchange
//! values through the keyed data bag.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::CommandError;
use crate::source::Manifest;

/// Why an operation was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// The caller asked for this operation to stop.
    Abort,
    /// A console or process termination signal arrived.
    CtrlSignal,
    /// The hosting process is shutting down.
    AppShutdown,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Abort => write!(f, "aborted"),
            CancelReason::CtrlSignal => write!(f, "termination signal"),
            CancelReason::AppShutdown => write!(f, "application shutdown"),
        }
    }
}

/// Terminal result recorded on a context that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationResult {
    /// The operation was deliberately cancelled.
    Cancelled(CancelReason),
    /// A command failed or faulted.
    Failed(CommandError),
}

impl TerminationResult {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TerminationResult::Cancelled(_))
    }
}

impl fmt::Display for TerminationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationResult::Cancelled(reason) => write!(f, "cancelled: {}", reason),
            TerminationResult::Failed(err) => write!(f, "failed: {}", err),
        }
    }
}

/// Outcome reported upward once an operation has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationStatus::Succeeded => write!(f, "succeeded"),
            OperationStatus::Failed => write!(f, "failed"),
            OperationStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Coarse phase of an operation, set by commands as they progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStage {
    #[default]
    Initial,
    Discovery,
    Download,
    Execution,
    PostExecution,
}

/// Progress reported by a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressReport {
    pub current: u64,
    pub maximum: u64,
    pub stage: ExecutionStage,
}

type ProgressCallback = Arc<dyn Fn(ProgressReport) + Send + Sync>;

/// Per-operation state handed to every command of a queue item.
pub struct ExecutionContext {
    cancellation: CancellationToken,
    cancel_reason: Mutex<Option<CancelReason>>,
    termination: Mutex<Option<TerminationResult>>,
    stage: Mutex<ExecutionStage>,
    manifest: Option<Manifest>,
    data: RwLock<HashMap<String, serde_json::Value>>,
    progress: Mutex<Vec<ProgressCallback>>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            cancellation: CancellationToken::new(),
            cancel_reason: Mutex::new(None),
            termination: Mutex::new(None),
            stage: Mutex::new(ExecutionStage::Initial),
            manifest: None,
            data: RwLock::new(HashMap::new()),
            progress: Mutex::new(Vec::new()),
        }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("cancelled", &self.is_cancelled())
            .field("termination", &*self.termination.lock())
            .field("stage", &*self.stage.lock())
            .field("manifest", &self.manifest)
            .finish_non_exhaustive()
    }
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches the manifest of the package being operated on.
    pub fn with_manifest(mut self, manifest: Manifest) -> Self {
        self.manifest = Some(manifest);
        self
    }

    pub fn manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    /// Token that fires when cancellation is requested.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Requests cancellation and records it as the terminal result,
    /// unless the context already terminated for another reason.
    pub fn cancel(&self, reason: CancelReason) {
        {
            let mut current = self.cancel_reason.lock();
            if current.is_none() {
                *current = Some(reason);
            }
        }
        self.terminate(TerminationResult::Cancelled(reason));
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        *self.cancel_reason.lock()
    }

    /// Returns `Err(CommandError::Cancelled)` once cancellation has been requested.
    ///
    /// Commands call this between their internal steps.
    pub fn check_cancelled(&self, command: &str) -> Result<(), CommandError> {
        if self.is_cancelled() {
            Err(CommandError::Cancelled(command.to_string()))
        } else {
            Ok(())
        }
    }

    /// Records a terminal result. The first result wins; returns whether
    /// this call set it.
    pub fn terminate(&self, result: TerminationResult) -> bool {
        let mut termination = self.termination.lock();
        if termination.is_some() {
            return false;
        }
        *termination = Some(result);
        true
    }

    pub fn is_terminated(&self) -> bool {
        self.termination.lock().is_some()
    }

    pub fn termination_result(&self) -> Option<TerminationResult> {
        self.termination.lock().clone()
    }

    /// Outcome as seen from the current terminal result.
    ///
    /// Only meaningful once the owning item has completed.
    pub fn status(&self) -> OperationStatus {
        match &*self.termination.lock() {
            None => OperationStatus::Succeeded,
            Some(TerminationResult::Cancelled(_)) => OperationStatus::Cancelled,
            Some(TerminationResult::Failed(_)) => OperationStatus::Failed,
        }
    }

    pub fn stage(&self) -> ExecutionStage {
        *self.stage.lock()
    }

    pub fn set_stage(&self, stage: ExecutionStage) {
        *self.stage.lock() = stage;
    }

    /// Stores a value in the keyed data bag.
    pub fn insert<T: Serialize>(
        &self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(value)?;
        self.data.write().insert(key.into(), value);
        Ok(())
    }

    /// Reads a value from the keyed data bag.
    ///
    /// Returns `None` when the key is absent or holds a different type.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let data = self.data.read();
        let value = data.get(key)?;
        serde_json::from_value(value.clone()).ok()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.read().contains_key(key)
    }

    /// Registers a callback invoked on every progress report.
    pub fn add_progress_callback<F>(&self, callback: F)
    where
        F: Fn(ProgressReport) + Send + Sync + 'static,
    {
        self.progress.lock().push(Arc::new(callback));
    }

    /// Reports progress for the current stage to every registered callback.
    pub fn report_progress(&self, current: u64, maximum: u64) {
        let report = ProgressReport {
            current,
            maximum,
            stage: self.stage(),
        };
        // Callbacks run without the lock held so they may register more.
        let callbacks: Vec<ProgressCallback> = self.progress.lock().clone();
        for callback in callbacks {
            callback(report);
        }
    }
}
