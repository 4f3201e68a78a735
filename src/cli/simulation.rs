//! Simulated package commands and the report printed by `pkgorch simulate`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use crate::command::{self, Command, CommandRegistry, FnCommand};
use crate::context::{ExecutionContext, ExecutionStage};
use crate::error::CommandError;
use crate::orchestrator::{OperationType, QueueItem};

/// Version given to every simulated manifest.
pub const SIMULATED_VERSION: &str = "1.0.0";

/// Timing and failure knobs shared by all simulated commands.
#[derive(Debug, Clone)]
pub struct SimulationSettings {
    pub steps: u64,
    pub step_delay: Duration,
    /// Lowercased ids of packages whose install, uninstall or repair fails.
    pub fail: HashSet<String>,
}

impl SimulationSettings {
    pub fn new(steps: u64, step_delay: Duration, fail: &[String]) -> Self {
        Self {
            steps,
            step_delay,
            fail: fail.iter().map(|id| id.to_lowercase()).collect(),
        }
    }

    fn should_fail(&self, context: &ExecutionContext) -> bool {
        context
            .manifest()
            .is_some_and(|m| self.fail.contains(&m.id.to_lowercase()))
    }
}

/// Catalog with one simulated command per well-known command name.
pub fn simulated_catalog(settings: SimulationSettings) -> CommandRegistry {
    let settings = Arc::new(settings);
    CommandRegistry::new()
        .with(simulated_command(command::DOWNLOAD, ExecutionStage::Download, &settings))
        .with(simulated_command(command::INSTALL, ExecutionStage::Execution, &settings))
        .with(simulated_command(command::UNINSTALL, ExecutionStage::Execution, &settings))
        .with(simulated_command(command::REPAIR, ExecutionStage::Execution, &settings))
}

fn simulated_command(
    name: &'static str,
    stage: ExecutionStage,
    settings: &Arc<SimulationSettings>,
) -> Arc<dyn Command> {
    let settings = Arc::clone(settings);
    FnCommand::new(name, move |ctx| {
        ctx.set_stage(stage);
        for step in 0..settings.steps {
            ctx.check_cancelled(name)?;
            ctx.report_progress(step, settings.steps);
            std::thread::sleep(settings.step_delay);
        }
        ctx.check_cancelled(name)?;

        if name != command::DOWNLOAD && settings.should_fail(ctx) {
            return Err(CommandError::failed(name, "simulated failure"));
        }
        ctx.report_progress(settings.steps, settings.steps);
        Ok(())
    })
    .shared()
}

/// Attaches a debug log line to every progress report of the context.
pub fn log_progress(context: &ExecutionContext, package_id: &str) {
    let package_id = package_id.to_string();
    context.add_progress_callback(move |report| {
        debug!(
            package_id = %package_id,
            stage = ?report.stage,
            current = report.current,
            maximum = report.maximum,
            "Progress"
        );
    });
}

/// One line of the simulation report.
#[derive(Debug, Clone, Serialize)]
pub struct OperationReport {
    pub package_id: String,
    pub source_id: String,
    pub operation: OperationType,
    pub status: String,
    pub detail: Option<String>,
    pub duration_ms: i64,
}

impl OperationReport {
    /// Report for an item that has completed.
    pub fn completed(item: &QueueItem) -> Self {
        let context = item.context();
        Self {
            package_id: item.id().package_id().to_string(),
            source_id: item.id().source_id().to_string(),
            operation: item.operation_type(),
            status: context.status().to_string(),
            detail: context.termination_result().map(|r| r.to_string()),
            duration_ms: (Utc::now() - item.created_at()).num_milliseconds(),
        }
    }

    /// Report for an item the orchestrator refused to admit.
    pub fn rejected(item: &QueueItem, reason: impl Into<String>) -> Self {
        Self {
            package_id: item.id().package_id().to_string(),
            source_id: item.id().source_id().to_string(),
            operation: item.operation_type(),
            status: "rejected".to_string(),
            detail: Some(reason.into()),
            duration_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandCatalog;
    use crate::context::{CancelReason, OperationStatus};
    use crate::orchestrator::OperationIdentity;
    use crate::source::Manifest;

    fn settings(fail: &[&str]) -> SimulationSettings {
        let fail: Vec<String> = fail.iter().map(|s| s.to_string()).collect();
        SimulationSettings::new(2, Duration::from_millis(1), &fail)
    }

    #[test]
    fn test_catalog_has_all_commands() {
        let catalog = simulated_catalog(settings(&[]));
        for name in [command::DOWNLOAD, command::INSTALL, command::UNINSTALL, command::REPAIR] {
            assert!(catalog.command(name).is_some(), "missing {}", name);
        }
    }

    #[test]
    fn test_failure_applies_to_listed_package_only() {
        let catalog = simulated_catalog(settings(&["Contoso.Broken"]));
        let install = catalog.command(command::INSTALL).unwrap();
        let download = catalog.command(command::DOWNLOAD).unwrap();

        let broken = ExecutionContext::new().with_manifest(Manifest::new("contoso.broken", "1.0"));
        assert!(download.execute(&broken).is_ok());
        assert!(install.execute(&broken).is_err());

        let fine = ExecutionContext::new().with_manifest(Manifest::new("Contoso.App", "1.0"));
        assert!(install.execute(&fine).is_ok());
        assert_eq!(fine.stage(), ExecutionStage::Execution);
    }

    #[test]
    fn test_simulated_command_observes_cancellation() {
        let catalog = simulated_catalog(settings(&[]));
        let install = catalog.command(command::INSTALL).unwrap();
        let ctx = ExecutionContext::new();
        ctx.cancel(CancelReason::Abort);

        assert_eq!(
            install.execute(&ctx).unwrap_err(),
            CommandError::Cancelled(command::INSTALL.to_string())
        );
    }

    #[test]
    fn test_reports() {
        let item = QueueItem::new(
            OperationIdentity::new("Contoso.App", "community"),
            OperationType::Upgrade,
            ExecutionContext::new(),
        );

        let rejected = OperationReport::rejected(&item, "already in progress");
        assert_eq!(rejected.status, "rejected");

        item.context().cancel(CancelReason::Abort);
        let completed = OperationReport::completed(&item);
        assert_eq!(completed.status, OperationStatus::Cancelled.to_string());
        assert_eq!(completed.detail.as_deref(), Some("cancelled: aborted"));

        let json = serde_json::to_value(&completed).unwrap();
        assert_eq!(json["operation"], "upgrade");
    }
}
