//! Command-line interface for pkgorch.
//!
//! Provides a simulation driver for the orchestrator and a configuration dump.

mod commands;
mod simulation;

pub use commands::{parse_cli, run_with_cli, Cli, Commands, OutputFormat};
pub use simulation::{simulated_catalog, OperationReport, SimulationSettings};
