//! Orchestrator configuration.
//!
//! This module provides the concurrency limits for each operation queue and
//! the routing table that maps command names to the queue that runs them.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;

use serde::Serialize;
use thiserror::Error;

use crate::command;

/// Queue shared by install, uninstall and repair commands.
pub const OPERATION_QUEUE: &str = "operation";

/// Queue used by download commands.
pub const DOWNLOAD_QUEUE: &str = command::DOWNLOAD;

/// Upper bound on the default number of download threads.
const MAX_DOWNLOAD_THREADS: usize = 3;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the operation orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorConfig {
    /// Worker count for queues without an explicit limit.
    pub default_concurrency: usize,
    /// Worker count per queue name.
    pub queue_limits: BTreeMap<String, usize>,
    /// Command name to queue name. Unlisted commands run in a queue named
    /// after the command.
    pub routes: BTreeMap<String, String>,
    /// Prefix for worker thread names.
    pub thread_name_prefix: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let mut queue_limits = BTreeMap::new();
        // Only one install-like operation may touch the system at a time.
        queue_limits.insert(OPERATION_QUEUE.to_string(), 1);
        queue_limits.insert(DOWNLOAD_QUEUE.to_string(), default_download_threads());

        let routes = [command::INSTALL, command::UNINSTALL, command::REPAIR]
            .into_iter()
            .map(|name| (name.to_string(), OPERATION_QUEUE.to_string()))
            .collect();

        Self {
            default_concurrency: 1,
            queue_limits,
            routes,
            thread_name_prefix: "pkgorch".to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `ORCHESTRATOR_DEFAULT_CONCURRENCY`: Workers for unlisted queues (default: 1)
    /// - `ORCHESTRATOR_OPERATION_THREADS`: Workers for the operation queue (default: 1)
    /// - `ORCHESTRATOR_DOWNLOAD_THREADS`: Workers for the download queue
    ///   (default: cores - 1, max 3)
    /// - `ORCHESTRATOR_QUEUE_LIMITS`: Comma-separated `queue=workers` overrides
    /// - `ORCHESTRATOR_THREAD_PREFIX`: Worker thread name prefix (default: pkgorch)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Creates configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("ORCHESTRATOR_DEFAULT_CONCURRENCY") {
            config.default_concurrency = parse_env_value(&val, "ORCHESTRATOR_DEFAULT_CONCURRENCY")?;
        }

        if let Some(val) = lookup("ORCHESTRATOR_OPERATION_THREADS") {
            let threads = parse_env_value(&val, "ORCHESTRATOR_OPERATION_THREADS")?;
            config.queue_limits.insert(OPERATION_QUEUE.to_string(), threads);
        }

        if let Some(val) = lookup("ORCHESTRATOR_DOWNLOAD_THREADS") {
            let threads = parse_env_value(&val, "ORCHESTRATOR_DOWNLOAD_THREADS")?;
            config.queue_limits.insert(DOWNLOAD_QUEUE.to_string(), threads);
        }

        if let Some(val) = lookup("ORCHESTRATOR_QUEUE_LIMITS") {
            for (queue, threads) in parse_queue_limits(&val)? {
                config.queue_limits.insert(queue, threads);
            }
        }

        if let Some(val) = lookup("ORCHESTRATOR_THREAD_PREFIX") {
            config.thread_name_prefix = val;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "default_concurrency must be greater than 0".to_string(),
            ));
        }

        if let Some((queue, _)) = self.queue_limits.iter().find(|(_, limit)| **limit == 0) {
            return Err(ConfigError::ValidationFailed(format!(
                "queue limit for '{}' must be greater than 0",
                queue
            )));
        }

        if let Some((command, _)) = self
            .routes
            .iter()
            .find(|(command, queue)| command.is_empty() || queue.is_empty())
        {
            return Err(ConfigError::ValidationFailed(format!(
                "route for command '{}' must name a non-empty queue",
                command
            )));
        }

        if self.thread_name_prefix.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "thread_name_prefix cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Returns the number of workers a queue with this name gets.
    pub fn concurrency_for(&self, queue: &str) -> usize {
        self.queue_limits
            .get(queue)
            .copied()
            .unwrap_or(self.default_concurrency)
    }

    /// Returns the name of the queue that runs the given command.
    pub fn queue_for_command<'a>(&'a self, command: &'a str) -> &'a str {
        self.routes.get(command).map(String::as_str).unwrap_or(command)
    }

    /// Builder method to set the default concurrency.
    pub fn with_default_concurrency(mut self, workers: usize) -> Self {
        self.default_concurrency = workers;
        self
    }

    /// Builder method to set the worker count of one queue.
    pub fn with_queue_limit(mut self, queue: impl Into<String>, workers: usize) -> Self {
        self.queue_limits.insert(queue.into(), workers);
        self
    }

    /// Builder method to route a command to a queue.
    pub fn with_route(mut self, command: impl Into<String>, queue: impl Into<String>) -> Self {
        self.routes.insert(command.into(), queue.into());
        self
    }

    /// Builder method to set the worker thread name prefix.
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }
}

/// One fewer than the available cores, between 1 and 3.
fn default_download_threads() -> usize {
    let cores = std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1);
    cores.saturating_sub(1).clamp(1, MAX_DOWNLOAD_THREADS)
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse `name=workers,name=workers` pairs.
fn parse_queue_limits(value: &str) -> Result<Vec<(String, usize)>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (queue, threads) =
                entry
                    .split_once('=')
                    .ok_or_else(|| ConfigError::InvalidValue {
                        key: "ORCHESTRATOR_QUEUE_LIMITS".to_string(),
                        message: format!("expected 'queue=workers', got '{}'", entry),
                    })?;
            let threads = parse_env_value(threads, "ORCHESTRATOR_QUEUE_LIMITS")?;
            Ok((queue.trim().to_string(), threads))
        })
        .collect()
}
