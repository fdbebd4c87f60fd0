//! Settings file and CLI overrides.
//!
//! Every field has a default, so an absent file or an empty one is valid.
//! Flags given on the command line win over the file.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use vsmerger_reconciler::{BackoffPolicy, ControllerConfig};

use crate::cli::Cli;

/// Namespace watched when neither the file nor the CLI names one.
pub const DEFAULT_NAMESPACE: &str = "istio-virtualservice-merger";

/// Requeue backoff for failed reconciles.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            base_ms: 5,
            max_ms: 300_000,
            jitter: true,
        }
    }
}

impl RetrySettings {
    fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.base_ms),
            max: Duration::from_millis(self.max_ms),
            use_jitter: self.jitter,
        }
    }
}

/// Retry of failed target-event routing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RoutingSettings {
    pub attempts: u32,
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_ms: 100,
            max_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub namespace: String,
    pub workers: usize,
    pub reconcile_timeout_secs: u64,
    /// Zero disables periodic resync.
    pub resync_period_secs: u64,
    pub shutdown_grace_secs: u64,
    /// How long `--once` waits for the queue to drain.
    pub idle_timeout_secs: u64,
    /// Route-list fields merged into targets.
    pub route_fields: Vec<String>,
    /// Most recent observability events kept in memory.
    pub recorded_events: usize,
    pub retry: RetrySettings,
    pub routing: RoutingSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            workers: 2,
            reconcile_timeout_secs: 30,
            resync_period_secs: 600,
            shutdown_grace_secs: 10,
            idle_timeout_secs: 60,
            route_fields: vec!["http".to_string(), "tcp".to_string(), "tls".to_string()],
            recorded_events: 256,
            retry: RetrySettings::default(),
            routing: RoutingSettings::default(),
        }
    }
}

impl Settings {
    /// Parse settings from TOML text.
    pub fn from_toml(input: &str) -> Result<Self> {
        toml::from_str(input).context("Invalid settings file")
    }

    /// Read settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        Self::from_toml(&content).with_context(|| format!("In {}", path.display()))
    }

    /// File settings (or defaults) with CLI flags applied on top.
    pub fn resolve(cli: &Cli) -> Result<Self> {
        let settings = match &cli.config {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        Ok(settings.with_overrides(cli))
    }

    #[must_use]
    pub fn with_overrides(mut self, cli: &Cli) -> Self {
        if let Some(namespace) = &cli.namespace {
            self.namespace.clone_from(namespace);
        }
        if let Some(workers) = cli.workers {
            self.workers = workers;
        }
        self
    }

    /// Runtime configuration for the controller.
    ///
    /// Validation happens when the controller is built.
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            namespace: self.namespace.clone(),
            workers: self.workers,
            reconcile_timeout: Duration::from_secs(self.reconcile_timeout_secs),
            resync_period: (self.resync_period_secs > 0)
                .then(|| Duration::from_secs(self.resync_period_secs)),
            backoff: self.retry.policy(),
            route_backoff: BackoffPolicy::new(
                Duration::from_millis(self.routing.base_ms),
                Duration::from_millis(self.routing.max_ms),
            ),
            route_attempts: self.routing.attempts,
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}
