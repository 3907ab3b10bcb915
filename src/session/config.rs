//! Session configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default wall-clock budget for one mutant's test run.
pub const DEFAULT_MUTANT_TIMEOUT_MS: u64 = 10_000;

/// Score bands used when grading a report.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Thresholds {
    /// Scores at or above this are "high".
    pub high: f64,
    /// Scores below this are "low".
    pub low: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            high: 80.0,
            low: 60.0,
        }
    }
}

/// Configuration for one mutation test session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Hard per-mutant timeout in milliseconds.
    pub mutant_timeout_ms: u64,
    /// Optional bound for the baseline test run. Unbounded when unset.
    pub baseline_timeout_ms: Option<u64>,
    /// Number of mutants evaluated at once. Values below 1 are treated as 1.
    pub concurrency: usize,
    /// Classify a mutant as an execution error when its sandbox fails,
    /// instead of aborting the session.
    pub isolate_sandbox_failures: bool,
    /// Report score bands.
    pub thresholds: Thresholds,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mutant_timeout_ms: DEFAULT_MUTANT_TIMEOUT_MS,
            baseline_timeout_ms: None,
            concurrency: 1,
            isolate_sandbox_failures: true,
            thresholds: Thresholds::default(),
        }
    }
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// File is not a valid config document.
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
}

impl SessionConfig {
    /// Load a JSON config file. Missing fields keep their defaults.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Set the per-mutant timeout.
    pub fn with_mutant_timeout(mut self, timeout: Duration) -> Self {
        self.mutant_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Bound the baseline test run.
    pub fn with_baseline_timeout(mut self, timeout: Duration) -> Self {
        self.baseline_timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }

    /// Set the worker pool size.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Choose between per-mutant isolation and session abort on sandbox failures.
    pub fn with_isolated_sandbox_failures(mut self, isolate: bool) -> Self {
        self.isolate_sandbox_failures = isolate;
        self
    }

    /// Set report thresholds.
    pub fn with_thresholds(mut self, thresholds: Thresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub(crate) fn mutant_timeout(&self) -> Duration {
        Duration::from_millis(self.mutant_timeout_ms)
    }

    pub(crate) fn baseline_timeout(&self) -> Option<Duration> {
        self.baseline_timeout_ms.map(Duration::from_millis)
    }

    pub(crate) fn effective_concurrency(&self) -> usize {
        self.concurrency.max(1)
    }
}
