// Process-wide engine settings
// Loaded once at startup from CODEGRADE_* environment variables

use crate::types::ReportMode;
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Which isolation primitive wraps each process launch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Local process with rlimits, private namespaces and /proc monitoring
    Process,
    /// One Docker container per launch
    Container,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "process" | "local" => Ok(BackendKind::Process),
            "container" | "docker" => Ok(BackendKind::Container),
            other => Err(format!("Unknown sandbox backend '{}'", other)),
        }
    }
}

/// What the process backend does when private namespaces (filesystem,
/// pid and network) cannot be created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkIsolation {
    /// Refuse to start without private namespaces
    Strict,
    /// Run unisolated, with rlimits and the /proc monitor only
    BestEffort,
}

impl FromStr for NetworkIsolation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(NetworkIsolation::Strict),
            "best-effort" | "best_effort" => Ok(NetworkIsolation::BestEffort),
            other => Err(format!("Unknown network isolation mode '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Concurrent sandboxes the host can safely run
    pub workers: usize,
    /// Submissions allowed to wait for a worker
    pub queue_capacity: usize,
    /// Wall-clock budget for all cases of one submission
    pub grading_deadline_ms: u64,
    pub report_mode: ReportMode,
    pub compile_once: bool,
    pub backend: BackendKind,
    pub network_isolation: NetworkIsolation,
    pub max_source_bytes: usize,
    /// Per-field cap for learner-visible diagnostic text
    pub diagnostic_bytes: usize,
    /// Parent directory for private sandbox scopes
    pub scratch_dir: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);

        Self {
            workers,
            queue_capacity: 256,
            grading_deadline_ms: 30_000,
            report_mode: ReportMode::Full,
            compile_once: false,
            backend: BackendKind::Process,
            network_isolation: NetworkIsolation::Strict,
            max_source_bytes: 1024 * 1024,
            diagnostic_bytes: 4096,
            scratch_dir: None,
        }
    }
}

impl EngineSettings {
    pub fn grading_deadline(&self) -> Duration {
        Duration::from_millis(self.grading_deadline_ms)
    }

    /// Load settings from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary key lookup, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(v) = lookup("CODEGRADE_WORKERS") {
            settings.workers = parse_var("CODEGRADE_WORKERS", &v)?;
            if settings.workers == 0 {
                bail!("CODEGRADE_WORKERS must be at least 1");
            }
        }
        if let Some(v) = lookup("CODEGRADE_QUEUE_CAPACITY") {
            settings.queue_capacity = parse_var("CODEGRADE_QUEUE_CAPACITY", &v)?;
            if settings.queue_capacity == 0 {
                bail!("CODEGRADE_QUEUE_CAPACITY must be at least 1");
            }
        }
        if let Some(v) = lookup("CODEGRADE_GRADING_DEADLINE_MS") {
            settings.grading_deadline_ms = parse_var("CODEGRADE_GRADING_DEADLINE_MS", &v)?;
        }
        if let Some(v) = lookup("CODEGRADE_REPORT_MODE") {
            settings.report_mode = parse_var("CODEGRADE_REPORT_MODE", &v)?;
        }
        if let Some(v) = lookup("CODEGRADE_COMPILE_ONCE") {
            settings.compile_once = v.to_lowercase() == "true" || v == "1";
        }
        if let Some(v) = lookup("CODEGRADE_BACKEND") {
            settings.backend = parse_var("CODEGRADE_BACKEND", &v)?;
        }
        if let Some(v) = lookup("CODEGRADE_NETWORK_ISOLATION") {
            settings.network_isolation = parse_var("CODEGRADE_NETWORK_ISOLATION", &v)?;
        }
        if let Some(v) = lookup("CODEGRADE_MAX_SOURCE_BYTES") {
            settings.max_source_bytes = parse_var("CODEGRADE_MAX_SOURCE_BYTES", &v)?;
        }
        if let Some(v) = lookup("CODEGRADE_DIAGNOSTIC_BYTES") {
            settings.diagnostic_bytes = parse_var("CODEGRADE_DIAGNOSTIC_BYTES", &v)?;
        }
        if let Some(v) = lookup("CODEGRADE_SCRATCH_DIR") {
            settings.scratch_dir = Some(PathBuf::from(v));
        }

        Ok(settings)
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| anyhow!("{}", e))
        .with_context(|| format!("Invalid value for {}: '{}'", key, value))
}
