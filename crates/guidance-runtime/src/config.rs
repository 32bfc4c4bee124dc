//! Startup configuration – reads `~/.guidance/config.toml` plus `GUIDANCE_*`
//! environment overrides.
//!
//! The run identifier has no default: a process without one refuses to
//! start, so a bad deployment is caught at launch rather than at the first
//! heartbeat.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use guidance_types::{GuidanceError, Severity};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Number of long-lived guidance components the orchestrator schedules.
pub const COMPONENT_COUNT: usize = 4;

/// Upper bound on `worker_threads`.
pub const MAX_WORKER_THREADS: usize = 1024;

/// Guidance process configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuidanceConfig {
    /// Identifier of this run, embedded verbatim in heartbeat descriptions.
    #[serde(default)]
    pub run_id: String,

    /// Size of the component worker pool. Must host every component.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    /// Seconds between two heartbeat alerts.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Severity stamped on heartbeat alerts.
    #[serde(default = "default_heartbeat_severity")]
    pub heartbeat_severity: Severity,

    /// Cadence of each component's status loop, in milliseconds.
    #[serde(default = "default_component_tick_millis")]
    pub component_tick_millis: u64,
}

fn default_worker_threads() -> usize {
    COMPONENT_COUNT
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_heartbeat_severity() -> Severity {
    Severity::Caution
}
fn default_component_tick_millis() -> u64 {
    1000
}

impl Default for GuidanceConfig {
    fn default() -> Self {
        Self {
            run_id: String::new(),
            worker_threads: default_worker_threads(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_severity: default_heartbeat_severity(),
            component_tick_millis: default_component_tick_millis(),
        }
    }
}

impl GuidanceConfig {
    /// Default configuration for run `run_id`.
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            ..Self::default()
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn component_tick(&self) -> Duration {
        Duration::from_millis(self.component_tick_millis)
    }

    /// Reject configurations the process cannot start with.
    ///
    /// # Errors
    ///
    /// [`GuidanceError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<(), GuidanceError> {
        if self.run_id.trim().is_empty() {
            return Err(GuidanceError::Config(
                "run_id is missing (set it in the config file or GUIDANCE_RUN_ID)".to_string(),
            ));
        }
        if self.run_id.chars().any(char::is_control) {
            return Err(GuidanceError::Config(format!(
                "run_id {:?} contains control characters",
                self.run_id
            )));
        }
        if self.worker_threads == 0 {
            return Err(GuidanceError::Config("worker_threads must be at least 1".to_string()));
        }
        if self.worker_threads > MAX_WORKER_THREADS {
            return Err(GuidanceError::Config(format!(
                "worker_threads = {} exceeds the maximum of {MAX_WORKER_THREADS}",
                self.worker_threads
            )));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(GuidanceError::Config(
                "heartbeat_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.component_tick_millis == 0 {
            return Err(GuidanceError::Config(
                "component_tick_millis must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Return the path to `~/.guidance/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(
        &std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .unwrap_or_else(|_| ".".to_string()),
    )
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".guidance").join("config.toml")
}

/// Load, override, and validate the startup configuration.
///
/// With `path` set the file must exist. Without it, `~/.guidance/config.toml`
/// is read when present and the defaults are used otherwise.
///
/// # Errors
///
/// [`GuidanceError::Config`] when the file is unreadable or malformed, or the
/// final configuration fails [`GuidanceConfig::validate`].
pub fn load(path: Option<&Path>) -> Result<GuidanceConfig, GuidanceError> {
    let mut cfg = match path {
        Some(path) => load_from(path)?.ok_or_else(|| {
            GuidanceError::Config(format!("config file {} does not exist", path.display()))
        })?,
        None => load_from(&config_path())?.unwrap_or_default(),
    };
    apply_env_overrides(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

/// Parse the config at `path`. Returns `None` if the file does not exist.
pub fn load_from(path: &Path) -> Result<Option<GuidanceConfig>, GuidanceError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|e| {
        GuidanceError::Config(format!("failed to read config at {}: {e}", path.display()))
    })?;
    let cfg = toml::from_str(&raw).map_err(|e| {
        GuidanceError::Config(format!("failed to parse config at {}: {e}", path.display()))
    })?;
    Ok(Some(cfg))
}

/// Apply `GUIDANCE_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `GUIDANCE_RUN_ID` | `run_id` |
/// | `GUIDANCE_WORKER_THREADS` | `worker_threads` |
/// | `GUIDANCE_HEARTBEAT_SECS` | `heartbeat_interval_secs` |
/// | `GUIDANCE_COMPONENT_TICK_MS` | `component_tick_millis` |
///
/// Unparsable numbers are logged and ignored.
pub fn apply_env_overrides(cfg: &mut GuidanceConfig) {
    if let Ok(v) = std::env::var("GUIDANCE_RUN_ID") {
        cfg.run_id = v;
    }
    if let Some(n) = parse_env("GUIDANCE_WORKER_THREADS") {
        cfg.worker_threads = n;
    }
    if let Some(n) = parse_env("GUIDANCE_HEARTBEAT_SECS") {
        cfg.heartbeat_interval_secs = n;
    }
    if let Some(n) = parse_env("GUIDANCE_COMPONENT_TICK_MS") {
        cfg.component_tick_millis = n;
    }
}

fn parse_env<T: std::str::FromStr>(var: &str) -> Option<T> {
    let raw = std::env::var(var).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(variable = var, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}
