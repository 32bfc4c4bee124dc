//! [`ComponentMonitor`] – lifecycle and liveness record of every component.
//!
//! The [`ComponentScheduler`][crate::scheduler::ComponentScheduler] records
//! each lifecycle transition here; running components call
//! [`ComponentMonitor::heartbeat`] from their loop so that a supervisor can
//! spot a component that is still "running" but has stopped making progress.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a scheduled component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentState {
    /// Submitted, waiting for a free worker.
    Pending,
    /// `run()` is executing.
    Running,
    /// `run()` returned after the scheduler was shut down.
    Stopped,
    /// `run()` returned on its own. Components are expected to run forever.
    Exited,
    /// `run()` returned an error.
    Failed(String),
    /// `run()` panicked.
    Panicked(String),
}

impl ComponentState {
    /// `true` for states a component never leaves.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ComponentState::Pending | ComponentState::Running)
    }

    /// `true` for terminal states that indicate abnormal termination.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ComponentState::Exited | ComponentState::Failed(_) | ComponentState::Panicked(_)
        )
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentState::Pending => f.write_str("pending"),
            ComponentState::Running => f.write_str("running"),
            ComponentState::Stopped => f.write_str("stopped"),
            ComponentState::Exited => f.write_str("exited"),
            ComponentState::Failed(reason) => write!(f, "failed: {reason}"),
            ComponentState::Panicked(reason) => write!(f, "panicked: {reason}"),
        }
    }
}

/// Point-in-time view of one component.
#[derive(Debug, Clone)]
pub struct ComponentReport {
    pub name: String,
    pub state: ComponentState,
    /// Wall-clock time of the last state transition.
    pub since: DateTime<Utc>,
}

// ────────────────────────────────────────────────────────────────────────────
// Internal entry
// ────────────────────────────────────────────────────────────────────────────

struct ComponentEntry {
    state: ComponentState,
    since: DateTime<Utc>,
    last_heartbeat: Instant,
}

// ────────────────────────────────────────────────────────────────────────────
// ComponentMonitor
// ────────────────────────────────────────────────────────────────────────────

/// Shared registry of component states. Clone it cheaply – all clones see
/// the same records.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use guidance_kernel::health::{ComponentMonitor, ComponentState};
///
/// let monitor = ComponentMonitor::new();
/// monitor.register("tracking");
/// monitor.transition("tracking", ComponentState::Running);
/// monitor.heartbeat("tracking");
///
/// assert_eq!(monitor.state("tracking"), Some(ComponentState::Running));
/// assert!(monitor.stale(Duration::from_secs(60)).is_empty());
/// ```
#[derive(Clone, Default)]
pub struct ComponentMonitor {
    components: Arc<Mutex<HashMap<String, ComponentEntry>>>,
}

impl ComponentMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `name` as [`ComponentState::Pending`].
    ///
    /// Returns `false` (and changes nothing) if `name` is already known, so a
    /// component can only ever be registered once.
    pub fn register(&self, name: &str) -> bool {
        let mut components = self.lock();
        if components.contains_key(name) {
            return false;
        }
        components.insert(
            name.to_string(),
            ComponentEntry {
                state: ComponentState::Pending,
                since: Utc::now(),
                last_heartbeat: Instant::now(),
            },
        );
        true
    }

    /// Move `name` to `state`. No-ops for unknown components.
    pub fn transition(&self, name: &str, state: ComponentState) {
        if let Some(entry) = self.lock().get_mut(name) {
            entry.state = state;
            entry.since = Utc::now();
            entry.last_heartbeat = Instant::now();
        }
    }

    /// Record progress for `name`. No-ops for unknown components.
    pub fn heartbeat(&self, name: &str) {
        if let Some(entry) = self.lock().get_mut(name) {
            entry.last_heartbeat = Instant::now();
        }
    }

    /// Current state of `name`, or `None` if it was never registered.
    pub fn state(&self, name: &str) -> Option<ComponentState> {
        self.lock().get(name).map(|e| e.state.clone())
    }

    /// Names of running components whose last heartbeat is older than
    /// `timeout`. The order of the returned list is unspecified.
    pub fn stale(&self, timeout: Duration) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|(_, e)| e.state == ComponentState::Running)
            .filter(|(_, e)| e.last_heartbeat.elapsed() > timeout)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Reports for every registered component, sorted by name.
    pub fn snapshot(&self) -> Vec<ComponentReport> {
        let mut reports: Vec<ComponentReport> = self
            .lock()
            .iter()
            .map(|(name, e)| ComponentReport {
                name: name.clone(),
                state: e.state.clone(),
                since: e.since,
            })
            .collect();
        reports.sort_by(|a, b| a.name.cmp(&b.name));
        reports
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ComponentEntry>> {
        self.components.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn registered_component_is_pending() {
        let monitor = ComponentMonitor::new();
        assert!(monitor.register("arbitrator"));
        assert_eq!(monitor.state("arbitrator"), Some(ComponentState::Pending));
    }

    #[test]
    fn register_is_once_only() {
        let monitor = ComponentMonitor::new();
        assert!(monitor.register("arbitrator"));
        monitor.transition("arbitrator", ComponentState::Running);
        assert!(!monitor.register("arbitrator"));
        assert_eq!(monitor.state("arbitrator"), Some(ComponentState::Running));
    }

    #[test]
    fn unknown_component_has_no_state() {
        let monitor = ComponentMonitor::new();
        assert_eq!(monitor.state("ghost"), None);
        // Should not panic.
        monitor.heartbeat("ghost");
        monitor.transition("ghost", ComponentState::Running);
        assert_eq!(monitor.state("ghost"), None);
    }

    #[test]
    fn silent_running_component_goes_stale() {
        let monitor = ComponentMonitor::new();
        monitor.register("fast");
        monitor.register("slow");
        monitor.transition("fast", ComponentState::Running);
        monitor.transition("slow", ComponentState::Running);

        thread::sleep(Duration::from_millis(30));
        monitor.heartbeat("slow");

        assert_eq!(monitor.stale(Duration::from_millis(20)), vec!["fast".to_string()]);
    }

    #[test]
    fn terminal_components_are_never_stale() {
        let monitor = ComponentMonitor::new();
        monitor.register("done");
        monitor.transition("done", ComponentState::Failed("boom".into()));
        thread::sleep(Duration::from_millis(30));
        assert!(monitor.stale(Duration::from_millis(20)).is_empty());
    }

    #[test]
    fn snapshot_is_sorted_by_name() {
        let monitor = ComponentMonitor::new();
        monitor.register("tracking");
        monitor.register("arbitrator");
        let names: Vec<_> = monitor.snapshot().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["arbitrator", "tracking"]);
    }

    #[test]
    fn state_classification() {
        assert!(!ComponentState::Running.is_terminal());
        assert!(ComponentState::Stopped.is_terminal());
        assert!(!ComponentState::Stopped.is_fatal());
        assert!(ComponentState::Exited.is_fatal());
        assert!(ComponentState::Panicked("x".into()).is_fatal());
        assert_eq!(ComponentState::Failed("io".into()).to_string(), "failed: io");
    }
}
