//! The four long-lived guidance components.
//!
//! Their guidance algorithms live elsewhere; from the bus's point of view
//! each component is a black box that
//!
//! 1. listens on the `system_alert` topic,
//! 2. publishes a [`ComponentStatus`] on `guidance/<name>/status` every
//!    tick, and
//! 3. runs until the scheduler cancels it.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use guidance_kernel::{CancellableLoop, ComponentTask, LoopError, LoopState, PeriodicTask, TaskContext};
use guidance_middleware::{ChannelRegistry, PublicationChannel};
use guidance_types::{ComponentStatus, GuidanceError, SYSTEM_ALERT_TOPIC, Severity, SystemAlert};
use tracing::{debug, warn};

/// Which guidance subsystem a [`GuidanceComponent`] stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    Arbitrator,
    PluginManager,
    TrajectoryExecutor,
    Tracking,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 4] = [
        ComponentKind::Arbitrator,
        ComponentKind::PluginManager,
        ComponentKind::TrajectoryExecutor,
        ComponentKind::Tracking,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ComponentKind::Arbitrator => "arbitrator",
            ComponentKind::PluginManager => "plugin_manager",
            ComponentKind::TrajectoryExecutor => "trajectory_executor",
            ComponentKind::Tracking => "tracking",
        }
    }

    /// Topic this component publishes its [`ComponentStatus`] on.
    pub fn status_topic(self) -> String {
        format!("guidance/{}/status", self.name())
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A guidance component bound to the shared [`ChannelRegistry`].
pub struct GuidanceComponent {
    kind: ComponentKind,
    registry: ChannelRegistry,
    tick: Duration,
}

impl GuidanceComponent {
    pub fn new(kind: ComponentKind, registry: ChannelRegistry, tick: Duration) -> Self {
        Self { kind, registry, tick }
    }

    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    /// React to one system alert. Runs on the publisher's thread.
    fn on_alert(kind: ComponentKind, alert: &SystemAlert) {
        match (kind, alert.severity()) {
            (ComponentKind::Arbitrator, Some(Severity::Fatal)) => {
                warn!(component = %kind, description = %alert.description, "fatal alert; arbitration should stop planning");
            }
            (ComponentKind::Tracking, _) => {
                debug!(
                    component = %kind,
                    alert_type = alert.alert_type,
                    description = %alert.description,
                    "alert observed"
                );
            }
            _ => {}
        }
    }
}

#[async_trait]
impl ComponentTask for GuidanceComponent {
    fn name(&self) -> &str {
        self.kind.name()
    }

    async fn run(&self, ctx: TaskContext) -> Result<(), GuidanceError> {
        let alerts = self
            .registry
            .get_subscription_channel::<SystemAlert>(SYSTEM_ALERT_TOPIC)?;
        let status = self
            .registry
            .get_publication_channel::<ComponentStatus>(&self.kind.status_topic())?;

        let alerts_seen = Arc::new(AtomicU64::new(0));
        let kind = self.kind;
        let handler = alerts.register_on_message_callback({
            let alerts_seen = Arc::clone(&alerts_seen);
            move |alert: &SystemAlert| {
                alerts_seen.fetch_add(1, Ordering::Relaxed);
                GuidanceComponent::on_alert(kind, alert);
                Ok(())
            }
        });

        let mut body = StatusLoop {
            kind,
            tick: 0,
            alerts_seen,
            status,
            ctx: ctx.clone(),
        };
        let mut task = PeriodicTask::new(kind.name(), self.tick);
        let state = task.run(&mut body, ctx.token()).await;
        alerts.unregister(handler);

        match state {
            LoopState::Failed => Err(GuidanceError::ComponentFailed {
                component: kind.name().to_string(),
                reason: "status loop failed".to_string(),
            }),
            _ => Ok(()),
        }
    }
}

/// Per-tick body of a component: publish status and record progress.
struct StatusLoop {
    kind: ComponentKind,
    tick: u64,
    alerts_seen: Arc<AtomicU64>,
    status: PublicationChannel<ComponentStatus>,
    ctx: TaskContext,
}

#[async_trait]
impl CancellableLoop for StatusLoop {
    async fn setup(&mut self) -> Result<(), LoopError> {
        self.tick = 0;
        Ok(())
    }

    async fn iterate(&mut self) -> Result<(), LoopError> {
        let mut status = self.status.new_message();
        status.component = self.kind.name().to_string();
        status.tick = self.tick;
        status.alerts_seen = self.alerts_seen.load(Ordering::Relaxed);
        status.timestamp = Utc::now();
        self.status.publish(status);

        self.ctx.heartbeat();
        self.tick += 1;
        Ok(())
    }
}

/// One component of each kind, all bound to `registry`.
pub fn guidance_components(registry: &ChannelRegistry, tick: Duration) -> Vec<Arc<dyn ComponentTask>> {
    ComponentKind::ALL
        .into_iter()
        .map(|kind| Arc::new(GuidanceComponent::new(kind, registry.clone(), tick)) as Arc<dyn ComponentTask>)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use guidance_kernel::{ComponentScheduler, ComponentState};
    use std::sync::Mutex;

    const TICK: Duration = Duration::from_millis(100);

    #[test]
    fn names_and_status_topics_are_unique() {
        let mut names: Vec<_> = ComponentKind::ALL.iter().map(|k| k.name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 4);
        assert_eq!(
            ComponentKind::Tracking.status_topic(),
            "guidance/tracking/status"
        );
    }

    #[test]
    fn builds_one_component_per_kind() {
        let registry = ChannelRegistry::new();
        let names: Vec<String> = guidance_components(&registry, TICK)
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["arbitrator", "plugin_manager", "trajectory_executor", "tracking"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn component_publishes_status_and_counts_alerts() -> Result<(), GuidanceError> {
        let registry = ChannelRegistry::new();
        let statuses = Arc::new(Mutex::new(Vec::new()));
        registry
            .get_subscription_channel::<ComponentStatus>(&ComponentKind::Arbitrator.status_topic())?
            .register_on_message_callback({
                let statuses = Arc::clone(&statuses);
                move |s: &ComponentStatus| {
                    statuses.lock().unwrap().push(s.clone());
                    Ok(())
                }
            });

        let component: Arc<dyn ComponentTask> = Arc::new(GuidanceComponent::new(
            ComponentKind::Arbitrator,
            registry.clone(),
            TICK,
        ));
        let mut scheduler = ComponentScheduler::new(1)?;
        scheduler.start(vec![component]);
        tokio::time::sleep(TICK * 2 + TICK / 2).await;

        let alerts = registry.get_publication_channel::<SystemAlert>(SYSTEM_ALERT_TOPIC)?;
        let mut alert = alerts.new_message();
        alert.set_severity(Severity::Fatal);
        let report = alerts.publish(alert);
        assert_eq!(report.delivered, 1);

        tokio::time::sleep(TICK).await;
        scheduler.shutdown();
        scheduler.join().await;

        let statuses = statuses.lock().unwrap();
        let ticks: Vec<u64> = statuses.iter().map(|s| s.tick).collect();
        assert_eq!(ticks, vec![0, 1, 2, 3]);
        assert!(statuses.iter().all(|s| s.component == "arbitrator"));
        assert_eq!(statuses.last().map(|s| s.alerts_seen), Some(1));
        assert_eq!(
            scheduler.monitor().state("arbitrator"),
            Some(ComponentState::Stopped)
        );
        // The alert handler is removed once the component stops.
        assert_eq!(
            registry
                .get_subscription_channel::<SystemAlert>(SYSTEM_ALERT_TOPIC)?
                .handler_count(),
            0
        );
        Ok(())
    }

    #[tokio::test]
    async fn conflicting_topic_type_fails_the_component() -> Result<(), GuidanceError> {
        let registry = ChannelRegistry::new();
        registry.get_publication_channel::<u32>(SYSTEM_ALERT_TOPIC)?;

        let component: Arc<dyn ComponentTask> = Arc::new(GuidanceComponent::new(
            ComponentKind::Tracking,
            registry.clone(),
            TICK,
        ));
        let mut scheduler = ComponentScheduler::new(1)?;
        scheduler.start(vec![component]);
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(matches!(
            scheduler.monitor().state("tracking"),
            Some(ComponentState::Failed(_))
        ));
        scheduler.shutdown();
        scheduler.join().await;
        Ok(())
    }
}
