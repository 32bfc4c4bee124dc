//! [`Orchestrator`] – composition root of the guidance process.
//!
//! On [`Orchestrator::run`]:
//!
//! 1. the [`ChannelRegistry`] (built in [`Orchestrator::new`]) resolves the
//!    `system_alert` channel pair, so a topic type conflict aborts startup
//!    before any component runs;
//! 2. the four guidance components are built with the registry injected and
//!    handed to a [`ComponentScheduler`] sized from the config;
//! 3. a handler is registered on `system_alert` that logs every alert with
//!    its severity phrase;
//! 4. the heartbeat [`PeriodicTask`] runs on the caller's task, publishing a
//!    numbered alert every `heartbeat_interval` until the token is
//!    cancelled.
//!
//! The heartbeat listens to its own topic, which exercises the whole bus
//! end to end. Real producers and consumers attach to the same topic via
//! [`Orchestrator::registry`].
//!
//! # Example
//!
//! ```rust,no_run
//! use guidance_runtime::{GuidanceConfig, Orchestrator};
//! use guidance_kernel::CancellationToken;
//!
//! # async fn start() -> Result<(), guidance_types::GuidanceError> {
//! let orchestrator = Orchestrator::new(GuidanceConfig::new("42"))?;
//! let state = orchestrator.run(CancellationToken::new()).await?;
//! # let _ = state;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use guidance_kernel::{
    CancellableLoop, CancellationToken, ComponentMonitor, ComponentScheduler, ComponentTask,
    LoopError, LoopState, PeriodicTask,
};
use guidance_middleware::{ChannelRegistry, PublicationChannel};
use guidance_types::{GuidanceError, SYSTEM_ALERT_TOPIC, Severity, SystemAlert};
use tracing::{info, warn};

use crate::components::guidance_components;
use crate::config::GuidanceConfig;

/// Name the heartbeat introduces itself with.
pub const NODE_NAME: &str = "guidance_main";

/// Owns the registry and the scheduler for the life of the process.
pub struct Orchestrator {
    config: GuidanceConfig,
    registry: ChannelRegistry,
}

impl Orchestrator {
    /// Validate `config` and build the channel registry.
    ///
    /// # Errors
    ///
    /// [`GuidanceError::Config`] if the configuration is invalid.
    pub fn new(config: GuidanceConfig) -> Result<Self, GuidanceError> {
        config.validate()?;
        Ok(Self {
            config,
            registry: ChannelRegistry::new(),
        })
    }

    /// Shared registry, for attaching extra producers and consumers.
    pub fn registry(&self) -> ChannelRegistry {
        self.registry.clone()
    }

    pub fn config(&self) -> &GuidanceConfig {
        &self.config
    }

    /// Compose and run the guidance process until `token` is cancelled.
    ///
    /// Returns the final state of the heartbeat loop. Components are shut
    /// down and joined before this returns.
    ///
    /// # Errors
    ///
    /// Configuration errors (topic type conflicts, a worker pool too small
    /// for the components) are returned before any component starts.
    pub async fn run(self, token: CancellationToken) -> Result<LoopState, GuidanceError> {
        let alerts = self
            .registry
            .get_subscription_channel::<SystemAlert>(SYSTEM_ALERT_TOPIC)?;
        let publisher = self
            .registry
            .get_publication_channel::<SystemAlert>(SYSTEM_ALERT_TOPIC)?;

        let components: Vec<Arc<dyn ComponentTask>> =
            guidance_components(&self.registry, self.config.component_tick());
        if components.len() > self.config.worker_threads {
            return Err(GuidanceError::Config(format!(
                "worker_threads = {} cannot host {} components",
                self.config.worker_threads,
                components.len()
            )));
        }

        let mut scheduler = ComponentScheduler::with_token(self.config.worker_threads, token.clone())?;
        scheduler.start(components);
        info!(
            run_id = %self.config.run_id,
            workers = scheduler.pool_size(),
            "guidance components scheduled"
        );

        alerts.register_on_message_callback(|alert: &SystemAlert| {
            info!("{NODE_NAME} heard: \"{}\"", format_alert(alert));
            Ok(())
        });

        let mut heartbeat = Heartbeat::new(
            publisher,
            self.config.run_id.clone(),
            self.config.heartbeat_severity,
        )
        .with_monitor(scheduler.monitor(), self.config.component_tick() * 3);
        let mut task = PeriodicTask::new(NODE_NAME, self.config.heartbeat_interval());
        let state = task.run(&mut heartbeat, &token).await;

        scheduler.shutdown();
        scheduler.join().await;
        info!(state = ?state, heartbeats = task.iterations(), "guidance stopped");
        Ok(state)
    }
}

/// `"<description>;<phrase>"` – the line logged for every received alert.
pub fn format_alert(alert: &SystemAlert) -> String {
    format!("{};{}", alert.description, alert.phrase())
}

/// Heartbeat body: publish a numbered alert on every iteration.
pub struct Heartbeat {
    publisher: PublicationChannel<SystemAlert>,
    run_id: String,
    severity: Severity,
    sequence: u64,
    monitor: Option<(ComponentMonitor, Duration)>,
}

impl Heartbeat {
    pub fn new(publisher: PublicationChannel<SystemAlert>, run_id: String, severity: Severity) -> Self {
        Self {
            publisher,
            run_id,
            severity,
            sequence: 0,
            monitor: None,
        }
    }

    /// Also report components that stopped heartbeating for `stale_after`.
    pub fn with_monitor(mut self, monitor: ComponentMonitor, stale_after: Duration) -> Self {
        self.monitor = Some((monitor, stale_after));
        self
    }

    /// Sequence number the next heartbeat will carry.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    fn describe(&self) -> String {
        format!(
            "Hello World! I am {NODE_NAME}. {} run_id = {}.",
            self.sequence, self.run_id
        )
    }

    fn report_components(&self) {
        let Some((monitor, stale_after)) = &self.monitor else {
            return;
        };
        for name in monitor.stale(*stale_after) {
            warn!(component = %name, "component has stopped reporting progress");
        }
        for report in monitor.snapshot() {
            if report.state.is_fatal() {
                warn!(component = %report.name, state = %report.state, since = %report.since, "component is down");
            }
        }
    }
}

#[async_trait]
impl CancellableLoop for Heartbeat {
    async fn setup(&mut self) -> Result<(), LoopError> {
        self.sequence = 0;
        Ok(())
    }

    async fn iterate(&mut self) -> Result<(), LoopError> {
        let mut alert = self.publisher.new_message();
        alert.description = self.describe();
        alert.set_severity(self.severity);
        self.publisher.publish(alert);
        self.sequence += 1;

        self.report_components();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collect_alerts(registry: &ChannelRegistry) -> Arc<Mutex<Vec<SystemAlert>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        registry
            .get_subscription_channel::<SystemAlert>(SYSTEM_ALERT_TOPIC)
            .unwrap()
            .register_on_message_callback({
                let seen = Arc::clone(&seen);
                move |alert: &SystemAlert| {
                    seen.lock().unwrap().push(alert.clone());
                    Ok(())
                }
            });
        seen
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        assert!(matches!(
            Orchestrator::new(GuidanceConfig::new("")),
            Err(GuidanceError::Config(_))
        ));
    }

    #[test]
    fn format_alert_uses_phrase_table() {
        let mut alert = SystemAlert {
            alert_type: 0,
            description: "Hello".to_string(),
        };
        alert.set_severity(Severity::SystemReady);
        assert_eq!(format_alert(&alert), "Hello;I am Ready!");

        alert.alert_type = 42;
        assert_eq!(format_alert(&alert), "Hello;I am NOT Ready!");
    }

    #[tokio::test]
    async fn heartbeat_numbers_alerts_from_zero() {
        let registry = ChannelRegistry::new();
        let seen = collect_alerts(&registry);
        let publisher = registry
            .get_publication_channel::<SystemAlert>(SYSTEM_ALERT_TOPIC)
            .unwrap();

        let mut heartbeat = Heartbeat::new(publisher, "42".to_string(), Severity::Warning);
        heartbeat.setup().await.unwrap();
        for _ in 0..3 {
            heartbeat.iterate().await.unwrap();
        }

        let seen = seen.lock().unwrap();
        let descriptions: Vec<&str> = seen.iter().map(|a| a.description.as_str()).collect();
        assert_eq!(
            descriptions,
            vec![
                "Hello World! I am guidance_main. 0 run_id = 42.",
                "Hello World! I am guidance_main. 1 run_id = 42.",
                "Hello World! I am guidance_main. 2 run_id = 42.",
            ]
        );
        assert!(seen.iter().all(|a| a.severity() == Some(Severity::Warning)));
        assert_eq!(heartbeat.sequence(), 3);
    }

    #[test]
    fn oversized_pool_is_rejected_up_front() {
        let mut config = GuidanceConfig::new("42");
        config.worker_threads = usize::MAX;
        assert!(matches!(
            Orchestrator::new(config),
            Err(GuidanceError::Config(msg)) if msg.contains("worker_threads")
        ));
    }

    #[tokio::test]
    async fn undersized_pool_aborts_before_components_start() {
        let mut config = GuidanceConfig::new("42");
        config.worker_threads = 3;
        let orchestrator = Orchestrator::new(config).unwrap();
        let registry = orchestrator.registry();

        let err = orchestrator.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, GuidanceError::Config(msg) if msg.contains("worker_threads")));
        // No component got far enough to create its status topic.
        let names: Vec<String> = registry.topics().iter().map(|t| t.name().to_string()).collect();
        assert_eq!(names, vec![SYSTEM_ALERT_TOPIC.to_string()]);
    }

    #[tokio::test]
    async fn topic_conflict_aborts_startup() {
        let orchestrator = Orchestrator::new(GuidanceConfig::new("42")).unwrap();
        orchestrator
            .registry()
            .get_publication_channel::<String>(SYSTEM_ALERT_TOPIC)
            .unwrap();

        let err = orchestrator.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, GuidanceError::TopicTypeMismatch { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_heartbeat_and_components() {
        let mut config = GuidanceConfig::new("7");
        config.heartbeat_severity = Severity::SystemReady;
        let orchestrator = Orchestrator::new(config).unwrap();
        let seen = collect_alerts(&orchestrator.registry());
        let token = CancellationToken::new();

        let run = tokio::spawn(orchestrator.run(token.clone()));
        tokio::time::sleep(Duration::from_secs(45)).await;
        token.cancel();

        let state = run.await.unwrap().unwrap();
        assert_eq!(state, LoopState::Cancelled);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|a| a.phrase() == "I am Ready!"));
    }
}
