//! `guidance-runtime` – The Guidance Node
//!
//! Wires the bus and the scheduler into a running guidance process.
//!
//! # Modules
//!
//! - [`orchestrator`] – [`Orchestrator`]: builds the
//!   [`ChannelRegistry`][guidance_middleware::ChannelRegistry], schedules the
//!   components, and runs the `system_alert` heartbeat on its own task.
//! - [`components`] – [`GuidanceComponent`]: Arbitrator, PluginManager,
//!   TrajectoryExecutor, and Tracking as black-box bus participants.
//! - [`config`] – [`GuidanceConfig`]: run identifier, pool size, and
//!   cadences from `~/.guidance/config.toml` and `GUIDANCE_*` variables.
//! - [`telemetry`] – [`init_tracing`]: global `tracing` subscriber with an
//!   optional OTLP span exporter.

pub mod components;
pub mod config;
pub mod orchestrator;
pub mod telemetry;

pub use components::{ComponentKind, GuidanceComponent, guidance_components};
pub use config::GuidanceConfig;
pub use orchestrator::{Heartbeat, NODE_NAME, Orchestrator, format_alert};
pub use telemetry::{TracerProviderGuard, init_tracing};
