//! `guidance-kernel` – Scheduling & Lifecycle
//!
//! Runs guidance components and periodic loops. It does not know what the
//! components do; it starts them, watches them, and stops them.
//!
//! # Modules
//!
//! - [`scheduler`] – [`ComponentScheduler`][scheduler::ComponentScheduler]:
//!   a fixed-size worker pool that starts every
//!   [`ComponentTask`][scheduler::ComponentTask] exactly once and reports
//!   components that exit, fail, or panic without restarting them.
//! - [`periodic`] – [`PeriodicTask`][periodic::PeriodicTask]:
//!   `setup` once, then `iterate` at a fixed cadence until cooperatively
//!   cancelled or failed.
//! - [`health`] – [`ComponentMonitor`][health::ComponentMonitor]:
//!   lifecycle state and heartbeat record of every scheduled component.

pub mod health;
pub mod periodic;
pub mod scheduler;

pub use health::{ComponentMonitor, ComponentReport, ComponentState};
pub use periodic::{CancellableLoop, LoopError, LoopState, PeriodicTask};
pub use scheduler::{ComponentScheduler, ComponentTask, TaskContext};

// Re-exported so component crates share one cancellation type.
pub use tokio_util::sync::CancellationToken;
