//! [`ComponentScheduler`] – runs each guidance component as a long-lived task.
//!
//! The scheduler owns a fixed-size worker pool, modelled as a semaphore with
//! one permit per worker. Every submitted [`ComponentTask`] is spawned once
//! on the Tokio runtime and holds a permit for as long as its `run()` lasts.
//!
//! # Rules
//! - A component is started **exactly once**; resubmitting a name is ignored.
//! - The pool is **not** resized to fit the load. When more components are
//!   submitted than there are workers, the surplus waits for a free worker
//!   (and logs a warning at submission). Sizing is the caller's contract.
//! - A component whose `run()` returns, fails, or panics is reported at
//!   `error` level and recorded in the [`ComponentMonitor`]. It is **never**
//!   restarted, and its siblings keep running.
//! - [`ComponentScheduler::shutdown`] cancels the token handed to every
//!   component; a component that then returns `Ok` is recorded as stopped.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use guidance_types::GuidanceError;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::health::{ComponentMonitor, ComponentState};

/// A long-running unit of work scheduled by the [`ComponentScheduler`].
#[async_trait]
pub trait ComponentTask: Send + Sync {
    /// Unique component name, e.g. `"arbitrator"`.
    fn name(&self) -> &str;

    /// Run until `ctx` is cancelled. Returning at any other time is treated
    /// as a fatal condition for this component.
    async fn run(&self, ctx: TaskContext) -> Result<(), GuidanceError>;
}

/// Per-component handle passed to [`ComponentTask::run`].
#[derive(Clone)]
pub struct TaskContext {
    name: Arc<str>,
    token: CancellationToken,
    monitor: ComponentMonitor,
}

impl TaskContext {
    pub fn new(name: &str, token: CancellationToken, monitor: ComponentMonitor) -> Self {
        Self {
            name: Arc::from(name),
            token,
            monitor,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancelled when the scheduler shuts down.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Record progress with the scheduler's monitor.
    pub fn heartbeat(&self) {
        self.monitor.heartbeat(&self.name);
    }
}

/// Fixed-size pool that starts every component once for the life of the
/// process.
pub struct ComponentScheduler {
    pool: Arc<Semaphore>,
    pool_size: usize,
    submitted: usize,
    token: CancellationToken,
    monitor: ComponentMonitor,
    handles: Vec<JoinHandle<()>>,
}

impl ComponentScheduler {
    /// Create a scheduler with `pool_size` workers.
    ///
    /// # Errors
    ///
    /// [`GuidanceError::Config`] when `pool_size` is zero or larger than
    /// [`Semaphore::MAX_PERMITS`].
    pub fn new(pool_size: usize) -> Result<Self, GuidanceError> {
        Self::with_token(pool_size, CancellationToken::new())
    }

    /// Like [`new`][Self::new], with components cancelled whenever `token`
    /// is.
    pub fn with_token(pool_size: usize, token: CancellationToken) -> Result<Self, GuidanceError> {
        if pool_size == 0 {
            return Err(GuidanceError::Config(
                "component scheduler needs at least one worker".to_string(),
            ));
        }
        if pool_size > Semaphore::MAX_PERMITS {
            return Err(GuidanceError::Config(format!(
                "component scheduler cannot hold {pool_size} workers (limit {})",
                Semaphore::MAX_PERMITS
            )));
        }
        Ok(Self {
            pool: Arc::new(Semaphore::new(pool_size)),
            pool_size,
            submitted: 0,
            token: token.child_token(),
            monitor: ComponentMonitor::new(),
            handles: Vec::new(),
        })
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    pub fn monitor(&self) -> ComponentMonitor {
        self.monitor.clone()
    }

    /// Spawn every component in `components` onto the current Tokio runtime.
    ///
    /// Must be called from within a runtime.
    pub fn start(&mut self, components: Vec<Arc<dyn ComponentTask>>) {
        for component in components {
            let name = component.name().to_string();
            if !self.monitor.register(&name) {
                warn!(component = %name, "component already started; ignoring resubmission");
                continue;
            }
            self.submitted += 1;
            if self.submitted > self.pool_size {
                warn!(
                    component = %name,
                    pool_size = self.pool_size,
                    submitted = self.submitted,
                    "worker pool is smaller than the component count; component waits for a free worker"
                );
            }

            let ctx = TaskContext::new(&name, self.token.child_token(), self.monitor.clone());
            let supervisor = supervise(component, Arc::clone(&self.pool), ctx, self.monitor.clone());
            self.handles.push(tokio::spawn(supervisor));
        }
    }

    /// Ask every component to stop.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Wait for every supervised component to finish.
    pub async fn join(&mut self) {
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "component supervisor aborted");
            }
        }
    }
}

impl Drop for ComponentScheduler {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Acquire a worker, run one component to completion, and record the outcome.
async fn supervise(
    component: Arc<dyn ComponentTask>,
    pool: Arc<Semaphore>,
    ctx: TaskContext,
    monitor: ComponentMonitor,
) {
    let name = ctx.name().to_string();
    let token = ctx.token().clone();

    let _worker = tokio::select! {
        biased;
        _ = token.cancelled() => {
            monitor.transition(&name, ComponentState::Stopped);
            return;
        }
        permit = pool.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_closed) => {
                error!(component = %name, "worker pool closed before component started");
                monitor.transition(&name, ComponentState::Failed("worker pool closed".into()));
                return;
            }
        },
    };

    monitor.transition(&name, ComponentState::Running);
    info!(component = %name, "component started");

    // Run on its own task so a panic surfaces as a JoinError instead of
    // unwinding through the supervisor.
    let outcome = tokio::spawn(async move { component.run(ctx).await }).await;

    let state = match outcome {
        Ok(Ok(())) if token.is_cancelled() => {
            info!(component = %name, "component stopped");
            ComponentState::Stopped
        }
        Ok(Ok(())) => {
            error!(component = %name, "component exited unexpectedly; it will not be restarted");
            ComponentState::Exited
        }
        Ok(Err(e)) => {
            error!(component = %name, error = %e, "component failed; it will not be restarted");
            ComponentState::Failed(e.to_string())
        }
        Err(join_err) if join_err.is_panic() => {
            let reason = panic_reason(join_err.into_panic());
            error!(component = %name, panic = %reason, "component panicked; it will not be restarted");
            ComponentState::Panicked(reason)
        }
        Err(join_err) => {
            error!(component = %name, error = %join_err, "component task cancelled by the runtime");
            ComponentState::Failed(join_err.to_string())
        }
    };
    monitor.transition(&name, state);
}

fn panic_reason(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(s) => *s,
        Err(payload) => match payload.downcast::<&'static str>() {
            Ok(s) => (*s).to_string(),
            Err(_) => "<non-string panic payload>".to_string(),
        },
    }
}
