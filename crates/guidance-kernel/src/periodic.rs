//! [`PeriodicTask`] – run a [`CancellableLoop`] at a fixed cadence.
//!
//! ```text
//! Created ──run()──► Running ──► setup() once
//!                        │
//!                        ▼
//!        ┌──► cancelled? ──yes──► Cancelled
//!        │        │ no
//!        │        ▼
//!        │    iterate() ──Err(Failed)──────► Failed
//!        │        │      ──Err(Interrupted)─► Cancelled
//!        │        ▼ Ok
//!        └── sleep(interval) | cancelled ──► Cancelled
//! ```
//!
//! Cancellation is cooperative: it is observed between iterations, never in
//! the middle of one. The inter-iteration sleep races the cancellation token,
//! so a task asked to stop while suspended exits at once instead of waiting
//! out the interval.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Why a loop step did not complete.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoopError {
    /// The step was interrupted. Treated as a cancellation, not a failure.
    #[error("interrupted")]
    Interrupted,
    /// The step failed. The task stops and is not retried.
    #[error("{0}")]
    Failed(String),
}

/// Body of a [`PeriodicTask`].
#[async_trait]
pub trait CancellableLoop: Send {
    /// Runs once before the first iteration.
    async fn setup(&mut self) -> Result<(), LoopError> {
        Ok(())
    }

    /// One unit of work.
    async fn iterate(&mut self) -> Result<(), LoopError>;
}

/// Lifecycle of a [`PeriodicTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Created,
    Running,
    Cancelled,
    Failed,
}

/// Drives a [`CancellableLoop`]: `setup` once, then `iterate` every
/// `interval` until cancelled or failed.
#[derive(Debug)]
pub struct PeriodicTask {
    name: String,
    interval: Duration,
    state: LoopState,
    iterations: u64,
}

impl PeriodicTask {
    pub fn new(name: impl Into<String>, interval: Duration) -> Self {
        Self {
            name: name.into(),
            interval,
            state: LoopState::Created,
            iterations: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Number of iterations that completed successfully.
    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    /// Run `body` until `token` is cancelled or an iteration fails.
    ///
    /// A task runs at most once: calling `run` on a task that has already
    /// left [`LoopState::Created`] returns its current state without touching
    /// `body`.
    pub async fn run<L>(&mut self, body: &mut L, token: &CancellationToken) -> LoopState
    where
        L: CancellableLoop + ?Sized,
    {
        if self.state != LoopState::Created {
            debug!(task = %self.name, state = ?self.state, "periodic task already started");
            return self.state;
        }
        self.state = LoopState::Running;
        info!(task = %self.name, interval_ms = self.interval.as_millis() as u64, "periodic task started");

        if let Err(e) = body.setup().await {
            return self.stop(e);
        }

        loop {
            if token.is_cancelled() {
                return self.finish(LoopState::Cancelled);
            }

            if let Err(e) = body.iterate().await {
                return self.stop(e);
            }
            self.iterations += 1;

            tokio::select! {
                biased;
                _ = token.cancelled() => return self.finish(LoopState::Cancelled),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    fn stop(&mut self, err: LoopError) -> LoopState {
        match err {
            LoopError::Interrupted => self.finish(LoopState::Cancelled),
            LoopError::Failed(reason) => {
                error!(task = %self.name, iterations = self.iterations, %reason, "periodic task failed");
                self.finish(LoopState::Failed)
            }
        }
    }

    fn finish(&mut self, state: LoopState) -> LoopState {
        self.state = state;
        if state == LoopState::Cancelled {
            info!(task = %self.name, iterations = self.iterations, "periodic task cancelled");
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    /// Records a sequence number per iteration, optionally failing or
    /// interrupting at a given sequence.
    struct Counter {
        sequence: u64,
        setups: u32,
        seen: Arc<Mutex<Vec<u64>>>,
        fail_at: Option<(u64, LoopError)>,
    }

    impl Counter {
        fn new(seen: Arc<Mutex<Vec<u64>>>) -> Self {
            Self {
                sequence: 99,
                setups: 0,
                seen,
                fail_at: None,
            }
        }
    }

    #[async_trait]
    impl CancellableLoop for Counter {
        async fn setup(&mut self) -> Result<(), LoopError> {
            self.setups += 1;
            self.sequence = 0;
            Ok(())
        }

        async fn iterate(&mut self) -> Result<(), LoopError> {
            if let Some((at, err)) = &self.fail_at {
                if *at == self.sequence {
                    return Err(err.clone());
                }
            }
            self.seen.lock().unwrap().push(self.sequence);
            self.sequence += 1;
            Ok(())
        }
    }

    const INTERVAL: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn iterates_with_increasing_sequence_until_cancelled() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let token = CancellationToken::new();
        let handle = tokio::spawn({
            let seen = Arc::clone(&seen);
            let token = token.clone();
            async move {
                let mut body = Counter::new(seen);
                let mut task = PeriodicTask::new("counter", INTERVAL);
                let state = task.run(&mut body, &token).await;
                (state, task.iterations(), body.setups)
            }
        });

        // Iterations at t = 0, 30, 60, 90.
        tokio::time::sleep(Duration::from_secs(95)).await;
        token.cancel();
        let cancelled_at = Instant::now();
        let (state, iterations, setups) = handle.await.unwrap();

        assert_eq!(state, LoopState::Cancelled);
        assert!(cancelled_at.elapsed() < INTERVAL, "must stop within one interval");
        assert_eq!(setups, 1);
        assert_eq!(iterations, 4);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);

        // Nothing runs after cancellation was observed.
        tokio::time::sleep(INTERVAL * 3).await;
        assert_eq!(seen.lock().unwrap().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_start_runs_no_iteration() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let token = CancellationToken::new();
        token.cancel();

        let mut body = Counter::new(Arc::clone(&seen));
        let mut task = PeriodicTask::new("counter", INTERVAL);
        assert_eq!(task.run(&mut body, &token).await, LoopState::Cancelled);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn failure_stops_without_retry() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let token = CancellationToken::new();
        let mut body = Counter::new(Arc::clone(&seen));
        body.fail_at = Some((2, LoopError::Failed("sensor offline".into())));

        let mut task = PeriodicTask::new("counter", INTERVAL);
        let state = task.run(&mut body, &token).await;

        assert_eq!(state, LoopState::Failed);
        assert_eq!(task.state(), LoopState::Failed);
        assert_eq!(task.iterations(), 2);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn interruption_is_a_cancellation() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let token = CancellationToken::new();
        let mut body = Counter::new(Arc::clone(&seen));
        body.fail_at = Some((1, LoopError::Interrupted));

        let mut task = PeriodicTask::new("counter", INTERVAL);
        assert_eq!(task.run(&mut body, &token).await, LoopState::Cancelled);
        assert_eq!(*seen.lock().unwrap(), vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_setup_never_iterates() {
        struct BadSetup;

        #[async_trait]
        impl CancellableLoop for BadSetup {
            async fn setup(&mut self) -> Result<(), LoopError> {
                Err(LoopError::Failed("no config".into()))
            }

            async fn iterate(&mut self) -> Result<(), LoopError> {
                panic!("iterate must not run after a failed setup")
            }
        }

        let mut task = PeriodicTask::new("bad", INTERVAL);
        let state = task.run(&mut BadSetup, &CancellationToken::new()).await;
        assert_eq!(state, LoopState::Failed);
        assert_eq!(task.iterations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn task_runs_at_most_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let token = CancellationToken::new();
        let mut body = Counter::new(Arc::clone(&seen));
        body.fail_at = Some((0, LoopError::Interrupted));

        let mut task = PeriodicTask::new("counter", INTERVAL);
        assert_eq!(task.run(&mut body, &token).await, LoopState::Cancelled);
        assert_eq!(task.run(&mut body, &token).await, LoopState::Cancelled);
        assert_eq!(body.setups, 1);
    }
}
