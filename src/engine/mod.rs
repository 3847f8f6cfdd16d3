//! Workflow-engine primitives.
//!
//! The durable-workflow runtime is an external collaborator; the core
//! consumes it through the pieces here: per-agent schedule management
//! ([`Schedules`]), retrying activity execution ([`run_activity`]) with an
//! activity heartbeat that cancels a stalled attempt, and deterministic
//! child-workflow dedup. [`local::LocalEngine`] is the in-process
//! implementation used by the binary and the test-suite.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

pub mod local;

pub use local::LocalEngine;

/// Errors surfaced by engine primitives.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The schedule backend rejected or could not perform the request.
    #[error("Schedule unavailable: {0}")]
    ScheduleUnavailable(String),

    /// An activity failed with a non-retriable error.
    #[error("Activity failed permanently: {0}")]
    Permanent(String),

    /// All retry attempts were exhausted.
    #[error("Activity failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },

    /// The activity's heartbeat went silent past the configured timeout.
    #[error("Activity heartbeat timed out")]
    HeartbeatTimeout,

    /// The activity exceeded its overall timeout.
    #[error("Activity timed out")]
    Timeout,

    /// The workflow was cancelled.
    #[error("Workflow cancelled")]
    Cancelled,
}

/// Failure returned by an activity body. `retriable` decides whether the
/// engine schedules another attempt.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ActivityError {
    pub message: String,
    pub retriable: bool,
}

impl ActivityError {
    /// A failure the engine should retry (network errors, conflicts).
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: true,
        }
    }

    /// A failure that retrying cannot fix (unknown job, bad credentials).
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retriable: false,
        }
    }
}

/// Retry configuration for one activity.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_interval: Duration,
    /// Ceiling for the exponentially growing delay.
    pub max_interval: Duration,
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Overall deadline per attempt.
    pub timeout: Option<Duration>,
    /// Cancel the attempt when no heartbeat arrives for this long.
    pub heartbeat_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
            max_attempts: 3,
            timeout: None,
            heartbeat_timeout: None,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after attempt `attempt` (1-based), doubling
    /// from `initial_interval` up to `max_interval`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_interval
            .saturating_mul(factor)
            .min(self.max_interval)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }
}

/// Handle an activity body uses to report liveness. Long-running streaming
/// activities call [`ActivityContext::heartbeat`] on every unit of progress;
/// silence past the policy's heartbeat timeout cancels the attempt.
#[derive(Clone)]
pub struct ActivityContext {
    heartbeat: watch::Sender<Instant>,
}

impl ActivityContext {
    /// Resets the heartbeat clock.
    pub fn heartbeat(&self) {
        let _ = self.heartbeat.send(Instant::now());
    }
}

enum AttemptOutcome<T> {
    Done(Result<T, ActivityError>),
    HeartbeatTimeout,
    Timeout,
}

/// Runs one activity under `policy`: retries transient failures with
/// exponential backoff, enforces the per-attempt timeout, and cancels an
/// attempt whose heartbeat goes silent.
pub async fn run_activity<T, F, Fut>(policy: &RetryPolicy, mut body: F) -> Result<T, EngineError>
where
    F: FnMut(ActivityContext) -> Fut,
    Fut: Future<Output = Result<T, ActivityError>>,
{
    let mut last_failure = String::new();

    for attempt in 1..=policy.max_attempts {
        let outcome = run_attempt(policy, &mut body).await;
        match outcome {
            AttemptOutcome::Done(Ok(value)) => return Ok(value),
            AttemptOutcome::Done(Err(error)) if !error.retriable => {
                return Err(EngineError::Permanent(error.message));
            }
            AttemptOutcome::Done(Err(error)) => {
                last_failure = error.message;
            }
            AttemptOutcome::HeartbeatTimeout => {
                last_failure = EngineError::HeartbeatTimeout.to_string();
            }
            AttemptOutcome::Timeout => {
                last_failure = EngineError::Timeout.to_string();
            }
        }

        if attempt < policy.max_attempts {
            let delay = policy.backoff(attempt);
            tracing::debug!(
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                error = %last_failure,
                "Activity attempt failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    Err(EngineError::Exhausted {
        attempts: policy.max_attempts,
        last: last_failure,
    })
}

async fn run_attempt<T, F, Fut>(policy: &RetryPolicy, body: &mut F) -> AttemptOutcome<T>
where
    F: FnMut(ActivityContext) -> Fut,
    Fut: Future<Output = Result<T, ActivityError>>,
{
    let (heartbeat_tx, heartbeat_rx) = watch::channel(Instant::now());
    let ctx = ActivityContext {
        heartbeat: heartbeat_tx,
    };
    let fut = body(ctx);
    tokio::pin!(fut);

    let guarded = async {
        match policy.heartbeat_timeout {
            Some(heartbeat_timeout) => {
                tokio::select! {
                    result = &mut fut => AttemptOutcome::Done(result),
                    _ = heartbeat_watchdog(heartbeat_rx, heartbeat_timeout) => {
                        AttemptOutcome::HeartbeatTimeout
                    }
                }
            }
            None => AttemptOutcome::Done(fut.await),
        }
    };

    match policy.timeout {
        Some(timeout) => match tokio::time::timeout(timeout, guarded).await {
            Ok(outcome) => outcome,
            Err(_) => AttemptOutcome::Timeout,
        },
        None => guarded.await,
    }
}

/// Resolves when no heartbeat has been recorded for `timeout`.
async fn heartbeat_watchdog(mut heartbeats: watch::Receiver<Instant>, timeout: Duration) {
    loop {
        let last = *heartbeats.borrow();
        let deadline = last + timeout;
        if deadline <= Instant::now() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                if *heartbeats.borrow() == last {
                    return;
                }
            }
            changed = heartbeats.changed() => {
                if changed.is_err() {
                    // Activity finished and dropped its context; the main
                    // select resolves on the future branch.
                    std::future::pending::<()>().await;
                }
            }
        }
    }
}

/// Per-agent schedule management: the dispatch and health-check schedules
/// the engine fires on their cadences.
#[async_trait]
pub trait Schedules: Send + Sync {
    /// Creates both schedules for an agent if they do not exist.
    async fn ensure_agent_schedules(&self, agent_id: Uuid) -> Result<(), EngineError>;

    /// Pauses both schedules.
    async fn pause_agent_schedules(&self, agent_id: Uuid) -> Result<(), EngineError>;

    /// Resumes both schedules.
    async fn resume_agent_schedules(&self, agent_id: Uuid) -> Result<(), EngineError>;
}
