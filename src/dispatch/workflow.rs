//! Dispatch workflow: the short-lived per-agent firing.
//!
//! Each firing runs the preprocess activity and, when it claims a job,
//! drives a child job-execution workflow under a deterministic id. A child
//! that cannot start (already running, engine refusal) is logged and left
//! for the next firing to reconcile through orphan recovery.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::engine::{run_activity, RetryPolicy};
use crate::model::QueueType;
use crate::store::JobStore;
use crate::stream::StreamManager;

use super::execution::JobExecutor;
use super::preprocess::preprocess;

/// Result of one dispatch firing.
#[derive(Debug, Clone, Default)]
pub struct DispatchResult {
    /// Whether a job was claimed and executed this firing.
    pub processed: bool,
    pub job_id: Option<Uuid>,
    pub queue_type: Option<QueueType>,
}

/// Per-agent dispatch driver.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    streams: Arc<StreamManager>,
    executor: Arc<JobExecutor>,
    config: OrchestratorConfig,
    /// Deterministic child-workflow ids currently running; duplicate starts
    /// are refused.
    running_children: Mutex<HashSet<String>>,
    /// Broadcast cancel signal for in-flight executions.
    cancel: watch::Sender<bool>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        streams: Arc<StreamManager>,
        executor: Arc<JobExecutor>,
        config: OrchestratorConfig,
    ) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            store,
            streams,
            executor,
            config,
            running_children: Mutex::new(HashSet::new()),
            cancel,
        }
    }

    /// Signals every in-flight execution to cancel.
    pub fn cancel_all(&self) {
        let _ = self.cancel.send(true);
    }

    /// One dispatch firing for one agent.
    pub async fn run_once(&self, agent_id: Uuid) -> DispatchResult {
        let preprocess_policy = RetryPolicy {
            initial_interval: self.config.retry_initial_interval,
            max_interval: self.config.retry_max_interval,
            max_attempts: self.config.retry_max_attempts,
            timeout: Some(self.config.preprocess_timeout),
            heartbeat_timeout: None,
        };

        let outcome = run_activity(&preprocess_policy, |_ctx| {
            preprocess(self.store.as_ref(), &self.streams, &self.config, agent_id)
        })
        .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(agent_id = %agent_id, error = %e, "Preprocess failed");
                return DispatchResult::default();
            }
        };

        let (Some(job_id), Some(queue), Some(org_id)) =
            (outcome.job_id, outcome.queue_type, outcome.org_id)
        else {
            return DispatchResult::default();
        };

        self.execute_child(job_id, org_id, queue, agent_id).await;

        DispatchResult {
            processed: true,
            job_id: Some(job_id),
            queue_type: Some(queue),
        }
    }

    /// Runs the job-execution child workflow under its deterministic id.
    /// Start refusals and run failures are logged, never propagated: the
    /// next firing reconciles through orphan recovery.
    pub async fn execute_child(
        &self,
        job_id: Uuid,
        org_id: Uuid,
        queue: QueueType,
        agent_id: Uuid,
    ) {
        let workflow_id = format!("job-execution-{}", job_id);
        let Some(_guard) = ChildGuard::acquire(&self.running_children, &workflow_id) else {
            warn!(workflow_id = %workflow_id, "Child workflow already started");
            return;
        };

        let run = self
            .executor
            .run(job_id, org_id, queue, agent_id, self.cancel.subscribe());
        match tokio::time::timeout(self.config.execution_run_timeout, run).await {
            Ok(Ok(outcome)) => {
                info!(
                    job_id = %job_id,
                    succeeded = outcome.succeeded,
                    "Child workflow finished"
                );
            }
            Ok(Err(e)) => {
                error!(job_id = %job_id, error = %e, "Child workflow failed");
            }
            Err(_) => {
                // The run deadline passed with the job still in-progress;
                // orphan recovery returns it to its queue within the
                // staleness window.
                warn!(job_id = %job_id, "Child workflow run timed out");
            }
        }
    }
}

/// Removes its workflow id from the running set on drop.
struct ChildGuard<'a> {
    set: &'a Mutex<HashSet<String>>,
    id: String,
}

impl<'a> ChildGuard<'a> {
    fn acquire(set: &'a Mutex<HashSet<String>>, id: &str) -> Option<Self> {
        let mut guard = set.lock().expect("child set lock");
        if !guard.insert(id.to_string()) {
            return None;
        }
        Some(Self {
            set,
            id: id.to_string(),
        })
    }
}

impl Drop for ChildGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.set.lock() {
            guard.remove(&self.id);
        }
    }
}
