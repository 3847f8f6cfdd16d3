//! Job-execution workflow: drives one claimed job through
//! execute → verify → PR → cleanup against the agent's RPC surface.
//!
//! The execute activity is streaming: every inbound log frame persists to
//! the store, fans out to live subscribers, and resets the activity
//! heartbeat, so five minutes of silence cancels the attempt and the engine
//! retries it. Cleanup always runs, including on failure and cancellation.

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::{AgentClient, AgentClientError, CreatePrRequest, ExecuteJobRequest};
use crate::config::OrchestratorConfig;
use crate::engine::{run_activity, ActivityContext, ActivityError, EngineError, RetryPolicy};
use crate::error::DispatchError;
use crate::metrics;
use crate::model::{Activity, Agent, Job, JobLogEntry, JobStatus, LogLevel, QueueType};
use crate::store::JobStore;
use crate::stream::{BackendFrame, LogNotifier, StreamManager};

/// Result of one job-execution workflow.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub job_id: Uuid,
    pub succeeded: bool,
}

/// Drives job-execution workflows.
pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    streams: Arc<StreamManager>,
    notifier: Arc<LogNotifier>,
    client: Arc<dyn AgentClient>,
    config: OrchestratorConfig,
}

impl JobExecutor {
    pub fn new(
        store: Arc<dyn JobStore>,
        streams: Arc<StreamManager>,
        notifier: Arc<LogNotifier>,
        client: Arc<dyn AgentClient>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            streams,
            notifier,
            client,
            config,
        }
    }

    fn activity_policy(&self) -> RetryPolicy {
        RetryPolicy {
            initial_interval: self.config.retry_initial_interval,
            max_interval: self.config.retry_max_interval,
            max_attempts: self.config.retry_max_attempts,
            timeout: None,
            heartbeat_timeout: None,
        }
    }

    /// Runs the workflow for one claimed job.
    ///
    /// A cancel signal aborts the current phase, asks the agent to stop,
    /// still runs cleanup, and marks the job failed with a cancellation
    /// marker in `updates`.
    pub async fn run(
        &self,
        job_id: Uuid,
        org_id: Uuid,
        queue: QueueType,
        agent_id: Uuid,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<ExecutionOutcome, DispatchError> {
        let job = self
            .store
            .latest(org_id, job_id)
            .await?
            .ok_or(DispatchError::JobNotFound(job_id))?;
        let agent = self
            .store
            .get_agent(agent_id)
            .await?
            .ok_or(DispatchError::AgentNotFound(agent_id))?;

        // Let the agent know the assignment is coming; the RPC call that
        // follows is authoritative.
        if let Err(e) = self
            .streams
            .write(
                agent_id,
                BackendFrame::TaskAssignment {
                    job_id,
                    queue_type: queue,
                },
            )
            .await
        {
            warn!(agent_id = %agent_id, job_id = %job_id, error = %e, "Assignment notice not delivered");
        }

        info!(job_id = %job_id, agent_id = %agent_id, queue = %queue, "Starting job execution");

        let mut failure: Option<String> = None;

        // Phase 1: streamed code generation, heartbeated per log frame.
        let execute_policy = self
            .activity_policy()
            .with_heartbeat_timeout(self.config.execute_heartbeat_timeout);
        let executed = with_cancel(
            &mut cancel,
            run_activity(&execute_policy, |ctx| self.execute_activity(ctx, &job, &agent)),
        )
        .await;
        match executed {
            None => return self.cancelled(&job, &agent).await,
            Some(Ok(())) => {}
            Some(Err(e)) => failure = Some(failure_detail(&e)),
        }

        // The persisted series is authoritative; snapshot it onto the job.
        self.snapshot_generation_logs(&job).await;

        // Phase 2: verification.
        if failure.is_none() {
            let client = Arc::clone(&self.client);
            let agent_ref = agent.clone();
            let verified = with_cancel(
                &mut cancel,
                run_activity(&self.activity_policy(), move |_ctx| {
                    let client = Arc::clone(&client);
                    let agent = agent_ref.clone();
                    async move {
                        client
                            .run_verification(&agent, job_id)
                            .await
                            .map_err(client_failure)
                    }
                }),
            )
            .await;
            match verified {
                None => return self.cancelled(&job, &agent).await,
                Some(Ok(outcome)) => {
                    self.persist_verification(&job, &outcome.logs, outcome.confidence_score)
                        .await;
                    if !outcome.passed {
                        failure = Some("verification failed".to_string());
                    }
                }
                Some(Err(e)) => failure = Some(failure_detail(&e)),
            }
        }

        // Phase 3: PR creation, only for verified jobs with a repository.
        if failure.is_none() {
            if let Some(repo_id) = job.repo_id.clone() {
                let request = CreatePrRequest {
                    job_id,
                    repo_id,
                    branch: format!("jobforge/job-{}", &job_id.to_string()[..8]),
                    title: job.name.clone(),
                    body: job.description.clone(),
                };
                let client = Arc::clone(&self.client);
                let agent_ref = agent.clone();
                let pr = with_cancel(
                    &mut cancel,
                    run_activity(&self.activity_policy(), move |_ctx| {
                        let client = Arc::clone(&client);
                        let agent = agent_ref.clone();
                        let request = request.clone();
                        async move {
                            client.create_pr(&agent, request).await.map_err(client_failure)
                        }
                    }),
                )
                .await;
                match pr {
                    None => return self.cancelled(&job, &agent).await,
                    Some(Ok(outcome)) => self.persist_pr_link(&job, &outcome.link).await,
                    Some(Err(e)) => failure = Some(failure_detail(&e)),
                }
            }
        }

        // Terminal block: cleanup always runs.
        self.cleanup(&job, &agent).await;

        match failure {
            None => self.finish(&job, &agent, JobStatus::Completed, None).await,
            Some(detail) => {
                self.finish(&job, &agent, JobStatus::Failed, Some(detail))
                    .await
            }
        }
    }

    /// Streaming execute activity: one attempt of the `ExecuteJob` RPC.
    async fn execute_activity(
        &self,
        ctx: ActivityContext,
        job: &Job,
        agent: &Agent,
    ) -> Result<(), ActivityError> {
        let request = ExecuteJobRequest {
            job_id: job.id,
            job_version: job.version,
            prompt: job.user_input.prompt.clone(),
            repo_id: job.repo_id.clone(),
            user_comments: job.user_comments.clone(),
        };
        let mut stream = self
            .client
            .execute_job(agent, request)
            .await
            .map_err(client_failure)?;

        let mut last_level = LogLevel::Info;
        let mut last_message = String::new();
        while let Some(item) = stream.next().await {
            let message = item.map_err(client_failure)?;
            ctx.heartbeat();
            metrics::log_frame_ingested();

            let entry = JobLogEntry {
                job_id: job.id,
                job_version: job.version,
                org_id: job.org_id,
                level: message.level,
                timestamp: message.timestamp,
                message: message.message.clone(),
                stage: message.stage.clone(),
            };
            // Persistence is at-least-once; a dropped entry is not worth
            // failing the whole run over.
            if let Err(e) = self.store.append_job_log(&entry).await {
                warn!(job_id = %job.id, error = %e, "Failed to persist log entry");
            }
            self.notifier.broadcast(&entry).await;

            last_level = message.level;
            last_message = message.message;
        }

        // The agent signals failure by ending the stream on an error line.
        if last_level == LogLevel::Error {
            return Err(ActivityError::permanent(format!(
                "agent reported failure: {}",
                last_message
            )));
        }
        Ok(())
    }

    async fn snapshot_generation_logs(&self, job: &Job) {
        let rendered = match self.store.job_logs(job.org_id, job.id, job.version).await {
            Ok(entries) if !entries.is_empty() => entries
                .iter()
                .map(JobLogEntry::render)
                .collect::<Vec<_>>()
                .join("\n"),
            Ok(_) => return,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed to read log series");
                return;
            }
        };
        if let Ok(Some(mut latest)) = self.store.latest(job.org_id, job.id).await {
            latest.code_generation_logs = Some(rendered);
            latest.updated_at = Utc::now();
            if let Err(e) = self.store.update_latest(&latest).await {
                warn!(job_id = %job.id, error = %e, "Failed to snapshot generation logs");
            }
        }
    }

    async fn persist_verification(&self, job: &Job, logs: &str, confidence: Option<f64>) {
        if let Ok(Some(mut latest)) = self.store.latest(job.org_id, job.id).await {
            latest.code_verification_logs = Some(logs.to_string());
            if confidence.is_some() {
                latest.confidence_score = confidence;
            }
            latest.updated_at = Utc::now();
            if let Err(e) = self.store.update_latest(&latest).await {
                warn!(job_id = %job.id, error = %e, "Failed to persist verification logs");
            }
        }
    }

    async fn persist_pr_link(&self, job: &Job, link: &str) {
        if let Ok(Some(mut latest)) = self.store.latest(job.org_id, job.id).await {
            latest.pr_link = Some(link.to_string());
            latest.updated_at = Utc::now();
            if let Err(e) = self.store.update_latest(&latest).await {
                warn!(job_id = %job.id, error = %e, "Failed to persist PR link");
            }
        }
    }

    /// Terminal cleanup. Failures are logged, never escalated: the
    /// workspace is the agent's to reap on its next run.
    async fn cleanup(&self, job: &Job, agent: &Agent) {
        let client = Arc::clone(&self.client);
        let agent = agent.clone();
        let job_id = job.id;
        let result = run_activity(&self.activity_policy(), move |_ctx| {
            let client = Arc::clone(&client);
            let agent = agent.clone();
            async move {
                client
                    .cleanup_workspace(&agent, job_id)
                    .await
                    .map_err(client_failure)
            }
        })
        .await;
        if let Err(e) = result {
            warn!(job_id = %job.id, error = %e, "Workspace cleanup failed");
        }
    }

    /// Cancellation path: tell the agent to stop, clean up, mark failed.
    async fn cancelled(
        &self,
        job: &Job,
        agent: &Agent,
    ) -> Result<ExecutionOutcome, DispatchError> {
        warn!(job_id = %job.id, "Job execution cancelled");
        if let Err(e) = self.client.cancel_job(agent, job.id).await {
            warn!(job_id = %job.id, error = %e, "CancelJob call failed");
        }
        self.cleanup(job, agent).await;
        self.finish(
            job,
            agent,
            JobStatus::Failed,
            Some("cancelled before completion".to_string()),
        )
        .await
    }

    /// Writes the terminal status, `updates` line, and activity row.
    async fn finish(
        &self,
        job: &Job,
        agent: &Agent,
        status: JobStatus,
        failure: Option<String>,
    ) -> Result<ExecutionOutcome, DispatchError> {
        let mut latest = self
            .store
            .latest(job.org_id, job.id)
            .await?
            .ok_or(DispatchError::JobNotFound(job.id))?;

        latest.status = status;
        latest.agent_id = None;
        latest.updated_at = Utc::now();
        let line = match &failure {
            None => format!("execution completed on agent {}", agent.host),
            Some(detail) => format!("execution failed on agent {}: {}", agent.host, detail),
        };
        latest.append_update(&line);
        self.store.update_latest(&latest).await?;

        let succeeded = status == JobStatus::Completed;
        metrics::execution_finished(if succeeded { "completed" } else { "failed" });
        info!(job_id = %job.id, status = %status, "Job execution finished");

        let activity = Activity::new(job.id, job.org_id, "job.executed", line, "system")
            .with_logs(
                latest.code_generation_logs.clone(),
                latest.code_verification_logs.clone(),
            );
        if let Err(e) = self.store.insert_activity(&activity).await {
            warn!(job_id = %job.id, error = %e, "Failed to write execution activity");
        }

        Ok(ExecutionOutcome {
            job_id: job.id,
            succeeded,
        })
    }
}

/// Runs `fut` unless the cancel signal fires first.
async fn with_cancel<T>(
    cancel: &mut watch::Receiver<bool>,
    fut: impl std::future::Future<Output = T>,
) -> Option<T> {
    tokio::select! {
        result = fut => Some(result),
        _ = wait_cancelled(cancel) => None,
    }
}

async fn wait_cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            // Cancel source dropped: nothing will ever signal.
            std::future::pending::<()>().await;
        }
    }
}

fn client_failure(error: AgentClientError) -> ActivityError {
    if error.is_transient() {
        ActivityError::transient(error.to_string())
    } else {
        ActivityError::permanent(error.to_string())
    }
}

/// The innermost cause string of an engine failure, for `updates`.
fn failure_detail(error: &EngineError) -> String {
    match error {
        EngineError::Exhausted { last, .. } => last.clone(),
        EngineError::Permanent(message) => message.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_detail_unwraps_engine_layers() {
        let exhausted = EngineError::Exhausted {
            attempts: 3,
            last: "connection refused".to_string(),
        };
        assert_eq!(failure_detail(&exhausted), "connection refused");

        let permanent = EngineError::Permanent("job not found".to_string());
        assert_eq!(failure_detail(&permanent), "job not found");
    }

    #[tokio::test]
    async fn test_with_cancel_resolves_future_when_not_cancelled() {
        let (_tx, mut rx) = watch::channel(false);
        let result = with_cancel(&mut rx, async { 5 }).await;
        assert_eq!(result, Some(5));
    }

    #[tokio::test]
    async fn test_with_cancel_aborts_on_signal() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).expect("signal");
        let result = with_cancel(&mut rx, std::future::pending::<()>()).await;
        assert!(result.is_none());
    }
}
