//! Shared fixtures for the integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream;
use tokio::sync::Mutex;
use uuid::Uuid;

use jobforge::agent::{
    AgentClient, AgentClientError, CreatePrRequest, ExecuteJobRequest, LogMessage, LogStream,
    PrOutcome, VerificationOutcome,
};
use jobforge::config::OrchestratorConfig;
use jobforge::model::{Agent, LogLevel};
use jobforge::store::{AgentRegistration, JobStore, MemStore};

/// A scripted agent: emits a fixed log sequence, passes or fails
/// verification on demand, and counts lifecycle calls.
pub struct MockAgentClient {
    pub verification_passes: Mutex<bool>,
    pub fail_execution: Mutex<bool>,
    pub executions: AtomicUsize,
    pub cleanups: AtomicUsize,
    pub cancels: AtomicUsize,
}

impl Default for MockAgentClient {
    fn default() -> Self {
        Self {
            verification_passes: Mutex::new(true),
            fail_execution: Mutex::new(false),
            executions: AtomicUsize::new(0),
            cleanups: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
        }
    }
}

impl MockAgentClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn set_verification_passes(&self, passes: bool) {
        *self.verification_passes.lock().await = passes;
    }

    pub async fn set_fail_execution(&self, fail: bool) {
        *self.fail_execution.lock().await = fail;
    }
}

#[async_trait]
impl AgentClient for MockAgentClient {
    async fn execute_job(
        &self,
        _agent: &Agent,
        request: ExecuteJobRequest,
    ) -> Result<LogStream, AgentClientError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let failing = *self.fail_execution.lock().await;

        let mut messages = vec![
            LogMessage {
                job_id: request.job_id,
                level: LogLevel::Info,
                timestamp: Utc::now(),
                message: "workspace prepared".to_string(),
                stage: Some("execute".to_string()),
            },
            LogMessage {
                job_id: request.job_id,
                level: LogLevel::Info,
                timestamp: Utc::now(),
                message: "changes applied".to_string(),
                stage: Some("execute".to_string()),
            },
        ];
        if failing {
            messages.push(LogMessage {
                job_id: request.job_id,
                level: LogLevel::Error,
                timestamp: Utc::now(),
                message: "build broke".to_string(),
                stage: Some("execute".to_string()),
            });
        }

        let items: Vec<Result<LogMessage, AgentClientError>> =
            messages.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(items)))
    }

    async fn cancel_job(&self, _agent: &Agent, _job_id: Uuid) -> Result<(), AgentClientError> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn run_verification(
        &self,
        _agent: &Agent,
        _job_id: Uuid,
    ) -> Result<VerificationOutcome, AgentClientError> {
        let passed = *self.verification_passes.lock().await;
        Ok(VerificationOutcome {
            passed,
            logs: if passed {
                "all checks passed".to_string()
            } else {
                "2 tests failed".to_string()
            },
            confidence_score: Some(if passed { 0.9 } else { 0.2 }),
        })
    }

    async fn create_pr(
        &self,
        _agent: &Agent,
        request: CreatePrRequest,
    ) -> Result<PrOutcome, AgentClientError> {
        Ok(PrOutcome {
            link: format!("https://example.com/{}/pull/1", request.repo_id),
        })
    }

    async fn cleanup_workspace(
        &self,
        _agent: &Agent,
        _job_id: Uuid,
    ) -> Result<(), AgentClientError> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn health_check(&self, _agent: &Agent) -> Result<(), AgentClientError> {
        Ok(())
    }
}

/// Registers an active agent row and returns its id.
pub async fn register_agent(store: &MemStore, org_id: Uuid) -> Uuid {
    store
        .upsert_agent(AgentRegistration {
            org_id,
            host: format!("host-{}", Uuid::new_v4()),
            port: 50051,
            ip: None,
        })
        .await
        .expect("agent upsert")
        .agent
        .id
}

/// A config with retry delays shrunk so failing paths stay fast.
pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        retry_initial_interval: std::time::Duration::from_millis(1),
        retry_max_interval: std::time::Duration::from_millis(5),
        ping_timeout: std::time::Duration::from_millis(50),
        reconnect_timeout: std::time::Duration::from_millis(50),
        ..Default::default()
    }
}
