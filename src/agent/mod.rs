//! Client for the agent's RPC surface.
//!
//! One stable interface covers every call the backend makes against a
//! remote agent: streamed job execution, verification, PR creation,
//! workspace cleanup, cancellation, and health checks. Contract drift
//! fails at compile time instead of at dispatch time.

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{Agent, LogLevel};

pub mod http;

pub use http::HttpAgentClient;

/// Errors raised by agent RPC calls.
#[derive(Debug, Error)]
pub enum AgentClientError {
    /// Network-level failure; retriable.
    #[error("Agent request failed: {0}")]
    RequestFailed(String),

    /// The agent rejected the call; not retriable.
    #[error("Agent rejected request: {0}")]
    Rejected(String),

    /// A streamed log line could not be decoded.
    #[error("Malformed log frame: {0}")]
    MalformedFrame(String),
}

impl AgentClientError {
    /// Whether the engine should retry the failed call.
    pub fn is_transient(&self) -> bool {
        matches!(self, AgentClientError::RequestFailed(_))
    }
}

/// Request to start code generation for one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteJobRequest {
    pub job_id: Uuid,
    pub job_version: u32,
    pub prompt: String,
    pub repo_id: Option<String>,
    /// Reviewer comments carried into a rework run.
    pub user_comments: Vec<String>,
}

/// One log line streamed back during execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessage {
    pub job_id: Uuid,
    pub level: LogLevel,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    #[serde(default)]
    pub stage: Option<String>,
}

/// Result of the verification pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub passed: bool,
    pub logs: String,
    #[serde(default)]
    pub confidence_score: Option<f64>,
}

/// Request to open a pull request for a finished job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePrRequest {
    pub job_id: Uuid,
    pub repo_id: String,
    pub branch: String,
    pub title: String,
    pub body: String,
}

/// Result of PR creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrOutcome {
    pub link: String,
}

/// The stream of log messages produced by a running execution.
pub type LogStream = Pin<Box<dyn Stream<Item = Result<LogMessage, AgentClientError>> + Send>>;

/// RPC surface every agent exposes.
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Starts code generation; resolves to the live log stream. The stream
    /// ends when the agent finishes (successfully or not); an `Error`-level
    /// terminal message indicates failure.
    async fn execute_job(
        &self,
        agent: &Agent,
        request: ExecuteJobRequest,
    ) -> Result<LogStream, AgentClientError>;

    /// Asks the agent to abort a running job.
    async fn cancel_job(&self, agent: &Agent, job_id: Uuid) -> Result<(), AgentClientError>;

    /// Runs the verification pass for a finished execution.
    async fn run_verification(
        &self,
        agent: &Agent,
        job_id: Uuid,
    ) -> Result<VerificationOutcome, AgentClientError>;

    /// Creates the pull request.
    async fn create_pr(
        &self,
        agent: &Agent,
        request: CreatePrRequest,
    ) -> Result<PrOutcome, AgentClientError>;

    /// Removes the job's workspace. Runs even after failures.
    async fn cleanup_workspace(&self, agent: &Agent, job_id: Uuid)
        -> Result<(), AgentClientError>;

    /// Direct liveness probe against the agent process.
    async fn health_check(&self, agent: &Agent) -> Result<(), AgentClientError>;
}
