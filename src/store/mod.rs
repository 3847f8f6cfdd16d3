//! Persistent store for jobs, agents, queue-pause flags, activities, and
//! job logs.
//!
//! The store is the single authority on durable state. Every operation that
//! touches queue positions runs as one serializable transaction so the
//! contiguous `[0, n-1]` position invariant holds at every instant, even
//! under concurrent claimers.
//!
//! Two implementations exist: [`MemStore`] (one async mutex over the whole
//! state, used by tests and local development) and [`PgStore`] (PostgreSQL
//! via sqlx).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{
    Activity, Agent, AgentStatus, Job, JobLogEntry, QueueType, ScheduleBinding,
};

pub mod memory;
pub mod migrations;
pub mod postgres;

pub use memory::MemStore;
pub use postgres::PgStore;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Job not found (latest version) for the given org.
    #[error("Job {0} not found")]
    JobNotFound(Uuid),

    /// Agent not found.
    #[error("Agent {0} not found")]
    AgentNotFound(Uuid),

    /// The operation required the job to be queued and it was not.
    #[error("Job {0} is not queued")]
    NotQueued(Uuid),

    /// The queue had no claimable job (not an error for callers that poll).
    #[error("Queue is empty")]
    QueueEmpty,

    /// A serialization conflict that the caller should retry.
    #[error("Transaction conflict: {0}")]
    Conflict(String),

    /// Serialization/deserialization of a stored JSON column failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(String),
}

impl StoreError {
    /// Whether the engine should retry the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::ConnectionFailed(_) | StoreError::QueryFailed(_) | StoreError::Conflict(_)
        )
    }
}

/// Fields written by an agent registration upsert, keyed on `(org_id, host)`.
#[derive(Debug, Clone)]
pub struct AgentRegistration {
    pub org_id: Uuid,
    pub host: String,
    pub port: u16,
    pub ip: Option<String>,
}

/// Result of a registration upsert: the stored agent plus the status it had
/// before the upsert (`Offline` for a freshly inserted row).
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub agent: Agent,
    pub prior_status: AgentStatus,
    pub created: bool,
}

/// Durable state operations.
///
/// Queue-mutating methods (`claim_next`, `enqueue_at_tail`, `dequeue`,
/// `move_to_position`, `recover_orphans`) each execute as a single
/// transaction; on conflict the caller retries.
#[async_trait]
pub trait JobStore: Send + Sync {
    // ---- jobs ----

    /// Inserts a new `(id, version)` row. Rejects duplicate keys.
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Latest version of a job, scoped by org.
    async fn latest(&self, org_id: Uuid, job_id: Uuid) -> Result<Option<Job>, StoreError>;

    /// A specific version of a job, scoped by org.
    async fn job_version(
        &self,
        org_id: Uuid,
        job_id: Uuid,
        version: u32,
    ) -> Result<Option<Job>, StoreError>;

    /// Latest versions of all non-archived jobs in an org.
    async fn list_jobs(&self, org_id: Uuid) -> Result<Vec<Job>, StoreError>;

    /// Overwrites the latest version row in place. The caller must have read
    /// the latest version; `version` in `job` must match it.
    async fn update_latest(&self, job: &Job) -> Result<(), StoreError>;

    // ---- queue model ----

    /// Number of latest-version queued rows in `(org, queue)`; the position
    /// the next tail insert receives.
    async fn next_position(&self, org_id: Uuid, queue: QueueType) -> Result<i64, StoreError>;

    /// Atomically claims the minimum-position queued job: marks it
    /// in-progress under `agent_id`, clears its queue slot, and closes the
    /// position gap. Returns `None` when the queue is empty.
    async fn claim_next(
        &self,
        org_id: Uuid,
        queue: QueueType,
        agent_id: Uuid,
    ) -> Result<Option<Job>, StoreError>;

    /// Places the job at the tail of `queue`, setting `status = queued`.
    async fn enqueue_at_tail(
        &self,
        org_id: Uuid,
        job_id: Uuid,
        queue: QueueType,
    ) -> Result<Job, StoreError>;

    /// Removes a queued job from its queue and reprioritizes the remainder,
    /// in one transaction. The job's `status` is left untouched; callers
    /// advance it in the same logical step.
    async fn dequeue(&self, org_id: Uuid, job_id: Uuid) -> Result<Job, StoreError>;

    /// Moves a queued job to `new_position` (clamped to `[0, n-1]`) and
    /// rewrites positions as `[0, n-1]`, in one transaction.
    async fn move_to_position(
        &self,
        org_id: Uuid,
        job_id: Uuid,
        new_position: i64,
    ) -> Result<Job, StoreError>;

    /// Queued jobs of `(org, queue)` ordered by position.
    async fn queued_jobs(&self, org_id: Uuid, queue: QueueType) -> Result<Vec<Job>, StoreError>;

    // ---- orphan recovery ----

    /// Returns every in-progress job in the org that is either owned by
    /// `agent_id` or stale (`updated_at < stale_before`) back to `queued`,
    /// clearing `agent_id` and re-enqueueing each at the tail of its home
    /// queue. Returns the recovered jobs.
    async fn recover_orphans(
        &self,
        org_id: Uuid,
        agent_id: Uuid,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError>;

    /// The single in-progress job owned by an agent, if any.
    async fn in_progress_for_agent(
        &self,
        org_id: Uuid,
        agent_id: Uuid,
    ) -> Result<Option<Job>, StoreError>;

    // ---- queue pause state ----

    async fn is_queue_paused(&self, org_id: Uuid, queue: QueueType) -> Result<bool, StoreError>;

    async fn set_queue_paused(
        &self,
        org_id: Uuid,
        queue: QueueType,
        paused: bool,
    ) -> Result<(), StoreError>;

    // ---- agents ----

    /// Registration upsert on `(org_id, host)`: writes ip/port, marks the
    /// agent active with a cleared failure counter, touches both liveness
    /// timestamps, and reports the prior status.
    async fn upsert_agent(&self, reg: AgentRegistration) -> Result<UpsertOutcome, StoreError>;

    async fn get_agent(&self, agent_id: Uuid) -> Result<Option<Agent>, StoreError>;

    async fn list_agents(&self, org_id: Uuid) -> Result<Vec<Agent>, StoreError>;

    /// Overwrites an agent row.
    async fn update_agent(&self, agent: &Agent) -> Result<(), StoreError>;

    /// HEARTBEAT frame effect: `last_active = at`, failure counter cleared.
    async fn record_agent_heartbeat(
        &self,
        agent_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Increments the consecutive-failure counter and flips the agent
    /// offline at `threshold`. Returns the updated agent.
    async fn record_ping_failure(
        &self,
        agent_id: Uuid,
        threshold: u32,
    ) -> Result<Agent, StoreError>;

    async fn delete_agent(&self, agent_id: Uuid) -> Result<(), StoreError>;

    // ---- credentials ----

    /// Resolves a hashed agent API key to its org.
    async fn org_for_api_key(&self, key_hash: &str) -> Result<Option<Uuid>, StoreError>;

    /// Registers a hashed agent API key for an org.
    async fn insert_api_key(&self, org_id: Uuid, key_hash: &str) -> Result<(), StoreError>;

    /// Resolves a hashed user bearer token to `(user_id, org_id)`.
    async fn resolve_user_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<(String, Uuid)>, StoreError>;

    /// Registers a hashed user bearer token.
    async fn insert_user_token(
        &self,
        token_hash: &str,
        user_id: &str,
        org_id: Uuid,
    ) -> Result<(), StoreError>;

    // ---- activities ----

    async fn insert_activity(&self, activity: &Activity) -> Result<(), StoreError>;

    async fn activities_for_job(
        &self,
        org_id: Uuid,
        job_id: Uuid,
    ) -> Result<Vec<Activity>, StoreError>;

    // ---- job logs ----

    /// Appends one entry to the `(job_id, job_version, org_id)` log series.
    async fn append_job_log(&self, entry: &JobLogEntry) -> Result<(), StoreError>;

    /// The persisted log series for one job version, in append order.
    async fn job_logs(
        &self,
        org_id: Uuid,
        job_id: Uuid,
        version: u32,
    ) -> Result<Vec<JobLogEntry>, StoreError>;

    // ---- schedule bindings ----

    async fn set_schedule_binding(&self, binding: &ScheduleBinding) -> Result<(), StoreError>;

    async fn get_schedule_binding(
        &self,
        agent_id: Uuid,
    ) -> Result<Option<ScheduleBinding>, StoreError>;
}
