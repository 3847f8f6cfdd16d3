//! PostgreSQL store implementation.
//!
//! Every queue-mutating method runs as one transaction against the pool.
//! Job rows are versioned; the latest-version projection is applied in SQL
//! so callers never see stale version rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use crate::model::{
    Activity, Agent, AgentStatus, Job, JobLogEntry, JobStatus, QueueType, ScheduleBinding,
    UserInput,
};

use super::{migrations, AgentRegistration, JobStore, StoreError, UpsertOutcome};

/// Restricts a jobs query to latest-version rows. `j` must be the alias of
/// the outer `jobs` reference.
const LATEST_VERSION: &str = "version = (SELECT MAX(version) FROM jobs WHERE id = j.id)";

const JOB_COLUMNS: &str = "id, version, org_id, name, description, status, priority, queue_type, \
     order_in_queue, agent_id, user_input, repo_id, user_acceptance_status, user_comments, \
     code_generation_logs, code_verification_logs, pr_link, confidence_score, updates, \
     created_at, updated_at, created_by, updated_by";

/// PostgreSQL [`JobStore`].
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connects to the database and runs pending migrations.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .acquire_timeout(std::time::Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        migrations::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Creates a store from an existing pool. Migrations are not run.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_latest_tx(
        tx: &mut Transaction<'_, Postgres>,
        org_id: Uuid,
        job_id: Uuid,
        lock: bool,
    ) -> Result<Option<Job>, StoreError> {
        let suffix = if lock { "FOR UPDATE" } else { "" };
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM jobs j \
             WHERE id = $1 AND org_id = $2 AND {LATEST_VERSION} {suffix}"
        );
        let row = sqlx::query(&query)
            .bind(job_id)
            .bind(org_id)
            .fetch_optional(&mut **tx)
            .await?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    /// Tail position of `(org, queue)` as seen inside `tx`.
    async fn tail_position_tx(
        tx: &mut Transaction<'_, Postgres>,
        org_id: Uuid,
        queue: QueueType,
    ) -> Result<i64, StoreError> {
        let query = format!(
            "SELECT COUNT(*) FROM jobs j \
             WHERE org_id = $1 AND status = 'queued' AND queue_type = $2 AND {LATEST_VERSION}"
        );
        let count: i64 = sqlx::query_scalar(&query)
            .bind(org_id)
            .bind(queue.to_string())
            .fetch_one(&mut **tx)
            .await?;
        Ok(count)
    }

    /// Closes a position gap inside `tx`.
    async fn close_gap_tx(
        tx: &mut Transaction<'_, Postgres>,
        org_id: Uuid,
        queue: QueueType,
        removed_position: i64,
    ) -> Result<(), StoreError> {
        let query = format!(
            "UPDATE jobs j SET order_in_queue = order_in_queue - 1 \
             WHERE org_id = $1 AND status = 'queued' AND queue_type = $2 \
               AND order_in_queue > $3 AND {LATEST_VERSION}"
        );
        sqlx::query(&query)
            .bind(org_id)
            .bind(queue.to_string())
            .bind(removed_position)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let user_input = serde_json::to_value(&job.user_input)?;
        let user_comments = serde_json::to_value(&job.user_comments)?;

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, version, org_id, name, description, status, priority, queue_type,
                order_in_queue, agent_id, user_input, repo_id, user_acceptance_status,
                user_comments, code_generation_logs, code_verification_logs, pr_link,
                confidence_score, updates, created_at, updated_at, created_by, updated_by
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                $14, $15, $16, $17, $18, $19, $20, $21, $22, $23
            )
            "#,
        )
        .bind(job.id)
        .bind(job.version as i32)
        .bind(job.org_id)
        .bind(&job.name)
        .bind(&job.description)
        .bind(job.status.to_string())
        .bind(job.priority.to_string())
        .bind(job.queue_type.map(|q| q.to_string()))
        .bind(job.order_in_queue)
        .bind(job.agent_id)
        .bind(&user_input)
        .bind(&job.repo_id)
        .bind(job.user_acceptance_status.to_string())
        .bind(&user_comments)
        .bind(&job.code_generation_logs)
        .bind(&job.code_verification_logs)
        .bind(&job.pr_link)
        .bind(job.confidence_score)
        .bind(&job.updates)
        .bind(job.created_at)
        .bind(job.updated_at)
        .bind(&job.created_by)
        .bind(&job.updated_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest(&self, org_id: Uuid, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM jobs j \
             WHERE id = $1 AND org_id = $2 AND {LATEST_VERSION}"
        );
        let row = sqlx::query(&query)
            .bind(job_id)
            .bind(org_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    async fn job_version(
        &self,
        org_id: Uuid,
        job_id: Uuid,
        version: u32,
    ) -> Result<Option<Job>, StoreError> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE id = $1 AND org_id = $2 AND version = $3"
        );
        let row = sqlx::query(&query)
            .bind(job_id)
            .bind(org_id)
            .bind(version as i32)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    async fn list_jobs(&self, org_id: Uuid) -> Result<Vec<Job>, StoreError> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM jobs j \
             WHERE org_id = $1 AND status != 'archived' AND {LATEST_VERSION} \
             ORDER BY created_at"
        );
        let rows = sqlx::query(&query).bind(org_id).fetch_all(&self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn update_latest(&self, job: &Job) -> Result<(), StoreError> {
        let user_input = serde_json::to_value(&job.user_input)?;
        let user_comments = serde_json::to_value(&job.user_comments)?;

        let query = format!(
            "UPDATE jobs j SET \
                name = $4, description = $5, status = $6, priority = $7, queue_type = $8, \
                order_in_queue = $9, agent_id = $10, user_input = $11, repo_id = $12, \
                user_acceptance_status = $13, user_comments = $14, code_generation_logs = $15, \
                code_verification_logs = $16, pr_link = $17, confidence_score = $18, \
                updates = $19, updated_at = $20, updated_by = $21 \
             WHERE id = $1 AND org_id = $2 AND version = $3 AND {LATEST_VERSION}"
        );
        let result = sqlx::query(&query)
            .bind(job.id)
            .bind(job.org_id)
            .bind(job.version as i32)
            .bind(&job.name)
            .bind(&job.description)
            .bind(job.status.to_string())
            .bind(job.priority.to_string())
            .bind(job.queue_type.map(|q| q.to_string()))
            .bind(job.order_in_queue)
            .bind(job.agent_id)
            .bind(&user_input)
            .bind(&job.repo_id)
            .bind(job.user_acceptance_status.to_string())
            .bind(&user_comments)
            .bind(&job.code_generation_logs)
            .bind(&job.code_verification_logs)
            .bind(&job.pr_link)
            .bind(job.confidence_score)
            .bind(&job.updates)
            .bind(job.updated_at)
            .bind(&job.updated_by)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "job {} version {} is not the latest",
                job.id, job.version
            )));
        }
        Ok(())
    }

    async fn next_position(&self, org_id: Uuid, queue: QueueType) -> Result<i64, StoreError> {
        let query = format!(
            "SELECT COUNT(*) FROM jobs j \
             WHERE org_id = $1 AND status = 'queued' AND queue_type = $2 AND {LATEST_VERSION}"
        );
        let count: i64 = sqlx::query_scalar(&query)
            .bind(org_id)
            .bind(queue.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn claim_next(
        &self,
        org_id: Uuid,
        queue: QueueType,
        agent_id: Uuid,
    ) -> Result<Option<Job>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let query = format!(
            "SELECT {JOB_COLUMNS} FROM jobs j \
             WHERE org_id = $1 AND status = 'queued' AND queue_type = $2 AND {LATEST_VERSION} \
             ORDER BY order_in_queue ASC LIMIT 1 FOR UPDATE"
        );
        let row = sqlx::query(&query)
            .bind(org_id)
            .bind(queue.to_string())
            .fetch_optional(&mut *tx)
            .await?;
        let head = match row {
            Some(row) => job_from_row(&row)?,
            None => return Ok(None),
        };

        let now = Utc::now();
        sqlx::query(
            "UPDATE jobs SET status = 'in-progress', agent_id = $3, queue_type = NULL, \
             order_in_queue = -1, updated_at = $4 WHERE id = $1 AND version = $2",
        )
        .bind(head.id)
        .bind(head.version as i32)
        .bind(agent_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        Self::close_gap_tx(&mut tx, org_id, queue, head.order_in_queue).await?;

        let claimed = Self::fetch_latest_tx(&mut tx, org_id, head.id, false)
            .await?
            .ok_or(StoreError::JobNotFound(head.id))?;
        tx.commit().await?;
        Ok(Some(claimed))
    }

    async fn enqueue_at_tail(
        &self,
        org_id: Uuid,
        job_id: Uuid,
        queue: QueueType,
    ) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await?;
        let current = Self::fetch_latest_tx(&mut tx, org_id, job_id, true)
            .await?
            .ok_or(StoreError::JobNotFound(job_id))?;

        // Leaving one queue for another closes the old gap first.
        if let (JobStatus::Queued, Some(old_queue)) = (current.status, current.queue_type) {
            sqlx::query(
                "UPDATE jobs SET queue_type = NULL, order_in_queue = -1 \
                 WHERE id = $1 AND version = $2",
            )
            .bind(job_id)
            .bind(current.version as i32)
            .execute(&mut *tx)
            .await?;
            Self::close_gap_tx(&mut tx, org_id, old_queue, current.order_in_queue).await?;
        }

        let tail = Self::tail_position_tx(&mut tx, org_id, queue).await?;
        sqlx::query(
            "UPDATE jobs SET status = 'queued', queue_type = $3, order_in_queue = $4, \
             agent_id = NULL, updated_at = $5 WHERE id = $1 AND version = $2",
        )
        .bind(job_id)
        .bind(current.version as i32)
        .bind(queue.to_string())
        .bind(tail)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        let queued = Self::fetch_latest_tx(&mut tx, org_id, job_id, false)
            .await?
            .ok_or(StoreError::JobNotFound(job_id))?;
        tx.commit().await?;
        Ok(queued)
    }

    async fn dequeue(&self, org_id: Uuid, job_id: Uuid) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await?;
        let current = Self::fetch_latest_tx(&mut tx, org_id, job_id, true)
            .await?
            .ok_or(StoreError::JobNotFound(job_id))?;
        let queue = match (current.status, current.queue_type) {
            (JobStatus::Queued, Some(queue)) => queue,
            _ => return Err(StoreError::NotQueued(job_id)),
        };

        sqlx::query(
            "UPDATE jobs SET queue_type = NULL, order_in_queue = -1, updated_at = $3 \
             WHERE id = $1 AND version = $2",
        )
        .bind(job_id)
        .bind(current.version as i32)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;
        Self::close_gap_tx(&mut tx, org_id, queue, current.order_in_queue).await?;

        let removed = Self::fetch_latest_tx(&mut tx, org_id, job_id, false)
            .await?
            .ok_or(StoreError::JobNotFound(job_id))?;
        tx.commit().await?;
        Ok(removed)
    }

    async fn move_to_position(
        &self,
        org_id: Uuid,
        job_id: Uuid,
        new_position: i64,
    ) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await?;
        let current = Self::fetch_latest_tx(&mut tx, org_id, job_id, true)
            .await?
            .ok_or(StoreError::JobNotFound(job_id))?;
        let queue = match (current.status, current.queue_type) {
            (JobStatus::Queued, Some(queue)) => queue,
            _ => return Err(StoreError::NotQueued(job_id)),
        };

        let query = format!(
            "SELECT id, version FROM jobs j \
             WHERE org_id = $1 AND status = 'queued' AND queue_type = $2 AND {LATEST_VERSION} \
             ORDER BY order_in_queue ASC FOR UPDATE"
        );
        let rows = sqlx::query(&query)
            .bind(org_id)
            .bind(queue.to_string())
            .fetch_all(&mut *tx)
            .await?;
        let mut ordered: Vec<(Uuid, i32)> = rows
            .iter()
            .map(|row| (row.get("id"), row.get("version")))
            .collect();

        let clamped = new_position.clamp(0, ordered.len() as i64 - 1) as usize;
        let from = ordered
            .iter()
            .position(|(id, _)| *id == job_id)
            .ok_or(StoreError::NotQueued(job_id))?;
        if from != clamped {
            let entry = ordered.remove(from);
            ordered.insert(clamped, entry);

            let now = Utc::now();
            for (position, (id, version)) in ordered.iter().enumerate() {
                sqlx::query(
                    "UPDATE jobs SET order_in_queue = $3, updated_at = $4 \
                     WHERE id = $1 AND version = $2 AND order_in_queue != $3",
                )
                .bind(id)
                .bind(version)
                .bind(position as i64)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
        }

        let moved = Self::fetch_latest_tx(&mut tx, org_id, job_id, false)
            .await?
            .ok_or(StoreError::JobNotFound(job_id))?;
        tx.commit().await?;
        Ok(moved)
    }

    async fn queued_jobs(&self, org_id: Uuid, queue: QueueType) -> Result<Vec<Job>, StoreError> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM jobs j \
             WHERE org_id = $1 AND status = 'queued' AND queue_type = $2 AND {LATEST_VERSION} \
             ORDER BY order_in_queue ASC"
        );
        let rows = sqlx::query(&query)
            .bind(org_id)
            .bind(queue.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn recover_orphans(
        &self,
        org_id: Uuid,
        agent_id: Uuid,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let query = format!(
            "SELECT {JOB_COLUMNS} FROM jobs j \
             WHERE org_id = $1 AND status = 'in-progress' \
               AND (agent_id = $2 OR updated_at < $3) AND {LATEST_VERSION} \
             ORDER BY updated_at ASC FOR UPDATE"
        );
        let rows = sqlx::query(&query)
            .bind(org_id)
            .bind(agent_id)
            .bind(stale_before)
            .fetch_all(&mut *tx)
            .await?;
        let orphans: Vec<Job> = rows
            .iter()
            .map(job_from_row)
            .collect::<Result<_, _>>()?;

        let now = Utc::now();
        let mut recovered = Vec::with_capacity(orphans.len());
        for mut orphan in orphans {
            let home = orphan.home_queue();
            let tail = Self::tail_position_tx(&mut tx, org_id, home).await?;
            orphan.append_update("requeued after its agent went silent");

            sqlx::query(
                "UPDATE jobs SET status = 'queued', agent_id = NULL, queue_type = $3, \
                 order_in_queue = $4, updates = $5, updated_at = $6 \
                 WHERE id = $1 AND version = $2",
            )
            .bind(orphan.id)
            .bind(orphan.version as i32)
            .bind(home.to_string())
            .bind(tail)
            .bind(&orphan.updates)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            orphan.status = JobStatus::Queued;
            orphan.agent_id = None;
            orphan.queue_type = Some(home);
            orphan.order_in_queue = tail;
            orphan.updated_at = now;
            recovered.push(orphan);
        }

        tx.commit().await?;
        Ok(recovered)
    }

    async fn in_progress_for_agent(
        &self,
        org_id: Uuid,
        agent_id: Uuid,
    ) -> Result<Option<Job>, StoreError> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM jobs j \
             WHERE org_id = $1 AND status = 'in-progress' AND agent_id = $2 AND {LATEST_VERSION} \
             LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(org_id)
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    async fn is_queue_paused(&self, org_id: Uuid, queue: QueueType) -> Result<bool, StoreError> {
        let paused: Option<bool> = sqlx::query_scalar(
            "SELECT is_paused FROM queue_pause WHERE org_id = $1 AND queue_type = $2",
        )
        .bind(org_id)
        .bind(queue.to_string())
        .fetch_optional(&self.pool)
        .await?;
        Ok(paused.unwrap_or(false))
    }

    async fn set_queue_paused(
        &self,
        org_id: Uuid,
        queue: QueueType,
        paused: bool,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO queue_pause (org_id, queue_type, is_paused) VALUES ($1, $2, $3) \
             ON CONFLICT (org_id, queue_type) DO UPDATE SET is_paused = EXCLUDED.is_paused",
        )
        .bind(org_id)
        .bind(queue.to_string())
        .bind(paused)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_agent(&self, reg: AgentRegistration) -> Result<UpsertOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let existing = sqlx::query(
            "SELECT id, status FROM agents WHERE org_id = $1 AND host = $2 FOR UPDATE",
        )
        .bind(reg.org_id)
        .bind(&reg.host)
        .fetch_optional(&mut *tx)
        .await?;

        let outcome = match existing {
            Some(row) => {
                let id: Uuid = row.get("id");
                let prior_status: AgentStatus = parse_enum(row.get("status"))?;
                sqlx::query(
                    "UPDATE agents SET ip = $2, port = $3, status = 'active', \
                     consecutive_failures = 0, last_active = $4, \
                     last_stream_connected_at = $4, updated_at = $4 WHERE id = $1",
                )
                .bind(id)
                .bind(&reg.ip)
                .bind(reg.port as i32)
                .bind(now)
                .execute(&mut *tx)
                .await?;

                let row = sqlx::query("SELECT * FROM agents WHERE id = $1")
                    .bind(id)
                    .fetch_one(&mut *tx)
                    .await?;
                UpsertOutcome {
                    agent: agent_from_row(&row)?,
                    prior_status,
                    created: false,
                }
            }
            None => {
                let agent = Agent::new(reg.org_id, reg.host, reg.port, reg.ip);
                sqlx::query(
                    "INSERT INTO agents (id, org_id, name, status, host, port, ip, \
                     consecutive_failures, last_active, last_stream_connected_at, \
                     created_at, updated_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
                )
                .bind(agent.id)
                .bind(agent.org_id)
                .bind(&agent.name)
                .bind(agent.status.to_string())
                .bind(&agent.host)
                .bind(agent.port as i32)
                .bind(&agent.ip)
                .bind(agent.consecutive_failures as i32)
                .bind(agent.last_active)
                .bind(agent.last_stream_connected_at)
                .bind(agent.created_at)
                .bind(agent.updated_at)
                .execute(&mut *tx)
                .await?;
                UpsertOutcome {
                    agent,
                    prior_status: AgentStatus::Offline,
                    created: true,
                }
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn get_agent(&self, agent_id: Uuid) -> Result<Option<Agent>, StoreError> {
        let row = sqlx::query("SELECT * FROM agents WHERE id = $1")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| agent_from_row(&r)).transpose()
    }

    async fn list_agents(&self, org_id: Uuid) -> Result<Vec<Agent>, StoreError> {
        let rows = sqlx::query("SELECT * FROM agents WHERE org_id = $1 ORDER BY created_at")
            .bind(org_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(agent_from_row).collect()
    }

    async fn update_agent(&self, agent: &Agent) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE agents SET name = $2, status = $3, host = $4, port = $5, ip = $6, \
             consecutive_failures = $7, last_active = $8, last_stream_connected_at = $9, \
             updated_at = $10 WHERE id = $1",
        )
        .bind(agent.id)
        .bind(&agent.name)
        .bind(agent.status.to_string())
        .bind(&agent.host)
        .bind(agent.port as i32)
        .bind(&agent.ip)
        .bind(agent.consecutive_failures as i32)
        .bind(agent.last_active)
        .bind(agent.last_stream_connected_at)
        .bind(agent.updated_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::AgentNotFound(agent.id));
        }
        Ok(())
    }

    async fn record_agent_heartbeat(
        &self,
        agent_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE agents SET last_active = $2, consecutive_failures = 0, updated_at = $2 \
             WHERE id = $1",
        )
        .bind(agent_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::AgentNotFound(agent_id));
        }
        Ok(())
    }

    async fn record_ping_failure(
        &self,
        agent_id: Uuid,
        threshold: u32,
    ) -> Result<Agent, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM agents WHERE id = $1 FOR UPDATE")
            .bind(agent_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::AgentNotFound(agent_id))?;
        let mut agent = agent_from_row(&row)?;
        agent.record_failure(threshold, Utc::now());

        sqlx::query(
            "UPDATE agents SET status = $2, consecutive_failures = $3, updated_at = $4 \
             WHERE id = $1",
        )
        .bind(agent.id)
        .bind(agent.status.to_string())
        .bind(agent.consecutive_failures as i32)
        .bind(agent.updated_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(agent)
    }

    async fn delete_agent(&self, agent_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM agents WHERE id = $1")
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::AgentNotFound(agent_id));
        }
        sqlx::query("DELETE FROM schedule_bindings WHERE agent_id = $1")
            .bind(agent_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn org_for_api_key(&self, key_hash: &str) -> Result<Option<Uuid>, StoreError> {
        let org: Option<Uuid> =
            sqlx::query_scalar("SELECT org_id FROM api_keys WHERE key_hash = $1")
                .bind(key_hash)
                .fetch_optional(&self.pool)
                .await?;
        Ok(org)
    }

    async fn insert_api_key(&self, org_id: Uuid, key_hash: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO api_keys (key_hash, org_id) VALUES ($1, $2) \
             ON CONFLICT (key_hash) DO NOTHING",
        )
        .bind(key_hash)
        .bind(org_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn resolve_user_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<(String, Uuid)>, StoreError> {
        let row = sqlx::query("SELECT user_id, org_id FROM user_tokens WHERE token_hash = $1")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| (r.get("user_id"), r.get("org_id"))))
    }

    async fn insert_user_token(
        &self,
        token_hash: &str,
        user_id: &str,
        org_id: Uuid,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO user_tokens (token_hash, user_id, org_id) VALUES ($1, $2, $3) \
             ON CONFLICT (token_hash) DO NOTHING",
        )
        .bind(token_hash)
        .bind(user_id)
        .bind(org_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_activity(&self, activity: &Activity) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO activities (id, job_id, org_id, name, summary, created_by, \
             updated_by, created_at, updated_at, code_generation_logs, verification_logs) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(activity.id)
        .bind(activity.job_id)
        .bind(activity.org_id)
        .bind(&activity.name)
        .bind(&activity.summary)
        .bind(&activity.created_by)
        .bind(&activity.updated_by)
        .bind(activity.created_at)
        .bind(activity.updated_at)
        .bind(&activity.code_generation_logs)
        .bind(&activity.verification_logs)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn activities_for_job(
        &self,
        org_id: Uuid,
        job_id: Uuid,
    ) -> Result<Vec<Activity>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM activities WHERE org_id = $1 AND job_id = $2 ORDER BY created_at",
        )
        .bind(org_id)
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(activity_from_row).collect()
    }

    async fn append_job_log(&self, entry: &JobLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO job_logs (job_id, job_version, org_id, level, timestamp, message, stage) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(entry.job_id)
        .bind(entry.job_version as i32)
        .bind(entry.org_id)
        .bind(entry.level.to_string())
        .bind(entry.timestamp)
        .bind(&entry.message)
        .bind(&entry.stage)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn job_logs(
        &self,
        org_id: Uuid,
        job_id: Uuid,
        version: u32,
    ) -> Result<Vec<JobLogEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM job_logs \
             WHERE org_id = $1 AND job_id = $2 AND job_version = $3 ORDER BY id",
        )
        .bind(org_id)
        .bind(job_id)
        .bind(version as i32)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(log_from_row).collect()
    }

    async fn set_schedule_binding(&self, binding: &ScheduleBinding) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO schedule_bindings (agent_id, queue_schedule_id, health_check_schedule_id) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (agent_id) DO UPDATE SET \
                queue_schedule_id = EXCLUDED.queue_schedule_id, \
                health_check_schedule_id = EXCLUDED.health_check_schedule_id",
        )
        .bind(binding.agent_id)
        .bind(&binding.queue_schedule_id)
        .bind(&binding.health_check_schedule_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_schedule_binding(
        &self,
        agent_id: Uuid,
    ) -> Result<Option<ScheduleBinding>, StoreError> {
        let row = sqlx::query("SELECT * FROM schedule_bindings WHERE agent_id = $1")
            .bind(agent_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| ScheduleBinding {
            agent_id: r.get("agent_id"),
            queue_schedule_id: r.get("queue_schedule_id"),
            health_check_schedule_id: r.get("health_check_schedule_id"),
        }))
    }
}

fn parse_enum<T: std::str::FromStr<Err = String>>(value: &str) -> Result<T, StoreError> {
    value
        .parse()
        .map_err(|e: String| StoreError::Conflict(format!("corrupt enum column: {}", e)))
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let status: String = row.get("status");
    let priority: String = row.get("priority");
    let queue_type: Option<String> = row.get("queue_type");
    let acceptance: String = row.get("user_acceptance_status");
    let user_input: serde_json::Value = row.get("user_input");
    let user_comments: serde_json::Value = row.get("user_comments");
    let version: i32 = row.get("version");

    Ok(Job {
        id: row.get("id"),
        version: version as u32,
        org_id: row.get("org_id"),
        name: row.get("name"),
        description: row.get("description"),
        status: parse_enum(&status)?,
        priority: parse_enum(&priority)?,
        queue_type: queue_type.as_deref().map(parse_enum).transpose()?,
        order_in_queue: row.get("order_in_queue"),
        agent_id: row.get("agent_id"),
        user_input: serde_json::from_value::<UserInput>(user_input)?,
        repo_id: row.get("repo_id"),
        user_acceptance_status: parse_enum(&acceptance)?,
        user_comments: serde_json::from_value(user_comments)?,
        code_generation_logs: row.get("code_generation_logs"),
        code_verification_logs: row.get("code_verification_logs"),
        pr_link: row.get("pr_link"),
        confidence_score: row.get("confidence_score"),
        updates: row.get("updates"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        created_by: row.get("created_by"),
        updated_by: row.get("updated_by"),
    })
}

fn agent_from_row(row: &PgRow) -> Result<Agent, StoreError> {
    let status: String = row.get("status");
    let port: i32 = row.get("port");
    let failures: i32 = row.get("consecutive_failures");

    Ok(Agent {
        id: row.get("id"),
        org_id: row.get("org_id"),
        name: row.get("name"),
        status: parse_enum(&status)?,
        host: row.get("host"),
        port: port as u16,
        ip: row.get("ip"),
        consecutive_failures: failures as u32,
        last_active: row.get("last_active"),
        last_stream_connected_at: row.get("last_stream_connected_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn activity_from_row(row: &PgRow) -> Result<Activity, StoreError> {
    Ok(Activity {
        id: row.get("id"),
        job_id: row.get("job_id"),
        org_id: row.get("org_id"),
        name: row.get("name"),
        summary: row.get("summary"),
        created_by: row.get("created_by"),
        updated_by: row.get("updated_by"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        code_generation_logs: row.get("code_generation_logs"),
        verification_logs: row.get("verification_logs"),
    })
}

fn log_from_row(row: &PgRow) -> Result<JobLogEntry, StoreError> {
    let level: String = row.get("level");
    let version: i32 = row.get("job_version");

    Ok(JobLogEntry {
        job_id: row.get("job_id"),
        job_version: version as u32,
        org_id: row.get("org_id"),
        level: parse_enum(&level)?,
        timestamp: row.get("timestamp"),
        message: row.get("message"),
        stage: row.get("stage"),
    })
}
