//! Embedded schema migrations for the PostgreSQL store.
//!
//! Idempotent (IF NOT EXISTS) statements tracked in a `_migrations` table.
//! Queue claiming relies on the `(org_id, queue_type, order_in_queue)`
//! index; the orphan scan relies on the `agent_id` index; registration
//! relies on the unique `(org_id, host)` key.

use sqlx::PgPool;

use super::StoreError;

/// SQL schema for creating the jobs table. One row per `(id, version)`.
pub const CREATE_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id UUID NOT NULL,
    version INTEGER NOT NULL,
    org_id UUID NOT NULL,
    name VARCHAR(512) NOT NULL,
    description TEXT NOT NULL,
    status VARCHAR(32) NOT NULL,
    priority VARCHAR(16) NOT NULL,
    queue_type VARCHAR(16),
    order_in_queue BIGINT NOT NULL DEFAULT -1,
    agent_id UUID,
    user_input JSONB NOT NULL,
    repo_id VARCHAR(512),
    user_acceptance_status VARCHAR(64) NOT NULL,
    user_comments JSONB NOT NULL DEFAULT '[]',
    code_generation_logs TEXT,
    code_verification_logs TEXT,
    pr_link TEXT,
    confidence_score DOUBLE PRECISION,
    updates TEXT NOT NULL DEFAULT '',
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    created_by VARCHAR(255) NOT NULL,
    updated_by VARCHAR(255) NOT NULL,
    PRIMARY KEY (id, version)
)
"#;

/// Claim path: minimum position within `(org_id, queue_type)`.
pub const CREATE_JOBS_QUEUE_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_jobs_queue_position
ON jobs (org_id, queue_type, order_in_queue)
WHERE status = 'queued'
"#;

/// Orphan scan path.
pub const CREATE_JOBS_AGENT_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_jobs_agent ON jobs (agent_id)
"#;

/// SQL schema for creating the agents table.
pub const CREATE_AGENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS agents (
    id UUID PRIMARY KEY,
    org_id UUID NOT NULL,
    name VARCHAR(255) NOT NULL,
    status VARCHAR(16) NOT NULL,
    host VARCHAR(255) NOT NULL,
    port INTEGER NOT NULL,
    ip VARCHAR(64),
    consecutive_failures INTEGER NOT NULL DEFAULT 0,
    last_active TIMESTAMPTZ,
    last_stream_connected_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    UNIQUE (org_id, host)
)
"#;

/// SQL schema for queue pause flags.
pub const CREATE_QUEUE_PAUSE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS queue_pause (
    org_id UUID NOT NULL,
    queue_type VARCHAR(16) NOT NULL,
    is_paused BOOLEAN NOT NULL DEFAULT FALSE,
    PRIMARY KEY (org_id, queue_type)
)
"#;

/// SQL schema for activity audit rows.
pub const CREATE_ACTIVITIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS activities (
    id UUID PRIMARY KEY,
    job_id UUID NOT NULL,
    org_id UUID NOT NULL,
    name VARCHAR(255) NOT NULL,
    summary TEXT NOT NULL,
    created_by VARCHAR(255) NOT NULL,
    updated_by VARCHAR(255) NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    code_generation_logs TEXT,
    verification_logs TEXT
)
"#;

/// SQL schema for per-user activity read tracking.
pub const CREATE_ACTIVITY_READ_STATUS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS activity_read_status (
    activity_id UUID NOT NULL,
    user_id VARCHAR(255) NOT NULL,
    status VARCHAR(16) NOT NULL DEFAULT 'unread',
    PRIMARY KEY (activity_id, user_id)
)
"#;

/// SQL schema for the per-version job log series.
pub const CREATE_JOB_LOGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS job_logs (
    id BIGSERIAL PRIMARY KEY,
    job_id UUID NOT NULL,
    job_version INTEGER NOT NULL,
    org_id UUID NOT NULL,
    level VARCHAR(16) NOT NULL,
    timestamp TIMESTAMPTZ NOT NULL,
    message TEXT NOT NULL,
    stage VARCHAR(64)
)
"#;

/// Log reads are always per `(job, version)`.
pub const CREATE_JOB_LOGS_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS idx_job_logs_series ON job_logs (job_id, job_version, id)
"#;

/// SQL schema for agent API keys (stored hashed).
pub const CREATE_API_KEYS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS api_keys (
    key_hash VARCHAR(64) PRIMARY KEY,
    org_id UUID NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for user bearer tokens (stored hashed).
pub const CREATE_USER_TOKENS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS user_tokens (
    token_hash VARCHAR(64) PRIMARY KEY,
    user_id VARCHAR(255) NOT NULL,
    org_id UUID NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// SQL schema for schedule bindings.
pub const CREATE_SCHEDULE_BINDINGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS schedule_bindings (
    agent_id UUID PRIMARY KEY,
    queue_schedule_id VARCHAR(255) NOT NULL,
    health_check_schedule_id VARCHAR(255) NOT NULL
)
"#;

/// All schema statements in application order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_JOBS_TABLE,
        CREATE_JOBS_QUEUE_INDEX,
        CREATE_JOBS_AGENT_INDEX,
        CREATE_AGENTS_TABLE,
        CREATE_QUEUE_PAUSE_TABLE,
        CREATE_ACTIVITIES_TABLE,
        CREATE_ACTIVITY_READ_STATUS_TABLE,
        CREATE_JOB_LOGS_TABLE,
        CREATE_JOB_LOGS_INDEX,
        CREATE_API_KEYS_TABLE,
        CREATE_USER_TOKENS_TABLE,
        CREATE_SCHEDULE_BINDINGS_TABLE,
    ]
}

/// Runs all pending migrations. Idempotent.
pub async fn run_migrations(pool: &PgPool) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _migrations (
            id SERIAL PRIMARY KEY,
            name VARCHAR(255) NOT NULL UNIQUE,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    for (idx, statement) in all_schema_statements().iter().enumerate() {
        let migration_name = format!("schema_v1_part_{}", idx);

        let applied: Option<(i32,)> = sqlx::query_as("SELECT id FROM _migrations WHERE name = $1")
            .bind(&migration_name)
            .fetch_optional(pool)
            .await?;
        if applied.is_some() {
            continue;
        }

        let mut tx = pool.begin().await?;
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Migration(format!("{}: {}", migration_name, e)))?;
        sqlx::query("INSERT INTO _migrations (name) VALUES ($1)")
            .bind(&migration_name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_order_creates_tables_before_indexes() {
        let statements = all_schema_statements();
        let jobs = statements
            .iter()
            .position(|s| s.contains("CREATE TABLE IF NOT EXISTS jobs"))
            .expect("jobs table present");
        let index = statements
            .iter()
            .position(|s| s.contains("idx_jobs_queue_position"))
            .expect("queue index present");
        assert!(jobs < index);
    }

    #[test]
    fn test_agents_table_has_registration_key() {
        assert!(CREATE_AGENTS_TABLE.contains("UNIQUE (org_id, host)"));
    }
}
