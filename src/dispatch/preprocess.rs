//! Preprocess step: the workhorse of dispatch.
//!
//! One invocation per dispatch firing, for one agent. In order: reconcile
//! orphaned jobs, heartbeat an in-progress job (at most one job per agent),
//! then claim the next queued job, draining rework strictly before backlog.

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::engine::ActivityError;
use crate::metrics;
use crate::model::{AgentStatus, QueueType};
use crate::store::JobStore;
use crate::stream::{BackendFrame, StreamManager};

/// What a preprocess invocation decided.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreprocessOutcome {
    /// The claimed job, if any.
    pub job_id: Option<Uuid>,
    /// The queue it was claimed from.
    pub queue_type: Option<QueueType>,
    /// The agent's org; `None` only when the agent was skipped outright.
    pub org_id: Option<Uuid>,
}

/// Runs the preprocess step for one agent.
///
/// Step 2 (orphan reconciliation) failures are fatal to the activity and
/// retried by the engine; step 3's stream write is best-effort.
pub async fn preprocess(
    store: &dyn JobStore,
    streams: &StreamManager,
    config: &OrchestratorConfig,
    agent_id: Uuid,
) -> Result<PreprocessOutcome, ActivityError> {
    // Step 1: only active agents take work.
    let agent = store
        .get_agent(agent_id)
        .await
        .map_err(store_failure)?
        .ok_or_else(|| ActivityError::permanent(format!("agent {} not found", agent_id)))?;
    if agent.status != AgentStatus::Active {
        debug!(agent_id = %agent_id, status = %agent.status, "Agent not active, skipping");
        return Ok(PreprocessOutcome::default());
    }
    let org_id = agent.org_id;

    // Step 2: return orphaned in-progress jobs to their queues.
    let stale_before = Utc::now()
        - chrono::Duration::from_std(config.orphan_staleness)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
    let recovered = store
        .recover_orphans(org_id, agent_id, stale_before)
        .await
        .map_err(store_failure)?;
    if !recovered.is_empty() {
        metrics::orphans_recovered(recovered.len() as u64);
        info!(
            agent_id = %agent_id,
            count = recovered.len(),
            "Recovered orphaned jobs back to their queues"
        );
    }

    // Step 3: an agent already running a job only gets a heartbeat. This is
    // what keeps one agent from carrying two jobs.
    if let Some(running) = store
        .in_progress_for_agent(org_id, agent_id)
        .await
        .map_err(store_failure)?
    {
        if let Err(e) = streams
            .write(agent_id, BackendFrame::HealthCheckPing { nonce: rand::random() })
            .await
        {
            warn!(agent_id = %agent_id, error = %e, "In-progress heartbeat write failed");
        }
        store
            .record_agent_heartbeat(agent_id, Utc::now())
            .await
            .map_err(store_failure)?;
        debug!(agent_id = %agent_id, job_id = %running.id, "Agent busy, heartbeat only");
        return Ok(PreprocessOutcome {
            job_id: None,
            queue_type: None,
            org_id: Some(org_id),
        });
    }

    // Step 4: claim the next job, rework strictly before backlog.
    for queue in QueueType::CLAIM_ORDER {
        if store
            .is_queue_paused(org_id, queue)
            .await
            .map_err(store_failure)?
        {
            debug!(org_id = %org_id, queue = %queue, "Queue paused, skipping");
            continue;
        }
        if let Some(job) = store
            .claim_next(org_id, queue, agent_id)
            .await
            .map_err(store_failure)?
        {
            metrics::job_claimed(queue);
            info!(
                agent_id = %agent_id,
                job_id = %job.id,
                queue = %queue,
                "Claimed job for dispatch"
            );
            return Ok(PreprocessOutcome {
                job_id: Some(job.id),
                queue_type: Some(queue),
                org_id: Some(org_id),
            });
        }
    }

    Ok(PreprocessOutcome {
        job_id: None,
        queue_type: None,
        org_id: Some(org_id),
    })
}

fn store_failure(error: crate::store::StoreError) -> ActivityError {
    if error.is_transient() {
        ActivityError::transient(error.to_string())
    } else {
        ActivityError::permanent(error.to_string())
    }
}
