//! In-memory store implementation.
//!
//! All state sits behind one async mutex, so every operation is trivially
//! serializable. Used by the test-suite and by `--store memory` for local
//! development.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::model::{
    Activity, Agent, AgentStatus, Job, JobLogEntry, JobStatus, QueueType, ScheduleBinding,
};

use super::{AgentRegistration, JobStore, StoreError, UpsertOutcome};

#[derive(Default)]
struct Inner {
    /// Version rows per job id, ascending by version.
    jobs: HashMap<Uuid, Vec<Job>>,
    agents: HashMap<Uuid, Agent>,
    api_keys: HashMap<String, Uuid>,
    user_tokens: HashMap<String, (String, Uuid)>,
    paused: HashMap<(Uuid, QueueType), bool>,
    activities: Vec<Activity>,
    logs: HashMap<(Uuid, u32), Vec<JobLogEntry>>,
    bindings: HashMap<Uuid, ScheduleBinding>,
}

impl Inner {
    fn latest(&self, org_id: Uuid, job_id: Uuid) -> Option<&Job> {
        self.jobs
            .get(&job_id)
            .and_then(|versions| versions.last())
            .filter(|job| job.org_id == org_id)
    }

    fn latest_mut(&mut self, org_id: Uuid, job_id: Uuid) -> Option<&mut Job> {
        self.jobs
            .get_mut(&job_id)
            .and_then(|versions| versions.last_mut())
            .filter(|job| job.org_id == org_id)
    }

    /// Latest-version queued rows of `(org, queue)`, ordered by position.
    fn queued(&self, org_id: Uuid, queue: QueueType) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .values()
            .filter_map(|versions| versions.last())
            .filter(|job| {
                job.org_id == org_id
                    && job.status == JobStatus::Queued
                    && job.queue_type == Some(queue)
            })
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.order_in_queue);
        jobs
    }

    /// Closes the gap left by removing the row at `removed_position`.
    fn reprioritize_after_removal(
        &mut self,
        org_id: Uuid,
        queue: QueueType,
        removed_position: i64,
    ) {
        for versions in self.jobs.values_mut() {
            if let Some(job) = versions.last_mut() {
                if job.org_id == org_id
                    && job.status == JobStatus::Queued
                    && job.queue_type == Some(queue)
                    && job.order_in_queue > removed_position
                {
                    job.order_in_queue -= 1;
                }
            }
        }
    }

    /// Appends a job at the tail of `queue`, marking it queued.
    fn push_tail(&mut self, org_id: Uuid, job_id: Uuid, queue: QueueType, now: DateTime<Utc>) {
        let tail = self.queued(org_id, queue).len() as i64;
        if let Some(job) = self.latest_mut(org_id, job_id) {
            job.status = JobStatus::Queued;
            job.queue_type = Some(queue);
            job.order_in_queue = tail;
            job.agent_id = None;
            job.updated_at = now;
        }
    }
}

/// In-memory [`JobStore`].
#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemStore {
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let versions = inner.jobs.entry(job.id).or_default();
        if let Some(last) = versions.last() {
            if job.version != last.version + 1 {
                return Err(StoreError::Conflict(format!(
                    "expected version {} for job {}, got {}",
                    last.version + 1,
                    job.id,
                    job.version
                )));
            }
        }
        versions.push(job.clone());
        Ok(())
    }

    async fn latest(&self, org_id: Uuid, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.latest(org_id, job_id).cloned())
    }

    async fn job_version(
        &self,
        org_id: Uuid,
        job_id: Uuid,
        version: u32,
    ) -> Result<Option<Job>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .get(&job_id)
            .and_then(|versions| versions.iter().find(|job| job.version == version))
            .filter(|job| job.org_id == org_id)
            .cloned())
    }

    async fn list_jobs(&self, org_id: Uuid) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter_map(|versions| versions.last())
            .filter(|job| job.org_id == org_id && job.status != JobStatus::Archived)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn update_latest(&self, job: &Job) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let current = inner
            .latest_mut(job.org_id, job.id)
            .ok_or(StoreError::JobNotFound(job.id))?;
        if current.version != job.version {
            return Err(StoreError::Conflict(format!(
                "job {} latest version is {}, update targeted {}",
                job.id, current.version, job.version
            )));
        }
        *current = job.clone();
        Ok(())
    }

    async fn next_position(&self, org_id: Uuid, queue: QueueType) -> Result<i64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.queued(org_id, queue).len() as i64)
    }

    async fn claim_next(
        &self,
        org_id: Uuid,
        queue: QueueType,
        agent_id: Uuid,
    ) -> Result<Option<Job>, StoreError> {
        let mut inner = self.inner.lock().await;
        let head = match inner.queued(org_id, queue).into_iter().next() {
            Some(job) => job,
            None => return Ok(None),
        };
        let removed_position = head.order_in_queue;
        let now = Utc::now();

        let claimed = {
            let job = inner
                .latest_mut(org_id, head.id)
                .ok_or(StoreError::JobNotFound(head.id))?;
            job.status = JobStatus::InProgress;
            job.agent_id = Some(agent_id);
            job.clear_queue_slot();
            job.updated_at = now;
            job.clone()
        };
        inner.reprioritize_after_removal(org_id, queue, removed_position);
        Ok(Some(claimed))
    }

    async fn enqueue_at_tail(
        &self,
        org_id: Uuid,
        job_id: Uuid,
        queue: QueueType,
    ) -> Result<Job, StoreError> {
        let mut inner = self.inner.lock().await;
        let current = inner
            .latest(org_id, job_id)
            .cloned()
            .ok_or(StoreError::JobNotFound(job_id))?;

        // Leaving one queue for another closes the old gap first.
        if let (JobStatus::Queued, Some(old_queue)) = (current.status, current.queue_type) {
            let old_position = current.order_in_queue;
            if let Some(job) = inner.latest_mut(org_id, job_id) {
                job.clear_queue_slot();
            }
            inner.reprioritize_after_removal(org_id, old_queue, old_position);
        }

        let now = Utc::now();
        inner.push_tail(org_id, job_id, queue, now);
        Ok(inner
            .latest(org_id, job_id)
            .cloned()
            .ok_or(StoreError::JobNotFound(job_id))?)
    }

    async fn dequeue(&self, org_id: Uuid, job_id: Uuid) -> Result<Job, StoreError> {
        let mut inner = self.inner.lock().await;
        let current = inner
            .latest(org_id, job_id)
            .cloned()
            .ok_or(StoreError::JobNotFound(job_id))?;
        let queue = match (current.status, current.queue_type) {
            (JobStatus::Queued, Some(queue)) => queue,
            _ => return Err(StoreError::NotQueued(job_id)),
        };
        let removed_position = current.order_in_queue;

        let removed = {
            let job = inner
                .latest_mut(org_id, job_id)
                .ok_or(StoreError::JobNotFound(job_id))?;
            job.clear_queue_slot();
            job.updated_at = Utc::now();
            job.clone()
        };
        inner.reprioritize_after_removal(org_id, queue, removed_position);
        Ok(removed)
    }

    async fn move_to_position(
        &self,
        org_id: Uuid,
        job_id: Uuid,
        new_position: i64,
    ) -> Result<Job, StoreError> {
        let mut inner = self.inner.lock().await;
        let current = inner
            .latest(org_id, job_id)
            .cloned()
            .ok_or(StoreError::JobNotFound(job_id))?;
        let queue = match (current.status, current.queue_type) {
            (JobStatus::Queued, Some(queue)) => queue,
            _ => return Err(StoreError::NotQueued(job_id)),
        };

        let mut ordered: Vec<Uuid> = inner.queued(org_id, queue).iter().map(|j| j.id).collect();
        let clamped = new_position.clamp(0, ordered.len() as i64 - 1) as usize;
        let from = ordered
            .iter()
            .position(|id| *id == job_id)
            .ok_or(StoreError::NotQueued(job_id))?;
        if from == clamped {
            return Ok(current);
        }
        let id = ordered.remove(from);
        ordered.insert(clamped, id);

        let now = Utc::now();
        for (position, id) in ordered.iter().enumerate() {
            if let Some(job) = inner.latest_mut(org_id, *id) {
                if job.order_in_queue != position as i64 {
                    job.order_in_queue = position as i64;
                    job.updated_at = now;
                }
            }
        }
        Ok(inner
            .latest(org_id, job_id)
            .cloned()
            .ok_or(StoreError::JobNotFound(job_id))?)
    }

    async fn queued_jobs(&self, org_id: Uuid, queue: QueueType) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.queued(org_id, queue))
    }

    async fn recover_orphans(
        &self,
        org_id: Uuid,
        agent_id: Uuid,
        stale_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let mut inner = self.inner.lock().await;
        let orphan_ids: Vec<Uuid> = inner
            .jobs
            .values()
            .filter_map(|versions| versions.last())
            .filter(|job| {
                job.org_id == org_id
                    && job.status == JobStatus::InProgress
                    && (job.agent_id == Some(agent_id) || job.updated_at < stale_before)
            })
            .map(|job| job.id)
            .collect();

        let now = Utc::now();
        let mut recovered = Vec::with_capacity(orphan_ids.len());
        for job_id in orphan_ids {
            let home = match inner.latest(org_id, job_id) {
                Some(job) => job.home_queue(),
                None => continue,
            };
            if let Some(job) = inner.latest_mut(org_id, job_id) {
                job.append_update("requeued after its agent went silent");
            }
            inner.push_tail(org_id, job_id, home, now);
            if let Some(job) = inner.latest(org_id, job_id) {
                recovered.push(job.clone());
            }
        }
        Ok(recovered)
    }

    async fn in_progress_for_agent(
        &self,
        org_id: Uuid,
        agent_id: Uuid,
    ) -> Result<Option<Job>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .values()
            .filter_map(|versions| versions.last())
            .find(|job| {
                job.org_id == org_id
                    && job.status == JobStatus::InProgress
                    && job.agent_id == Some(agent_id)
            })
            .cloned())
    }

    async fn is_queue_paused(&self, org_id: Uuid, queue: QueueType) -> Result<bool, StoreError> {
        let inner = self.inner.lock().await;
        Ok(*inner.paused.get(&(org_id, queue)).unwrap_or(&false))
    }

    async fn set_queue_paused(
        &self,
        org_id: Uuid,
        queue: QueueType,
        paused: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.paused.insert((org_id, queue), paused);
        Ok(())
    }

    async fn upsert_agent(&self, reg: AgentRegistration) -> Result<UpsertOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        let existing_id = inner
            .agents
            .values()
            .find(|agent| agent.org_id == reg.org_id && agent.host == reg.host)
            .map(|agent| agent.id);

        match existing_id {
            Some(id) => {
                let agent = inner.agents.get_mut(&id).expect("agent row exists");
                let prior_status = agent.status;
                agent.ip = reg.ip;
                agent.port = reg.port;
                agent.mark_active(now);
                agent.last_stream_connected_at = Some(now);
                Ok(UpsertOutcome {
                    agent: agent.clone(),
                    prior_status,
                    created: false,
                })
            }
            None => {
                let agent = Agent::new(reg.org_id, reg.host, reg.port, reg.ip);
                inner.agents.insert(agent.id, agent.clone());
                Ok(UpsertOutcome {
                    agent,
                    prior_status: AgentStatus::Offline,
                    created: true,
                })
            }
        }
    }

    async fn get_agent(&self, agent_id: Uuid) -> Result<Option<Agent>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.agents.get(&agent_id).cloned())
    }

    async fn list_agents(&self, org_id: Uuid) -> Result<Vec<Agent>, StoreError> {
        let inner = self.inner.lock().await;
        let mut agents: Vec<Agent> = inner
            .agents
            .values()
            .filter(|agent| agent.org_id == org_id)
            .cloned()
            .collect();
        agents.sort_by_key(|agent| agent.created_at);
        Ok(agents)
    }

    async fn update_agent(&self, agent: &Agent) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if !inner.agents.contains_key(&agent.id) {
            return Err(StoreError::AgentNotFound(agent.id));
        }
        inner.agents.insert(agent.id, agent.clone());
        Ok(())
    }

    async fn record_agent_heartbeat(
        &self,
        agent_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let agent = inner
            .agents
            .get_mut(&agent_id)
            .ok_or(StoreError::AgentNotFound(agent_id))?;
        agent.last_active = Some(at);
        agent.consecutive_failures = 0;
        agent.updated_at = at;
        Ok(())
    }

    async fn record_ping_failure(
        &self,
        agent_id: Uuid,
        threshold: u32,
    ) -> Result<Agent, StoreError> {
        let mut inner = self.inner.lock().await;
        let agent = inner
            .agents
            .get_mut(&agent_id)
            .ok_or(StoreError::AgentNotFound(agent_id))?;
        agent.record_failure(threshold, Utc::now());
        Ok(agent.clone())
    }

    async fn delete_agent(&self, agent_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .agents
            .remove(&agent_id)
            .ok_or(StoreError::AgentNotFound(agent_id))?;
        inner.bindings.remove(&agent_id);
        Ok(())
    }

    async fn org_for_api_key(&self, key_hash: &str) -> Result<Option<Uuid>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.api_keys.get(key_hash).copied())
    }

    async fn insert_api_key(&self, org_id: Uuid, key_hash: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.api_keys.insert(key_hash.to_string(), org_id);
        Ok(())
    }

    async fn resolve_user_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<(String, Uuid)>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.user_tokens.get(token_hash).cloned())
    }

    async fn insert_user_token(
        &self,
        token_hash: &str,
        user_id: &str,
        org_id: Uuid,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .user_tokens
            .insert(token_hash.to_string(), (user_id.to_string(), org_id));
        Ok(())
    }

    async fn insert_activity(&self, activity: &Activity) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.activities.push(activity.clone());
        Ok(())
    }

    async fn activities_for_job(
        &self,
        org_id: Uuid,
        job_id: Uuid,
    ) -> Result<Vec<Activity>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .activities
            .iter()
            .filter(|activity| activity.org_id == org_id && activity.job_id == job_id)
            .cloned()
            .collect())
    }

    async fn append_job_log(&self, entry: &JobLogEntry) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .logs
            .entry((entry.job_id, entry.job_version))
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn job_logs(
        &self,
        org_id: Uuid,
        job_id: Uuid,
        version: u32,
    ) -> Result<Vec<JobLogEntry>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .logs
            .get(&(job_id, version))
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| entry.org_id == org_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn set_schedule_binding(&self, binding: &ScheduleBinding) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.bindings.insert(binding.agent_id, binding.clone());
        Ok(())
    }

    async fn get_schedule_binding(
        &self,
        agent_id: Uuid,
    ) -> Result<Option<ScheduleBinding>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.bindings.get(&agent_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::UserInput;

    fn org() -> Uuid {
        Uuid::new_v4()
    }

    async fn enqueue_new(store: &MemStore, org_id: Uuid, queue: QueueType) -> Job {
        let job = Job::new(org_id, UserInput::new("test", "do the thing"), "tester");
        store.insert_job(&job).await.expect("insert");
        store
            .enqueue_at_tail(org_id, job.id, queue)
            .await
            .expect("enqueue")
    }

    async fn positions(store: &MemStore, org_id: Uuid, queue: QueueType) -> Vec<i64> {
        store
            .queued_jobs(org_id, queue)
            .await
            .expect("queued_jobs")
            .iter()
            .map(|job| job.order_in_queue)
            .collect()
    }

    #[tokio::test]
    async fn test_enqueue_assigns_contiguous_tail_positions() {
        let store = MemStore::new();
        let org_id = org();

        for _ in 0..4 {
            enqueue_new(&store, org_id, QueueType::Backlog).await;
        }

        assert_eq!(
            positions(&store, org_id, QueueType::Backlog).await,
            vec![0, 1, 2, 3]
        );
    }

    #[tokio::test]
    async fn test_claim_takes_head_and_closes_gap() {
        let store = MemStore::new();
        let org_id = org();
        let agent_id = Uuid::new_v4();

        let first = enqueue_new(&store, org_id, QueueType::Backlog).await;
        enqueue_new(&store, org_id, QueueType::Backlog).await;
        enqueue_new(&store, org_id, QueueType::Backlog).await;

        let claimed = store
            .claim_next(org_id, QueueType::Backlog, agent_id)
            .await
            .expect("claim")
            .expect("job available");

        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, JobStatus::InProgress);
        assert_eq!(claimed.agent_id, Some(agent_id));
        assert!(claimed.queue_type.is_none());
        assert_eq!(claimed.order_in_queue, crate::model::UNQUEUED_POSITION);
        assert_eq!(
            positions(&store, org_id, QueueType::Backlog).await,
            vec![0, 1]
        );
    }

    #[tokio::test]
    async fn test_claim_on_empty_queue_returns_none() {
        let store = MemStore::new();
        let claimed = store
            .claim_next(org(), QueueType::Rework, Uuid::new_v4())
            .await
            .expect("claim");
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn test_move_to_position_clamps_and_renumbers() {
        let store = MemStore::new();
        let org_id = org();

        let a = enqueue_new(&store, org_id, QueueType::Backlog).await;
        let b = enqueue_new(&store, org_id, QueueType::Backlog).await;
        let c = enqueue_new(&store, org_id, QueueType::Backlog).await;

        // Move the tail to the front.
        let moved = store
            .move_to_position(org_id, c.id, 0)
            .await
            .expect("move");
        assert_eq!(moved.order_in_queue, 0);

        let order: Vec<Uuid> = store
            .queued_jobs(org_id, QueueType::Backlog)
            .await
            .expect("queued")
            .iter()
            .map(|job| job.id)
            .collect();
        assert_eq!(order, vec![c.id, a.id, b.id]);

        // Out-of-range positions clamp to the tail.
        let moved = store
            .move_to_position(org_id, c.id, 99)
            .await
            .expect("move");
        assert_eq!(moved.order_in_queue, 2);
        assert_eq!(
            positions(&store, org_id, QueueType::Backlog).await,
            vec![0, 1, 2]
        );
    }

    #[tokio::test]
    async fn test_dequeue_requires_queued() {
        let store = MemStore::new();
        let org_id = org();
        let job = enqueue_new(&store, org_id, QueueType::Backlog).await;

        store.dequeue(org_id, job.id).await.expect("dequeue");

        let err = store.dequeue(org_id, job.id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotQueued(_)));
    }

    #[tokio::test]
    async fn test_recover_orphans_requeues_at_home_tail() {
        let store = MemStore::new();
        let org_id = org();
        let agent_id = Uuid::new_v4();

        enqueue_new(&store, org_id, QueueType::Backlog).await;
        enqueue_new(&store, org_id, QueueType::Backlog).await;
        let claimed = store
            .claim_next(org_id, QueueType::Backlog, agent_id)
            .await
            .expect("claim")
            .expect("job");

        let recovered = store
            .recover_orphans(org_id, agent_id, Utc::now() - chrono::Duration::minutes(5))
            .await
            .expect("recover");

        assert_eq!(recovered.len(), 1);
        let job = &recovered[0];
        assert_eq!(job.id, claimed.id);
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.agent_id.is_none());
        assert_eq!(job.queue_type, Some(QueueType::Backlog));
        // Back of the queue, behind the job that was never claimed.
        assert_eq!(job.order_in_queue, 1);
        assert!(job.updates.contains("requeued"));
    }

    #[tokio::test]
    async fn test_recover_orphans_ignores_fresh_jobs_of_other_agents() {
        let store = MemStore::new();
        let org_id = org();
        let ours = Uuid::new_v4();
        let theirs = Uuid::new_v4();

        enqueue_new(&store, org_id, QueueType::Backlog).await;
        enqueue_new(&store, org_id, QueueType::Backlog).await;
        store
            .claim_next(org_id, QueueType::Backlog, theirs)
            .await
            .expect("claim")
            .expect("job");

        let recovered = store
            .recover_orphans(org_id, ours, Utc::now() - chrono::Duration::minutes(5))
            .await
            .expect("recover");

        assert!(recovered.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_agent_on_same_host_updates_in_place() {
        let store = MemStore::new();
        let org_id = org();

        let first = store
            .upsert_agent(AgentRegistration {
                org_id,
                host: "dev-box".to_string(),
                port: 50051,
                ip: None,
            })
            .await
            .expect("upsert");
        assert!(first.created);
        assert_eq!(first.prior_status, AgentStatus::Offline);

        // Simulate the agent having gone offline before reconnecting.
        let mut agent = first.agent.clone();
        agent.status = AgentStatus::Offline;
        agent.consecutive_failures = 3;
        store.update_agent(&agent).await.expect("update");

        let second = store
            .upsert_agent(AgentRegistration {
                org_id,
                host: "dev-box".to_string(),
                port: 50052,
                ip: Some("10.0.0.5".to_string()),
            })
            .await
            .expect("upsert");

        assert!(!second.created);
        assert_eq!(second.prior_status, AgentStatus::Offline);
        assert_eq!(second.agent.id, first.agent.id);
        assert_eq!(second.agent.port, 50052);
        assert_eq!(second.agent.status, AgentStatus::Active);
        assert_eq!(second.agent.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_update_latest_rejects_stale_version() {
        let store = MemStore::new();
        let org_id = org();
        let job = enqueue_new(&store, org_id, QueueType::Backlog).await;

        let mut retry = job.next_version();
        retry.user_comments.push("please fix".to_string());
        store.insert_job(&retry).await.expect("insert v2");

        let err = store.update_latest(&job).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_logs_keyed_by_version() {
        let store = MemStore::new();
        let org_id = org();
        let job = enqueue_new(&store, org_id, QueueType::Backlog).await;

        let entry = JobLogEntry {
            job_id: job.id,
            job_version: 1,
            org_id,
            level: crate::model::LogLevel::Info,
            timestamp: Utc::now(),
            message: "hello".to_string(),
            stage: None,
        };
        store.append_job_log(&entry).await.expect("append");

        assert_eq!(store.job_logs(org_id, job.id, 1).await.expect("logs").len(), 1);
        assert!(store.job_logs(org_id, job.id, 2).await.expect("logs").is_empty());
    }
}
