//! User-driven job state changes: the orchestrated update behind
//! `PUT /jobs/:id`, plus creation, reprioritization, archive, and the
//! queue half of manual dispatch.
//!
//! The orchestrated update applies its rules in a fixed order: review
//! dequeue, rework transitions (both directions), then queue re-entry. A
//! retry — re-queued into rework with a new comment — writes a fresh job
//! version with cleared run artifacts.

use chrono::Utc;
use tracing::warn;
use uuid::Uuid;

use crate::error::TransitionError;
use crate::model::{
    AcceptanceStatus, Activity, Job, JobStatus, Priority, QueueType, UserInput,
};
use crate::store::JobStore;

/// Fields a `PUT /jobs/:id` may carry.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub queue_type: Option<QueueType>,
    pub user_acceptance_status: Option<AcceptanceStatus>,
    pub user_comments: Option<Vec<String>>,
    pub prompt: Option<String>,
    pub repo_id: Option<String>,
    pub priority: Option<Priority>,
}

/// Creates a job at the tail of the org's backlog.
pub async fn create_job(
    store: &dyn JobStore,
    org_id: Uuid,
    user_input: UserInput,
    repo_id: Option<String>,
    priority: Option<Priority>,
    actor: &str,
) -> Result<Job, TransitionError> {
    let mut job = Job::new(org_id, user_input, actor);
    if let Some(repo_id) = repo_id {
        job.repo_id = Some(repo_id);
    }
    if let Some(priority) = priority {
        job.priority = priority;
    }
    job.append_update("job created");
    store.insert_job(&job).await?;
    let queued = store
        .enqueue_at_tail(org_id, job.id, QueueType::Backlog)
        .await?;

    record_activity(store, &queued, "job.created", "Job created", actor).await;
    Ok(queued)
}

/// Applies the orchestrated update to the latest version of a job.
pub async fn apply_job_update(
    store: &dyn JobStore,
    org_id: Uuid,
    job_id: Uuid,
    update: JobUpdate,
    actor: &str,
) -> Result<Job, TransitionError> {
    let prev = store
        .latest(org_id, job_id)
        .await?
        .ok_or(TransitionError::JobNotFound(job_id))?;

    if prev.status == JobStatus::Archived {
        return Err(TransitionError::AlreadyArchived(job_id));
    }
    // The dispatcher is the only writer of in-progress; archive has its own
    // endpoint.
    if update.status == Some(JobStatus::InProgress) && prev.status == JobStatus::Queued {
        return Err(TransitionError::InvalidTransition {
            from: prev.status.to_string(),
            to: JobStatus::InProgress.to_string(),
            reason: "dispatch is driven by the engine".to_string(),
        });
    }
    if update.status == Some(JobStatus::Archived) {
        return Err(TransitionError::InvalidTransition {
            from: prev.status.to_string(),
            to: JobStatus::Archived.to_string(),
            reason: "use the archive endpoint".to_string(),
        });
    }

    // Field updates on a working copy; version-bump triggers tracked as we
    // go.
    let mut job = prev.clone();
    let mut bump = false;

    if let Some(prompt) = &update.prompt {
        if *prompt != job.user_input.prompt {
            job.user_input.prompt = prompt.clone();
            job.description = prompt.clone();
            bump = true;
        }
    }
    if let Some(repo_id) = &update.repo_id {
        if Some(repo_id) != job.repo_id.as_ref() {
            job.repo_id = Some(repo_id.clone());
            bump = true;
        }
    }
    if let Some(priority) = update.priority {
        job.priority = priority;
    }

    let prev_acceptance = prev.user_acceptance_status;
    if let Some(acceptance) = update.user_acceptance_status {
        if acceptance != prev_acceptance {
            job.user_acceptance_status = acceptance;
            if acceptance == AcceptanceStatus::ReviewedAndAskedRework {
                bump = true;
            }
        }
    }

    let comments_grew = update
        .user_comments
        .as_ref()
        .map(|comments| comments.len() > prev.user_comments.len())
        .unwrap_or(false);
    if let Some(comments) = update.user_comments {
        job.user_comments = comments;
    }

    // Queue rules, evaluated against the pre-update state.
    let to_in_review =
        update.status == Some(JobStatus::InReview) && prev.status != JobStatus::InReview;
    let acceptance_to_rework = job.user_acceptance_status
        == AcceptanceStatus::ReviewedAndAskedRework
        && prev_acceptance != AcceptanceStatus::ReviewedAndAskedRework;
    let rework_withdrawn = job.user_acceptance_status == AcceptanceStatus::NotReviewed
        && prev_acceptance == AcceptanceStatus::ReviewedAndAskedRework
        && prev.is_queued();
    let to_queued = update.status == Some(JobStatus::Queued) && prev.status != JobStatus::Queued;
    let target_queue = update.queue_type.unwrap_or_else(|| job.home_queue());

    let retry = update.status == Some(JobStatus::Queued)
        && target_queue == QueueType::Rework
        && comments_grew;
    if retry {
        bump = true;
    }

    if acceptance_to_rework {
        job.append_update("rework requested by reviewer");
    }
    if retry {
        let comment = job
            .user_comments
            .last()
            .cloned()
            .unwrap_or_default();
        job.append_update(&format!("retry requested with new comment: \"{}\"", comment));
    }

    job.updated_by = actor.to_string();
    job.updated_at = Utc::now();

    // Persist the field updates: either a fresh version row (run artifacts
    // cleared, so the retry starts an empty log series) or in place.
    if bump {
        let mut next = job.clone();
        next.version = prev.version + 1;
        next.code_generation_logs = None;
        next.code_verification_logs = None;
        next.pr_link = None;
        next.confidence_score = None;
        store.insert_job(&next).await?;
        job = next;
    } else {
        store.update_latest(&job).await?;
    }

    // Queue transitions, in rule order.
    let mut requeued = false;
    if to_in_review {
        if job.is_queued() {
            store.dequeue(org_id, job_id).await?;
        }
        let mut latest = store
            .latest(org_id, job_id)
            .await?
            .ok_or(TransitionError::JobNotFound(job_id))?;
        latest.status = JobStatus::InReview;
        latest.agent_id = None;
        latest.updated_at = Utc::now();
        latest.append_update("moved to review");
        store.update_latest(&latest).await?;
    }
    if acceptance_to_rework {
        store
            .enqueue_at_tail(org_id, job_id, QueueType::Rework)
            .await?;
        requeued = true;
    } else if rework_withdrawn {
        store
            .enqueue_at_tail(org_id, job_id, QueueType::Backlog)
            .await?;
        requeued = true;
    }
    if to_queued && !requeued && !to_in_review {
        store.enqueue_at_tail(org_id, job_id, target_queue).await?;
    }
    // A plain terminal-status write still vacates the queue slot.
    if let Some(status) = update.status {
        if matches!(status, JobStatus::Completed | JobStatus::Failed) {
            let current = store
                .latest(org_id, job_id)
                .await?
                .ok_or(TransitionError::JobNotFound(job_id))?;
            if current.is_queued() {
                store.dequeue(org_id, job_id).await?;
            }
            let mut latest = store
                .latest(org_id, job_id)
                .await?
                .ok_or(TransitionError::JobNotFound(job_id))?;
            latest.status = status;
            latest.agent_id = None;
            latest.updated_at = Utc::now();
            store.update_latest(&latest).await?;
        }
    }

    let updated = store
        .latest(org_id, job_id)
        .await?
        .ok_or(TransitionError::JobNotFound(job_id))?;
    record_activity(
        store,
        &updated,
        "job.updated",
        if retry {
            "Job re-queued for rework"
        } else {
            "Job updated"
        },
        actor,
    )
    .await;
    Ok(updated)
}

/// Moves a queued job to `position` (clamped), rewriting the queue's
/// positions as one contiguous range.
pub async fn reprioritize(
    store: &dyn JobStore,
    org_id: Uuid,
    job_id: Uuid,
    position: i64,
    actor: &str,
) -> Result<Job, TransitionError> {
    let job = store
        .latest(org_id, job_id)
        .await?
        .ok_or(TransitionError::JobNotFound(job_id))?;
    if !job.is_queued() {
        return Err(TransitionError::NotQueued(job_id));
    }

    let moved = store.move_to_position(org_id, job_id, position).await?;
    record_activity(
        store,
        &moved,
        "job.reprioritized",
        &format!("Moved to position {}", moved.order_in_queue),
        actor,
    )
    .await;
    Ok(moved)
}

/// Archives a job. A queued job leaves its queue first so the remaining
/// positions stay contiguous.
pub async fn archive(
    store: &dyn JobStore,
    org_id: Uuid,
    job_id: Uuid,
    actor: &str,
) -> Result<Job, TransitionError> {
    let job = store
        .latest(org_id, job_id)
        .await?
        .ok_or(TransitionError::JobNotFound(job_id))?;
    if job.status == JobStatus::Archived {
        return Err(TransitionError::AlreadyArchived(job_id));
    }

    if job.is_queued() {
        store.dequeue(org_id, job_id).await?;
    }
    let mut latest = store
        .latest(org_id, job_id)
        .await?
        .ok_or(TransitionError::JobNotFound(job_id))?;
    latest.status = JobStatus::Archived;
    latest.agent_id = None;
    latest.updated_at = Utc::now();
    latest.updated_by = actor.to_string();
    latest.append_update("archived");
    store.update_latest(&latest).await?;

    record_activity(store, &latest, "job.archived", "Job archived", actor).await;
    Ok(latest)
}

/// Queue half of manual dispatch: validates the job is queued with a queue
/// type, removes it, and reprioritizes the remainder. The caller assigns an
/// agent and starts the execution workflow.
pub async fn prepare_manual_execute(
    store: &dyn JobStore,
    org_id: Uuid,
    job_id: Uuid,
    actor: &str,
) -> Result<(Job, QueueType), TransitionError> {
    let job = store
        .latest(org_id, job_id)
        .await?
        .ok_or(TransitionError::JobNotFound(job_id))?;
    let queue = match (job.status, job.queue_type) {
        (JobStatus::Queued, Some(queue)) => queue,
        _ => return Err(TransitionError::NotQueued(job_id)),
    };

    let removed = store.dequeue(org_id, job_id).await?;
    record_activity(
        store,
        &removed,
        "job.executed.manual",
        "Manual dispatch requested",
        actor,
    )
    .await;
    Ok((removed, queue))
}

async fn record_activity(
    store: &dyn JobStore,
    job: &Job,
    name: &str,
    summary: &str,
    actor: &str,
) {
    let activity = Activity::new(job.id, job.org_id, name, summary, actor);
    if let Err(e) = store.insert_activity(&activity).await {
        warn!(job_id = %job.id, error = %e, "Failed to write activity row");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    async fn seeded_job(store: &MemStore, org_id: Uuid) -> Job {
        create_job(
            store,
            org_id,
            UserInput::new("web", "Fix the flaky login test"),
            None,
            None,
            "user-1",
        )
        .await
        .expect("create")
    }

    #[tokio::test]
    async fn test_create_job_lands_at_backlog_tail() {
        let store = MemStore::new();
        let org_id = Uuid::new_v4();

        let first = seeded_job(&store, org_id).await;
        let second = seeded_job(&store, org_id).await;

        assert_eq!(first.status, JobStatus::Queued);
        assert_eq!(first.queue_type, Some(QueueType::Backlog));
        assert_eq!(first.order_in_queue, 0);
        assert_eq!(second.order_in_queue, 1);
        assert!(first.updates.contains("job created"));

        let activities = store
            .activities_for_job(org_id, first.id)
            .await
            .expect("activities");
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0].name, "job.created");
    }

    #[tokio::test]
    async fn test_queued_to_in_progress_is_forbidden() {
        let store = MemStore::new();
        let org_id = Uuid::new_v4();
        let job = seeded_job(&store, org_id).await;

        let err = apply_job_update(
            &store,
            org_id,
            job.id,
            JobUpdate {
                status: Some(JobStatus::InProgress),
                ..Default::default()
            },
            "user-1",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransitionError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_in_review_dequeues_and_reprioritizes() {
        let store = MemStore::new();
        let org_id = Uuid::new_v4();
        let first = seeded_job(&store, org_id).await;
        let second = seeded_job(&store, org_id).await;

        let updated = apply_job_update(
            &store,
            org_id,
            first.id,
            JobUpdate {
                status: Some(JobStatus::InReview),
                ..Default::default()
            },
            "user-1",
        )
        .await
        .expect("update");

        assert_eq!(updated.status, JobStatus::InReview);
        assert!(updated.queue_type.is_none());

        let remaining = store
            .queued_jobs(org_id, QueueType::Backlog)
            .await
            .expect("queued");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, second.id);
        assert_eq!(remaining[0].order_in_queue, 0);
    }

    #[tokio::test]
    async fn test_rework_request_moves_completed_job_into_rework() {
        let store = MemStore::new();
        let org_id = Uuid::new_v4();
        let job = seeded_job(&store, org_id).await;

        // Finish the job outside the queue first.
        store.dequeue(org_id, job.id).await.expect("dequeue");
        let mut done = store.latest(org_id, job.id).await.expect("get").expect("job");
        done.status = JobStatus::Completed;
        store.update_latest(&done).await.expect("update");

        let updated = apply_job_update(
            &store,
            org_id,
            job.id,
            JobUpdate {
                user_acceptance_status: Some(AcceptanceStatus::ReviewedAndAskedRework),
                ..Default::default()
            },
            "user-1",
        )
        .await
        .expect("update");

        assert_eq!(updated.status, JobStatus::Queued);
        assert_eq!(updated.queue_type, Some(QueueType::Rework));
        assert_eq!(updated.order_in_queue, 0);
        // Rework request writes a new version.
        assert_eq!(updated.version, job.version + 1);
        assert!(updated.updates.contains("rework requested"));
    }

    #[tokio::test]
    async fn test_rework_request_on_queued_backlog_job_switches_queue() {
        let store = MemStore::new();
        let org_id = Uuid::new_v4();
        let first = seeded_job(&store, org_id).await;
        let second = seeded_job(&store, org_id).await;

        let updated = apply_job_update(
            &store,
            org_id,
            first.id,
            JobUpdate {
                user_acceptance_status: Some(AcceptanceStatus::ReviewedAndAskedRework),
                ..Default::default()
            },
            "user-1",
        )
        .await
        .expect("update");

        assert_eq!(updated.queue_type, Some(QueueType::Rework));
        // Backlog closed the gap.
        let backlog = store
            .queued_jobs(org_id, QueueType::Backlog)
            .await
            .expect("queued");
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].id, second.id);
        assert_eq!(backlog[0].order_in_queue, 0);
    }

    #[tokio::test]
    async fn test_withdrawing_rework_returns_to_backlog_tail() {
        let store = MemStore::new();
        let org_id = Uuid::new_v4();
        let job = seeded_job(&store, org_id).await;
        let other = seeded_job(&store, org_id).await;

        apply_job_update(
            &store,
            org_id,
            job.id,
            JobUpdate {
                user_acceptance_status: Some(AcceptanceStatus::ReviewedAndAskedRework),
                ..Default::default()
            },
            "user-1",
        )
        .await
        .expect("into rework");

        let updated = apply_job_update(
            &store,
            org_id,
            job.id,
            JobUpdate {
                user_acceptance_status: Some(AcceptanceStatus::NotReviewed),
                ..Default::default()
            },
            "user-1",
        )
        .await
        .expect("withdraw");

        assert_eq!(updated.queue_type, Some(QueueType::Backlog));
        // Tail of backlog, behind the untouched job.
        assert_eq!(updated.order_in_queue, 1);
        let other = store.latest(org_id, other.id).await.expect("get").expect("job");
        assert_eq!(other.order_in_queue, 0);
    }

    #[tokio::test]
    async fn test_retry_writes_new_version_with_cleared_logs() {
        let store = MemStore::new();
        let org_id = Uuid::new_v4();
        let job = seeded_job(&store, org_id).await;

        // A failed run with rework already requested.
        store.dequeue(org_id, job.id).await.expect("dequeue");
        let mut failed = store.latest(org_id, job.id).await.expect("get").expect("job");
        failed.status = JobStatus::Failed;
        failed.user_acceptance_status = AcceptanceStatus::ReviewedAndAskedRework;
        failed.code_generation_logs = Some("old generation logs".to_string());
        failed.code_verification_logs = Some("old verification logs".to_string());
        store.update_latest(&failed).await.expect("update");

        let updated = apply_job_update(
            &store,
            org_id,
            job.id,
            JobUpdate {
                status: Some(JobStatus::Queued),
                queue_type: Some(QueueType::Rework),
                user_comments: Some(vec!["please handle the empty-cart case".to_string()]),
                ..Default::default()
            },
            "user-1",
        )
        .await
        .expect("retry");

        assert_eq!(updated.version, failed.version + 1);
        assert!(updated.code_generation_logs.is_none());
        assert!(updated.code_verification_logs.is_none());
        assert_eq!(updated.status, JobStatus::Queued);
        assert_eq!(updated.queue_type, Some(QueueType::Rework));
        assert!(updated
            .updates
            .contains("retry requested with new comment: \"please handle the empty-cart case\""));
    }

    #[tokio::test]
    async fn test_requeue_without_queue_type_follows_acceptance() {
        let store = MemStore::new();
        let org_id = Uuid::new_v4();
        let job = seeded_job(&store, org_id).await;

        store.dequeue(org_id, job.id).await.expect("dequeue");
        let mut failed = store.latest(org_id, job.id).await.expect("get").expect("job");
        failed.status = JobStatus::Failed;
        store.update_latest(&failed).await.expect("update");

        let updated = apply_job_update(
            &store,
            org_id,
            job.id,
            JobUpdate {
                status: Some(JobStatus::Queued),
                ..Default::default()
            },
            "user-1",
        )
        .await
        .expect("requeue");

        // not_reviewed acceptance: home queue is the backlog.
        assert_eq!(updated.queue_type, Some(QueueType::Backlog));
    }

    #[tokio::test]
    async fn test_prompt_change_bumps_version() {
        let store = MemStore::new();
        let org_id = Uuid::new_v4();
        let job = seeded_job(&store, org_id).await;

        let updated = apply_job_update(
            &store,
            org_id,
            job.id,
            JobUpdate {
                prompt: Some("Fix the flaky login test and add coverage".to_string()),
                ..Default::default()
            },
            "user-1",
        )
        .await
        .expect("update");

        assert_eq!(updated.version, job.version + 1);
        assert_eq!(
            updated.user_input.prompt,
            "Fix the flaky login test and add coverage"
        );
        // The version bump preserved the queue slot.
        assert_eq!(updated.status, JobStatus::Queued);
        assert_eq!(updated.order_in_queue, job.order_in_queue);
    }

    #[tokio::test]
    async fn test_reprioritize_requires_queued() {
        let store = MemStore::new();
        let org_id = Uuid::new_v4();
        let job = seeded_job(&store, org_id).await;

        store.dequeue(org_id, job.id).await.expect("dequeue");
        let err = reprioritize(&store, org_id, job.id, 0, "user-1")
            .await
            .unwrap_err();
        assert!(matches!(err, TransitionError::NotQueued(_)));
    }

    #[tokio::test]
    async fn test_reprioritize_clamps_position() {
        let store = MemStore::new();
        let org_id = Uuid::new_v4();
        let first = seeded_job(&store, org_id).await;
        let _second = seeded_job(&store, org_id).await;

        let moved = reprioritize(&store, org_id, first.id, 99, "user-1")
            .await
            .expect("move");
        assert_eq!(moved.order_in_queue, 1);
    }

    #[tokio::test]
    async fn test_archive_queued_job_reprioritizes_remainder() {
        let store = MemStore::new();
        let org_id = Uuid::new_v4();
        let first = seeded_job(&store, org_id).await;
        let second = seeded_job(&store, org_id).await;
        let third = seeded_job(&store, org_id).await;

        let archived = archive(&store, org_id, second.id, "user-1")
            .await
            .expect("archive");
        assert_eq!(archived.status, JobStatus::Archived);

        let backlog = store
            .queued_jobs(org_id, QueueType::Backlog)
            .await
            .expect("queued");
        let ids: Vec<Uuid> = backlog.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![first.id, third.id]);
        assert_eq!(backlog[0].order_in_queue, 0);
        assert_eq!(backlog[1].order_in_queue, 1);

        let err = archive(&store, org_id, second.id, "user-1")
            .await
            .unwrap_err();
        assert!(matches!(err, TransitionError::AlreadyArchived(_)));
    }

    #[tokio::test]
    async fn test_prepare_manual_execute_dequeues() {
        let store = MemStore::new();
        let org_id = Uuid::new_v4();
        let first = seeded_job(&store, org_id).await;
        let second = seeded_job(&store, org_id).await;

        let (job, queue) = prepare_manual_execute(&store, org_id, first.id, "user-1")
            .await
            .expect("prepare");
        assert_eq!(queue, QueueType::Backlog);
        assert!(job.queue_type.is_none());

        let backlog = store
            .queued_jobs(org_id, QueueType::Backlog)
            .await
            .expect("queued");
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].id, second.id);
        assert_eq!(backlog[0].order_in_queue, 0);

        let err = prepare_manual_execute(&store, org_id, first.id, "user-1")
            .await
            .unwrap_err();
        assert!(matches!(err, TransitionError::NotQueued(_)));
    }
}
