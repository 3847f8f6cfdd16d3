//! Randomized queue-model invariants.
//!
//! A seeded random walk over the queue operations checks, after every
//! step, that positions stay an exact contiguous range, that non-queued
//! jobs carry no queue slot, and that concurrent claimers never share a
//! job.

use std::collections::HashSet;
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use uuid::Uuid;

use jobforge::model::{Job, JobStatus, QueueType, UserInput, UNQUEUED_POSITION};
use jobforge::store::{JobStore, MemStore};

const ITERATIONS: usize = 150;

async fn new_job(store: &MemStore, org_id: Uuid) -> Uuid {
    let job = Job::new(org_id, UserInput::new("test", "randomized work"), "tester");
    store.insert_job(&job).await.expect("insert");
    job.id
}

/// Asserts the two queue invariants over the whole store.
async fn assert_queue_invariants(store: &MemStore, org_id: Uuid) {
    for queue in [QueueType::Backlog, QueueType::Rework] {
        let queued = store.queued_jobs(org_id, queue).await.expect("queued");
        let positions: Vec<i64> = queued.iter().map(|job| job.order_in_queue).collect();
        let expected: Vec<i64> = (0..queued.len() as i64).collect();
        assert_eq!(
            positions, expected,
            "positions in {} must be the exact range [0, n-1]",
            queue
        );
    }

    for job in store.list_jobs(org_id).await.expect("list") {
        if job.status != JobStatus::Queued {
            assert_eq!(job.queue_type, None, "non-queued job holds a queue type");
            assert_eq!(
                job.order_in_queue, UNQUEUED_POSITION,
                "non-queued job holds a position"
            );
        }
        assert_eq!(
            job.agent_id.is_some(),
            job.status == JobStatus::InProgress,
            "agent_id must be set exactly for in-progress jobs"
        );
    }
}

#[tokio::test]
async fn random_walk_preserves_contiguous_positions() {
    let mut rng = ChaCha8Rng::seed_from_u64(0x0b5e55ed);
    let store = MemStore::new();
    let org_id = Uuid::new_v4();
    let mut known: Vec<Uuid> = Vec::new();

    for _ in 0..ITERATIONS {
        let action = rng.gen_range(0..6);
        match action {
            // Enqueue a fresh job.
            0 => {
                let id = new_job(&store, org_id).await;
                let queue = if rng.gen_bool(0.5) {
                    QueueType::Backlog
                } else {
                    QueueType::Rework
                };
                store
                    .enqueue_at_tail(org_id, id, queue)
                    .await
                    .expect("enqueue");
                known.push(id);
            }
            // Claim from a random queue.
            1 => {
                let queue = if rng.gen_bool(0.5) {
                    QueueType::Backlog
                } else {
                    QueueType::Rework
                };
                store
                    .claim_next(org_id, queue, Uuid::new_v4())
                    .await
                    .expect("claim");
            }
            // Dequeue a random known job (tolerating not-queued).
            2 => {
                if let Some(&id) = pick(&mut rng, &known) {
                    let _ = store.dequeue(org_id, id).await;
                }
            }
            // Move a random job to a random (possibly out-of-range) slot.
            3 => {
                if let Some(&id) = pick(&mut rng, &known) {
                    let position = rng.gen_range(-2..20);
                    let _ = store.move_to_position(org_id, id, position).await;
                }
            }
            // Re-home a random job to the other queue's tail.
            4 => {
                if let Some(&id) = pick(&mut rng, &known) {
                    let queue = if rng.gen_bool(0.5) {
                        QueueType::Backlog
                    } else {
                        QueueType::Rework
                    };
                    let _ = store.enqueue_at_tail(org_id, id, queue).await;
                }
            }
            // Recover any stale claims back into the queues.
            _ => {
                store
                    .recover_orphans(org_id, Uuid::new_v4(), chrono::Utc::now())
                    .await
                    .expect("recover");
            }
        }

        assert_queue_invariants(&store, org_id).await;
    }
}

fn pick<'a, T>(rng: &mut ChaCha8Rng, items: &'a [T]) -> Option<&'a T> {
    if items.is_empty() {
        return None;
    }
    let index = rng.gen_range(0..items.len());
    Some(&items[index])
}

#[tokio::test]
async fn concurrent_claims_never_share_a_job() {
    // 120 rounds of racing claimers over a small queue.
    for round in 0..120u64 {
        let mut rng = ChaCha8Rng::seed_from_u64(round);
        let store = Arc::new(MemStore::new());
        let org_id = Uuid::new_v4();

        let jobs = rng.gen_range(1..5usize);
        for _ in 0..jobs {
            let id = new_job(&store, org_id).await;
            store
                .enqueue_at_tail(org_id, id, QueueType::Backlog)
                .await
                .expect("enqueue");
        }

        let claimers = rng.gen_range(2..6usize);
        let mut handles = Vec::new();
        for _ in 0..claimers {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .claim_next(org_id, QueueType::Backlog, Uuid::new_v4())
                    .await
                    .expect("claim")
            }));
        }

        let mut claimed = Vec::new();
        for handle in handles {
            if let Some(job) = handle.await.expect("join") {
                claimed.push(job);
            }
        }

        let distinct: HashSet<(Uuid, u32)> =
            claimed.iter().map(|job| (job.id, job.version)).collect();
        assert_eq!(
            distinct.len(),
            claimed.len(),
            "two claimers took the same (job, version)"
        );
        assert!(claimed.len() <= jobs);
        assert_queue_invariants(&store, org_id).await;
    }
}

#[tokio::test]
async fn reprioritize_is_a_permutation() {
    let mut rng = ChaCha8Rng::seed_from_u64(0x9e3779b9);

    for _ in 0..ITERATIONS {
        let store = MemStore::new();
        let org_id = Uuid::new_v4();

        let count = rng.gen_range(1..8usize);
        let mut ids = Vec::new();
        for _ in 0..count {
            let id = new_job(&store, org_id).await;
            store
                .enqueue_at_tail(org_id, id, QueueType::Backlog)
                .await
                .expect("enqueue");
            ids.push(id);
        }

        let target = ids[rng.gen_range(0..count)];
        let requested = rng.gen_range(-3..12i64);
        let moved = store
            .move_to_position(org_id, target, requested)
            .await
            .expect("move");

        let clamped = requested.clamp(0, count as i64 - 1);
        assert_eq!(moved.order_in_queue, clamped);

        let queued = store
            .queued_jobs(org_id, QueueType::Backlog)
            .await
            .expect("queued");
        let after: HashSet<Uuid> = queued.iter().map(|job| job.id).collect();
        let before: HashSet<Uuid> = ids.iter().copied().collect();
        assert_eq!(after, before, "reprioritize changed the set of jobs");
        assert_queue_invariants(&store, org_id).await;
    }
}

#[tokio::test]
async fn retry_version_starts_with_empty_logs() {
    use jobforge::dispatch::{apply_job_update, create_job, JobUpdate};
    use jobforge::model::AcceptanceStatus;

    let mut rng = ChaCha8Rng::seed_from_u64(7);

    for _ in 0..100 {
        let store = MemStore::new();
        let org_id = Uuid::new_v4();
        let job = create_job(
            &store,
            org_id,
            UserInput::new("web", "do something"),
            None,
            None,
            "user-1",
        )
        .await
        .expect("create");

        // A failed run with stale artifacts.
        store.dequeue(org_id, job.id).await.expect("dequeue");
        let mut failed = store
            .latest(org_id, job.id)
            .await
            .expect("get")
            .expect("job");
        failed.status = JobStatus::Failed;
        failed.user_acceptance_status = AcceptanceStatus::ReviewedAndAskedRework;
        failed.code_generation_logs = Some("stale".to_string());
        failed.code_verification_logs = Some("stale".to_string());
        store.update_latest(&failed).await.expect("update");

        let comment = format!("comment {}", rng.gen_range(0..1000));
        let updated = apply_job_update(
            &store,
            org_id,
            job.id,
            JobUpdate {
                status: Some(JobStatus::Queued),
                queue_type: Some(QueueType::Rework),
                user_comments: Some(vec![comment.clone()]),
                ..Default::default()
            },
            "user-1",
        )
        .await
        .expect("retry");

        assert_eq!(updated.version, failed.version + 1);
        assert!(updated.code_generation_logs.is_none());
        assert!(updated.code_verification_logs.is_none());
        assert!(updated.updates.contains(&comment));
        assert_eq!(updated.queue_type, Some(QueueType::Rework));
    }
}
