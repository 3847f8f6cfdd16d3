//! Per-job log fan-out.
//!
//! UI subscribers get a best-effort live feed of log entries; the persisted
//! series in the store is authoritative. Broadcast never blocks: a
//! subscriber whose channel is full misses the entry, and closed channels
//! are pruned on the next broadcast.

use std::collections::HashMap;

use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::model::JobLogEntry;

/// Buffer depth per subscriber before entries are dropped.
const SUBSCRIBER_BUFFER: usize = 256;

/// Fan-out of job log entries to live subscribers, keyed by job id.
#[derive(Default)]
pub struct LogNotifier {
    subscribers: Mutex<HashMap<Uuid, Vec<mpsc::Sender<JobLogEntry>>>>,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes to a job's live log feed.
    pub async fn subscribe(&self, job_id: Uuid) -> mpsc::Receiver<JobLogEntry> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut subscribers = self.subscribers.lock().await;
        subscribers.entry(job_id).or_default().push(tx);
        rx
    }

    /// Whether anyone is currently listening to a job.
    pub async fn has_subscribers(&self, job_id: Uuid) -> bool {
        let subscribers = self.subscribers.lock().await;
        subscribers
            .get(&job_id)
            .map(|list| list.iter().any(|tx| !tx.is_closed()))
            .unwrap_or(false)
    }

    /// Delivers an entry to every live subscriber of its job. Non-blocking;
    /// full channels drop the entry, closed channels are pruned.
    pub async fn broadcast(&self, entry: &JobLogEntry) {
        let mut subscribers = self.subscribers.lock().await;
        let Some(list) = subscribers.get_mut(&entry.job_id) else {
            return;
        };
        list.retain(|tx| match tx.try_send(entry.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if list.is_empty() {
            subscribers.remove(&entry.job_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LogLevel;
    use chrono::Utc;

    fn entry(job_id: Uuid, message: &str) -> JobLogEntry {
        JobLogEntry {
            job_id,
            job_version: 1,
            org_id: Uuid::new_v4(),
            level: LogLevel::Info,
            timestamp: Utc::now(),
            message: message.to_string(),
            stage: None,
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscriber() {
        let notifier = LogNotifier::new();
        let job_id = Uuid::new_v4();
        let mut rx = notifier.subscribe(job_id).await;

        assert!(notifier.has_subscribers(job_id).await);
        notifier.broadcast(&entry(job_id, "hello")).await;

        let received = rx.recv().await.expect("entry delivered");
        assert_eq!(received.message, "hello");
    }

    #[tokio::test]
    async fn test_broadcast_scoped_to_job() {
        let notifier = LogNotifier::new();
        let watched = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut rx = notifier.subscribe(watched).await;

        notifier.broadcast(&entry(other, "noise")).await;
        notifier.broadcast(&entry(watched, "signal")).await;

        let received = rx.recv().await.expect("entry delivered");
        assert_eq!(received.message, "signal");
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let notifier = LogNotifier::new();
        let job_id = Uuid::new_v4();
        let rx = notifier.subscribe(job_id).await;
        drop(rx);

        notifier.broadcast(&entry(job_id, "anyone?")).await;
        assert!(!notifier.has_subscribers(job_id).await);
    }

    #[tokio::test]
    async fn test_full_subscriber_drops_without_blocking() {
        let notifier = LogNotifier::new();
        let job_id = Uuid::new_v4();
        let mut rx = notifier.subscribe(job_id).await;

        for i in 0..SUBSCRIBER_BUFFER + 10 {
            notifier.broadcast(&entry(job_id, &format!("line {}", i))).await;
        }

        // The subscriber still works and sees the buffered prefix.
        let first = rx.recv().await.expect("entry");
        assert_eq!(first.message, "line 0");
        assert!(notifier.has_subscribers(job_id).await);
    }
}
