//! Append-only activity audit records.
//!
//! Every create/update/archive/execute/reprioritize event writes one typed
//! activity row alongside the job's human-readable `updates` line.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A machine-readable audit record tied to a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub id: Uuid,
    pub job_id: Uuid,
    pub org_id: Uuid,
    /// Event name, e.g. "job.created", "job.reprioritized".
    pub name: String,
    pub summary: String,
    pub created_by: String,
    pub updated_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub code_generation_logs: Option<String>,
    pub verification_logs: Option<String>,
}

impl Activity {
    /// Creates a new activity record for a job event.
    pub fn new(
        job_id: Uuid,
        org_id: Uuid,
        name: impl Into<String>,
        summary: impl Into<String>,
        actor: impl Into<String>,
    ) -> Self {
        let actor = actor.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_id,
            org_id,
            name: name.into(),
            summary: summary.into(),
            created_by: actor.clone(),
            updated_by: actor,
            created_at: now,
            updated_at: now,
            code_generation_logs: None,
            verification_logs: None,
        }
    }

    /// Attaches captured run logs to the record.
    pub fn with_logs(
        mut self,
        generation: Option<String>,
        verification: Option<String>,
    ) -> Self {
        self.code_generation_logs = generation;
        self.verification_logs = verification;
        self
    }
}

/// Per-user read tracking for an activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadStatus {
    Read,
    Unread,
}

/// Marks whether a given user has seen a given activity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityReadStatus {
    pub activity_id: Uuid,
    pub user_id: String,
    pub status: ReadStatus,
}
