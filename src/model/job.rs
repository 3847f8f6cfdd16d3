//! Job definitions for the dispatch engine.
//!
//! A job is a versioned record keyed by `(id, version)`. Most mutations
//! update the latest version in place; a new version row is written when the
//! prompt or repository changes, when the reviewer asks for rework, or when
//! the job re-enters the queue as a retry carrying new comments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Position value for jobs that are not in any queue.
pub const UNQUEUED_POSITION: i64 = -1;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    /// Waiting in a queue for an agent.
    Queued,
    /// Claimed by an agent and currently executing.
    InProgress,
    /// Awaiting user review.
    InReview,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Soft-deleted; hidden from listings.
    Archived,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::InProgress => write!(f, "in-progress"),
            JobStatus::InReview => write!(f, "in-review"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Archived => write!(f, "archived"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "in-progress" => Ok(JobStatus::InProgress),
            "in-review" => Ok(JobStatus::InReview),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "archived" => Ok(JobStatus::Archived),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// User-facing priority of a job. Ordering within a queue is positional;
/// priority is advisory metadata surfaced to reviewers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

/// Which per-org queue a job sits in. `rework` has strict priority over
/// `backlog` during claiming. A job that is not queued carries no queue type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueType {
    Backlog,
    Rework,
}

impl QueueType {
    /// Claim order: rework is always drained before backlog.
    pub const CLAIM_ORDER: [QueueType; 2] = [QueueType::Rework, QueueType::Backlog];
}

impl std::fmt::Display for QueueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueType::Backlog => write!(f, "backlog"),
            QueueType::Rework => write!(f, "rework"),
        }
    }
}

impl std::str::FromStr for QueueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backlog" => Ok(QueueType::Backlog),
            "rework" => Ok(QueueType::Rework),
            other => Err(format!("unknown queue type '{}'", other)),
        }
    }
}

/// Reviewer verdict on a finished job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptanceStatus {
    NotReviewed,
    ReviewedAndAccepted,
    ReviewedAndAskedRework,
    Rejected,
}

impl std::fmt::Display for AcceptanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcceptanceStatus::NotReviewed => write!(f, "not_reviewed"),
            AcceptanceStatus::ReviewedAndAccepted => write!(f, "reviewed_and_accepted"),
            AcceptanceStatus::ReviewedAndAskedRework => write!(f, "reviewed_and_asked_rework"),
            AcceptanceStatus::Rejected => write!(f, "rejected"),
        }
    }
}

impl std::str::FromStr for AcceptanceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_reviewed" => Ok(AcceptanceStatus::NotReviewed),
            "reviewed_and_accepted" => Ok(AcceptanceStatus::ReviewedAndAccepted),
            "reviewed_and_asked_rework" => Ok(AcceptanceStatus::ReviewedAndAskedRework),
            "rejected" => Ok(AcceptanceStatus::Rejected),
            other => Err(format!("unknown acceptance status '{}'", other)),
        }
    }
}

/// What the user originally asked for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInput {
    /// Where the request came from (e.g. "web", "slack").
    pub source: String,
    /// The code-generation prompt.
    pub prompt: String,
    /// Source-specific context (thread ids, message links).
    #[serde(default)]
    pub source_metadata: Option<serde_json::Value>,
}

impl UserInput {
    /// Creates a new user input with no source metadata.
    pub fn new(source: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            prompt: prompt.into(),
            source_metadata: None,
        }
    }
}

/// A versioned code-generation job.
///
/// The pair `(id, version)` is the storage key; `version` starts at 1 and
/// only ever grows. Queue membership is expressed by `queue_type` together
/// with `order_in_queue`; both are cleared the moment a job leaves its queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub version: u32,
    pub org_id: Uuid,
    /// Short display name, generated from the prompt at creation time.
    pub name: String,
    pub description: String,
    pub status: JobStatus,
    pub priority: Priority,
    /// Present iff the job is queued.
    pub queue_type: Option<QueueType>,
    /// Zero-based position within `queue_type`, or -1 when unqueued.
    pub order_in_queue: i64,
    /// The agent currently executing this job. Non-null iff `in-progress`.
    pub agent_id: Option<Uuid>,
    pub user_input: UserInput,
    pub repo_id: Option<String>,
    pub user_acceptance_status: AcceptanceStatus,
    pub user_comments: Vec<String>,
    pub code_generation_logs: Option<String>,
    pub code_verification_logs: Option<String>,
    pub pr_link: Option<String>,
    pub confidence_score: Option<f64>,
    /// Append-only, newline-separated, human-readable audit trail.
    pub updates: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: String,
    pub updated_by: String,
}

impl Job {
    /// Creates a fresh version-1 job, not yet placed in any queue.
    pub fn new(org_id: Uuid, user_input: UserInput, created_by: impl Into<String>) -> Self {
        let created_by = created_by.into();
        let now = Utc::now();
        let name = summarize_prompt(&user_input.prompt);
        Self {
            id: Uuid::new_v4(),
            version: 1,
            org_id,
            description: user_input.prompt.clone(),
            name,
            status: JobStatus::Queued,
            priority: Priority::Medium,
            queue_type: None,
            order_in_queue: UNQUEUED_POSITION,
            agent_id: None,
            user_input,
            repo_id: None,
            user_acceptance_status: AcceptanceStatus::NotReviewed,
            user_comments: Vec::new(),
            code_generation_logs: None,
            code_verification_logs: None,
            pr_link: None,
            confidence_score: None,
            updates: String::new(),
            created_at: now,
            updated_at: now,
            created_by: created_by.clone(),
            updated_by: created_by,
        }
    }

    /// Sets the target repository.
    pub fn with_repo(mut self, repo_id: impl Into<String>) -> Self {
        self.repo_id = Some(repo_id.into());
        self
    }

    /// Sets the advisory priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Returns whether the job currently occupies a queue slot.
    pub fn is_queued(&self) -> bool {
        self.status == JobStatus::Queued && self.queue_type.is_some()
    }

    /// Appends a timestamped line to the human-readable audit trail.
    pub fn append_update(&mut self, line: &str) {
        if !self.updates.is_empty() {
            self.updates.push('\n');
        }
        self.updates
            .push_str(&format!("[{}] {}", Utc::now().to_rfc3339(), line));
    }

    /// The queue an orphaned or re-queued job belongs in, derived from the
    /// reviewer verdict: rework requests go back to the rework queue,
    /// everything else returns to the backlog.
    pub fn home_queue(&self) -> QueueType {
        match self.user_acceptance_status {
            AcceptanceStatus::ReviewedAndAskedRework => QueueType::Rework,
            _ => QueueType::Backlog,
        }
    }

    /// Detaches the job from its queue slot without touching `status`.
    pub fn clear_queue_slot(&mut self) {
        self.queue_type = None;
        self.order_in_queue = UNQUEUED_POSITION;
    }

    /// Starts a successor version, clearing per-run artifacts so a retry
    /// begins a fresh log series.
    pub fn next_version(&self) -> Self {
        let mut next = self.clone();
        next.version = self.version + 1;
        next.code_generation_logs = None;
        next.code_verification_logs = None;
        next.pr_link = None;
        next.confidence_score = None;
        next.agent_id = None;
        next.updated_at = Utc::now();
        next
    }
}

/// Derives a short job name from the prompt's first words.
fn summarize_prompt(prompt: &str) -> String {
    const MAX_WORDS: usize = 8;
    let words: Vec<&str> = prompt.split_whitespace().take(MAX_WORDS).collect();
    if words.is_empty() {
        return "untitled job".to_string();
    }
    let mut name = words.join(" ");
    if prompt.split_whitespace().count() > MAX_WORDS {
        name.push('…');
    }
    name
}
