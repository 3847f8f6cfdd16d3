//! Structured job log entries.
//!
//! Log series are keyed by `(job_id, job_version, org_id)` so a retry that
//! writes a new job version starts a fresh series.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Severity of a log entry streamed from an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// One entry in a job's persisted log series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub job_id: Uuid,
    pub job_version: u32,
    pub org_id: Uuid,
    pub level: LogLevel,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    /// Pipeline stage the agent reported, e.g. "execute", "verify".
    pub stage: Option<String>,
}

impl JobLogEntry {
    /// Renders the entry as one line for the job's accumulated log text.
    pub fn render(&self) -> String {
        match &self.stage {
            Some(stage) => format!(
                "{} [{}] ({}) {}",
                self.timestamp.to_rfc3339(),
                self.level,
                stage,
                self.message
            ),
            None => format!(
                "{} [{}] {}",
                self.timestamp.to_rfc3339(),
                self.level,
                self.message
            ),
        }
    }
}
