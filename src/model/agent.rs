//! Agent records and liveness state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Liveness status of a remote execution agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Connected and eligible for dispatch.
    Active,
    /// Registered but not currently taking work.
    Idle,
    /// Failed three consecutive health checks; schedules paused.
    Offline,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Active => write!(f, "active"),
            AgentStatus::Idle => write!(f, "idle"),
            AgentStatus::Offline => write!(f, "offline"),
        }
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AgentStatus::Active),
            "idle" => Ok(AgentStatus::Idle),
            "offline" => Ok(AgentStatus::Offline),
            other => Err(format!("unknown agent status '{}'", other)),
        }
    }
}

/// A remote process on a developer machine that executes code-generation
/// jobs and streams logs back. Registration upserts on `(org_id, host)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub status: AgentStatus,
    pub host: String,
    pub port: u16,
    pub ip: Option<String>,
    pub consecutive_failures: u32,
    pub last_active: Option<DateTime<Utc>>,
    pub last_stream_connected_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Agent {
    /// Creates a freshly registered, active agent.
    pub fn new(org_id: Uuid, host: impl Into<String>, port: u16, ip: Option<String>) -> Self {
        let host = host.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            org_id,
            name: host.clone(),
            status: AgentStatus::Active,
            host,
            port,
            ip,
            consecutive_failures: 0,
            last_active: Some(now),
            last_stream_connected_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    /// Marks the agent live: active status and a cleared failure counter.
    pub fn mark_active(&mut self, at: DateTime<Utc>) {
        self.status = AgentStatus::Active;
        self.consecutive_failures = 0;
        self.last_active = Some(at);
        self.updated_at = at;
    }

    /// Records one failed ping; returns true when the failure pushed the
    /// agent over the offline threshold.
    pub fn record_failure(&mut self, threshold: u32, at: DateTime<Utc>) -> bool {
        self.consecutive_failures += 1;
        self.updated_at = at;
        if self.consecutive_failures >= threshold && self.status != AgentStatus::Offline {
            self.status = AgentStatus::Offline;
            return true;
        }
        false
    }

    /// Base URL for the agent's own RPC surface.
    pub fn rpc_url(&self) -> String {
        let host = self.ip.as_deref().unwrap_or(&self.host);
        format!("http://{}:{}", host, self.port)
    }
}

/// Per-agent binding to the workflow engine's schedules. Exists iff the
/// agent has ever been active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleBinding {
    pub agent_id: Uuid,
    pub queue_schedule_id: String,
    pub health_check_schedule_id: String,
}

impl ScheduleBinding {
    /// Deterministic schedule ids for an agent.
    pub fn for_agent(agent_id: Uuid) -> Self {
        Self {
            agent_id,
            queue_schedule_id: format!("queue-dispatch-{}", agent_id),
            health_check_schedule_id: format!("health-check-{}", agent_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_agent_is_active() {
        let agent = Agent::new(Uuid::new_v4(), "dev-box", 50051, None);

        assert_eq!(agent.status, AgentStatus::Active);
        assert_eq!(agent.consecutive_failures, 0);
        assert!(agent.last_active.is_some());
        assert_eq!(agent.name, "dev-box");
    }

    #[test]
    fn test_record_failure_crosses_threshold_once() {
        let mut agent = Agent::new(Uuid::new_v4(), "dev-box", 50051, None);

        assert!(!agent.record_failure(3, Utc::now()));
        assert!(!agent.record_failure(3, Utc::now()));
        assert!(agent.record_failure(3, Utc::now()));
        assert_eq!(agent.status, AgentStatus::Offline);

        // Already offline: further failures do not re-trigger.
        assert!(!agent.record_failure(3, Utc::now()));
        assert_eq!(agent.consecutive_failures, 4);
    }

    #[test]
    fn test_mark_active_resets_counter() {
        let mut agent = Agent::new(Uuid::new_v4(), "dev-box", 50051, None);
        agent.record_failure(3, Utc::now());
        agent.record_failure(3, Utc::now());

        agent.mark_active(Utc::now());

        assert_eq!(agent.status, AgentStatus::Active);
        assert_eq!(agent.consecutive_failures, 0);
    }

    #[test]
    fn test_rpc_url_prefers_ip() {
        let agent = Agent::new(Uuid::new_v4(), "dev-box", 50051, Some("10.1.2.3".to_string()));
        assert_eq!(agent.rpc_url(), "http://10.1.2.3:50051");

        let agent = Agent::new(Uuid::new_v4(), "dev-box", 50051, None);
        assert_eq!(agent.rpc_url(), "http://dev-box:50051");
    }

    #[test]
    fn test_schedule_binding_is_deterministic() {
        let id = Uuid::new_v4();
        let a = ScheduleBinding::for_agent(id);
        let b = ScheduleBinding::for_agent(id);
        assert_eq!(a, b);
        assert!(a.queue_schedule_id.contains(&id.to_string()));
    }
}
