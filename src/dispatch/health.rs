//! Per-agent health checking.
//!
//! The scheduled check pings over the agent stream and waits for a
//! heartbeat ack; three consecutive misses flip the agent offline (the
//! schedule runner pauses its schedules on that signal). The user-initiated
//! reconnect path performs one longer synchronous ping and revives the
//! agent on success.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::DispatchError;
use crate::metrics;
use crate::model::AgentStatus;
use crate::store::JobStore;
use crate::stream::StreamManager;

/// Result of one scheduled health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthOutcome {
    pub success: bool,
    /// True exactly when this check pushed the agent over the offline
    /// threshold; the schedule runner pauses both schedules on it.
    pub went_offline: bool,
}

/// Scheduled and on-demand agent liveness checks.
pub struct HealthChecker {
    store: Arc<dyn JobStore>,
    streams: Arc<StreamManager>,
    config: OrchestratorConfig,
}

impl HealthChecker {
    pub fn new(
        store: Arc<dyn JobStore>,
        streams: Arc<StreamManager>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            streams,
            config,
        }
    }

    /// One scheduled check: ping, await the heartbeat ack, update liveness.
    pub async fn check(&self, agent_id: Uuid) -> Result<HealthOutcome, DispatchError> {
        let agent = self
            .store
            .get_agent(agent_id)
            .await?
            .ok_or(DispatchError::AgentNotFound(agent_id))?;
        if agent.status != AgentStatus::Active {
            return Ok(HealthOutcome {
                success: false,
                went_offline: false,
            });
        }

        match self.streams.ping(agent_id, self.config.ping_timeout).await {
            Ok(()) => {
                self.store
                    .record_agent_heartbeat(agent_id, Utc::now())
                    .await?;
                debug!(agent_id = %agent_id, "Health check passed");
                Ok(HealthOutcome {
                    success: true,
                    went_offline: false,
                })
            }
            Err(e) => {
                metrics::ping_failed();
                let updated = self
                    .store
                    .record_ping_failure(agent_id, self.config.offline_threshold)
                    .await?;
                let went_offline = updated.status == AgentStatus::Offline
                    && updated.consecutive_failures == self.config.offline_threshold;
                if went_offline {
                    warn!(
                        agent_id = %agent_id,
                        failures = updated.consecutive_failures,
                        "Agent went offline after consecutive ping failures"
                    );
                } else {
                    debug!(
                        agent_id = %agent_id,
                        failures = updated.consecutive_failures,
                        error = %e,
                        "Health check failed"
                    );
                }
                Ok(HealthOutcome {
                    success: false,
                    went_offline,
                })
            }
        }
    }

    /// User-initiated reconnect: one synchronous ping with the longer
    /// timeout. On success the agent is revived; the caller resumes its
    /// schedules.
    pub async fn reconnect(&self, agent_id: Uuid) -> Result<bool, DispatchError> {
        let agent = self
            .store
            .get_agent(agent_id)
            .await?
            .ok_or(DispatchError::AgentNotFound(agent_id))?;

        match self
            .streams
            .ping(agent_id, self.config.reconnect_timeout)
            .await
        {
            Ok(()) => {
                let mut revived = agent;
                revived.mark_active(Utc::now());
                self.store.update_agent(&revived).await?;
                info!(agent_id = %agent_id, "Agent reconnected");
                Ok(true)
            }
            Err(e) => {
                debug!(agent_id = %agent_id, error = %e, "Reconnect ping failed");
                Ok(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AgentRegistration, MemStore};
    use crate::stream::BackendFrame;
    use tokio::sync::mpsc;

    async fn fixtures() -> (HealthChecker, Arc<MemStore>, Arc<StreamManager>, Uuid) {
        let store = Arc::new(MemStore::new());
        let streams = Arc::new(StreamManager::new());
        let agent_id = store
            .upsert_agent(AgentRegistration {
                org_id: Uuid::new_v4(),
                host: "dev-box".to_string(),
                port: 50051,
                ip: None,
            })
            .await
            .expect("upsert")
            .agent
            .id;
        let config = OrchestratorConfig {
            ping_timeout: std::time::Duration::from_millis(50),
            reconnect_timeout: std::time::Duration::from_millis(50),
            ..Default::default()
        };
        let checker = HealthChecker::new(store.clone(), streams.clone(), config);
        (checker, store, streams, agent_id)
    }

    /// Spawns a fake agent that answers every ping with a heartbeat.
    fn answer_pings(
        streams: &StreamManager,
        agent_id: Uuid,
    ) -> impl std::future::Future<Output = tokio::task::JoinHandle<()>> + '_ {
        async move {
            let (tx, mut rx) = mpsc::channel(8);
            let session = streams.register(agent_id, Uuid::new_v4(), tx).await;
            tokio::spawn(async move {
                while let Some(frame) = rx.recv().await {
                    if matches!(frame, BackendFrame::HealthCheckPing { .. }) {
                        session.note_heartbeat();
                    }
                }
            })
        }
    }

    #[tokio::test]
    async fn test_check_success_resets_counter() {
        let (checker, store, streams, agent_id) = fixtures().await;
        let _responder = answer_pings(&streams, agent_id).await;

        // Seed a prior failure.
        store.record_ping_failure(agent_id, 3).await.expect("failure");

        let outcome = checker.check(agent_id).await.expect("check");
        assert!(outcome.success);

        let agent = store.get_agent(agent_id).await.expect("get").expect("agent");
        assert_eq!(agent.consecutive_failures, 0);
        assert_eq!(agent.status, AgentStatus::Active);
    }

    #[tokio::test]
    async fn test_three_misses_flip_offline_once() {
        let (checker, store, _streams, agent_id) = fixtures().await;
        // No stream session at all: every ping fails immediately.

        let first = checker.check(agent_id).await.expect("check");
        let second = checker.check(agent_id).await.expect("check");
        let third = checker.check(agent_id).await.expect("check");

        assert!(!first.went_offline);
        assert!(!second.went_offline);
        assert!(third.went_offline);

        let agent = store.get_agent(agent_id).await.expect("get").expect("agent");
        assert_eq!(agent.status, AgentStatus::Offline);

        // Offline agents are skipped, not re-counted.
        let fourth = checker.check(agent_id).await.expect("check");
        assert!(!fourth.success);
        assert!(!fourth.went_offline);
    }

    #[tokio::test]
    async fn test_reconnect_revives_offline_agent() {
        let (checker, store, streams, agent_id) = fixtures().await;

        for _ in 0..3 {
            checker.check(agent_id).await.expect("check");
        }
        assert_eq!(
            store
                .get_agent(agent_id)
                .await
                .expect("get")
                .expect("agent")
                .status,
            AgentStatus::Offline
        );

        let _responder = answer_pings(&streams, agent_id).await;
        let revived = checker.reconnect(agent_id).await.expect("reconnect");
        assert!(revived);

        let agent = store.get_agent(agent_id).await.expect("get").expect("agent");
        assert_eq!(agent.status, AgentStatus::Active);
        assert_eq!(agent.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_reconnect_without_stream_reports_failure() {
        let (checker, _store, _streams, agent_id) = fixtures().await;
        let revived = checker.reconnect(agent_id).await.expect("reconnect");
        assert!(!revived);
    }
}
