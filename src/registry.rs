//! Agent registry: API-key validation and registration upserts.
//!
//! Registration is two steps with different failure semantics: the
//! credential check and agent upsert are transactional and fatal on error;
//! the schedule hook that follows is best-effort and retried on the next
//! reconnect.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::Schedules;
use crate::error::RegistryError;
use crate::model::{AgentStatus, ScheduleBinding};
use crate::store::{AgentRegistration, JobStore};

/// Outcome of a successful registration.
#[derive(Debug, Clone)]
pub struct Registered {
    pub agent_id: Uuid,
    pub org_id: Uuid,
    pub created: bool,
}

/// Validates API keys and upserts agent records.
pub struct AgentRegistry {
    store: Arc<dyn JobStore>,
    schedules: Arc<dyn Schedules>,
}

impl AgentRegistry {
    pub fn new(store: Arc<dyn JobStore>, schedules: Arc<dyn Schedules>) -> Self {
        Self { store, schedules }
    }

    /// Registers (or re-registers) an agent.
    ///
    /// Looks up the hashed API key, upserts on `(org_id, host)` marking the
    /// agent active, then — outside the transaction — asks the engine to
    /// create or unpause the agent's schedules if it was not already active.
    pub async fn register(
        &self,
        api_key: &str,
        hostname: &str,
        ip: Option<String>,
        port: u16,
    ) -> Result<Registered, RegistryError> {
        let org_id = self
            .store
            .org_for_api_key(&hash_secret(api_key))
            .await?
            .ok_or(RegistryError::InvalidCredentials)?;

        let outcome = self
            .store
            .upsert_agent(AgentRegistration {
                org_id,
                host: hostname.to_string(),
                port,
                ip,
            })
            .await?;

        info!(
            agent_id = %outcome.agent.id,
            org_id = %org_id,
            host = hostname,
            created = outcome.created,
            prior_status = %outcome.prior_status,
            "Agent registered"
        );

        if outcome.prior_status != AgentStatus::Active {
            self.activate_schedules(outcome.agent.id).await;
        }

        Ok(Registered {
            agent_id: outcome.agent.id,
            org_id,
            created: outcome.created,
        })
    }

    /// Best-effort schedule creation/unpause. Failure never fails the
    /// registration; the next reconnect retries.
    async fn activate_schedules(&self, agent_id: Uuid) {
        if let Err(e) = self.schedules.ensure_agent_schedules(agent_id).await {
            warn!(agent_id = %agent_id, error = %e, "Failed to activate agent schedules");
            return;
        }
        if let Err(e) = self.schedules.resume_agent_schedules(agent_id).await {
            warn!(agent_id = %agent_id, error = %e, "Failed to resume agent schedules");
            return;
        }
        let binding = ScheduleBinding::for_agent(agent_id);
        if let Err(e) = self.store.set_schedule_binding(&binding).await {
            warn!(agent_id = %agent_id, error = %e, "Failed to persist schedule binding");
        }
    }
}

/// Hex-encoded SHA-256 of a credential. Both agent API keys and user bearer
/// tokens are stored hashed.
pub fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}
