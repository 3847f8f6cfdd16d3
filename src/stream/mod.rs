//! Agent stream manager.
//!
//! A process-local registry of live agent connections: a sharded concurrent
//! map `agent_id → StreamSession`. Sessions exist only for the lifetime of
//! the underlying connection; on process restart agents must reconnect.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

pub mod frames;
pub mod notifier;
pub mod session;

pub use frames::{AgentFrame, BackendFrame, FrameError};
pub use notifier::LogNotifier;
pub use session::{SessionState, StreamSession};

const SHARD_COUNT: usize = 8;

/// Errors raised by stream operations.
#[derive(Debug, Error)]
pub enum StreamError {
    /// No live session for the agent.
    #[error("Agent {0} has no live stream")]
    NotConnected(Uuid),

    /// The session's outbound channel is closed.
    #[error("Stream session for agent {0} is closed")]
    SessionClosed(Uuid),

    /// A ping was sent but no heartbeat arrived within the deadline.
    #[error("Ping to agent {0} timed out")]
    PingTimeout(Uuid),

    /// Frame codec failure.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Sharded registry of live agent sessions.
pub struct StreamManager {
    shards: Vec<RwLock<HashMap<Uuid, Arc<StreamSession>>>>,
}

impl Default for StreamManager {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamManager {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, agent_id: Uuid) -> &RwLock<HashMap<Uuid, Arc<StreamSession>>> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        agent_id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Registers a freshly bound session. A prior session for the same
    /// agent is closed: the newest connection wins.
    pub async fn register(
        &self,
        agent_id: Uuid,
        org_id: Uuid,
        outbound: mpsc::Sender<BackendFrame>,
    ) -> Arc<StreamSession> {
        let session = Arc::new(StreamSession::new(agent_id, org_id, outbound));
        let prior = {
            let mut shard = self.shard(agent_id).write().await;
            shard.insert(agent_id, Arc::clone(&session))
        };
        if let Some(prior) = prior {
            tracing::debug!(agent_id = %agent_id, "Replacing existing stream session");
            prior.close().await;
        }
        session
    }

    /// Removes and closes the agent's session. Only removes `session` itself,
    /// so a stale disconnect cannot evict a newer connection.
    pub async fn unregister(&self, agent_id: Uuid, session: &Arc<StreamSession>) {
        let removed = {
            let mut shard = self.shard(agent_id).write().await;
            match shard.get(&agent_id) {
                Some(current) if Arc::ptr_eq(current, session) => shard.remove(&agent_id),
                _ => None,
            }
        };
        if let Some(removed) = removed {
            removed.close().await;
        }
    }

    /// The live session for an agent, if any.
    pub async fn get(&self, agent_id: Uuid) -> Option<Arc<StreamSession>> {
        let shard = self.shard(agent_id).read().await;
        shard.get(&agent_id).cloned()
    }

    /// Writes one frame to the agent's stream.
    pub async fn write(&self, agent_id: Uuid, frame: BackendFrame) -> Result<(), StreamError> {
        let session = self
            .get(agent_id)
            .await
            .ok_or(StreamError::NotConnected(agent_id))?;
        session.write(frame).await
    }

    /// Sends a `HEALTH_CHECK_PING` and waits for a heartbeat that arrives
    /// after the ping was written.
    pub async fn ping(&self, agent_id: Uuid, timeout: Duration) -> Result<(), StreamError> {
        let session = self
            .get(agent_id)
            .await
            .ok_or(StreamError::NotConnected(agent_id))?;

        let mut heartbeats = session.heartbeat_watch();
        let nonce = rand::random();
        session
            .write(BackendFrame::HealthCheckPing { nonce })
            .await?;

        match tokio::time::timeout(timeout, heartbeats.changed()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(StreamError::SessionClosed(agent_id)),
            Err(_) => Err(StreamError::PingTimeout(agent_id)),
        }
    }

    /// Number of live sessions.
    pub async fn connected_count(&self) -> usize {
        let mut count = 0;
        for shard in &self.shards {
            count += shard.read().await.len();
        }
        count
    }
}
