//! Per-agent stream sessions.
//!
//! A session owns the outbound half of one agent connection. Writes are
//! serialized by an async mutex around the channel sender; the inbound half
//! stays with the connection handler. The lifecycle is an explicit state
//! machine: a fresh connection is `Unbound` until its `INIT` frame arrives,
//! `Bound` while serving traffic, and `Closing`/`Closed` during teardown.

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch, Mutex};
use uuid::Uuid;

use super::frames::BackendFrame;
use super::StreamError;

/// Lifecycle of a stream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, awaiting the `INIT` frame.
    Unbound,
    /// Bound to an agent and serving traffic.
    Bound,
    /// Teardown requested; outbound drains, no new writes accepted.
    Closing,
    /// Fully torn down.
    Closed,
}

/// The outbound half of one agent's stream connection.
pub struct StreamSession {
    pub agent_id: Uuid,
    pub org_id: Uuid,
    pub connected_at: DateTime<Utc>,
    /// Serializes outbound frames onto the connection.
    outbound: Mutex<Option<mpsc::Sender<BackendFrame>>>,
    state: watch::Sender<SessionState>,
    /// Bumped on every inbound `HEARTBEAT`; ping waiters watch for changes.
    heartbeats: watch::Sender<u64>,
}

impl StreamSession {
    /// Creates a bound session around an outbound channel.
    pub fn new(agent_id: Uuid, org_id: Uuid, outbound: mpsc::Sender<BackendFrame>) -> Self {
        let (state, _) = watch::channel(SessionState::Bound);
        let (heartbeats, _) = watch::channel(0);
        Self {
            agent_id,
            org_id,
            connected_at: Utc::now(),
            outbound: Mutex::new(Some(outbound)),
            state,
            heartbeats,
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Writes one frame under the session write lock.
    pub async fn write(&self, frame: BackendFrame) -> Result<(), StreamError> {
        let guard = self.outbound.lock().await;
        let sender = guard
            .as_ref()
            .ok_or(StreamError::SessionClosed(self.agent_id))?;
        sender
            .send(frame)
            .await
            .map_err(|_| StreamError::SessionClosed(self.agent_id))
    }

    /// Records an inbound `HEARTBEAT` and wakes any ping waiters.
    pub fn note_heartbeat(&self) {
        self.heartbeats.send_modify(|count| *count += 1);
    }

    /// A receiver positioned at the current heartbeat count; any subsequent
    /// heartbeat shows up as a change.
    pub fn heartbeat_watch(&self) -> watch::Receiver<u64> {
        self.heartbeats.subscribe()
    }

    /// Drains outbound and closes. Safe to call more than once.
    pub async fn close(&self) {
        let _ = self.state.send(SessionState::Closing);
        let mut guard = self.outbound.lock().await;
        guard.take();
        let _ = self.state.send(SessionState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> (StreamSession, mpsc::Receiver<BackendFrame>) {
        let (tx, rx) = mpsc::channel(8);
        (StreamSession::new(Uuid::new_v4(), Uuid::new_v4(), tx), rx)
    }

    #[tokio::test]
    async fn test_write_delivers_frame() {
        let (session, mut rx) = session();
        session
            .write(BackendFrame::HealthCheckPing { nonce: 1 })
            .await
            .expect("write");

        let frame = rx.recv().await.expect("frame delivered");
        assert_eq!(frame, BackendFrame::HealthCheckPing { nonce: 1 });
    }

    #[tokio::test]
    async fn test_write_after_close_errors() {
        let (session, _rx) = session();
        assert_eq!(session.state(), SessionState::Bound);

        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);

        let err = session
            .write(BackendFrame::HealthCheckPing { nonce: 2 })
            .await
            .unwrap_err();
        assert!(matches!(err, StreamError::SessionClosed(_)));
    }

    #[tokio::test]
    async fn test_heartbeat_wakes_watcher() {
        let (session, _rx) = session();
        let mut watch = session.heartbeat_watch();

        session.note_heartbeat();

        tokio::time::timeout(std::time::Duration::from_secs(1), watch.changed())
            .await
            .expect("no timeout")
            .expect("sender alive");
        assert_eq!(*watch.borrow(), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (session, _rx) = session();
        session.close().await;
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
    }
}
