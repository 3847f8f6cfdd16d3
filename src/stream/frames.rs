//! Wire frames for the bidirectional agent stream.
//!
//! Frames are tagged JSON: a `kind` discriminant plus per-kind payload
//! fields, so decoding never loses type information and new kinds extend
//! the enum without touching existing ones.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{LogLevel, QueueType};

/// Frames the agent sends to the backend.
///
/// The first frame on a fresh stream must be `Init`; everything else is
/// rejected until the session is bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentFrame {
    /// Binds the stream to an agent.
    Init { agent_id: Uuid },
    /// Liveness signal; also acknowledges an outstanding ping.
    Heartbeat,
    /// One structured log line for a running job.
    LogMessage {
        job_id: Uuid,
        level: LogLevel,
        timestamp: DateTime<Utc>,
        message: String,
        #[serde(default)]
        stage: Option<String>,
    },
}

/// Frames the backend sends to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackendFrame {
    /// Liveness probe; the agent answers with a `Heartbeat`.
    HealthCheckPing { nonce: u64 },
    /// Notifies the agent that a job has been assigned to it.
    TaskAssignment { job_id: Uuid, queue_type: QueueType },
}

/// Errors raised by the frame codec.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("Frame decode failed: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Protocol violation: {0}")]
    Protocol(String),
}

/// Decodes one inbound frame from its wire text.
pub fn decode_agent_frame(text: &str) -> Result<AgentFrame, FrameError> {
    Ok(serde_json::from_str(text)?)
}

/// Encodes one outbound frame to wire text.
pub fn encode_backend_frame(frame: &BackendFrame) -> Result<String, FrameError> {
    Ok(serde_json::to_string(frame)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_kind_tags_are_screaming_snake() {
        let init = serde_json::to_value(AgentFrame::Init {
            agent_id: Uuid::new_v4(),
        })
        .expect("serialize");
        assert_eq!(init["kind"], "INIT");

        let heartbeat = serde_json::to_value(AgentFrame::Heartbeat).expect("serialize");
        assert_eq!(heartbeat["kind"], "HEARTBEAT");

        let ping = serde_json::to_value(BackendFrame::HealthCheckPing { nonce: 7 })
            .expect("serialize");
        assert_eq!(ping["kind"], "HEALTH_CHECK_PING");

        let assign = serde_json::to_value(BackendFrame::TaskAssignment {
            job_id: Uuid::new_v4(),
            queue_type: QueueType::Backlog,
        })
        .expect("serialize");
        assert_eq!(assign["kind"], "TASK_ASSIGNMENT");
    }

    #[test]
    fn test_log_message_roundtrip() {
        let frame = AgentFrame::LogMessage {
            job_id: Uuid::new_v4(),
            level: LogLevel::Info,
            timestamp: Utc::now(),
            message: "compiling crate".to_string(),
            stage: Some("execute".to_string()),
        };

        let wire = serde_json::to_string(&frame).expect("encode");
        let decoded = decode_agent_frame(&wire).expect("decode");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_log_message_stage_is_optional() {
        let job_id = Uuid::new_v4();
        let wire = format!(
            r#"{{"kind":"LOG_MESSAGE","job_id":"{}","level":"warn","timestamp":"2026-01-01T00:00:00Z","message":"hi"}}"#,
            job_id
        );
        let decoded = decode_agent_frame(&wire).expect("decode");
        match decoded {
            AgentFrame::LogMessage { stage, level, .. } => {
                assert!(stage.is_none());
                assert_eq!(level, LogLevel::Warn);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        assert!(decode_agent_frame(r#"{"kind":"SHRUG"}"#).is_err());
    }
}
