//! HTTP implementation of the agent RPC client.
//!
//! Calls the agent's endpoints with JSON bodies; `execute_job` consumes a
//! newline-delimited JSON response stream, one [`LogMessage`] per line.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use uuid::Uuid;

use crate::model::Agent;

use super::{
    AgentClient, AgentClientError, CreatePrRequest, ExecuteJobRequest, LogMessage, LogStream,
    PrOutcome, VerificationOutcome,
};

/// Connect timeout for agent requests.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for unary (non-streaming) agent requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Reqwest-based [`AgentClient`].
pub struct HttpAgentClient {
    /// Client for unary calls, bounded by `REQUEST_TIMEOUT`.
    client: reqwest::Client,
    /// Client for the execute stream; no overall timeout, the activity
    /// heartbeat bounds silence instead.
    streaming_client: reqwest::Client,
}

impl Default for HttpAgentClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpAgentClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client construction cannot fail with static options");
        let streaming_client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            client,
            streaming_client,
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, AgentClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            Err(AgentClientError::RequestFailed(format!(
                "{}: {}",
                status, body
            )))
        } else {
            Err(AgentClientError::Rejected(format!("{}: {}", status, body)))
        }
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn execute_job(
        &self,
        agent: &Agent,
        request: ExecuteJobRequest,
    ) -> Result<LogStream, AgentClientError> {
        let url = format!("{}/jobs/execute", agent.rpc_url());
        let response = self
            .streaming_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| AgentClientError::RequestFailed(e.to_string()))?;
        let response = Self::check_status(response).await?;

        Ok(decode_log_stream(Box::pin(response.bytes_stream())))
    }

    async fn cancel_job(&self, agent: &Agent, job_id: Uuid) -> Result<(), AgentClientError> {
        let url = format!("{}/jobs/{}/cancel", agent.rpc_url(), job_id);
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| AgentClientError::RequestFailed(e.to_string()))?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn run_verification(
        &self,
        agent: &Agent,
        job_id: Uuid,
    ) -> Result<VerificationOutcome, AgentClientError> {
        let url = format!("{}/jobs/{}/verify", agent.rpc_url(), job_id);
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| AgentClientError::RequestFailed(e.to_string()))?;
        let response = Self::check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| AgentClientError::MalformedFrame(e.to_string()))
    }

    async fn create_pr(
        &self,
        agent: &Agent,
        request: CreatePrRequest,
    ) -> Result<PrOutcome, AgentClientError> {
        let url = format!("{}/prs", agent.rpc_url());
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| AgentClientError::RequestFailed(e.to_string()))?;
        let response = Self::check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| AgentClientError::MalformedFrame(e.to_string()))
    }

    async fn cleanup_workspace(
        &self,
        agent: &Agent,
        job_id: Uuid,
    ) -> Result<(), AgentClientError> {
        let url = format!("{}/jobs/{}/cleanup", agent.rpc_url(), job_id);
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| AgentClientError::RequestFailed(e.to_string()))?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn health_check(&self, agent: &Agent) -> Result<(), AgentClientError> {
        let url = format!("{}/health", agent.rpc_url());
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| AgentClientError::RequestFailed(e.to_string()))?;
        Self::check_status(response).await?;
        Ok(())
    }
}

struct DecodeState<S> {
    inner: S,
    buffer: Vec<u8>,
    done: bool,
}

/// Turns a byte stream of newline-delimited JSON into a [`LogStream`].
fn decode_log_stream<S>(inner: S) -> LogStream
where
    S: futures::Stream<Item = reqwest::Result<bytes::Bytes>> + Send + Unpin + 'static,
{
    let state = DecodeState {
        inner,
        buffer: Vec::new(),
        done: false,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            // Emit every complete line currently buffered.
            if let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = state.buffer.drain(..=pos).collect();
                match parse_line(&line) {
                    Some(item) => return Some((item, state)),
                    None => continue,
                }
            }

            if state.done {
                // Flush a trailing line without a terminator.
                if state.buffer.is_empty() {
                    return None;
                }
                let line = std::mem::take(&mut state.buffer);
                match parse_line(&line) {
                    Some(item) => return Some((item, state)),
                    None => return None,
                }
            }

            match state.inner.next().await {
                Some(Ok(chunk)) => state.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    state.done = true;
                    state.buffer.clear();
                    return Some((
                        Err(AgentClientError::RequestFailed(e.to_string())),
                        state,
                    ));
                }
                None => state.done = true,
            }
        }
    }))
}

fn parse_line(line: &[u8]) -> Option<Result<LogMessage, AgentClientError>> {
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(
        serde_json::from_str::<LogMessage>(trimmed)
            .map_err(|e| AgentClientError::MalformedFrame(e.to_string())),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LogLevel;
    use chrono::Utc;
    use futures::stream;

    fn line(message: &str) -> String {
        serde_json::to_string(&LogMessage {
            job_id: Uuid::new_v4(),
            level: LogLevel::Info,
            timestamp: Utc::now(),
            message: message.to_string(),
            stage: None,
        })
        .expect("serialize")
    }

    #[tokio::test]
    async fn test_decode_splits_lines_across_chunks() {
        let payload = format!("{}\n{}\n", line("first"), line("second"));
        let (a, b) = payload.split_at(payload.len() / 2);
        let chunks = vec![
            Ok(bytes::Bytes::copy_from_slice(a.as_bytes())),
            Ok(bytes::Bytes::copy_from_slice(b.as_bytes())),
        ];

        let mut stream = decode_log_stream(stream::iter(chunks));
        let first = stream.next().await.expect("item").expect("ok");
        let second = stream.next().await.expect("item").expect("ok");
        assert_eq!(first.message, "first");
        assert_eq!(second.message, "second");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_decode_flushes_unterminated_tail() {
        let payload = line("tail");
        let chunks = vec![Ok(bytes::Bytes::copy_from_slice(payload.as_bytes()))];

        let mut stream = decode_log_stream(stream::iter(chunks));
        let only = stream.next().await.expect("item").expect("ok");
        assert_eq!(only.message, "tail");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_decode_surfaces_malformed_lines() {
        let chunks = vec![Ok(bytes::Bytes::from_static(b"not json\n"))];

        let mut stream = decode_log_stream(stream::iter(chunks));
        let err = stream.next().await.expect("item").unwrap_err();
        assert!(matches!(err, AgentClientError::MalformedFrame(_)));
    }

    #[tokio::test]
    async fn test_decode_skips_blank_lines() {
        let payload = format!("\n\n{}\n\n", line("only"));
        let chunks = vec![Ok(bytes::Bytes::copy_from_slice(payload.as_bytes()))];

        let mut stream = decode_log_stream(stream::iter(chunks));
        let only = stream.next().await.expect("item").expect("ok");
        assert_eq!(only.message, "only");
        assert!(stream.next().await.is_none());
    }
}
