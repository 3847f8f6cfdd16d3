//! Shared error types for registration, job transitions, and dispatch.
//!
//! Module-local errors (`StoreError`, `StreamError`, `AgentClientError`,
//! `EngineError`) live next to the code that raises them; the enums here
//! cross subsystem boundaries.

use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

/// Errors raised during agent registration.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The presented API key matched no organization.
    #[error("Invalid credentials")]
    InvalidCredentials,

    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised by the orchestrated job update (`PUT /jobs/:id`) and its
/// siblings.
#[derive(Debug, Error)]
pub enum TransitionError {
    /// Job not found (latest version) for the caller's org.
    #[error("Job {0} not found")]
    JobNotFound(Uuid),

    /// The requested transition is not allowed through this surface.
    #[error("Invalid transition from '{from}' to '{to}': {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    /// The operation requires the job to be queued.
    #[error("Job {0} is not queued")]
    NotQueued(Uuid),

    /// The job is already archived.
    #[error("Job {0} is already archived")]
    AlreadyArchived(Uuid),

    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors raised while driving dispatch and job execution.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Agent {0} not found")]
    AgentNotFound(Uuid),

    #[error("Job {0} not found")]
    JobNotFound(Uuid),

    /// A child workflow with the same deterministic id is already running.
    #[error("Workflow '{0}' already started")]
    AlreadyStarted(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Extracts the innermost cause string from a chain of wrapped failures.
///
/// Engine and client layers wrap causes ("activity failed: request failed:
/// connection refused"); the job's `updates` line carries only the root.
pub fn innermost_cause(error: &dyn std::error::Error) -> String {
    let mut current = error;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("outer: {source}")]
    struct Outer {
        source: Inner,
    }

    #[derive(Debug, Error)]
    #[error("inner: {source}")]
    struct Inner {
        source: std::io::Error,
    }

    #[test]
    fn test_innermost_cause_unwraps_chain() {
        let error = Outer {
            source: Inner {
                source: std::io::Error::new(std::io::ErrorKind::Other, "connection refused"),
            },
        };
        assert_eq!(innermost_cause(&error), "connection refused");
    }

    #[test]
    fn test_innermost_cause_of_leaf_is_itself() {
        let error = std::io::Error::new(std::io::ErrorKind::Other, "plain failure");
        assert_eq!(innermost_cause(&error), "plain failure");
    }
}
