//! Orchestrator configuration.
//!
//! Plain struct with environment-variable overrides. Defaults match the
//! production cadences: dispatch fires per agent every minute, health
//! checks every 30 seconds, and an in-progress job with no update for five
//! minutes is treated as orphaned.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the dispatch and resilience engine.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    // Surfaces
    /// Listen address for the REST and agent-stream server.
    pub listen_addr: String,
    /// PostgreSQL database connection URL.
    pub database_url: String,

    // Cadences
    /// Interval between dispatch-workflow firings per agent.
    pub dispatch_interval: Duration,
    /// Interval between health-check firings per agent.
    pub health_check_interval: Duration,

    // Liveness
    /// In-progress jobs untouched for longer than this are orphans.
    pub orphan_staleness: Duration,
    /// How long a scheduled ping waits for its heartbeat ack.
    pub ping_timeout: Duration,
    /// How long the user-initiated reconnect ping waits.
    pub reconnect_timeout: Duration,
    /// Consecutive ping failures before an agent goes offline.
    pub offline_threshold: u32,

    // Activities
    /// Timeout for one preprocess activity attempt.
    pub preprocess_timeout: Duration,
    /// Heartbeat timeout for the streaming execute activity: silence longer
    /// than this cancels the attempt.
    pub execute_heartbeat_timeout: Duration,
    /// Overall deadline for one job-execution workflow run.
    pub execution_run_timeout: Duration,
    /// First retry delay for failed activities.
    pub retry_initial_interval: Duration,
    /// Ceiling for the exponential retry delay.
    pub retry_max_interval: Duration,
    /// Attempts per activity before the failure is surfaced.
    pub retry_max_attempts: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            database_url: "postgres://localhost/jobforge".to_string(),

            dispatch_interval: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(30),

            orphan_staleness: Duration::from_secs(300),
            ping_timeout: Duration::from_secs(5),
            reconnect_timeout: Duration::from_secs(10),
            offline_threshold: 3,

            preprocess_timeout: Duration::from_secs(60),
            execute_heartbeat_timeout: Duration::from_secs(300),
            execution_run_timeout: Duration::from_secs(3600),
            retry_initial_interval: Duration::from_secs(1),
            retry_max_interval: Duration::from_secs(30),
            retry_max_attempts: 3,
        }
    }
}

impl OrchestratorConfig {
    /// Creates a configuration from defaults plus environment overrides.
    ///
    /// Recognized variables: `JOBFORGE_LISTEN_ADDR`, `DATABASE_URL`,
    /// `JOBFORGE_DISPATCH_INTERVAL_SECS`, `JOBFORGE_HEALTH_INTERVAL_SECS`,
    /// `JOBFORGE_ORPHAN_STALENESS_SECS`, `JOBFORGE_OFFLINE_THRESHOLD`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("JOBFORGE_LISTEN_ADDR") {
            config.listen_addr = addr;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }
        if let Some(secs) = read_secs("JOBFORGE_DISPATCH_INTERVAL_SECS")? {
            config.dispatch_interval = secs;
        }
        if let Some(secs) = read_secs("JOBFORGE_HEALTH_INTERVAL_SECS")? {
            config.health_check_interval = secs;
        }
        if let Some(secs) = read_secs("JOBFORGE_ORPHAN_STALENESS_SECS")? {
            config.orphan_staleness = secs;
        }
        if let Ok(value) = std::env::var("JOBFORGE_OFFLINE_THRESHOLD") {
            config.offline_threshold =
                value.parse().map_err(|_| ConfigError::InvalidValue {
                    key: "JOBFORGE_OFFLINE_THRESHOLD".to_string(),
                    message: format!("'{}' is not a number", value),
                })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.offline_threshold == 0 {
            return Err(ConfigError::ValidationFailed(
                "offline_threshold must be at least 1".to_string(),
            ));
        }
        if self.retry_max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "retry_max_attempts must be at least 1".to_string(),
            ));
        }
        if self.orphan_staleness < self.dispatch_interval {
            return Err(ConfigError::ValidationFailed(
                "orphan_staleness must not be shorter than dispatch_interval".to_string(),
            ));
        }
        Ok(())
    }
}

fn read_secs(key: &str) -> Result<Option<Duration>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => {
            let secs: u64 = value.parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("'{}' is not a number of seconds", value),
            })?;
            Ok(Some(Duration::from_secs(secs)))
        }
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_production_cadences() {
        let config = OrchestratorConfig::default();

        assert_eq!(config.dispatch_interval, Duration::from_secs(60));
        assert_eq!(config.health_check_interval, Duration::from_secs(30));
        assert_eq!(config.orphan_staleness, Duration::from_secs(300));
        assert_eq!(config.ping_timeout, Duration::from_secs(5));
        assert_eq!(config.reconnect_timeout, Duration::from_secs(10));
        assert_eq!(config.offline_threshold, 3);
        assert_eq!(config.execute_heartbeat_timeout, Duration::from_secs(300));
        assert_eq!(config.retry_max_attempts, 3);
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let config = OrchestratorConfig {
            offline_threshold: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_staleness_below_dispatch_interval() {
        let config = OrchestratorConfig {
            orphan_staleness: Duration::from_secs(10),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
