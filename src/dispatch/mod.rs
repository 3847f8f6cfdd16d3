//! Dispatch and resilience: the preprocess step, the per-agent dispatch
//! and health-check workflows, the job-execution workflow, and the
//! user-driven transition rules.

pub mod execution;
pub mod health;
pub mod preprocess;
pub mod transitions;
pub mod workflow;

pub use execution::{ExecutionOutcome, JobExecutor};
pub use health::{HealthChecker, HealthOutcome};
pub use preprocess::{preprocess, PreprocessOutcome};
pub use transitions::{
    apply_job_update, archive, create_job, prepare_manual_execute, reprioritize, JobUpdate,
};
pub use workflow::{DispatchResult, Dispatcher};
