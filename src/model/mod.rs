//! Core data model: jobs, agents, activities, and log entries.

pub mod activity;
pub mod agent;
pub mod job;
pub mod log;

pub use activity::{Activity, ActivityReadStatus, ReadStatus};
pub use agent::{Agent, AgentStatus, ScheduleBinding};
pub use job::{
    AcceptanceStatus, Job, JobStatus, Priority, QueueType, UserInput, UNQUEUED_POSITION,
};
pub use log::{JobLogEntry, LogLevel};
