//! Prometheus metrics registration and export.

use prometheus::{
    CounterVec, Encoder, Gauge, IntCounter, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

use crate::model::QueueType;

/// Global Prometheus registry for all jobforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total jobs claimed for dispatch, labeled by queue.
pub static JOBS_CLAIMED: OnceLock<CounterVec> = OnceLock::new();

/// Total job executions finished, labeled by outcome.
pub static EXECUTIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Total orphaned jobs returned to their queues.
pub static ORPHANS_RECOVERED: OnceLock<IntCounter> = OnceLock::new();

/// Total health-check pings that went unanswered.
pub static PING_FAILURES: OnceLock<IntCounter> = OnceLock::new();

/// Total log frames ingested from agent streams.
pub static LOG_FRAMES: OnceLock<IntCounter> = OnceLock::new();

/// Number of agents with a live stream session.
pub static AGENTS_CONNECTED: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Called once at startup; later calls are no-ops for already-set cells.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let jobs_claimed = CounterVec::new(
        Opts::new("jobforge_jobs_claimed_total", "Jobs claimed for dispatch"),
        &["queue"],
    )?;
    let executions_total = CounterVec::new(
        Opts::new("jobforge_executions_total", "Job executions finished"),
        &["outcome"],
    )?;
    let orphans_recovered = IntCounter::new(
        "jobforge_orphans_recovered_total",
        "Orphaned jobs returned to their queues",
    )?;
    let ping_failures = IntCounter::new(
        "jobforge_ping_failures_total",
        "Health-check pings that went unanswered",
    )?;
    let log_frames = IntCounter::new(
        "jobforge_log_frames_total",
        "Log frames ingested from agent streams",
    )?;
    let agents_connected = Gauge::new(
        "jobforge_agents_connected",
        "Agents with a live stream session",
    )?;

    registry.register(Box::new(jobs_claimed.clone()))?;
    registry.register(Box::new(executions_total.clone()))?;
    registry.register(Box::new(orphans_recovered.clone()))?;
    registry.register(Box::new(ping_failures.clone()))?;
    registry.register(Box::new(log_frames.clone()))?;
    registry.register(Box::new(agents_connected.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = JOBS_CLAIMED.set(jobs_claimed);
    let _ = EXECUTIONS_TOTAL.set(executions_total);
    let _ = ORPHANS_RECOVERED.set(orphans_recovered);
    let _ = PING_FAILURES.set(ping_failures);
    let _ = LOG_FRAMES.set(log_frames);
    let _ = AGENTS_CONNECTED.set(agents_connected);

    Ok(())
}

/// Records a claim. No-op when metrics are uninitialized (tests).
pub fn job_claimed(queue: QueueType) {
    if let Some(counter) = JOBS_CLAIMED.get() {
        counter.with_label_values(&[&queue.to_string()]).inc();
    }
}

/// Records a finished execution by outcome label.
pub fn execution_finished(outcome: &str) {
    if let Some(counter) = EXECUTIONS_TOTAL.get() {
        counter.with_label_values(&[outcome]).inc();
    }
}

/// Records recovered orphans.
pub fn orphans_recovered(count: u64) {
    if let Some(counter) = ORPHANS_RECOVERED.get() {
        counter.inc_by(count);
    }
}

/// Records an unanswered ping.
pub fn ping_failed() {
    if let Some(counter) = PING_FAILURES.get() {
        counter.inc();
    }
}

/// Records one ingested log frame.
pub fn log_frame_ingested() {
    if let Some(counter) = LOG_FRAMES.get() {
        counter.inc();
    }
}

/// Updates the connected-agents gauge.
pub fn agents_connected(count: usize) {
    if let Some(gauge) = AGENTS_CONNECTED.get() {
        gauge.set(count as f64);
    }
}

/// Exports all metrics in the Prometheus text format.
pub fn gather_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return String::new();
    };
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&registry.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_and_gather() {
        init_metrics().expect("init");
        // Second init is harmless.
        init_metrics().expect("re-init");

        job_claimed(QueueType::Rework);
        execution_finished("completed");
        orphans_recovered(2);
        ping_failed();
        log_frame_ingested();
        agents_connected(3);

        let text = gather_metrics();
        assert!(text.contains("jobforge_jobs_claimed_total"));
        assert!(text.contains("jobforge_orphans_recovered_total"));
        assert!(text.contains("jobforge_agents_connected"));
    }
}
