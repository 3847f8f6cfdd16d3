//! In-process workflow engine.
//!
//! Per agent, two tokio interval loops: the dispatch schedule and the
//! health-check schedule, each with a pause flag. A health check that
//! pushes the agent over the offline threshold pauses both loops; resuming
//! happens through [`Schedules::resume_agent_schedules`] (registration and
//! the reconnect endpoint).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::dispatch::{Dispatcher, HealthChecker};

use super::{EngineError, Schedules};

struct AgentSchedules {
    dispatch_paused: Arc<AtomicBool>,
    health_paused: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

/// Tokio-based schedule runner.
pub struct LocalEngine {
    dispatcher: Arc<Dispatcher>,
    health: Arc<HealthChecker>,
    config: OrchestratorConfig,
    agents: Mutex<HashMap<Uuid, AgentSchedules>>,
    shutdown: broadcast::Sender<()>,
}

impl LocalEngine {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        health: Arc<HealthChecker>,
        config: OrchestratorConfig,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            dispatcher,
            health,
            config,
            agents: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Stops every schedule loop and cancels in-flight executions.
    pub async fn shutdown(&self) {
        info!("Shutting down schedule loops");
        let _ = self.shutdown.send(());
        self.dispatcher.cancel_all();
        let mut agents = self.agents.lock().await;
        for (_, schedules) in agents.drain() {
            for handle in schedules.handles {
                handle.abort();
            }
        }
    }

    fn spawn_dispatch_loop(&self, agent_id: Uuid, paused: Arc<AtomicBool>) -> JoinHandle<()> {
        let dispatcher = Arc::clone(&self.dispatcher);
        let interval = self.config.dispatch_interval;
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.recv() => {
                        debug!(agent_id = %agent_id, "Dispatch loop stopping");
                        return;
                    }
                }
                if paused.load(Ordering::SeqCst) {
                    continue;
                }
                // One firing at a time per agent: the loop awaits the whole
                // firing, child workflow included.
                let result = dispatcher.run_once(agent_id).await;
                if result.processed {
                    debug!(agent_id = %agent_id, job_id = ?result.job_id, "Dispatch firing processed a job");
                }
            }
        })
    }

    fn spawn_health_loop(
        &self,
        agent_id: Uuid,
        dispatch_paused: Arc<AtomicBool>,
        health_paused: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let health = Arc::clone(&self.health);
        let interval = self.config.health_check_interval;
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.recv() => {
                        debug!(agent_id = %agent_id, "Health loop stopping");
                        return;
                    }
                }
                if health_paused.load(Ordering::SeqCst) {
                    continue;
                }
                match health.check(agent_id).await {
                    Ok(outcome) if outcome.went_offline => {
                        info!(agent_id = %agent_id, "Pausing schedules for offline agent");
                        dispatch_paused.store(true, Ordering::SeqCst);
                        health_paused.store(true, Ordering::SeqCst);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(agent_id = %agent_id, error = %e, "Health check errored");
                    }
                }
            }
        })
    }
}

#[async_trait]
impl Schedules for LocalEngine {
    async fn ensure_agent_schedules(&self, agent_id: Uuid) -> Result<(), EngineError> {
        let mut agents = self.agents.lock().await;
        if agents.contains_key(&agent_id) {
            return Ok(());
        }

        let dispatch_paused = Arc::new(AtomicBool::new(false));
        let health_paused = Arc::new(AtomicBool::new(false));
        let handles = vec![
            self.spawn_dispatch_loop(agent_id, Arc::clone(&dispatch_paused)),
            self.spawn_health_loop(
                agent_id,
                Arc::clone(&dispatch_paused),
                Arc::clone(&health_paused),
            ),
        ];
        agents.insert(
            agent_id,
            AgentSchedules {
                dispatch_paused,
                health_paused,
                handles,
            },
        );
        info!(agent_id = %agent_id, "Agent schedules created");
        Ok(())
    }

    async fn pause_agent_schedules(&self, agent_id: Uuid) -> Result<(), EngineError> {
        let agents = self.agents.lock().await;
        let schedules = agents.get(&agent_id).ok_or_else(|| {
            EngineError::ScheduleUnavailable(format!("no schedules for agent {}", agent_id))
        })?;
        schedules.dispatch_paused.store(true, Ordering::SeqCst);
        schedules.health_paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume_agent_schedules(&self, agent_id: Uuid) -> Result<(), EngineError> {
        let agents = self.agents.lock().await;
        let schedules = agents.get(&agent_id).ok_or_else(|| {
            EngineError::ScheduleUnavailable(format!("no schedules for agent {}", agent_id))
        })?;
        schedules.dispatch_paused.store(false, Ordering::SeqCst);
        schedules.health_paused.store(false, Ordering::SeqCst);
        Ok(())
    }
}
