//! Fleet wiring
//!
//! Composes the runtime from configuration: registry, supervisor, slot
//! manager, idle reaper, client, and orchestrator, with explicit
//! references threaded through dependents. Construct once at startup.

use crate::agent::AgentRegistry;
use crate::client::LlmClient;
use crate::config::FleetConfig;
use crate::endpoint::EndpointRegistry;
use crate::error::OrchestratorResult;
use crate::orchestrator::TaskOrchestrator;
use crate::reaper::IdleReaper;
use crate::slots::SlotManager;
use crate::supervisor::ProcessSupervisor;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// The assembled runtime for one process
pub struct Fleet {
    registry: Arc<EndpointRegistry>,
    supervisor: Arc<ProcessSupervisor>,
    slots: Arc<SlotManager>,
    reaper: Arc<IdleReaper>,
    client: Arc<LlmClient>,
    orchestrator: Arc<TaskOrchestrator>,
}

impl Fleet {
    /// Build the runtime from the process environment
    pub fn from_env() -> OrchestratorResult<Self> {
        Self::from_config(FleetConfig::from_env()?)
    }

    /// Build the runtime from an explicit configuration
    pub fn from_config(config: FleetConfig) -> OrchestratorResult<Self> {
        let registry = Arc::new(EndpointRegistry::from_config(&config));
        let supervisor = Arc::new(ProcessSupervisor::from_config(
            Arc::clone(&registry),
            &config,
        )?);
        let slots = Arc::new(SlotManager::with_supervisor(
            Arc::clone(&registry),
            Arc::clone(&supervisor),
        ));
        let reaper = Arc::new(IdleReaper::new(
            Arc::clone(&slots),
            Arc::clone(&supervisor),
        ));
        let client = Arc::new(LlmClient::new(Arc::clone(&slots)));
        let orchestrator = Arc::new(TaskOrchestrator::new(
            Arc::new(AgentRegistry::builtin()),
            Arc::clone(&client),
            config.max_parallel,
        ));

        info!(
            endpoints = registry.tiers().len(),
            capacity = registry.total_capacity(),
            max_parallel = config.max_parallel,
            "fleet assembled"
        );

        Ok(Self {
            registry,
            supervisor,
            slots,
            reaper,
            client,
            orchestrator,
        })
    }

    /// Start the idle reaper's background sweep
    pub async fn start_reaper(&self, interval: Duration) {
        self.reaper.start(interval).await;
    }

    /// Stop the reaper and every supervised server
    pub async fn shutdown(&self) {
        self.reaper.stop().await;
        self.supervisor.stop_all().await;
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn slots(&self) -> &Arc<SlotManager> {
        &self.slots
    }

    pub fn reaper(&self) -> &Arc<IdleReaper> {
        &self.reaper
    }

    pub fn client(&self) -> &Arc<LlmClient> {
        &self.client
    }

    pub fn orchestrator(&self) -> &Arc<TaskOrchestrator> {
        &self.orchestrator
    }
}
