//! Endpoint records and the endpoint registry
//!
//! Each endpoint pairs the static description of one inference server with
//! its runtime slot state. The registry table is immutable after
//! construction; all runtime mutation happens through the endpoint's own
//! lock.

use crate::config::{EndpointConfig, FleetConfig};
use crate::types::{Dialect, ModelTier, ThinkingEffort};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Runtime slot state, guarded by the endpoint's own mutex
#[derive(Debug)]
struct SlotState {
    active: u32,
    running: bool,
    last_release: Option<Instant>,
}

/// One inference server endpoint with runtime slot tracking
#[derive(Debug)]
pub struct Endpoint {
    pub tier: ModelTier,
    pub name: String,
    pub base_url: String,
    pub dialect: Dialect,
    pub model_id: String,
    pub max_slots: u32,
    pub context_length: u32,
    pub supports_tools: bool,
    pub supports_vision: bool,
    pub thinking: Option<ThinkingEffort>,
    pub idle_shutdown_secs: u64,
    pub port: u16,
    pub externally_managed: bool,
    pub enabled: bool,
    state: Mutex<SlotState>,
}

/// Monitoring snapshot of one endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointStatus {
    pub name: String,
    pub url: String,
    pub active: u32,
    pub max: u32,
    pub available: u32,
    pub running: bool,
}

impl Endpoint {
    pub fn from_config(config: EndpointConfig) -> Self {
        // Enabled endpoints are assumed running until the supervisor or a
        // failed health probe says otherwise
        let running = config.enabled;
        Self {
            tier: config.tier,
            name: config.name,
            base_url: config.base_url,
            dialect: config.dialect,
            model_id: config.model_id,
            max_slots: config.max_slots,
            context_length: config.context_length,
            supports_tools: config.supports_tools,
            supports_vision: config.supports_vision,
            thinking: config.thinking,
            idle_shutdown_secs: config.idle_shutdown_secs,
            port: config.port,
            externally_managed: config.externally_managed,
            enabled: config.enabled,
            state: Mutex::new(SlotState {
                active: 0,
                running,
                last_release: None,
            }),
        }
    }

    /// Try to take one inference slot. Returns false at capacity.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.active < self.max_slots {
            state.active += 1;
            true
        } else {
            false
        }
    }

    /// Return one slot. The idle clock starts when the last slot returns.
    pub fn release(&self) {
        let mut state = self.state.lock();
        if state.active > 0 {
            state.active -= 1;
            if state.active == 0 {
                state.last_release = Some(Instant::now());
            }
        }
    }

    pub fn active_slots(&self) -> u32 {
        self.state.lock().active
    }

    pub fn available_slots(&self) -> u32 {
        let state = self.state.lock();
        self.max_slots.saturating_sub(state.active)
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn set_running(&self, running: bool) {
        self.state.lock().running = running;
    }

    /// How long the endpoint has been idle. None while slots are active or
    /// before the first release.
    pub fn idle_for(&self) -> Option<Duration> {
        let state = self.state.lock();
        if state.active > 0 {
            return None;
        }
        state.last_release.map(|at| at.elapsed())
    }

    /// Reset the idle clock, e.g. right after an on-demand start
    pub fn touch(&self) {
        self.state.lock().last_release = Some(Instant::now());
    }

    pub fn snapshot(&self) -> EndpointStatus {
        let state = self.state.lock();
        EndpointStatus {
            name: self.name.clone(),
            url: self.base_url.clone(),
            active: state.active,
            max: self.max_slots,
            available: self.max_slots.saturating_sub(state.active),
            running: state.running,
        }
    }
}

/// Immutable table of endpoints keyed by tier
#[derive(Debug, Default)]
pub struct EndpointRegistry {
    endpoints: HashMap<ModelTier, Arc<Endpoint>>,
}

impl EndpointRegistry {
    pub fn from_config(config: &FleetConfig) -> Self {
        Self::new(
            config
                .endpoints
                .iter()
                .cloned()
                .map(Endpoint::from_config)
                .collect(),
        )
    }

    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints: endpoints
                .into_iter()
                .map(|e| (e.tier, Arc::new(e)))
                .collect(),
        }
    }

    pub fn get(&self, tier: ModelTier) -> Option<Arc<Endpoint>> {
        self.endpoints.get(&tier).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Endpoint>> {
        self.endpoints.values()
    }

    pub fn tiers(&self) -> Vec<ModelTier> {
        self.endpoints.keys().copied().collect()
    }

    /// Total slot capacity across all endpoints
    pub fn total_capacity(&self) -> u32 {
        self.endpoints.values().map(|e| e.max_slots).sum()
    }
}
