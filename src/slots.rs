//! Slot manager
//!
//! Single process-wide authority for endpoint usage and liveness:
//! - Slot acquisition with exponential backoff and optional fallback tier
//! - Release accounting and idle tracking
//! - Health probes per wire dialect
//! - On-demand server start through the process supervisor
//!
//! Construct one manager at startup and thread references through
//! dependents; the adapter is the only caller that pairs acquire with
//! release.

use crate::endpoint::{Endpoint, EndpointRegistry, EndpointStatus};
use crate::supervisor::ProcessSupervisor;
use crate::types::{Dialect, ModelTier};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Health probe timeout
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Parameters for one acquisition attempt
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    /// Overall deadline for the acquisition
    pub timeout: Duration,
    pub allow_fallback: bool,
    pub fallback_tier: Option<ModelTier>,
    pub max_attempts: u32,
    /// First backoff delay; doubles each attempt, capped by remaining budget
    pub initial_backoff: Duration,
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            allow_fallback: true,
            fallback_tier: None,
            max_attempts: 10,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

/// Centralized slot management across all model endpoints
pub struct SlotManager {
    registry: Arc<EndpointRegistry>,
    supervisor: Option<Arc<ProcessSupervisor>>,
    http: reqwest::Client,
    /// Window for a freshly spawned server to pass its health probe
    startup_wait: Duration,
    startup_poll: Duration,
}

impl SlotManager {
    pub fn new(registry: Arc<EndpointRegistry>) -> Self {
        Self {
            registry,
            supervisor: None,
            http: reqwest::Client::new(),
            startup_wait: Duration::from_secs(30),
            startup_poll: Duration::from_secs(1),
        }
    }

    /// Attach a supervisor, enabling on-demand server starts
    pub fn with_supervisor(
        registry: Arc<EndpointRegistry>,
        supervisor: Arc<ProcessSupervisor>,
    ) -> Self {
        let mut manager = Self::new(registry);
        manager.supervisor = Some(supervisor);
        manager
    }

    /// Override the startup window (tests use short windows)
    pub fn with_startup_wait(mut self, wait: Duration, poll: Duration) -> Self {
        self.startup_wait = wait;
        self.startup_poll = poll;
        self
    }

    pub fn registry(&self) -> &Arc<EndpointRegistry> {
        &self.registry
    }

    /// Try to acquire a slot on `tier`, backing off while the endpoint is
    /// at capacity, then falling back once if allowed.
    ///
    /// Returns `(actual_tier, success)`. Failure is reported, not raised.
    pub async fn acquire_slot(&self, tier: ModelTier, opts: &AcquireOptions) -> (ModelTier, bool) {
        let Some(endpoint) = self.registry.get(tier) else {
            warn!(%tier, "unknown tier, cannot acquire slot");
            return (tier, false);
        };
        if !endpoint.enabled {
            debug!(%tier, "tier disabled, acquisition fails fast");
            return (tier, false);
        }

        if self.supervisor.is_some() && !endpoint.is_running() {
            self.ensure_running(&endpoint).await;
        }

        let start = Instant::now();
        let mut backoff = opts.initial_backoff;
        for attempt in 0..opts.max_attempts {
            if start.elapsed() >= opts.timeout {
                break;
            }
            if endpoint.try_acquire() {
                debug!(
                    %tier,
                    active = endpoint.active_slots(),
                    max = endpoint.max_slots,
                    "acquired slot"
                );
                return (tier, true);
            }

            let remaining = opts.timeout.saturating_sub(start.elapsed());
            let delay = backoff.min(remaining);
            if delay.is_zero() {
                break;
            }
            debug!(
                %tier,
                attempt = attempt + 1,
                max_attempts = opts.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "slot busy, backing off"
            );
            tokio::time::sleep(delay).await;
            backoff = backoff.saturating_mul(2);
        }

        // Single fallback attempt, no retries
        if opts.allow_fallback {
            if let Some(fallback) = opts.fallback_tier {
                if let Some(fb_endpoint) = self.registry.get(fallback) {
                    if fb_endpoint.enabled && fb_endpoint.try_acquire() {
                        info!(primary = %tier, %fallback, "primary full, using fallback tier");
                        return (fallback, true);
                    }
                }
            }
        }

        warn!(%tier, attempts = opts.max_attempts, "could not acquire slot");
        (tier, false)
    }

    /// Release a slot back to the tier. Unknown tiers are a logged no-op.
    pub fn release_slot(&self, tier: ModelTier) {
        match self.registry.get(tier) {
            Some(endpoint) => {
                endpoint.release();
                debug!(
                    %tier,
                    active = endpoint.active_slots(),
                    max = endpoint.max_slots,
                    "released slot"
                );
            }
            None => warn!(%tier, "unknown tier, cannot release slot"),
        }
    }

    /// One-shot health probe against the tier's dialect-specific path
    pub async fn check_health(&self, tier: ModelTier) -> bool {
        let Some(endpoint) = self.registry.get(tier) else {
            return false;
        };
        let url = health_url(&endpoint);
        match self
            .http
            .get(&url)
            .timeout(HEALTH_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                warn!(%tier, error = %err, "health check failed");
                false
            }
        }
    }

    /// Probe every endpoint concurrently
    pub async fn check_all_health(&self) -> HashMap<ModelTier, bool> {
        let tiers = self.registry.tiers();
        let probes = tiers.iter().map(|tier| self.check_health(*tier));
        tiers
            .iter()
            .copied()
            .zip(join_all(probes).await)
            .collect()
    }

    /// Current slot status for every endpoint
    pub fn status(&self) -> HashMap<ModelTier, EndpointStatus> {
        self.registry
            .iter()
            .map(|e| (e.tier, e.snapshot()))
            .collect()
    }

    pub fn available_slots(&self, tier: ModelTier) -> u32 {
        self.registry
            .get(tier)
            .map(|e| e.available_slots())
            .unwrap_or(0)
    }

    /// Seconds since the tier went quiet. None while slots are active or
    /// before first use.
    pub fn idle_seconds(&self, tier: ModelTier) -> Option<f64> {
        self.registry
            .get(tier)?
            .idle_for()
            .map(|d| d.as_secs_f64())
    }

    /// All currently idle tiers with their idle duration in seconds
    pub fn idle_tiers(&self) -> HashMap<ModelTier, f64> {
        self.registry
            .iter()
            .filter_map(|e| e.idle_for().map(|d| (e.tier, d.as_secs_f64())))
            .collect()
    }

    pub fn is_idle(&self, tier: ModelTier, threshold: Duration) -> bool {
        self.idle_seconds(tier)
            .map(|idle| idle >= threshold.as_secs_f64())
            .unwrap_or(false)
    }

    /// Reset the idle clock, preventing an immediate reap after a fresh
    /// on-demand start
    pub fn mark_active(&self, tier: ModelTier) {
        if let Some(endpoint) = self.registry.get(tier) {
            endpoint.touch();
        }
    }

    pub fn total_capacity(&self) -> u32 {
        self.registry.total_capacity()
    }

    pub fn total_active(&self) -> u32 {
        self.registry.iter().map(|e| e.active_slots()).sum()
    }

    pub fn total_available(&self) -> u32 {
        self.registry.iter().map(|e| e.available_slots()).sum()
    }

    /// Start a stopped server and wait for its health probe to pass.
    ///
    /// Externally managed endpoints are assumed alive; the supervisor will
    /// not touch them.
    async fn ensure_running(&self, endpoint: &Arc<Endpoint>) -> bool {
        if endpoint.externally_managed {
            return true;
        }
        let Some(supervisor) = &self.supervisor else {
            warn!(tier = %endpoint.tier, "no supervisor attached, cannot auto-start");
            return false;
        };

        info!(tier = %endpoint.tier, "auto-starting inference server");
        if supervisor.start(endpoint.tier).await.is_none() {
            error!(tier = %endpoint.tier, "failed to start inference server");
            return false;
        }

        let wait_start = Instant::now();
        while wait_start.elapsed() < self.startup_wait {
            if self.check_health(endpoint.tier).await {
                endpoint.set_running(true);
                endpoint.touch();
                info!(tier = %endpoint.tier, "server is ready");
                return true;
            }
            tokio::time::sleep(self.startup_poll).await;
        }

        error!(tier = %endpoint.tier, "server failed to become healthy");
        false
    }
}

fn health_url(endpoint: &Endpoint) -> String {
    let base = endpoint.base_url.trim_end_matches('/');
    match endpoint.dialect {
        Dialect::Native => format!("{base}/health"),
        Dialect::Gateway => format!("{base}/api/tags"),
    }
}
