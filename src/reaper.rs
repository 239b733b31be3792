//! Idle reaper
//!
//! Background task that stops inference servers whose idle window elapsed,
//! freeing accelerator memory while keeping the fleet ready to restart
//! them on demand. Tiers with a zero threshold and externally managed
//! tiers are never touched.

use crate::slots::SlotManager;
use crate::supervisor::ProcessSupervisor;
use crate::types::ModelTier;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Default sweep interval
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Reaper status snapshot for monitoring
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperStatus {
    pub active: bool,
    pub sweep_interval_secs: u64,
    /// Endpoints with a non-zero idle threshold
    pub endpoints_monitored: usize,
}

/// Watches endpoint idle times and shuts down servers past their threshold
pub struct IdleReaper {
    slots: Arc<SlotManager>,
    supervisor: Arc<ProcessSupervisor>,
    active: Arc<AtomicBool>,
    interval: Mutex<Duration>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl IdleReaper {
    pub fn new(slots: Arc<SlotManager>, supervisor: Arc<ProcessSupervisor>) -> Self {
        Self {
            slots,
            supervisor,
            active: Arc::new(AtomicBool::new(false)),
            interval: Mutex::new(DEFAULT_SWEEP_INTERVAL),
            handle: Mutex::new(None),
        }
    }

    /// Check every endpoint once, stopping those idle past their threshold.
    ///
    /// Returns which monitored tiers were shut down this sweep. A failure
    /// on one tier never aborts the rest of the sweep.
    pub async fn sweep(&self) -> HashMap<ModelTier, bool> {
        sweep_once(&self.slots, &self.supervisor).await
    }

    /// Start the background sweep loop
    pub async fn start(&self, interval: Duration) {
        if self.active.swap(true, Ordering::SeqCst) {
            warn!("idle reaper already running");
            return;
        }
        *self.interval.lock().await = interval;

        let slots = Arc::clone(&self.slots);
        let supervisor = Arc::clone(&self.supervisor);
        let active = Arc::clone(&self.active);
        let task = tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "idle reaper started");
            while active.load(Ordering::SeqCst) {
                let results = sweep_once(&slots, &supervisor).await;
                let stopped = results.values().filter(|v| **v).count();
                if stopped > 0 {
                    info!(stopped, "idle sweep shut down servers");
                }
                tokio::time::sleep(interval).await;
            }
        });
        *self.handle.lock().await = Some(task);
    }

    /// Stop the background sweep loop
    pub async fn stop(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.handle.lock().await.take() {
            task.abort();
            let _ = task.await;
        }
        info!("idle reaper stopped");
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub async fn status(&self) -> ReaperStatus {
        ReaperStatus {
            active: self.is_active(),
            sweep_interval_secs: self.interval.lock().await.as_secs(),
            endpoints_monitored: self
                .slots
                .registry()
                .iter()
                .filter(|e| e.idle_shutdown_secs > 0 && !e.externally_managed)
                .count(),
        }
    }
}

async fn sweep_once(
    slots: &SlotManager,
    supervisor: &ProcessSupervisor,
) -> HashMap<ModelTier, bool> {
    let mut results = HashMap::new();

    for endpoint in slots.registry().iter() {
        if endpoint.idle_shutdown_secs == 0 || endpoint.externally_managed {
            continue;
        }
        if !endpoint.is_running() {
            continue;
        }

        let threshold = Duration::from_secs(endpoint.idle_shutdown_secs);
        if !slots.is_idle(endpoint.tier, threshold) {
            results.insert(endpoint.tier, false);
            continue;
        }

        let idle = slots.idle_seconds(endpoint.tier).unwrap_or(0.0);
        info!(
            tier = %endpoint.tier,
            idle_secs = idle as u64,
            threshold_secs = endpoint.idle_shutdown_secs,
            "idle threshold exceeded, shutting down"
        );

        let stopped = supervisor.stop(endpoint.tier).await;
        if stopped {
            info!(tier = %endpoint.tier, "idle server shut down");
        } else {
            warn!(tier = %endpoint.tier, "idle shutdown failed");
        }
        results.insert(endpoint.tier, stopped);
    }

    results
}
