//! Process supervisor for local inference servers
//!
//! Spawns one detached server process per tier, tracks PIDs through PID
//! files, redirects child output to per-tier log files, and escalates
//! graceful stops to a forced kill. Externally managed tiers are accepted
//! as always running and never touched.

use crate::config::{FleetConfig, ServerConfig};
use crate::endpoint::EndpointRegistry;
use crate::error::OrchestratorResult;
use crate::types::ModelTier;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Default wait before a stop escalates to SIGKILL
pub const DEFAULT_GRACEFUL_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between stop and start during a restart, for port release
const RESTART_PAUSE: Duration = Duration::from_millis(500);

const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(250);

/// Monitoring snapshot of one supervised server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub port: u16,
    pub alias: String,
}

/// Manages the lifecycle of local inference server child processes
pub struct ProcessSupervisor {
    registry: Arc<EndpointRegistry>,
    configs: HashMap<ModelTier, ServerConfig>,
    state_dir: PathBuf,
    // One lock serializes lifecycle transitions across tiers
    children: Mutex<HashMap<ModelTier, Child>>,
}

impl ProcessSupervisor {
    pub fn new(
        registry: Arc<EndpointRegistry>,
        configs: HashMap<ModelTier, ServerConfig>,
        state_dir: PathBuf,
    ) -> OrchestratorResult<Self> {
        std::fs::create_dir_all(&state_dir)?;
        Ok(Self {
            registry,
            configs,
            state_dir,
            children: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_config(
        registry: Arc<EndpointRegistry>,
        config: &FleetConfig,
    ) -> OrchestratorResult<Self> {
        Self::new(registry, config.servers.clone(), config.state_dir.clone())
    }

    /// Start the server for a tier.
    ///
    /// Idempotent: a tracked live child or an occupied port returns the
    /// existing PID (from tracking or the PID file) without spawning.
    pub async fn start(&self, tier: ModelTier) -> Option<u32> {
        if self.refuses_lifecycle(tier) {
            return None;
        }
        let Some(config) = self.configs.get(&tier) else {
            error!(%tier, "no server configuration for tier");
            return None;
        };

        let mut children = self.children.lock().await;

        if let Some(child) = children.get_mut(&tier) {
            if matches!(child.try_wait(), Ok(None)) {
                warn!(%tier, pid = child.id(), "server already running");
                return child.id();
            }
        }

        if port_in_use(config.port) {
            warn!(%tier, port = config.port, "port already in use");
            return self.read_pid_file(tier);
        }

        info!(%tier, port = config.port, "starting inference server");
        let child = match self.spawn_server(tier, config) {
            Ok(child) => child,
            Err(err) => {
                error!(%tier, error = %err, "failed to start server");
                return None;
            }
        };

        let pid = child.id();
        if let Some(pid) = pid {
            if let Err(err) = std::fs::write(self.pid_path(tier), pid.to_string()) {
                warn!(%tier, error = %err, "could not write PID file");
            }
        }
        children.insert(tier, child);

        if let Some(endpoint) = self.registry.get(tier) {
            endpoint.set_running(true);
        }

        info!(%tier, ?pid, "server started");
        pid
    }

    /// Stop the server for a tier with the default graceful timeout
    pub async fn stop(&self, tier: ModelTier) -> bool {
        self.stop_with_timeout(tier, DEFAULT_GRACEFUL_TIMEOUT).await
    }

    /// Stop the server for a tier.
    ///
    /// Sends SIGTERM to the process group, waits up to `graceful_timeout`,
    /// then SIGKILLs. A vanished process counts as stopped.
    pub async fn stop_with_timeout(&self, tier: ModelTier, graceful_timeout: Duration) -> bool {
        if self.refuses_lifecycle(tier) {
            return false;
        }

        let mut children = self.children.lock().await;
        let Some(mut child) = children.remove(&tier) else {
            warn!(%tier, "no tracked process to stop");
            return false;
        };

        if matches!(child.try_wait(), Ok(Some(_))) {
            debug!(%tier, "server already terminated");
            self.cleanup_after_stop(tier);
            return true;
        }

        let pid = child.id();
        info!(%tier, ?pid, "stopping server");
        terminate(&mut child, pid);

        match tokio::time::timeout(graceful_timeout, child.wait()).await {
            Ok(_) => info!(%tier, "server stopped gracefully"),
            Err(_) => {
                warn!(%tier, "graceful shutdown timed out, force killing");
                force_kill(&mut child, pid);
                let _ = child.wait().await;
            }
        }

        self.cleanup_after_stop(tier);
        true
    }

    /// Stop, wait for the port to free, start again
    pub async fn restart(&self, tier: ModelTier) -> Option<u32> {
        self.stop(tier).await;
        tokio::time::sleep(RESTART_PAUSE).await;
        self.start(tier).await
    }

    /// Tracked child alive, or port bound (a server started externally)
    pub async fn is_running(&self, tier: ModelTier) -> bool {
        let mut children = self.children.lock().await;
        if let Some(child) = children.get_mut(&tier) {
            if matches!(child.try_wait(), Ok(None)) {
                return true;
            }
        }
        self.configs
            .get(&tier)
            .map(|c| port_in_use(c.port))
            .unwrap_or(false)
    }

    /// Status of every configured server
    pub async fn status(&self) -> HashMap<ModelTier, ServerStatus> {
        let mut children = self.children.lock().await;
        self.configs
            .iter()
            .map(|(tier, config)| {
                let tracked = match children.get_mut(tier) {
                    Some(child) => {
                        if matches!(child.try_wait(), Ok(None)) {
                            child.id()
                        } else {
                            None
                        }
                    }
                    None => None,
                };
                let running = tracked.is_some() || port_in_use(config.port);
                (
                    *tier,
                    ServerStatus {
                        running,
                        pid: tracked,
                        port: config.port,
                        alias: config.alias.clone(),
                    },
                )
            })
            .collect()
    }

    /// Start every configured server
    pub async fn start_all(&self) -> HashMap<ModelTier, Option<u32>> {
        let tiers: Vec<ModelTier> = self.configs.keys().copied().collect();
        let mut results = HashMap::new();
        for tier in tiers {
            results.insert(tier, self.start(tier).await);
        }
        results
    }

    /// Stop every tracked server
    pub async fn stop_all(&self) {
        let tiers: Vec<ModelTier> = {
            let children = self.children.lock().await;
            children.keys().copied().collect()
        };
        for tier in tiers {
            self.stop(tier).await;
        }
    }

    pub fn pid_path(&self, tier: ModelTier) -> PathBuf {
        self.state_dir.join(format!("{}.pid", tier.slug()))
    }

    pub fn log_path(&self, tier: ModelTier) -> PathBuf {
        self.state_dir.join(format!("{}.log", tier.slug()))
    }

    fn refuses_lifecycle(&self, tier: ModelTier) -> bool {
        let externally_managed = self
            .registry
            .get(tier)
            .map(|e| e.externally_managed)
            .unwrap_or(false);
        if externally_managed {
            warn!(%tier, "tier is externally managed, refusing lifecycle operation");
        }
        externally_managed
    }

    fn spawn_server(&self, tier: ModelTier, config: &ServerConfig) -> std::io::Result<Child> {
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(tier))?;
        let stderr_log = log_file.try_clone()?;

        let mut command = std::process::Command::new(&config.binary_path);
        command
            .args(build_args(config))
            .stdout(Stdio::from(log_file))
            .stderr(Stdio::from(stderr_log));

        // Own process group so a stop signal reaches the whole server tree
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        tokio::process::Command::from(command).spawn()
    }

    fn cleanup_after_stop(&self, tier: ModelTier) {
        let pid_path = self.pid_path(tier);
        if pid_path.exists() {
            if let Err(err) = std::fs::remove_file(&pid_path) {
                warn!(%tier, error = %err, "could not remove PID file");
            }
        }
        if let Some(endpoint) = self.registry.get(tier) {
            endpoint.set_running(false);
        }
    }

    fn read_pid_file(&self, tier: ModelTier) -> Option<u32> {
        std::fs::read_to_string(self.pid_path(tier))
            .ok()
            .and_then(|raw| raw.trim().parse().ok())
    }
}

/// Command line for one server, llama-server argument conventions
fn build_args(config: &ServerConfig) -> Vec<String> {
    let mut args = vec![
        "--model".into(),
        config.model_path.to_string_lossy().into_owned(),
        "--host".into(),
        "0.0.0.0".into(),
        "--port".into(),
        config.port.to_string(),
        "--n-gpu-layers".into(),
        config.gpu_layers.to_string(),
        "--ctx-size".into(),
        config.context_size.to_string(),
        "-np".into(),
        config.n_parallel.to_string(),
        "--batch-size".into(),
        config.batch_size.to_string(),
        "--threads".into(),
        config.threads.to_string(),
        "--alias".into(),
        config.alias.clone(),
    ];

    if let Some(mmproj) = &config.mmproj_path {
        args.push("--mmproj".into());
        args.push(mmproj.to_string_lossy().into_owned());
    }
    if config.flash_attn {
        args.push("--flash-attn".into());
        args.push("on".into());
    }
    if config.jinja {
        args.push("--jinja".into());
    }
    args.extend(config.extra_args.iter().cloned());

    args
}

fn port_in_use(port: u16) -> bool {
    if port == 0 {
        return false;
    }
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    TcpStream::connect_timeout(&addr, PORT_PROBE_TIMEOUT).is_ok()
}

#[cfg(unix)]
fn terminate(_child: &mut Child, pid: Option<u32>) {
    signal_group(pid, nix::sys::signal::Signal::SIGTERM);
}

#[cfg(unix)]
fn force_kill(_child: &mut Child, pid: Option<u32>) {
    signal_group(pid, nix::sys::signal::Signal::SIGKILL);
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: nix::sys::signal::Signal) {
    let Some(pid) = pid else { return };
    let pgid = nix::unistd::Pid::from_raw(pid as i32);
    if let Err(err) = nix::sys::signal::killpg(pgid, signal) {
        // ESRCH: process group already gone
        debug!(pid, %signal, error = %err, "signal delivery skipped");
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}

#[cfg(not(unix))]
fn force_kill(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;
    use crate::endpoint::Endpoint;
    use crate::types::Dialect;

    fn server_config(port: u16) -> ServerConfig {
        ServerConfig {
            tier: ModelTier::Vision,
            binary_path: PathBuf::from("llama-server"),
            model_path: PathBuf::from("/srv/models/vision.gguf"),
            mmproj_path: Some(PathBuf::from("/srv/models/mmproj.gguf")),
            port,
            alias: "forge-vision".into(),
            context_size: 8192,
            n_parallel: 2,
            batch_size: 1024,
            threads: 12,
            gpu_layers: 999,
            flash_attn: true,
            jinja: false,
            extra_args: vec!["--no-warmup".into()],
        }
    }

    #[test]
    fn command_line_covers_every_knob() {
        let args = build_args(&server_config(8086));
        let joined = args.join(" ");
        assert!(joined.contains("--model /srv/models/vision.gguf"));
        assert!(joined.contains("--port 8086"));
        assert!(joined.contains("-np 2"));
        assert!(joined.contains("--mmproj /srv/models/mmproj.gguf"));
        assert!(joined.contains("--flash-attn on"));
        assert!(!joined.contains("--jinja"));
        assert!(joined.ends_with("--no-warmup"));
    }

    #[test]
    fn unused_port_reports_free() {
        // Port 1 is never listening on a test host
        assert!(!port_in_use(1));
        assert!(!port_in_use(0));
    }

    #[tokio::test]
    async fn externally_managed_tier_is_refused() {
        let registry = Arc::new(EndpointRegistry::new(vec![Endpoint::from_config(
            EndpointConfig {
                tier: ModelTier::DeepReason,
                name: "Deep Reasoner".into(),
                base_url: "http://localhost:11434".into(),
                dialect: Dialect::Gateway,
                model_id: "forge-reasoner".into(),
                max_slots: 2,
                context_length: 65536,
                supports_tools: false,
                supports_vision: false,
                thinking: None,
                idle_shutdown_secs: 0,
                port: 11434,
                externally_managed: true,
                enabled: true,
            },
        )]));
        let dir = tempfile::tempdir().unwrap();
        let supervisor =
            ProcessSupervisor::new(registry, HashMap::new(), dir.path().to_path_buf()).unwrap();

        assert_eq!(supervisor.start(ModelTier::DeepReason).await, None);
        assert!(!supervisor.stop(ModelTier::DeepReason).await);
    }
}
