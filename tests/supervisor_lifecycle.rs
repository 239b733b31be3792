//! Process supervisor lifecycle tests
//!
//! Uses a harmless long-running shell script in place of a real inference
//! server binary, and a mock HTTP server for the health probe in the
//! reap-then-restart scenario.

#![cfg(unix)]

use forgeflow::config::{EndpointConfig, ServerConfig};
use forgeflow::endpoint::{Endpoint, EndpointRegistry};
use forgeflow::reaper::IdleReaper;
use forgeflow::slots::{AcquireOptions, SlotManager};
use forgeflow::supervisor::ProcessSupervisor;
use forgeflow::types::{Dialect, ModelTier};
use std::collections::HashMap;
use std::net::TcpListener;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// A script that stays alive until signalled
fn write_fake_server(dir: &Path) -> PathBuf {
    let path = dir.join("fake-server.sh");
    std::fs::write(&path, "#!/bin/sh\nexec sleep 300\n").unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

/// A script that ignores SIGTERM, forcing the kill escalation
fn write_stubborn_server(dir: &Path) -> PathBuf {
    let path = dir.join("stubborn-server.sh");
    std::fs::write(
        &path,
        "#!/bin/sh\ntrap '' TERM\nwhile true; do sleep 1; done\n",
    )
    .unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn vision_endpoint(base_url: &str, idle_shutdown_secs: u64) -> Endpoint {
    Endpoint::from_config(EndpointConfig {
        tier: ModelTier::Vision,
        name: "Vision".into(),
        base_url: base_url.into(),
        dialect: Dialect::Native,
        model_id: "forge-vision".into(),
        max_slots: 2,
        context_length: 8192,
        supports_tools: false,
        supports_vision: true,
        thinking: None,
        idle_shutdown_secs,
        port: 0,
        externally_managed: false,
        enabled: true,
    })
}

fn server_config(binary: PathBuf, port: u16) -> ServerConfig {
    ServerConfig {
        tier: ModelTier::Vision,
        binary_path: binary,
        model_path: PathBuf::from("/srv/models/vision.gguf"),
        mmproj_path: None,
        port,
        alias: "forge-vision".into(),
        context_size: 8192,
        n_parallel: 2,
        batch_size: 512,
        threads: 4,
        gpu_layers: 999,
        flash_attn: false,
        jinja: false,
        extra_args: Vec::new(),
    }
}

struct Harness {
    _state: TempDir,
    registry: Arc<EndpointRegistry>,
    supervisor: Arc<ProcessSupervisor>,
}

fn harness(base_url: &str, idle_shutdown_secs: u64, binary: fn(&Path) -> PathBuf) -> Harness {
    let state = TempDir::new().unwrap();
    let binary = binary(state.path());
    let registry = Arc::new(EndpointRegistry::new(vec![vision_endpoint(
        base_url,
        idle_shutdown_secs,
    )]));
    let mut configs = HashMap::new();
    configs.insert(ModelTier::Vision, server_config(binary, free_port()));
    let supervisor = Arc::new(
        ProcessSupervisor::new(
            Arc::clone(&registry),
            configs,
            state.path().to_path_buf(),
        )
        .unwrap(),
    );
    Harness {
        _state: state,
        registry,
        supervisor,
    }
}

#[tokio::test]
async fn start_writes_pid_file_and_flips_running() {
    let h = harness("http://localhost:1", 0, write_fake_server);

    let pid = h.supervisor.start(ModelTier::Vision).await.unwrap();
    assert!(pid > 0);

    let pid_file = h.supervisor.pid_path(ModelTier::Vision);
    let recorded: u32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert_eq!(recorded, pid);

    assert!(h.supervisor.is_running(ModelTier::Vision).await);
    assert!(h.registry.get(ModelTier::Vision).unwrap().is_running());

    assert!(h.supervisor.stop(ModelTier::Vision).await);
}

#[tokio::test]
async fn start_is_idempotent_for_a_live_child() {
    let h = harness("http://localhost:1", 0, write_fake_server);

    let first = h.supervisor.start(ModelTier::Vision).await.unwrap();
    let second = h.supervisor.start(ModelTier::Vision).await.unwrap();
    assert_eq!(first, second);

    assert!(h.supervisor.stop(ModelTier::Vision).await);
}

#[tokio::test]
async fn stop_removes_pid_file_and_clears_running() {
    let h = harness("http://localhost:1", 0, write_fake_server);

    h.supervisor.start(ModelTier::Vision).await.unwrap();
    assert!(h.supervisor.stop(ModelTier::Vision).await);

    assert!(!h.supervisor.pid_path(ModelTier::Vision).exists());
    assert!(!h.supervisor.is_running(ModelTier::Vision).await);
    assert!(!h.registry.get(ModelTier::Vision).unwrap().is_running());

    // Nothing tracked anymore
    assert!(!h.supervisor.stop(ModelTier::Vision).await);
}

#[tokio::test]
async fn start_stop_start_yields_a_fresh_pid() {
    let h = harness("http://localhost:1", 0, write_fake_server);

    let first = h.supervisor.start(ModelTier::Vision).await.unwrap();
    assert!(h.supervisor.stop(ModelTier::Vision).await);
    let second = h.supervisor.start(ModelTier::Vision).await.unwrap();

    assert_ne!(first, second);
    assert!(h.registry.get(ModelTier::Vision).unwrap().is_running());
    let recorded: u32 = std::fs::read_to_string(h.supervisor.pid_path(ModelTier::Vision))
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    assert_eq!(recorded, second);

    assert!(h.supervisor.stop(ModelTier::Vision).await);
}

#[tokio::test]
async fn restart_replaces_the_process() {
    let h = harness("http://localhost:1", 0, write_fake_server);

    let first = h.supervisor.start(ModelTier::Vision).await.unwrap();
    let second = h.supervisor.restart(ModelTier::Vision).await.unwrap();
    assert_ne!(first, second);
    assert!(h.supervisor.is_running(ModelTier::Vision).await);

    assert!(h.supervisor.stop(ModelTier::Vision).await);
}

#[tokio::test]
async fn stubborn_process_is_force_killed() {
    let h = harness("http://localhost:1", 0, write_stubborn_server);

    h.supervisor.start(ModelTier::Vision).await.unwrap();
    let stopped = h
        .supervisor
        .stop_with_timeout(ModelTier::Vision, Duration::from_millis(300))
        .await;
    assert!(stopped);
    assert!(!h.supervisor.is_running(ModelTier::Vision).await);
    assert!(!h.supervisor.pid_path(ModelTier::Vision).exists());
}

#[tokio::test]
async fn status_reports_tracked_servers() {
    let h = harness("http://localhost:1", 0, write_fake_server);

    let status = h.supervisor.status().await;
    let vision = status.get(&ModelTier::Vision).unwrap();
    assert!(!vision.running);
    assert!(vision.pid.is_none());

    let pid = h.supervisor.start(ModelTier::Vision).await.unwrap();
    let status = h.supervisor.status().await;
    let vision = status.get(&ModelTier::Vision).unwrap();
    assert!(vision.running);
    assert_eq!(vision.pid, Some(pid));
    assert_eq!(vision.alias, "forge-vision");

    h.supervisor.stop(ModelTier::Vision).await;
}

#[tokio::test]
async fn idle_reaper_stops_and_acquisition_restarts() {
    // Health probes answer through a mock server while the "inference
    // server" is the fake script
    let health = wiremock::MockServer::start().await;
    wiremock::Mock::given(wiremock::matchers::method("GET"))
        .and(wiremock::matchers::path("/health"))
        .respond_with(wiremock::ResponseTemplate::new(200))
        .mount(&health)
        .await;

    let h = harness(&health.uri(), 1, write_fake_server);
    let slots = Arc::new(
        SlotManager::with_supervisor(Arc::clone(&h.registry), Arc::clone(&h.supervisor))
            .with_startup_wait(Duration::from_secs(5), Duration::from_millis(50)),
    );
    let reaper = IdleReaper::new(Arc::clone(&slots), Arc::clone(&h.supervisor));

    h.supervisor.start(ModelTier::Vision).await.unwrap();

    // One call, then let the endpoint idle past its 1s threshold
    let acquire = AcquireOptions {
        timeout: Duration::from_secs(2),
        initial_backoff: Duration::from_millis(20),
        ..AcquireOptions::default()
    };
    let (tier, ok) = slots.acquire_slot(ModelTier::Vision, &acquire).await;
    assert!(ok);
    slots.release_slot(tier);

    tokio::time::sleep(Duration::from_millis(1200)).await;

    let results = reaper.sweep().await;
    assert_eq!(results.get(&ModelTier::Vision), Some(&true));
    assert!(!h.supervisor.is_running(ModelTier::Vision).await);
    assert!(!h.supervisor.pid_path(ModelTier::Vision).exists());
    assert!(!h.registry.get(ModelTier::Vision).unwrap().is_running());

    // The next acquisition starts the server again and succeeds
    let (tier, ok) = slots.acquire_slot(ModelTier::Vision, &acquire).await;
    assert!(ok);
    assert_eq!(tier, ModelTier::Vision);
    assert!(h.registry.get(ModelTier::Vision).unwrap().is_running());
    // Fresh start reset the idle clock, so the reaper leaves it alone
    let results = reaper.sweep().await;
    assert_eq!(results.get(&ModelTier::Vision), Some(&false));
    slots.release_slot(tier);

    h.supervisor.stop(ModelTier::Vision).await;
}
