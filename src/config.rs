//! Fleet configuration
//!
//! Environment-driven configuration for endpoints, supervised server
//! processes, and orchestrator limits. All lookups go through the
//! [`ConfigProvider`] seam so tests and embedding callers can substitute
//! the process environment.

use crate::error::{OrchestratorError, OrchestratorResult};
use crate::types::{Dialect, ModelTier, ThinkingEffort};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::warn;

/// Source of configuration values, keyed like environment variables
pub trait ConfigProvider: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads the process environment
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvProvider;

impl ConfigProvider for EnvProvider {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// In-memory provider for tests and embedded callers
#[derive(Debug, Clone, Default)]
pub struct MapProvider {
    values: HashMap<String, String>,
}

impl MapProvider {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }
}

impl ConfigProvider for MapProvider {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Static description of one endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub tier: ModelTier,
    /// Human-readable endpoint name
    pub name: String,
    pub base_url: String,
    pub dialect: Dialect,
    /// Model alias sent on each request
    pub model_id: String,
    pub max_slots: u32,
    pub context_length: u32,
    pub supports_tools: bool,
    pub supports_vision: bool,
    pub thinking: Option<ThinkingEffort>,
    /// Seconds of inactivity before the reaper stops the server; 0 never
    pub idle_shutdown_secs: u64,
    /// Listen port, derived from `base_url` unless overridden
    pub port: u16,
    /// Lifecycle owned outside this process; supervisor refuses start/stop
    pub externally_managed: bool,
    /// False when required configuration was missing; acquisitions fail fast
    pub enabled: bool,
}

/// Declarative description of one supervised inference server process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub tier: ModelTier,
    pub binary_path: PathBuf,
    pub model_path: PathBuf,
    /// Multimodal projection weights, for vision servers
    pub mmproj_path: Option<PathBuf>,
    pub port: u16,
    /// Model alias advertised by the server
    pub alias: String,
    pub context_size: u32,
    pub n_parallel: u32,
    pub batch_size: u32,
    pub threads: u32,
    pub gpu_layers: u32,
    pub flash_attn: bool,
    pub jinja: bool,
    /// Raw argv fragments appended verbatim
    pub extra_args: Vec<String>,
}

/// Complete fleet configuration built at process start
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub endpoints: Vec<EndpointConfig>,
    pub servers: HashMap<ModelTier, ServerConfig>,
    /// Global orchestrator semaphore size
    pub max_parallel: usize,
    /// Directory for PID and server log files
    pub state_dir: PathBuf,
}

/// Per-tier built-in defaults applied when a key is absent
struct TierDefaults {
    name: &'static str,
    dialect: Dialect,
    model_id: &'static str,
    max_slots: u32,
    context_length: u32,
    idle_shutdown_secs: u64,
    supports_tools: bool,
    supports_vision: bool,
    externally_managed: bool,
}

fn tier_defaults(tier: ModelTier) -> TierDefaults {
    match tier {
        ModelTier::Q4Tools => TierDefaults {
            name: "Tool Planner",
            dialect: Dialect::Native,
            model_id: "forge-q4",
            max_slots: 6,
            context_length: 131_072,
            idle_shutdown_secs: 900,
            supports_tools: true,
            supports_vision: false,
            externally_managed: false,
        },
        ModelTier::DeepReason => TierDefaults {
            name: "Deep Reasoner",
            dialect: Dialect::Gateway,
            model_id: "forge-reasoner",
            max_slots: 2,
            context_length: 65_536,
            idle_shutdown_secs: 0,
            supports_tools: false,
            supports_vision: false,
            // The gateway runtime manages its own keep-alive
            externally_managed: true,
        },
        ModelTier::Vision => TierDefaults {
            name: "Vision Analyst",
            dialect: Dialect::Native,
            model_id: "forge-vision",
            max_slots: 2,
            context_length: 8_192,
            idle_shutdown_secs: 1_800,
            supports_tools: false,
            supports_vision: true,
            externally_managed: false,
        },
        ModelTier::Coder => TierDefaults {
            name: "Coder",
            dialect: Dialect::Native,
            model_id: "forge-coder",
            max_slots: 4,
            context_length: 32_768,
            idle_shutdown_secs: 900,
            supports_tools: false,
            supports_vision: false,
            externally_managed: false,
        },
        ModelTier::Summary => TierDefaults {
            name: "Summarizer",
            dialect: Dialect::Native,
            model_id: "forge-summary",
            max_slots: 4,
            context_length: 4_096,
            idle_shutdown_secs: 1_800,
            supports_tools: false,
            supports_vision: false,
            externally_managed: false,
        },
    }
}

impl FleetConfig {
    /// Load from the process environment
    pub fn from_env() -> OrchestratorResult<Self> {
        Self::from_provider(&EnvProvider)
    }

    /// Load from an arbitrary provider
    pub fn from_provider(provider: &dyn ConfigProvider) -> OrchestratorResult<Self> {
        let mut endpoints = Vec::with_capacity(ModelTier::ALL.len());
        let mut servers = HashMap::new();

        for tier in ModelTier::ALL {
            let endpoint = load_endpoint(provider, tier)?;
            if endpoint.enabled && !endpoint.externally_managed {
                if let Some(server) = load_server(provider, tier, &endpoint)? {
                    servers.insert(tier, server);
                }
            }
            endpoints.push(endpoint);
        }

        let max_parallel = parse_opt_number::<usize>(provider, "ORCHESTRATOR_MAX_PARALLEL")?
            .unwrap_or(8)
            .max(1);
        let state_dir = provider
            .get("ORCHESTRATOR_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".forgeflow"));

        Ok(Self {
            endpoints,
            servers,
            max_parallel,
            state_dir,
        })
    }

    /// Development defaults: every tier enabled against localhost ports
    pub fn local_defaults() -> Self {
        let mut provider = MapProvider::default();
        provider.set("Q4_TOOLS_BASE_URL", "http://localhost:8083");
        provider.set("DEEP_REASON_BASE_URL", "http://localhost:11434");
        provider.set("VISION_BASE_URL", "http://localhost:8086");
        provider.set("CODER_BASE_URL", "http://localhost:8087");
        provider.set("SUMMARY_BASE_URL", "http://localhost:8084");
        // Defaults are well-formed; loading them cannot fail
        Self::from_provider(&provider).unwrap_or_else(|_| Self {
            endpoints: Vec::new(),
            servers: HashMap::new(),
            max_parallel: 8,
            state_dir: PathBuf::from(".forgeflow"),
        })
    }

    pub fn endpoint(&self, tier: ModelTier) -> Option<&EndpointConfig> {
        self.endpoints.iter().find(|e| e.tier == tier)
    }
}

fn load_endpoint(
    provider: &dyn ConfigProvider,
    tier: ModelTier,
) -> OrchestratorResult<EndpointConfig> {
    let prefix = tier.env_prefix();
    let defaults = tier_defaults(tier);

    let base_url = provider.get(&format!("{prefix}_BASE_URL"));
    let enabled = base_url.is_some();
    if !enabled {
        warn!(tier = %tier, "no base URL configured, tier disabled");
    }
    let base_url = base_url.unwrap_or_default();

    let dialect = match provider.get(&format!("{prefix}_DIALECT")) {
        Some(raw) => parse_dialect(&raw)
            .ok_or_else(|| OrchestratorError::Config(format!("{prefix}_DIALECT: {raw}")))?,
        None => defaults.dialect,
    };

    let thinking = match provider.get(&format!("{prefix}_THINKING")) {
        Some(raw) => {
            let effort = parse_thinking(&raw)
                .ok_or_else(|| OrchestratorError::Config(format!("{prefix}_THINKING: {raw}")))?;
            if dialect == Dialect::Gateway {
                Some(effort)
            } else {
                warn!(tier = %tier, "thinking effort ignored for native dialect");
                None
            }
        }
        None => None,
    };

    let max_slots = parse_opt_number::<u32>(provider, &format!("{prefix}_MAX_SLOTS"))?
        .unwrap_or(defaults.max_slots);
    if max_slots < 1 {
        return Err(OrchestratorError::Config(format!(
            "{prefix}_MAX_SLOTS must be at least 1"
        )));
    }

    let port = match parse_opt_number::<u16>(provider, &format!("{prefix}_PORT"))? {
        Some(port) => port,
        None => port_from_url(&base_url).unwrap_or(0),
    };

    Ok(EndpointConfig {
        tier,
        name: defaults.name.to_string(),
        base_url,
        dialect,
        model_id: provider
            .get(&format!("{prefix}_MODEL_ID"))
            .unwrap_or_else(|| defaults.model_id.to_string()),
        max_slots,
        context_length: parse_opt_number::<u32>(provider, &format!("{prefix}_CTX_SIZE"))?
            .unwrap_or(defaults.context_length),
        supports_tools: defaults.supports_tools,
        supports_vision: defaults.supports_vision,
        thinking,
        idle_shutdown_secs: parse_opt_number::<u64>(
            provider,
            &format!("{prefix}_IDLE_SHUTDOWN_SECONDS"),
        )?
        .unwrap_or(defaults.idle_shutdown_secs),
        port,
        externally_managed: match provider.get(&format!("{prefix}_EXTERNAL")) {
            Some(raw) => parse_bool(&raw)
                .ok_or_else(|| OrchestratorError::Config(format!("{prefix}_EXTERNAL: {raw}")))?,
            None => defaults.externally_managed,
        },
        enabled,
    })
}

fn load_server(
    provider: &dyn ConfigProvider,
    tier: ModelTier,
    endpoint: &EndpointConfig,
) -> OrchestratorResult<Option<ServerConfig>> {
    let prefix = tier.env_prefix();

    let Some(model_rel) = provider.get(&format!("{prefix}_MODEL_PATH")) else {
        return Ok(None);
    };
    let model_base = provider
        .get("MODEL_BASE")
        .map(PathBuf::from)
        .unwrap_or_default();

    let binary_path = provider
        .get(&format!("{prefix}_BINARY_PATH"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("llama-server"));

    Ok(Some(ServerConfig {
        tier,
        binary_path,
        model_path: model_base.join(&model_rel),
        mmproj_path: provider
            .get(&format!("{prefix}_MMPROJ_PATH"))
            .map(|rel| model_base.join(rel)),
        port: parse_opt_number::<u16>(provider, &format!("{prefix}_PORT"))?
            .unwrap_or(endpoint.port),
        alias: endpoint.model_id.clone(),
        context_size: endpoint.context_length,
        n_parallel: parse_opt_number::<u32>(provider, &format!("{prefix}_PARALLEL"))?
            .unwrap_or(endpoint.max_slots),
        batch_size: parse_opt_number::<u32>(provider, &format!("{prefix}_BATCH"))?.unwrap_or(512),
        threads: parse_opt_number::<u32>(provider, &format!("{prefix}_THREADS"))?.unwrap_or(8),
        gpu_layers: parse_opt_number::<u32>(provider, &format!("{prefix}_GPU_LAYERS"))?
            .unwrap_or(999),
        flash_attn: true,
        jinja: endpoint.supports_tools,
        extra_args: Vec::new(),
    }))
}

fn parse_opt_number<T: std::str::FromStr>(
    provider: &dyn ConfigProvider,
    key: &str,
) -> OrchestratorResult<Option<T>> {
    match provider.get(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| OrchestratorError::Config(format!("{key}: malformed number {raw:?}"))),
        None => Ok(None),
    }
}

fn parse_dialect(raw: &str) -> Option<Dialect> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "native" => Some(Dialect::Native),
        "gateway" => Some(Dialect::Gateway),
        _ => None,
    }
}

fn parse_thinking(raw: &str) -> Option<ThinkingEffort> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "low" => Some(ThinkingEffort::Low),
        "medium" => Some(ThinkingEffort::Medium),
        "high" => Some(ThinkingEffort::High),
        _ => None,
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn port_from_url(url: &str) -> Option<u16> {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.port_or_known_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(pairs: &[(&str, &str)]) -> MapProvider {
        let mut p = MapProvider::default();
        for (k, v) in pairs {
            p.set(*k, *v);
        }
        p
    }

    #[test]
    fn missing_base_url_disables_tier() {
        let config = FleetConfig::from_provider(&provider(&[(
            "CODER_BASE_URL",
            "http://localhost:8087",
        )]))
        .unwrap();

        let coder = config.endpoint(ModelTier::Coder).unwrap();
        assert!(coder.enabled);
        assert_eq!(coder.port, 8087);

        let vision = config.endpoint(ModelTier::Vision).unwrap();
        assert!(!vision.enabled);
    }

    #[test]
    fn malformed_number_is_a_config_error() {
        let result = FleetConfig::from_provider(&provider(&[
            ("CODER_BASE_URL", "http://localhost:8087"),
            ("CODER_MAX_SLOTS", "many"),
        ]));
        assert!(matches!(result, Err(OrchestratorError::Config(_))));
    }

    #[test]
    fn zero_slots_rejected() {
        let result = FleetConfig::from_provider(&provider(&[
            ("CODER_BASE_URL", "http://localhost:8087"),
            ("CODER_MAX_SLOTS", "0"),
        ]));
        assert!(matches!(result, Err(OrchestratorError::Config(_))));
    }

    #[test]
    fn thinking_only_honored_for_gateway() {
        let config = FleetConfig::from_provider(&provider(&[
            ("DEEP_REASON_BASE_URL", "http://localhost:11434"),
            ("DEEP_REASON_THINKING", "high"),
            ("CODER_BASE_URL", "http://localhost:8087"),
            ("CODER_THINKING", "low"),
        ]))
        .unwrap();

        assert_eq!(
            config.endpoint(ModelTier::DeepReason).unwrap().thinking,
            Some(ThinkingEffort::High)
        );
        assert_eq!(config.endpoint(ModelTier::Coder).unwrap().thinking, None);
    }

    #[test]
    fn server_config_requires_model_path() {
        let config = FleetConfig::from_provider(&provider(&[
            ("CODER_BASE_URL", "http://localhost:8087"),
            ("VISION_BASE_URL", "http://localhost:8086"),
            ("MODEL_BASE", "/srv/models"),
            ("VISION_MODEL_PATH", "vision/model.gguf"),
            ("VISION_MMPROJ_PATH", "vision/mmproj.gguf"),
        ]))
        .unwrap();

        assert!(!config.servers.contains_key(&ModelTier::Coder));
        let vision = config.servers.get(&ModelTier::Vision).unwrap();
        assert_eq!(vision.model_path, PathBuf::from("/srv/models/vision/model.gguf"));
        assert!(vision.mmproj_path.is_some());
    }

    #[test]
    fn externally_managed_tier_gets_no_server_config() {
        let config = FleetConfig::from_provider(&provider(&[
            ("DEEP_REASON_BASE_URL", "http://localhost:11434"),
            ("DEEP_REASON_MODEL_PATH", "reasoner.gguf"),
        ]))
        .unwrap();
        assert!(!config.servers.contains_key(&ModelTier::DeepReason));
    }

    #[test]
    fn local_defaults_enable_all_tiers() {
        let config = FleetConfig::local_defaults();
        assert!(config.endpoints.iter().all(|e| e.enabled));
        assert_eq!(config.max_parallel, 8);
    }
}
