//! Slot-aware LLM client adapter
//!
//! Wraps the two inference wire dialects behind one generate call:
//! - Native llama.cpp-style `/completion` with flat prompt framing
//! - Gateway Ollama-style `/api/generate` with optional thinking effort
//!
//! The adapter owns the acquire/release pairing: a slot is taken before
//! the request and structurally released on every exit path, including
//! errors and cancellation. It never retries; retries are an orchestrator
//! concern.

use crate::agent::AgentProfile;
use crate::endpoint::{Endpoint, EndpointStatus};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::slots::{AcquireOptions, SlotManager};
use crate::types::{Dialect, ModelTier};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// One generation request
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub tier: ModelTier,
    pub prompt: String,
    pub system_prompt: String,
    /// Supplies fallback routing and advisory tool guidance
    pub agent: Option<AgentProfile>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub allow_fallback: bool,
    /// Overrides the client default when set
    pub timeout: Option<Duration>,
}

impl GenerationRequest {
    pub fn new(tier: ModelTier, prompt: impl Into<String>) -> Self {
        Self {
            tier,
            prompt: prompt.into(),
            system_prompt: String::new(),
            agent: None,
            max_tokens: 2048,
            temperature: 0.7,
            allow_fallback: true,
            timeout: None,
        }
    }

    pub fn with_system(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }

    pub fn with_limits(mut self, max_tokens: u32, temperature: f32) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }
}

/// Usage and routing metadata for one generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationMeta {
    pub endpoint_used: ModelTier,
    pub model: String,
    pub used_fallback: bool,
    pub latency_ms: u64,
    pub tokens_prompt: u64,
    pub tokens_completion: u64,
}

/// Result of one generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    /// Reasoning trace, when the gateway endpoint returned one
    pub thinking: Option<String>,
    pub meta: GenerationMeta,
}

/// Slot-aware client over the fleet's inference endpoints
pub struct LlmClient {
    slots: Arc<SlotManager>,
    http: reqwest::Client,
    default_timeout: Duration,
    acquire_defaults: AcquireOptions,
}

impl LlmClient {
    pub fn new(slots: Arc<SlotManager>) -> Self {
        Self {
            slots,
            http: reqwest::Client::new(),
            default_timeout: DEFAULT_REQUEST_TIMEOUT,
            acquire_defaults: AcquireOptions::default(),
        }
    }

    /// Override the default request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Override acquisition parameters (tests use short deadlines)
    pub fn with_acquire_options(mut self, options: AcquireOptions) -> Self {
        self.acquire_defaults = options;
        self
    }

    /// Current slot status across all tiers
    pub fn slot_status(&self) -> HashMap<ModelTier, EndpointStatus> {
        self.slots.status()
    }

    /// Generate a completion with automatic slot management.
    ///
    /// Acquires a slot (falling back per the agent's routing when allowed),
    /// sends the dialect-specific request, and releases the slot whichever
    /// way the call ends.
    pub async fn generate(&self, request: GenerationRequest) -> OrchestratorResult<Generation> {
        let mut system_prompt = request.system_prompt.clone();
        if let Some(agent) = &request.agent {
            if !agent.tool_allowlist.is_empty() {
                system_prompt.push_str(&format!(
                    "\n\nRecommended tools: {}",
                    agent.tool_allowlist.join(", ")
                ));
            }
        }

        let fallback_tier = request.agent.as_ref().and_then(|a| a.fallback_tier);
        let acquire = AcquireOptions {
            allow_fallback: request.allow_fallback,
            fallback_tier,
            ..self.acquire_defaults.clone()
        };

        let (actual_tier, acquired) = self.slots.acquire_slot(request.tier, &acquire).await;
        if !acquired {
            return Err(OrchestratorError::Capacity {
                tier: request.tier,
                fallback: fallback_tier,
            });
        }
        // Released on every path out of this scope
        let _slot = SlotGuard {
            slots: &self.slots,
            tier: actual_tier,
        };

        let endpoint = self.slots.registry().get(actual_tier).ok_or_else(|| {
            OrchestratorError::Internal(format!("endpoint missing for tier {actual_tier}"))
        })?;

        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let started = Instant::now();

        let (text, thinking, tokens_prompt, tokens_completion) = match endpoint.dialect {
            Dialect::Native => {
                self.generate_native(&endpoint, &request, &system_prompt, timeout)
                    .await?
            }
            Dialect::Gateway => {
                self.generate_gateway(&endpoint, &request, &system_prompt, timeout)
                    .await?
            }
        };

        let meta = GenerationMeta {
            endpoint_used: actual_tier,
            model: endpoint.model_id.clone(),
            used_fallback: actual_tier != request.tier,
            latency_ms: started.elapsed().as_millis() as u64,
            tokens_prompt,
            tokens_completion,
        };
        debug!(
            tier = %actual_tier,
            latency_ms = meta.latency_ms,
            tokens = meta.tokens_completion,
            "generation complete"
        );

        Ok(Generation {
            text,
            thinking,
            meta,
        })
    }

    /// Generate using an agent's configured tier, prompts, and defaults
    pub async fn generate_for_agent(
        &self,
        agent: &AgentProfile,
        prompt: impl Into<String>,
        context: Option<&str>,
    ) -> OrchestratorResult<Generation> {
        let prompt = prompt.into();
        let full_prompt = match context {
            Some(context) if !context.is_empty() => format!("{context}\n\n{prompt}"),
            _ => prompt,
        };

        self.generate(GenerationRequest {
            tier: agent.primary_tier,
            prompt: full_prompt,
            system_prompt: agent.system_prompt.clone(),
            agent: Some(agent.clone()),
            max_tokens: agent.max_tokens,
            temperature: agent.temperature,
            allow_fallback: agent.fallback_tier.is_some(),
            timeout: None,
        })
        .await
    }

    async fn generate_native(
        &self,
        endpoint: &Endpoint,
        request: &GenerationRequest,
        system_prompt: &str,
        timeout: Duration,
    ) -> OrchestratorResult<(String, Option<String>, u64, u64)> {
        let body = NativeRequest {
            prompt: format!(
                "<|system|>\n{system_prompt}</s>\n<|user|>\n{}</s>\n<|assistant|>\n",
                request.prompt
            ),
            n_predict: request.max_tokens,
            temperature: request.temperature,
            top_p: 0.9,
            stop: vec!["</s>", "<|user|>", "<|system|>"],
            stream: false,
        };

        let url = format!("{}/completion", endpoint.base_url.trim_end_matches('/'));
        let response: NativeResponse = self.post_json(&url, &body, timeout).await?;

        Ok((
            response.content,
            None,
            response.tokens_evaluated,
            response.tokens_predicted,
        ))
    }

    async fn generate_gateway(
        &self,
        endpoint: &Endpoint,
        request: &GenerationRequest,
        system_prompt: &str,
        timeout: Duration,
    ) -> OrchestratorResult<(String, Option<String>, u64, u64)> {
        let body = GatewayRequest {
            model: endpoint.model_id.clone(),
            prompt: request.prompt.clone(),
            system: system_prompt.to_string(),
            stream: false,
            options: GatewayOptions {
                num_predict: request.max_tokens,
                temperature: request.temperature,
                think: endpoint.thinking.map(|t| t.as_str()),
            },
        };

        let url = format!("{}/api/generate", endpoint.base_url.trim_end_matches('/'));
        let response: GatewayResponse = self.post_json(&url, &body, timeout).await?;

        Ok((
            response.response,
            response.thinking,
            response.prompt_eval_count,
            response.eval_count,
        ))
    }

    async fn post_json<B, R>(&self, url: &str, body: &B, timeout: Duration) -> OrchestratorResult<R>
    where
        B: Serialize,
        R: serde::de::DeserializeOwned,
    {
        let response = self
            .http
            .post(url)
            .timeout(timeout)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            error!(%url, %status, "inference request failed");
            return Err(OrchestratorError::Protocol(format!(
                "HTTP {status} from {url}"
            )));
        }

        Ok(response.json::<R>().await?)
    }
}

/// Releases the held slot when dropped, whichever way the call exits
struct SlotGuard<'a> {
    slots: &'a SlotManager,
    tier: ModelTier,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.slots.release_slot(self.tier);
    }
}

#[derive(Serialize)]
struct NativeRequest<'a> {
    prompt: String,
    n_predict: u32,
    temperature: f32,
    top_p: f32,
    stop: Vec<&'a str>,
    stream: bool,
}

#[derive(Deserialize)]
struct NativeResponse {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tokens_predicted: u64,
    #[serde(default)]
    tokens_evaluated: u64,
}

#[derive(Serialize)]
struct GatewayRequest {
    model: String,
    prompt: String,
    system: String,
    stream: bool,
    options: GatewayOptions,
}

#[derive(Serialize)]
struct GatewayOptions {
    num_predict: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    think: Option<&'static str>,
}

#[derive(Deserialize)]
struct GatewayResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    eval_count: u64,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    thinking: Option<String>,
}
