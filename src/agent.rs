//! Agent profiles and the agent registry
//!
//! Agents are immutable values: a named role with a primary tier, an
//! optional fallback tier, and a soft tool allowlist the adapter surfaces
//! as advisory prompt guidance. Dispatch is by name lookup, never
//! inheritance.

use crate::types::ModelTier;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One specialized agent definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    /// Unique agent identifier; equality is by name
    pub name: String,
    /// Short human-readable role
    pub role: String,
    /// What the planner should route to this agent
    pub expertise: String,
    /// Base system prompt
    pub system_prompt: String,
    pub primary_tier: ModelTier,
    /// Tier tried when the primary is at capacity
    pub fallback_tier: Option<ModelTier>,
    /// Recommended tools; advisory, never enforced
    pub tool_allowlist: Vec<String>,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl PartialEq for AgentProfile {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for AgentProfile {}

impl AgentProfile {
    /// System prompt with the advisory tool sentence appended when the
    /// allowlist is non-empty
    pub fn full_system_prompt(&self) -> String {
        if self.tool_allowlist.is_empty() {
            return self.system_prompt.clone();
        }
        format!(
            "{}\n\nRecommended tools for your tasks: {}. Use these when appropriate; others remain available if needed.",
            self.system_prompt,
            self.tool_allowlist.join(", ")
        )
    }
}

/// Immutable name-keyed agent table
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    agents: HashMap<String, AgentProfile>,
}

/// Agent used when the planner assigns an unknown name
pub const DEFAULT_AGENT: &str = "researcher";

impl AgentRegistry {
    /// The built-in catalog of eight maker-assistant agents
    pub fn builtin() -> Self {
        Self::with_agents(builtin_agents())
    }

    /// Custom catalog, primarily for tests
    pub fn with_agents(agents: Vec<AgentProfile>) -> Self {
        Self {
            agents: agents.into_iter().map(|a| (a.name.clone(), a)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&AgentProfile> {
        self.agents.get(name)
    }

    /// Resolve a planner-assigned name, falling back to the default agent
    pub fn resolve(&self, name: &str) -> Option<&AgentProfile> {
        self.agents.get(name).or_else(|| self.agents.get(DEFAULT_AGENT))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.agents.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn iter(&self) -> impl Iterator<Item = &AgentProfile> {
        self.agents.values()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

fn builtin_agents() -> Vec<AgentProfile> {
    vec![
        AgentProfile {
            name: "researcher".into(),
            role: "Research Specialist".into(),
            expertise: "Web search, document analysis, source tracking, fact verification".into(),
            system_prompt: "You are the workshop's research agent. Search thoroughly with the \
available tools, cross-check claims against multiple sources, cite what you find, and search \
again to close any gaps you notice. Never invent information; say so when uncertain."
                .into(),
            primary_tier: ModelTier::Q4Tools,
            fallback_tier: None,
            tool_allowlist: vec![
                "web_search".into(),
                "fetch_page".into(),
                "vision.image_search".into(),
            ],
            max_tokens: 2048,
            temperature: 0.3,
        },
        AgentProfile {
            name: "reasoner".into(),
            role: "Deep Reasoning Specialist".into(),
            expertise: "Multi-step analysis, synthesis across sources, critical evaluation".into(),
            system_prompt: "You are the workshop's reasoning agent, running with thinking mode. \
Work step by step, weigh alternative explanations, and combine the other agents' outputs into \
coherent conclusions. Challenge weak assumptions and call out logical gaps."
                .into(),
            primary_tier: ModelTier::DeepReason,
            fallback_tier: Some(ModelTier::Q4Tools),
            tool_allowlist: vec![],
            max_tokens: 4096,
            temperature: 0.5,
        },
        AgentProfile {
            name: "cad_designer".into(),
            role: "CAD Generation Specialist".into(),
            expertise: "Parametric modeling, organic shapes, fabrication constraints".into(),
            system_prompt: "You are the workshop's CAD design agent. Always give explicit \
dimensions (metric preferred), account for printability (overhangs, supports, bed adhesion), \
choose organic generation for freeform shapes and parametric generation for precise geometry, \
and use reference images to improve organic results."
                .into(),
            primary_tier: ModelTier::Q4Tools,
            fallback_tier: None,
            tool_allowlist: vec![
                "cad.generate_model".into(),
                "vision.image_search".into(),
                "vision.store_selection".into(),
            ],
            max_tokens: 2048,
            temperature: 0.4,
        },
        AgentProfile {
            name: "fabricator".into(),
            role: "Fabrication Engineer".into(),
            expertise: "3D printing, slicing, material selection, printer routing".into(),
            system_prompt: "You are the workshop's fabrication agent. Check models for \
printability before submitting, pick the printer by part size, material, and queue depth, \
set slicer parameters for the chosen material, and estimate print time and filament use."
                .into(),
            primary_tier: ModelTier::Q4Tools,
            fallback_tier: None,
            tool_allowlist: vec![
                "fabrication.open_in_slicer".into(),
                "fabrication.submit_job".into(),
                "fabrication.check_queue".into(),
            ],
            max_tokens: 2048,
            temperature: 0.2,
        },
        AgentProfile {
            name: "coder".into(),
            role: "Software Engineer".into(),
            expertise: "Code generation, algorithm implementation, CAD scripting".into(),
            system_prompt: "You are the workshop's coding agent. Write clean, documented, \
tested code with typed interfaces, handle edge cases explicitly, and prefer the standard \
library when it suffices. For CAD scripting use parametric code for precise geometry and \
CSG for boolean assemblies."
                .into(),
            primary_tier: ModelTier::Coder,
            fallback_tier: Some(ModelTier::Q4Tools),
            tool_allowlist: vec![],
            max_tokens: 4096,
            temperature: 0.2,
        },
        AgentProfile {
            name: "vision_analyst".into(),
            role: "Visual Analysis Specialist".into(),
            expertise: "Image understanding, print failure detection, reference matching".into(),
            system_prompt: "You are the workshop's vision agent. Inspect images for print \
quality defects (stringing, warping, poor layer adhesion), match references for organic CAD \
generation, and flag first-layer or spaghetti failures from camera frames."
                .into(),
            primary_tier: ModelTier::Vision,
            fallback_tier: None,
            tool_allowlist: vec!["vision.analyze_image".into(), "camera.snapshot".into()],
            max_tokens: 2048,
            temperature: 0.3,
        },
        AgentProfile {
            name: "analyst".into(),
            role: "Data Analyst".into(),
            expertise: "Metrics interpretation, cost analysis, quality scoring".into(),
            system_prompt: "You are the workshop's analyst agent. Report metrics with units \
and context, break down costs across API calls, material, and time, justify any quality \
score you assign, and end with actionable recommendations."
                .into(),
            primary_tier: ModelTier::Q4Tools,
            fallback_tier: None,
            tool_allowlist: vec!["memory.recall".into(), "memory.store".into()],
            max_tokens: 2048,
            temperature: 0.3,
        },
        AgentProfile {
            name: "summarizer".into(),
            role: "Content Summarizer".into(),
            expertise: "Compression, key point extraction, short summaries".into(),
            system_prompt: "You are the workshop's summary agent. Compress content while \
preserving the critical facts, strip redundancy, stay within the token budget, and keep a \
conversational tone suitable for voice output."
                .into(),
            primary_tier: ModelTier::Summary,
            fallback_tier: None,
            tool_allowlist: vec![],
            max_tokens: 512,
            temperature: 0.3,
        },
    ]
}
