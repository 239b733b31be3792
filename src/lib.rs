//! Orchestration runtime for a local multi-model inference fleet
//!
//! forgeflow schedules concurrent work across a heterogeneous set of
//! locally hosted LLM inference servers, keeping them warm on demand and
//! cold when idle:
//!
//! - Per-endpoint slot accounting with backoff and fallback routing
//! - Process supervision of local inference servers (start, health,
//!   graceful stop, restart)
//! - Idle reaping of servers past their inactivity threshold
//! - Parallel DAG orchestration of agent subtasks with fail-soft
//!   execution and synthesis
//!
//! The crate is consumed as a library by outer services; see [`Fleet`]
//! for the one-call wiring of the whole runtime.

pub mod agent;
pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod fleet;
pub mod orchestrator;
pub mod reaper;
pub mod slots;
pub mod supervisor;
pub mod telemetry;
pub mod types;

pub use agent::{AgentProfile, AgentRegistry};
pub use client::{Generation, GenerationMeta, GenerationRequest, LlmClient};
pub use config::{ConfigProvider, EndpointConfig, EnvProvider, FleetConfig, MapProvider, ServerConfig};
pub use endpoint::{Endpoint, EndpointRegistry, EndpointStatus};
pub use error::{OrchestratorError, OrchestratorResult};
pub use fleet::Fleet;
pub use orchestrator::{ExecuteOptions, TaskOrchestrator};
pub use reaper::{IdleReaper, ReaperStatus};
pub use slots::{AcquireOptions, SlotManager};
pub use supervisor::{ProcessSupervisor, ServerStatus};
pub use types::{
    CancelFlag, Dialect, GoalRun, LogEntry, LogLevel, ModelTier, RunMetrics, SubTask, TaskStatus,
    ThinkingEffort,
};
