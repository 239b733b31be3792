//! Core types for the fleet orchestration runtime
//!
//! Provides the tier/dialect vocabulary, subtask records with status
//! tracking, per-run metrics, and the cancellation flag threaded through
//! goal execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Logical endpoint identity. Maps 1-to-1 to a concrete inference server
/// when running.
///
/// - `Q4Tools`: fast tool calling and planning
/// - `DeepReason`: deep reasoning with thinking mode
/// - `Vision`: multimodal image analysis
/// - `Coder`: code generation
/// - `Summary`: compression and short summaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Q4Tools,
    DeepReason,
    Vision,
    Coder,
    Summary,
}

impl ModelTier {
    /// All tiers, in registry order
    pub const ALL: [ModelTier; 5] = [
        ModelTier::Q4Tools,
        ModelTier::DeepReason,
        ModelTier::Vision,
        ModelTier::Coder,
        ModelTier::Summary,
    ];

    /// Stable lowercase identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Q4Tools => "q4_tools",
            ModelTier::DeepReason => "deep_reason",
            ModelTier::Vision => "vision",
            ModelTier::Coder => "coder",
            ModelTier::Summary => "summary",
        }
    }

    /// Filesystem-safe slug used for PID and log file names
    pub fn slug(&self) -> &'static str {
        match self {
            ModelTier::Q4Tools => "q4-tools",
            ModelTier::DeepReason => "deep-reason",
            ModelTier::Vision => "vision",
            ModelTier::Coder => "coder",
            ModelTier::Summary => "summary",
        }
    }

    /// Uppercase prefix for environment keys (`<TIER>_BASE_URL`, ...)
    pub fn env_prefix(&self) -> &'static str {
        match self {
            ModelTier::Q4Tools => "Q4_TOOLS",
            ModelTier::DeepReason => "DEEP_REASON",
            ModelTier::Vision => "VISION",
            ModelTier::Coder => "CODER",
            ModelTier::Summary => "SUMMARY",
        }
    }
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire dialect spoken by an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// llama.cpp-style `POST /completion`, health at `GET /health`
    Native,
    /// Ollama-style `POST /api/generate`, health at `GET /api/tags`
    Gateway,
}

/// Thinking effort requested from gateway endpoints that support it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingEffort {
    Low,
    Medium,
    High,
}

impl ThinkingEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThinkingEffort::Low => "low",
            ThinkingEffort::Medium => "medium",
            ThinkingEffort::High => "high",
        }
    }
}

/// Status of a subtask in the execution pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    /// Terminal states never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }
}

/// One node in the decomposed goal DAG, executed by a single adapter call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    /// Identifier stable within a run (e.g. "task_1")
    pub id: String,
    /// What this task should accomplish
    pub description: String,
    /// Agent name responsible for execution
    pub assigned_agent: String,
    /// Task ids that must reach a terminal state before this task starts
    pub depends_on: Vec<String>,
    pub status: TaskStatus,
    /// Output from successful execution
    pub result: Option<String>,
    /// Error message if the task failed or was skipped
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub latency_ms: u64,
    pub tokens_prompt: u64,
    pub tokens_completion: u64,
    /// Tier that actually served the call
    pub endpoint_used: Option<ModelTier>,
    pub used_fallback: bool,
}

impl SubTask {
    /// Create a pending task
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        assigned_agent: impl Into<String>,
        depends_on: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            assigned_agent: assigned_agent.into(),
            depends_on,
            status: TaskStatus::Pending,
            result: None,
            error: None,
            started_at: None,
            finished_at: None,
            latency_ms: 0,
            tokens_prompt: 0,
            tokens_completion: 0,
            endpoint_used: None,
            used_fallback: false,
        }
    }

    /// Transition to Running with a start timestamp
    pub fn mark_started(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Transition to Completed with result and usage
    pub fn mark_completed(&mut self, result: String) {
        self.status = TaskStatus::Completed;
        self.finished_at = Some(Utc::now());
        self.result = Some(result);
    }

    /// Transition to Failed with an error message
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error.into());
    }

    /// Transition to Skipped with a reason
    pub fn mark_skipped(&mut self, reason: impl Into<String>) {
        self.status = TaskStatus::Skipped;
        self.finished_at = Some(Utc::now());
        self.error = Some(reason.into());
    }
}

/// Timestamped entry in a run's execution log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Severity of an execution-log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        }
    }
}

/// Aggregated metrics for one goal run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetrics {
    pub total_duration_ms: u64,
    pub total_tokens: u64,
    pub total_tasks: usize,
    pub completed: usize,
    pub failed: usize,
    /// Number of topological layers executed
    pub parallel_batches: usize,
    pub avg_task_latency_ms: f64,
    pub max_task_latency_ms: u64,
    /// Distinct tiers that served at least one task
    pub endpoints_used: Vec<String>,
    /// Tasks that landed on a fallback tier
    pub fallback_count: usize,
}

impl RunMetrics {
    /// Aggregate metrics from a finished task list
    pub fn from_tasks(tasks: &[SubTask], total_duration_ms: u64, parallel_batches: usize) -> Self {
        let completed = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        let failed = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Failed)
            .count();

        let latencies: Vec<u64> = tasks
            .iter()
            .filter(|t| t.latency_ms > 0)
            .map(|t| t.latency_ms)
            .collect();
        let avg_latency = if latencies.is_empty() {
            0.0
        } else {
            latencies.iter().sum::<u64>() as f64 / latencies.len() as f64
        };
        let max_latency = latencies.iter().copied().max().unwrap_or(0);

        let mut endpoints: Vec<String> = tasks
            .iter()
            .filter_map(|t| t.endpoint_used.map(|tier| tier.to_string()))
            .collect();
        endpoints.sort();
        endpoints.dedup();

        Self {
            total_duration_ms,
            total_tokens: tasks
                .iter()
                .map(|t| t.tokens_prompt + t.tokens_completion)
                .sum(),
            total_tasks: tasks.len(),
            completed,
            failed,
            parallel_batches,
            avg_task_latency_ms: avg_latency,
            max_task_latency_ms: max_latency,
            endpoints_used: endpoints,
            fallback_count: tasks.iter().filter(|t| t.used_fallback).count(),
        }
    }
}

/// Result of one goal run. Not persisted by the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalRun {
    pub run_id: Uuid,
    pub goal: String,
    pub tasks: Vec<SubTask>,
    /// Synthesized answer, or an explicitly marked concatenation when
    /// synthesis failed
    pub final_output: String,
    /// Short voice-friendly summary, when requested and successful
    pub voice_summary: Option<String>,
    pub metrics: RunMetrics,
    pub execution_log: Vec<LogEntry>,
}

/// Cooperative cancellation flag for a goal run.
///
/// Cheap to clone; the orchestrator checks it between batches. In-flight
/// tasks run to completion, pending tasks are skipped.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    inner: Arc<AtomicBool>,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }
}
