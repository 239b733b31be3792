//! Parallel task orchestrator
//!
//! The decompose → execute → synthesize pipeline:
//! 1. Decompose: ask the planner tier to break a goal into a DAG of
//!    subtasks assigned to specialized agents
//! 2. Execute: run ready tasks concurrently under the global semaphore and
//!    per-endpoint slot limits, layer by layer
//! 3. Synthesize: combine results into one answer, plus an optional short
//!    voice summary
//!
//! Execution is fail-soft: a failed task is recorded and the run
//! continues; downstream tasks see an explicit failure sentinel instead of
//! blocking. Results are never fabricated for a failed task.

use crate::agent::{AgentRegistry, DEFAULT_AGENT};
use crate::client::{GenerationRequest, LlmClient};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::types::{
    CancelFlag, GoalRun, LogEntry, LogLevel, ModelTier, RunMetrics, SubTask, TaskStatus,
};
use futures::future::join_all;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Tier used for goal decomposition
const PLANNER_TIER: ModelTier = ModelTier::Q4Tools;
/// Tier used for final synthesis
const SYNTHESIS_TIER: ModelTier = ModelTier::DeepReason;
/// Tier used for the voice summary
const SUMMARY_TIER: ModelTier = ModelTier::Summary;

/// Upstream result excerpt length in task prompts
const DEP_EXCERPT_CHARS: usize = 1500;
/// Per-task excerpt length in the synthesis prompt
const SYNTH_EXCERPT_CHARS: usize = 2000;
/// Input excerpt length for the voice summary
const SUMMARY_INPUT_CHARS: usize = 3000;

/// Options for one goal run
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Hard clamp on planner output
    pub max_tasks: usize,
    /// Pre-seeded results, keyed like task ids
    pub context: HashMap<String, String>,
    pub cancel: Option<CancelFlag>,
    /// Produce the short voice summary after synthesis
    pub voice_summary: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            max_tasks: 6,
            context: HashMap::new(),
            cancel: None,
            voice_summary: true,
        }
    }
}

/// Scheduler for decomposed goal DAGs
pub struct TaskOrchestrator {
    agents: Arc<AgentRegistry>,
    client: Arc<LlmClient>,
    semaphore: Arc<Semaphore>,
    max_parallel: usize,
}

impl TaskOrchestrator {
    pub fn new(agents: Arc<AgentRegistry>, client: Arc<LlmClient>, max_parallel: usize) -> Self {
        let max_parallel = max_parallel.max(1);
        Self {
            agents,
            client,
            semaphore: Arc::new(Semaphore::new(max_parallel)),
            max_parallel,
        }
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Full pipeline for one goal. Always returns a run object; every
    /// failure inside the run is recorded on it rather than raised.
    pub async fn execute_goal(&self, goal: &str, options: ExecuteOptions) -> GoalRun {
        let started = Instant::now();
        let mut log = RunLog::default();
        log.info(format!(
            "starting goal run: {}",
            excerpt(goal, 100)
        ));

        let mut tasks = self.decompose(goal, options.max_tasks, &mut log).await;
        let mut results = options.context.clone();
        let batches = self
            .run_batches(&mut tasks, &mut results, options.cancel.as_ref(), &mut log)
            .await;

        let final_output = self.synthesize(goal, &tasks, &results, &mut log).await;
        let voice_summary = if options.voice_summary {
            self.voice_summary(&final_output, &mut log).await
        } else {
            None
        };

        let metrics = RunMetrics::from_tasks(&tasks, started.elapsed().as_millis() as u64, batches);
        log.info(format!(
            "goal run complete: {}/{} tasks in {} batches, {} tokens",
            metrics.completed, metrics.total_tasks, metrics.parallel_batches, metrics.total_tokens
        ));

        GoalRun {
            run_id: Uuid::new_v4(),
            goal: goal.to_string(),
            tasks,
            final_output,
            voice_summary,
            metrics,
            execution_log: log.entries,
        }
    }

    /// Ask the planner for a task DAG; fall back to a keyword template
    /// when the response is unusable
    async fn decompose(&self, goal: &str, max_tasks: usize, log: &mut RunLog) -> Vec<SubTask> {
        log.info(format!("decomposing goal into at most {max_tasks} tasks"));

        let mut agent_lines: Vec<String> = self
            .agents
            .iter()
            .map(|a| format!("- {}: {}", a.name, a.expertise))
            .collect();
        agent_lines.sort();

        let prompt = format!(
            "Decompose this goal into {max_tasks} or fewer specific subtasks.\n\
Maximize parallelism by minimizing dependencies where possible.\n\
Assign each task to the most appropriate agent.\n\n\
Goal: {goal}\n\n\
Available agents:\n{}\n\n\
Rules:\n\
1. Tasks with no dependencies can run in parallel\n\
2. Only add a dependency if its output is truly required\n\
3. Use 'reasoner' for final synthesis tasks\n\
4. Use 'researcher' for any web lookups\n\n\
Respond with ONLY a JSON array:\n\
[\n\
  {{\"id\": \"task_1\", \"description\": \"...\", \"assigned_agent\": \"researcher\", \"depends_on\": []}},\n\
  {{\"id\": \"task_2\", \"description\": \"...\", \"assigned_agent\": \"reasoner\", \"depends_on\": [\"task_1\"]}}\n\
]",
            agent_lines.join("\n")
        );

        let request = GenerationRequest::new(PLANNER_TIER, prompt)
            .with_system("You are a task planning expert. Output valid JSON only.")
            .with_limits(1024, 0.3);

        let tasks = match self.client.generate(request).await {
            Ok(generation) => match parse_plan(&generation.text) {
                Ok(planned) => self.validate_plan(planned, goal, max_tasks, log),
                Err(err) => {
                    log.warning(format!(
                        "decomposition unparseable, falling back to template plan: {err}"
                    ));
                    fallback_plan(goal)
                }
            },
            Err(err) => {
                log.warning(format!(
                    "decomposition failed, falling back to template plan: {err}"
                ));
                fallback_plan(goal)
            }
        };

        let tasks = if tasks.is_empty() {
            log.warning("decomposition produced no tasks, falling back to template plan".into());
            fallback_plan(goal)
        } else {
            tasks
        };

        for task in &tasks {
            let deps = if task.depends_on.is_empty() {
                " (parallel)".to_string()
            } else {
                format!(" (needs: {})", task.depends_on.join(", "))
            };
            log.info(format!(
                "  task {}: {} -> {}{}",
                task.id,
                excerpt(&task.description, 50),
                task.assigned_agent,
                deps
            ));
        }

        tasks
    }

    /// Enforce id uniqueness, known agents, known dependency references,
    /// and the max_tasks clamp
    fn validate_plan(
        &self,
        planned: Vec<PlannedTask>,
        goal: &str,
        max_tasks: usize,
        log: &mut RunLog,
    ) -> Vec<SubTask> {
        if planned.len() > max_tasks {
            log.warning(format!(
                "planner returned {} tasks, clamping to {max_tasks}",
                planned.len()
            ));
        }

        let mut seen = HashSet::new();
        let mut tasks: Vec<SubTask> = Vec::new();

        for (index, entry) in planned.into_iter().take(max_tasks).enumerate() {
            let id = entry
                .id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| format!("task_{}", index + 1));
            if !seen.insert(id.clone()) {
                log.warning(format!("duplicate task id {id}, dropping"));
                continue;
            }

            let mut agent = entry.assigned_agent.unwrap_or_default();
            if self.agents.get(&agent).is_none() {
                log.warning(format!(
                    "unknown agent {agent:?} for task {id}, assigning {DEFAULT_AGENT}"
                ));
                agent = DEFAULT_AGENT.to_string();
            }

            let description = entry
                .description
                .filter(|d| !d.is_empty())
                .unwrap_or_else(|| goal.to_string());

            tasks.push(SubTask::new(id, description, agent, entry.depends_on));
        }

        // Dependency references must point at another task in this plan
        let ids: HashSet<String> = tasks.iter().map(|t| t.id.clone()).collect();
        for task in &mut tasks {
            let before = task.depends_on.len();
            task.depends_on.retain(|dep| ids.contains(dep));
            if task.depends_on.len() < before {
                log.warning(format!(
                    "task {} referenced unknown dependencies, dropped",
                    task.id
                ));
            }
        }

        tasks
    }

    /// Execute the DAG layer by layer. Returns the number of batches run.
    async fn run_batches(
        &self,
        tasks: &mut [SubTask],
        results: &mut HashMap<String, String>,
        cancel: Option<&CancelFlag>,
        log: &mut RunLog,
    ) -> usize {
        let mut completed: HashSet<String> = results.keys().cloned().collect();
        let mut batches = 0;

        loop {
            let pending: Vec<usize> = tasks
                .iter()
                .enumerate()
                .filter(|(_, t)| t.status == TaskStatus::Pending)
                .map(|(i, _)| i)
                .collect();
            if pending.is_empty() {
                break;
            }

            if cancel.map(|c| c.is_cancelled()).unwrap_or(false) {
                log.warning("cancellation requested, skipping remaining tasks".into());
                for index in pending {
                    tasks[index].mark_skipped("cancelled");
                }
                break;
            }

            let ready: Vec<usize> = pending
                .iter()
                .copied()
                .filter(|&i| {
                    tasks[i]
                        .depends_on
                        .iter()
                        .all(|dep| completed.contains(dep))
                })
                .collect();

            if ready.is_empty() {
                log.warning("no ready tasks remain, dependency cycle detected".into());
                for index in pending {
                    tasks[index].mark_skipped("blocked by cycle");
                }
                break;
            }

            batches += 1;
            let ids: Vec<&str> = ready.iter().map(|&i| tasks[i].id.as_str()).collect();
            log.info(format!("batch {batches}: [{}]", ids.join(", ")));

            for &index in &ready {
                tasks[index].mark_started();
            }

            let mut calls = Vec::with_capacity(ready.len());
            for &index in &ready {
                let task = &tasks[index];
                let agent = self.agents.resolve(&task.assigned_agent).cloned();
                let agent_name = task.assigned_agent.clone();
                let prompt = build_task_prompt(task, results);
                let client = Arc::clone(&self.client);
                let semaphore = Arc::clone(&self.semaphore);

                calls.push(async move {
                    let Some(agent) = agent else {
                        let err = OrchestratorError::Internal(format!(
                            "no agent registered for {agent_name}"
                        ));
                        return (Err(err), 0);
                    };
                    // Global parallelism cap, independent of DAG width
                    let _permit = semaphore.acquire().await.ok();
                    let call_started = Instant::now();
                    let outcome = client.generate_for_agent(&agent, prompt, None).await;
                    (outcome, call_started.elapsed().as_millis() as u64)
                });
            }

            let outcomes = join_all(calls).await;
            for (&index, (outcome, latency_ms)) in ready.iter().zip(outcomes) {
                let id = tasks[index].id.clone();
                tasks[index].latency_ms = latency_ms;
                match outcome {
                    Ok(generation) => {
                        tasks[index].tokens_prompt = generation.meta.tokens_prompt;
                        tasks[index].tokens_completion = generation.meta.tokens_completion;
                        tasks[index].endpoint_used = Some(generation.meta.endpoint_used);
                        tasks[index].used_fallback = generation.meta.used_fallback;
                        tasks[index].mark_completed(generation.text.clone());
                        log.info(format!(
                            "  task {id} completed in {latency_ms}ms via {}",
                            generation.meta.endpoint_used
                        ));
                        results.insert(id.clone(), generation.text);
                    }
                    Err(err) => {
                        let reason = match &err {
                            OrchestratorError::Capacity { .. } => "no_capacity".to_string(),
                            other => other.to_string(),
                        };
                        tasks[index].mark_failed(reason.as_str());
                        log.error(format!("  task {id} failed: {err}"));
                        // Downstream tasks see explicit failure context
                        results.insert(id.clone(), format!("[task failed: {reason}]"));
                    }
                }
                completed.insert(id);
            }
        }

        batches
    }

    /// One synthesis call over all task results; degrades to an explicitly
    /// marked concatenation on failure
    async fn synthesize(
        &self,
        goal: &str,
        tasks: &[SubTask],
        results: &HashMap<String, String>,
        log: &mut RunLog,
    ) -> String {
        log.info("synthesizing results".into());

        let results_text: String = tasks
            .iter()
            .filter_map(|task| {
                results
                    .get(&task.id)
                    .map(|result| format!("### {}\n{}", task.id, excerpt(result, SYNTH_EXCERPT_CHARS)))
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let prompt = format!(
            "Synthesize these task results into one comprehensive, actionable answer.\n\n\
## Original Goal\n{goal}\n\n\
## Task Results\n{results_text}\n\n\
## Instructions\n\
1. Integrate all findings into a coherent response\n\
2. Resolve contradictions between sources\n\
3. Highlight key insights and recommendations\n\
4. Be thorough but concise\n\n\
## Final Answer"
        );

        let request = GenerationRequest::new(SYNTHESIS_TIER, prompt)
            .with_system("You are the synthesis agent. Create unified, insightful responses.")
            .with_limits(4096, 0.5);

        match self.client.generate(request).await {
            Ok(generation) => {
                log.info(format!(
                    "synthesis complete ({}ms)",
                    generation.meta.latency_ms
                ));
                generation.text
            }
            Err(err) => {
                log.warning(format!("synthesis failed, returning concatenation: {err}"));
                format!("Synthesis failed: {err}\n\n{results_text}")
            }
        }
    }

    /// Short voice-friendly summary; failures degrade to None
    async fn voice_summary(&self, final_output: &str, log: &mut RunLog) -> Option<String> {
        let request = GenerationRequest::new(
            SUMMARY_TIER,
            format!(
                "Summarize this for voice output (2-3 sentences, conversational):\n\n{}",
                excerpt(final_output, SUMMARY_INPUT_CHARS)
            ),
        )
        .with_system("Create brief, natural summaries suitable for speech.")
        .with_limits(256, 0.4);

        match self.client.generate(request).await {
            Ok(generation) => Some(generation.text),
            Err(err) => {
                log.warning(format!("voice summary failed: {err}"));
                None
            }
        }
    }
}

/// Task description plus truncated upstream results
fn build_task_prompt(task: &SubTask, results: &HashMap<String, String>) -> String {
    let context_parts: Vec<String> = task
        .depends_on
        .iter()
        .filter_map(|dep| {
            results
                .get(dep)
                .map(|result| format!("### {dep} result:\n{}", excerpt(result, DEP_EXCERPT_CHARS)))
        })
        .collect();

    if context_parts.is_empty() {
        format!(
            "{}\n\nProvide a thorough, actionable response.",
            task.description
        )
    } else {
        format!(
            "{}\n\nContext from previous tasks:\n{}\n\nProvide a thorough, actionable response.",
            task.description,
            context_parts.join("\n\n")
        )
    }
}

/// Planner output entry, parsed leniently
#[derive(Debug, Deserialize)]
struct PlannedTask {
    id: Option<String>,
    description: Option<String>,
    assigned_agent: Option<String>,
    #[serde(default)]
    depends_on: Vec<String>,
}

/// Extract and parse the first JSON array in a planner response. Planners
/// routinely wrap the array in prose.
fn parse_plan(response: &str) -> OrchestratorResult<Vec<PlannedTask>> {
    let array = extract_json_array(response)
        .ok_or_else(|| OrchestratorError::Plan("no JSON array found".into()))?;
    serde_json::from_str::<Vec<PlannedTask>>(array)
        .map_err(|err| OrchestratorError::Plan(err.to_string()))
}

/// Slice out the first bracket-balanced JSON array, honoring strings
fn extract_json_array(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'[' if !in_string => depth += 1,
            b']' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Deterministic three-task plan used when the planner output is unusable
fn fallback_plan(goal: &str) -> Vec<SubTask> {
    let lowered = goal.to_lowercase();
    let matches = |keywords: &[&str]| keywords.iter().any(|kw| lowered.contains(kw));

    if matches(&["code", "implement", "program", "script"]) {
        vec![
            SubTask::new(
                "task_1",
                format!("Research best practices for: {goal}"),
                "researcher",
                vec![],
            ),
            SubTask::new(
                "task_2",
                format!("Implement a code solution for: {goal}"),
                "coder",
                vec![],
            ),
            SubTask::new(
                "task_3",
                "Synthesize research and code into a final answer",
                "reasoner",
                vec!["task_1".into(), "task_2".into()],
            ),
        ]
    } else if matches(&["design", "cad", "model", "print", "3d"]) {
        vec![
            SubTask::new(
                "task_1",
                format!("Search for reference designs: {goal}"),
                "researcher",
                vec![],
            ),
            SubTask::new(
                "task_2",
                format!("Generate a CAD model for: {goal}"),
                "cad_designer",
                vec!["task_1".into()],
            ),
            SubTask::new(
                "task_3",
                "Analyze printability and recommend settings",
                "fabricator",
                vec!["task_2".into()],
            ),
        ]
    } else {
        vec![
            SubTask::new("task_1", format!("Research: {goal}"), "researcher", vec![]),
            SubTask::new(
                "task_2",
                "Analyze and structure the findings",
                "analyst",
                vec!["task_1".into()],
            ),
            SubTask::new(
                "task_3",
                "Synthesize into a comprehensive answer",
                "reasoner",
                vec!["task_2".into()],
            ),
        ]
    }
}

/// Char-boundary-safe prefix of at most `max_chars` characters
fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Execution log shared between tracing output and the run object
#[derive(Default)]
struct RunLog {
    entries: Vec<LogEntry>,
}

impl RunLog {
    fn info(&mut self, message: String) {
        info!("{message}");
        self.entries.push(LogEntry::new(LogLevel::Info, message));
    }

    fn warning(&mut self, message: String) {
        warn!("{message}");
        self.entries.push(LogEntry::new(LogLevel::Warning, message));
    }

    fn error(&mut self, message: String) {
        error!("{message}");
        self.entries.push(LogEntry::new(LogLevel::Error, message));
    }
}
