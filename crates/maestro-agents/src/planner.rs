// Planning Agent
// Turns a request plus loaded context into a validated task plan. Parse
// problems degrade to the documented fallback plan; only infrastructure
// failures surface as errors so the orchestrator's degraded mode can engage.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use maestro_fallback::{with_deadline, FallbackContext, FallbackManager, FallbackOutcome};
use maestro_memory::{MemoryManager, StoreMemoryRequest};
use maestro_observability::EventBus;
use maestro_providers::{ChatMessage, LlmOptions, LlmProvider};
use maestro_tools::{ToolContext, ToolRegistry};
use maestro_types::{
    Component, CoreError, DeadlineConfig, MemoryKind, Plan, RuntimeEvent, Session, Task,
};

use crate::parse::{fallback_task, materialize_task, parse_plan, ParsedPlan};
use crate::scheduler;
use crate::subagent::SubAgentSpec;

pub struct PlanningAgent {
    provider: Arc<dyn LlmProvider>,
    fallback: Arc<FallbackManager>,
    memory: Arc<MemoryManager>,
    tools: ToolRegistry,
    events: EventBus,
    deadlines: DeadlineConfig,
    llm_options: LlmOptions,
    roster: Vec<SubAgentSpec>,
}

impl PlanningAgent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        fallback: Arc<FallbackManager>,
        memory: Arc<MemoryManager>,
        tools: ToolRegistry,
        events: EventBus,
        deadlines: DeadlineConfig,
        llm_options: LlmOptions,
        roster: Vec<SubAgentSpec>,
    ) -> Self {
        Self {
            provider,
            fallback,
            memory,
            tools,
            events,
            deadlines,
            llm_options,
            roster,
        }
    }

    /// Produce a plan for the session. Returns an error only when the LLM
    /// itself is unavailable after retries; every parse or validation
    /// problem resolves to a usable plan.
    pub async fn plan(&self, session: &Session) -> Result<Plan, CoreError> {
        let prompt = self.build_prompt(session).await;
        let messages = vec![
            ChatMessage::system(PLANNER_RUBRIC.to_string()),
            ChatMessage::user(prompt),
        ];

        let provider = Arc::clone(&self.provider);
        let options = self.llm_options.clone();
        let llm_deadline = self.deadlines.llm_ms;
        let outcome = self
            .fallback
            .execute(
                FallbackContext::<String>::new(Component::Llm, "planning_completion"),
                move || {
                    let provider = Arc::clone(&provider);
                    let messages = messages.clone();
                    let options = options.clone();
                    async move {
                        with_deadline(llm_deadline, async {
                            provider
                                .complete(messages, &options, CancellationToken::new())
                                .await
                                .map_err(CoreError::from)
                        })
                        .await
                    }
                },
            )
            .await;

        let raw = match outcome {
            FallbackOutcome::Success { value, .. } => value,
            FallbackOutcome::Failure { error } => return Err(error),
        };

        let plan = self.normalise(parse_plan(&raw), session);

        if plan.needs_planning() {
            self.mirror_todos(&plan, session).await;
        }
        self.record_planning_memory(&plan, session).await;
        self.events.publish(RuntimeEvent::PlanningCreated {
            session_id: session.id.clone(),
            task_count: plan.tasks().len(),
            timestamp: Utc::now(),
        });

        Ok(plan)
    }

    /// The degraded shape: execute the raw request directly.
    pub fn degraded_plan(session: &Session) -> Plan {
        Plan::Direct {
            direct_action: session.request.clone(),
            reason: "planning degraded".to_string(),
        }
    }

    async fn build_prompt(&self, session: &Session) -> String {
        let mut prompt = String::new();

        if !session.memories.preferences.is_empty() {
            prompt.push_str("## User Preferences\n");
            for entry in &session.memories.preferences {
                prompt.push_str(&format!("- {}\n", entry.content));
            }
            prompt.push('\n');
        }
        if !session.memories.long_term.is_empty() {
            prompt.push_str("## Long-Term Context\n");
            for entry in &session.memories.long_term {
                prompt.push_str(&format!("- {}\n", entry.content));
            }
            prompt.push('\n');
        }
        if !session.memories.short_term.is_empty() {
            prompt.push_str("## Recent Conversation\n");
            for entry in &session.memories.short_term {
                prompt.push_str(&format!("- {}\n", entry.content));
            }
            prompt.push('\n');
        }

        prompt.push_str("## Sub-Agents\n");
        for agent in &self.roster {
            prompt.push_str(&format!("- {}: {}\n", agent.name, agent.description));
        }

        let tools = self.tools.get_all().await;
        if !tools.is_empty() {
            prompt.push_str("\n## Tools\n");
            for schema in &tools {
                prompt.push_str(&format!("- {}: {}\n", schema.name, schema.description));
            }
        }

        prompt.push_str(&format!("\n## Request\n{}\n", session.request));
        prompt
    }

    /// Normalise a parsed plan into the runtime shape and enforce the DAG
    /// invariants. Anything unusable collapses to the one-task fallback.
    fn normalise(&self, parsed: Option<ParsedPlan>, session: &Session) -> Plan {
        let parsed = parsed.unwrap_or_else(|| {
            tracing::warn!("planner output unusable, substituting fallback task");
            ParsedPlan::Planned {
                analysis: String::new(),
                tasks: vec![fallback_task()],
                execution_strategy: String::new(),
                risk_assessment: String::new(),
            }
        });

        match parsed {
            ParsedPlan::Direct {
                direct_action,
                reason,
            } => Plan::Direct {
                direct_action: if direct_action.trim().is_empty() {
                    session.request.clone()
                } else {
                    direct_action
                },
                reason,
            },
            ParsedPlan::Planned {
                analysis,
                tasks,
                execution_strategy,
                risk_assessment,
            } => {
                let mut materialized: Vec<Task> = tasks
                    .into_iter()
                    .enumerate()
                    .map(|(i, t)| materialize_task(t, i))
                    .collect();
                dedupe_ids(&mut materialized);

                if let Err(err) = scheduler::validate(&materialized) {
                    tracing::warn!(error = %err, "plan failed validation, pruning dependencies");
                    // Most validation failures come from hallucinated or
                    // cyclic dependencies; drop the edges and re-check.
                    for task in materialized.iter_mut() {
                        task.dependencies.clear();
                    }
                    if scheduler::validate(&materialized).is_err() {
                        materialized = vec![materialize_task(fallback_task(), 0)];
                    }
                }

                Plan::Planned {
                    analysis,
                    tasks: materialized,
                    execution_strategy,
                    risk_assessment,
                }
            }
        }
    }

    /// Best-effort mirror of the task list into the write_todos tool.
    async fn mirror_todos(&self, plan: &Plan, session: &Session) {
        if !self.tools.has("write_todos").await {
            return;
        }
        let todos: Vec<_> = plan
            .tasks()
            .iter()
            .map(|t| {
                json!({
                    "id": t.id,
                    "content": t.content,
                    "status": t.status,
                    "priority": t.priority,
                })
            })
            .collect();
        let ctx = ToolContext::new(session.id.clone(), session.user_id.clone());
        if let Err(err) = self
            .tools
            .execute("write_todos", json!({ "todos": todos }), &ctx)
            .await
        {
            tracing::debug!(error = %err, "write_todos mirror failed");
        }
    }

    async fn record_planning_memory(&self, plan: &Plan, session: &Session) {
        let content = match plan {
            Plan::Direct {
                direct_action,
                reason,
            } => format!("Planned direct action: {direct_action} ({reason})"),
            Plan::Planned {
                analysis,
                tasks,
                execution_strategy,
                ..
            } => format!(
                "Planned {} tasks. Analysis: {}. Strategy: {}",
                tasks.len(),
                analysis,
                execution_strategy
            ),
        };
        let mut request =
            StoreMemoryRequest::new(&session.user_id, MemoryKind::PlanningResult, content);
        request.session_id = Some(session.id.clone());
        request.category = "planning".to_string();
        if let Err(err) = self.memory.add_short_term_memory(request).await {
            tracing::warn!(error = %err, "failed to record planning memory");
        }
    }
}

const PLANNER_RUBRIC: &str = r#"You are the planning agent of a multi-agent system. Decompose the user's request into an ordered task list, or decide that no planning is needed.

## Task Quality
- Each task must be achievable by one sub-agent in one call.
- Order tasks logically; express ordering through the dependencies field.
- Assign each task to the most appropriate sub-agent.
- Give every task concrete success criteria.

## Output Format
If the request is trivial, respond with:
{"needs_planning": false, "direct_action": "what to do", "reason": "why"}

Otherwise respond with:
{"needs_planning": true,
 "analysis": "your reading of the request",
 "tasks": [{"id": "task_1", "content": "...", "priority": "high|medium|low",
            "estimated_duration": "...", "assigned_sub_agent": "...",
            "required_tools": [], "dependencies": [], "success_criteria": "..."}],
 "execution_strategy": "...",
 "risk_assessment": "..."}

Output ONLY the JSON object."#;

fn dedupe_ids(tasks: &mut [Task]) {
    let mut seen: HashSet<String> = HashSet::new();
    for task in tasks.iter_mut() {
        let base = task.id.clone();
        let mut candidate = base.clone();
        let mut suffix = 2usize;
        while !seen.insert(candidate.clone()) {
            candidate = format!("{base}_{suffix}");
            suffix += 1;
        }
        task.id = candidate;
    }
}
