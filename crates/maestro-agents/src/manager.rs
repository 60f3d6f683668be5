// Sub-Agent Manager
// Selects an agent for a task, builds its quarantined context, runs the LLM,
// parses the structured result, executes allow-listed tool calls, and keeps
// per-agent statistics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use maestro_fallback::{with_deadline, FallbackContext, FallbackManager, FallbackOutcome};
use maestro_memory::{MemoryManager, SearchContextOptions};
use maestro_observability::EventBus;
use maestro_providers::{ChatMessage, LlmOptions, LlmProvider};
use maestro_tools::{ToolContext, ToolRegistry, VirtualFs};
use maestro_types::{
    Component, CoreError, DeadlineConfig, RuntimeEvent, Session, SessionMemories, SubAgentResult,
    Task,
};

use crate::parse::{parse_sub_agent_output, ParsedToolCall};
use crate::subagent::{built_in_sub_agents, classify_task, SubAgentSpec, GENERAL_PURPOSE};

/// Running statistics for one agent. Updated atomically behind the manager's
/// lock; safe under concurrent sessions.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentStats {
    pub tasks_executed: u64,
    pub successes: u64,
    pub avg_execution_ms: f64,
}

impl AgentStats {
    pub fn success_rate(&self) -> f64 {
        if self.tasks_executed == 0 {
            0.0
        } else {
            self.successes as f64 / self.tasks_executed as f64
        }
    }

    fn record(&mut self, success: bool, execution_ms: u64) {
        self.tasks_executed += 1;
        if success {
            self.successes += 1;
        }
        let n = self.tasks_executed as f64;
        self.avg_execution_ms += (execution_ms as f64 - self.avg_execution_ms) / n;
    }
}

pub struct SubAgentManager {
    agents: Vec<SubAgentSpec>,
    provider: Arc<dyn LlmProvider>,
    fallback: Arc<FallbackManager>,
    memory: Arc<MemoryManager>,
    tools: ToolRegistry,
    events: EventBus,
    deadlines: DeadlineConfig,
    llm_options: LlmOptions,
    stats: RwLock<HashMap<String, AgentStats>>,
}

impl SubAgentManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        fallback: Arc<FallbackManager>,
        memory: Arc<MemoryManager>,
        tools: ToolRegistry,
        events: EventBus,
        deadlines: DeadlineConfig,
        llm_options: LlmOptions,
        extra_agents: Vec<SubAgentSpec>,
    ) -> Self {
        let mut agents = built_in_sub_agents();
        for extra in extra_agents {
            // Config-supplied agents override built-ins of the same name.
            agents.retain(|a| a.name != extra.name);
            agents.push(extra);
        }
        Self {
            agents,
            provider,
            fallback,
            memory,
            tools,
            events,
            deadlines,
            llm_options,
            stats: RwLock::new(HashMap::new()),
        }
    }

    pub fn roster(&self) -> &[SubAgentSpec] {
        &self.agents
    }

    pub fn agent(&self, name: &str) -> Option<&SubAgentSpec> {
        self.agents.iter().find(|a| a.name == name)
    }

    /// Explicit assignment wins when it names a registered agent; otherwise
    /// keyword classification; general-purpose as the default.
    pub fn select_agent(&self, task: &Task) -> &SubAgentSpec {
        if let Some(assigned) = task.assigned_sub_agent.as_deref() {
            if let Some(agent) = self.agent(assigned) {
                return agent;
            }
            tracing::debug!(assigned, "assigned sub-agent not registered, classifying");
        }
        let classified = classify_task(&task.content);
        self.agent(classified)
            .or_else(|| self.agent(GENERAL_PURPOSE))
            .unwrap_or(&self.agents[0])
    }

    pub async fn stats_for(&self, name: &str) -> Option<AgentStats> {
        self.stats.read().await.get(name).cloned()
    }

    /// Run one task on the named agent. Infrastructure failures (LLM down,
    /// timeout, circuit open) surface as errors so the caller's fallback
    /// chain can engage; non-conforming model output never does.
    pub async fn execute(
        &self,
        agent_name: &str,
        task: &Task,
        session: &Session,
        virtual_fs: &VirtualFs,
    ) -> Result<SubAgentResult, CoreError> {
        let agent = self
            .agent(agent_name)
            .ok_or_else(|| CoreError::NotFound(format!("sub-agent `{agent_name}`")))?;
        let started = Instant::now();

        // Context quarantine: each task gets its own bounded memory view.
        let context = match self
            .memory
            .search_with_context(&task.content, &session.user_id, &SearchContextOptions::default())
            .await
        {
            Ok(context) => context,
            Err(err) => {
                tracing::warn!(error = %err, "memory context unavailable, continuing without");
                SessionMemories::default()
            }
        };

        let allowed_tools: Vec<_> = self
            .tools
            .get_all()
            .await
            .into_iter()
            .filter(|schema| agent.allows_tool(&schema.name))
            .collect();
        let files = virtual_fs.inventory().await;

        let mut prompt = format!("## Task\n{}\n", task.content);
        if !task.success_criteria.is_empty() {
            prompt.push_str(&format!("\n## Success Criteria\n{}\n", task.success_criteria));
        }
        if !allowed_tools.is_empty() {
            prompt.push_str("\n## Available Tools\n");
            for schema in &allowed_tools {
                prompt.push_str(&format!("- {}: {}\n", schema.name, schema.description));
            }
        }
        if !files.is_empty() {
            prompt.push_str("\n## Workspace Files\n");
            for file in &files {
                prompt.push_str(&format!("- {} ({} bytes)\n", file.name, file.size));
            }
        }
        push_memory_context(&mut prompt, &context);

        let messages = vec![
            ChatMessage::system(agent.system_prompt.clone()),
            ChatMessage::user(prompt),
        ];

        let provider = Arc::clone(&self.provider);
        let options = self.llm_options.clone();
        let llm_deadline = self.deadlines.llm_ms;
        let outcome = self
            .fallback
            .execute(
                FallbackContext::<String>::new(Component::Llm, "sub_agent_completion"),
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
            FallbackOutcome::Failure { error } => {
                self.record_stats(&agent.name, false, started.elapsed().as_millis() as u64)
                    .await;
                return Err(error);
            }
        };

        let parsed = parse_sub_agent_output(&raw);
        let mut result = parsed.result;
        result.sub_agent = agent.name.clone();
        result.memory_accessed = context.total();

        self.run_tool_calls(agent, &parsed.tool_calls, session, virtual_fs, &mut result)
            .await;

        result.execution_time_ms = started.elapsed().as_millis() as u64;
        self.record_stats(&agent.name, result.success, result.execution_time_ms)
            .await;
        self.events.publish(RuntimeEvent::SubAgentCompleted {
            name: agent.name.clone(),
            duration_ms: result.execution_time_ms,
            success: result.success,
            timestamp: Utc::now(),
        });

        Ok(result)
    }

    /// Execute requested tool calls. Calls outside the allow-list are
    /// rejected here without reaching the registry.
    async fn run_tool_calls(
        &self,
        agent: &SubAgentSpec,
        calls: &[ParsedToolCall],
        session: &Session,
        virtual_fs: &VirtualFs,
        result: &mut SubAgentResult,
    ) {
        if calls.is_empty() {
            return;
        }
        let ctx = ToolContext::new(session.id.clone(), session.user_id.clone())
            .with_virtual_fs(virtual_fs.clone());

        for call in calls {
            if !agent.allows_tool(&call.name) {
                tracing::warn!(agent = %agent.name, tool = %call.name, "tool outside allow-list rejected");
                append_issue(
                    &mut result.issues,
                    &format!("tool `{}` is not allowed for this agent", call.name),
                );
                continue;
            }

            let executed = with_deadline(self.deadlines.tool_ms, async {
                self.tools
                    .execute(&call.name, call.params.clone(), &ctx)
                    .await
                    .map_err(CoreError::from)
            })
            .await;

            match executed {
                Ok(output) => {
                    result.tools_used.push(call.name.clone());
                    let rendered = render_tool_output(&output);
                    if !rendered.is_empty() {
                        if !result.result.is_empty() {
                            result.result.push('\n');
                        }
                        result.result.push_str(&format!("[{}] {}", call.name, rendered));
                    }
                }
                Err(err) => {
                    tracing::warn!(tool = %call.name, error = %err, "tool call failed");
                    append_issue(&mut result.issues, &format!("tool `{}` failed: {err}", call.name));
                }
            }
        }
    }

    async fn record_stats(&self, name: &str, success: bool, execution_ms: u64) {
        let mut stats = self.stats.write().await;
        stats
            .entry(name.to_string())
            .or_default()
            .record(success, execution_ms);
    }
}

fn push_memory_context(prompt: &mut String, context: &SessionMemories) {
    if !context.preferences.is_empty() {
        prompt.push_str("\n## User Preferences\n");
        for entry in &context.preferences {
            prompt.push_str(&format!("- {}\n", entry.content));
        }
    }
    if !context.long_term.is_empty() {
        prompt.push_str("\n## Relevant Context\n");
        for entry in &context.long_term {
            prompt.push_str(&format!("- {}\n", entry.content));
        }
    }
    if !context.short_term.is_empty() {
        prompt.push_str("\n## Recent Conversation\n");
        for entry in &context.short_term {
            prompt.push_str(&format!("- {}\n", entry.content));
        }
    }
    if !context.related.is_empty() {
        prompt.push_str("\n## Related Notes\n");
        for entry in &context.related {
            prompt.push_str(&format!("- {}\n", entry.content));
        }
    }
}

fn append_issue(issues: &mut String, note: &str) {
    if !issues.is_empty() {
        issues.push_str("; ");
    }
    issues.push_str(note);
}

fn render_tool_output(output: &serde_json::Value) -> String {
    if let Some(rendered) = output.get("rendered").and_then(|v| v.as_str()) {
        return rendered.to_string();
    }
    if let Some(text) = output.as_str() {
        return text.to_string();
    }
    output.to_string()
}
