// Session Orchestrator
// One request lifecycle: load memories, plan through the fallback layer,
// execute tasks in dependency order, write the turn back to memory, return
// an aggregate result. The outer boundary never propagates errors.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use maestro_agents::{
    parse_extracted_memories, scheduler, PlanningAgent, SubAgentManager, GENERAL_PURPOSE,
};
use maestro_fallback::{
    with_deadline, Alternative, FallbackContext, FallbackManager, FallbackOutcome, Strategy,
};
use maestro_memory::{MemoryManager, MemoryStore, StoreMemoryRequest};
use maestro_observability::EventBus;
use maestro_providers::{ChatMessage, LlmOptions, LlmProvider};
use maestro_tools::{ToolRegistry, VirtualFs};
use maestro_types::{
    Component, CoreError, DeadlineConfig, FinalResult, MemoryKind, Plan, PlanMetadata, Session,
    SessionMemories, SubAgentRecord, SubAgentResult, TaskStatus,
};

mod config;

pub use config::{RequestInput, RuntimeConfig};

pub struct Orchestrator {
    provider: Arc<dyn LlmProvider>,
    memory: Arc<MemoryManager>,
    fallback: Arc<FallbackManager>,
    planner: PlanningAgent,
    sub_agents: Arc<SubAgentManager>,
    events: EventBus,
    deadlines: DeadlineConfig,
    llm_options: LlmOptions,
    search: maestro_memory::SearchContextOptions,
}

impl Orchestrator {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        store: Arc<dyn MemoryStore>,
        tools: ToolRegistry,
        config: RuntimeConfig,
    ) -> Arc<Self> {
        let events = EventBus::new();
        let memory = Arc::new(MemoryManager::new(
            store,
            config.memory.clone(),
            events.clone(),
        ));
        let fallback = Arc::new(FallbackManager::new(config.fallback.clone(), events.clone()));

        let sub_agents = Arc::new(SubAgentManager::new(
            Arc::clone(&provider),
            Arc::clone(&fallback),
            Arc::clone(&memory),
            tools.clone(),
            events.clone(),
            config.deadlines.clone(),
            config.llm_options.clone(),
            config.extra_sub_agents.clone(),
        ));
        let planner = PlanningAgent::new(
            Arc::clone(&provider),
            Arc::clone(&fallback),
            Arc::clone(&memory),
            tools,
            events.clone(),
            config.deadlines.clone(),
            config.llm_options.clone(),
            sub_agents.roster().to_vec(),
        );

        Arc::new(Self {
            provider,
            memory,
            fallback,
            planner,
            sub_agents,
            events,
            deadlines: config.deadlines,
            llm_options: config.llm_options,
            search: config.search,
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    pub fn sub_agents(&self) -> &Arc<SubAgentManager> {
        &self.sub_agents
    }

    /// Start background memory maintenance. Call once from within a runtime.
    pub fn start_maintenance(self: &Arc<Self>) {
        self.memory.start_maintenance();
    }

    /// Stop background work. The orchestrator stays usable for requests.
    pub fn close(&self) {
        self.memory.close();
    }

    /// Drive one request to completion. Never returns an error: any residual
    /// failure becomes `{success: false, error, duration}`.
    pub async fn handle_request(&self, input: RequestInput) -> FinalResult {
        let started = Instant::now();
        let outcome = with_deadline(self.deadlines.request_ms, self.run_turn(input)).await;
        match outcome {
            Ok(result) => result,
            Err(error) => {
                tracing::error!(error = %error, "request failed at the outer boundary");
                FinalResult {
                    success: false,
                    response: String::new(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    memories_stored: 0,
                    sub_agents_used: Vec::new(),
                    todos_completed: 0,
                    files: HashMap::new(),
                    degraded: false,
                    error: Some(error.to_string()),
                }
            }
        }
    }

    async fn run_turn(&self, input: RequestInput) -> Result<FinalResult, CoreError> {
        let started = Instant::now();

        let mut session = Session::new(input.user_id, input.request);
        if let Some(session_id) = input.session_id {
            session.id = session_id;
        }
        session.files = input.files.clone();
        let virtual_fs = VirtualFs::from_snapshot(input.files);

        // An empty request short-circuits: nothing to plan or execute.
        if session.request.trim().is_empty() {
            session.response = "Please tell me what you would like me to do.".to_string();
            let memories_stored = self.persist_turn(&session, false).await?;
            return Ok(FinalResult {
                success: true,
                response: session.response,
                duration_ms: started.elapsed().as_millis() as u64,
                memories_stored,
                sub_agents_used: Vec::new(),
                todos_completed: 0,
                files: virtual_fs.snapshot().await,
                degraded: false,
                error: None,
            });
        }

        // Memory loading is best-effort: a broken store degrades the turn to
        // contextless execution instead of failing it.
        session.memories = match self
            .memory
            .search_with_context(&session.request, &session.user_id, &self.search)
            .await
        {
            Ok(memories) => memories,
            Err(err) => {
                tracing::warn!(error = %err, "memory load failed, continuing without context");
                SessionMemories::default()
            }
        };

        let (plan, planning_degraded) = self.plan_session(&session).await?;
        match plan {
            Plan::Planned {
                analysis,
                tasks,
                execution_strategy,
                risk_assessment,
            } => {
                session.plan_metadata = Some(PlanMetadata {
                    analysis,
                    execution_strategy,
                    risk_assessment,
                });
                session.todos = tasks;
            }
            Plan::Direct { direct_action, .. } => {
                session.direct_action = Some(direct_action);
            }
        }

        if session.todos.is_empty() {
            self.run_direct(&mut session, &virtual_fs).await;
        } else {
            self.run_todos(&mut session, &virtual_fs).await;
        }

        let successful: Vec<&SubAgentRecord> = session
            .sub_agent_results
            .iter()
            .filter(|r| r.result.success)
            .collect();
        session.response = if successful.is_empty() {
            "I was not able to complete the request.".to_string()
        } else {
            successful
                .iter()
                .map(|r| r.result.result.trim())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join("\n\n")
        };

        // A turn that cannot be recorded is not a success.
        let memories_stored = self.persist_turn(&session, true).await?;

        let sub_agents_used = {
            let mut names: Vec<String> = Vec::new();
            for record in &session.sub_agent_results {
                if !names.contains(&record.result.sub_agent) && !record.result.sub_agent.is_empty()
                {
                    names.push(record.result.sub_agent.clone());
                }
            }
            names
        };
        let todos_completed = session
            .todos
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .count();
        let any_degraded =
            planning_degraded || session.sub_agent_results.iter().any(|r| r.result.degraded);

        Ok(FinalResult {
            success: true,
            response: session.response,
            duration_ms: started.elapsed().as_millis() as u64,
            memories_stored,
            sub_agents_used,
            todos_completed,
            files: virtual_fs.snapshot().await,
            degraded: any_degraded,
            error: None,
        })
    }

    /// Plan through the fallback layer. Degraded mode collapses to a direct
    /// action on the raw request.
    async fn plan_session(&self, session: &Session) -> Result<(Plan, bool), CoreError> {
        let request = session.request.clone();
        let ctx = FallbackContext::<Plan>::new(Component::Planning, "plan_request")
            .with_strategy(Strategy::Degraded)
            .with_degraded(move |err| {
                tracing::warn!(error = %err, "planning degraded to direct action");
                Some(Plan::Direct {
                    direct_action: request.clone(),
                    reason: "planning degraded".to_string(),
                })
            });
        let outcome = self
            .fallback
            .execute(ctx, || self.planner.plan(session))
            .await;
        match outcome {
            FallbackOutcome::Success { value, via } => {
                let degraded = matches!(via, maestro_fallback::RecoveryPath::Degraded);
                Ok((value, degraded))
            }
            FallbackOutcome::Failure { error } => Err(error),
        }
    }

    /// Execute the planned task list sequentially: one task in progress at a
    /// time, dependencies first, blocked bookkeeping in between.
    async fn run_todos(&self, session: &mut Session, virtual_fs: &VirtualFs) {
        // Agent calls only read identity and request context, never todos.
        let session_view = Session {
            todos: Vec::new(),
            ..session.clone()
        };

        loop {
            scheduler::update_blocked(&mut session.todos);
            let Some(index) = scheduler::next_runnable(&session.todos) else {
                break;
            };

            let agent_name = self
                .sub_agents
                .select_agent(&session.todos[index])
                .name
                .clone();
            session.todos[index].transition(TaskStatus::InProgress);
            let task = session.todos[index].clone();

            let result = self
                .execute_task_with_recovery(&agent_name, &task, &session_view, virtual_fs)
                .await;

            let next_status = if result.success {
                TaskStatus::Completed
            } else {
                TaskStatus::Failed
            };
            session.todos[index].transition(next_status);
            session.todos[index].result = Some(result.clone());
            session.sub_agent_results.push(SubAgentRecord {
                task_id: task.id.clone(),
                agent_name: result.sub_agent.clone(),
                result,
                timestamp: Utc::now(),
            });
        }

        scheduler::update_blocked(&mut session.todos);
    }

    /// No task list: run the whole request (or the planner's direct action)
    /// on the general-purpose agent.
    async fn run_direct(&self, session: &mut Session, virtual_fs: &VirtualFs) {
        let action = session
            .direct_action
            .clone()
            .unwrap_or_else(|| session.request.clone());
        let task = maestro_types::Task::new("direct_action", action);
        let session_view = Session {
            todos: Vec::new(),
            ..session.clone()
        };
        let result = self
            .execute_task_with_recovery(GENERAL_PURPOSE, &task, &session_view, virtual_fs)
            .await;
        session.sub_agent_results.push(SubAgentRecord {
            task_id: task.id,
            agent_name: result.sub_agent.clone(),
            result,
            timestamp: Utc::now(),
        });
    }

    /// One task through the sub-agent fallback chain: primary agent, then the
    /// general-purpose alternative, then a synthetic degraded result. Always
    /// yields a SubAgentResult.
    async fn execute_task_with_recovery(
        &self,
        agent_name: &str,
        task: &maestro_types::Task,
        session: &Session,
        virtual_fs: &VirtualFs,
    ) -> SubAgentResult {
        let mut ctx = FallbackContext::<SubAgentResult>::new(Component::SubAgents, "execute_task")
            .with_strategy(Strategy::Alternative);

        if agent_name != GENERAL_PURPOSE {
            let sub_agents = Arc::clone(&self.sub_agents);
            let alt_task = task.clone();
            let alt_session = session.clone();
            let alt_vfs = virtual_fs.clone();
            ctx = ctx.with_alternative(Alternative::new(GENERAL_PURPOSE, move || {
                let sub_agents = Arc::clone(&sub_agents);
                let task = alt_task.clone();
                let session = alt_session.clone();
                let vfs = alt_vfs.clone();
                async move { sub_agents.execute(GENERAL_PURPOSE, &task, &session, &vfs).await }
            }));
        }

        let degraded_agent = agent_name.to_string();
        ctx = ctx.with_degraded(move |err| Some(degraded_result(&degraded_agent, err)));

        let outcome = self
            .fallback
            .execute(ctx, || {
                self.sub_agents
                    .execute(agent_name, task, session, virtual_fs)
            })
            .await;

        match outcome {
            FallbackOutcome::Success { value, .. } => value,
            // Degraded mode disabled: synthesise the failure result anyway so
            // the turn can aggregate partial progress.
            FallbackOutcome::Failure { error } => degraded_result(agent_name, &error),
        }
    }

    /// Write the turn back to memory: one short-term conversation entry plus
    /// LLM-extracted long-term memories. The turn entry is the one write a
    /// successful result depends on; extraction stays best-effort.
    async fn persist_turn(&self, session: &Session, extract: bool) -> Result<usize, CoreError> {
        let mut stored = 0usize;

        let mut turn = StoreMemoryRequest::new(
            &session.user_id,
            MemoryKind::Conversation,
            format!(
                "User: {}\nAssistant: {}",
                session.request, session.response
            ),
        );
        turn.session_id = Some(session.id.clone());
        turn.category = "conversation".to_string();
        turn.metadata.insert(
            "todos_completed".to_string(),
            serde_json::json!(session
                .todos
                .iter()
                .filter(|t| t.status == TaskStatus::Completed)
                .count()),
        );
        turn.metadata.insert(
            "sub_agents_used".to_string(),
            serde_json::json!(session
                .sub_agent_results
                .iter()
                .map(|r| r.result.sub_agent.clone())
                .collect::<Vec<_>>()),
        );
        turn.metadata.insert(
            "files".to_string(),
            serde_json::json!(session.files.keys().collect::<Vec<_>>()),
        );
        self.memory
            .add_short_term_memory(turn)
            .await
            .map_err(CoreError::from)?;
        stored += 1;

        if extract {
            stored += self.extract_long_term_memories(session).await;
        }
        Ok(stored)
    }

    /// Ask the model which durable facts this turn surfaced, and store them.
    /// Entirely best-effort.
    async fn extract_long_term_memories(&self, session: &Session) -> usize {
        let prompt = format!(
            "## Request\n{}\n\n## Response\n{}\n",
            session.request, session.response
        );
        let messages = vec![
            ChatMessage::system(EXTRACTOR_RUBRIC.to_string()),
            ChatMessage::user(prompt),
        ];

        let provider = Arc::clone(&self.provider);
        let options = self.llm_options.clone();
        let llm_deadline = self.deadlines.llm_ms;
        let outcome = self
            .fallback
            .execute(
                FallbackContext::<String>::new(Component::Llm, "memory_extraction"),
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
                tracing::warn!(error = %error, "memory extraction failed");
                return 0;
            }
        };

        let mut stored = 0usize;
        for extracted in parse_extracted_memories(&raw) {
            if extracted.content.trim().is_empty() {
                continue;
            }
            let kind = extracted
                .kind
                .as_deref()
                .map(MemoryKind::parse)
                .unwrap_or(MemoryKind::ExtractedFact);
            let mut request =
                StoreMemoryRequest::new(&session.user_id, kind, extracted.content.trim());
            request.category = extracted.category.unwrap_or_else(|| "extracted".to_string());
            request.importance = extracted.importance.unwrap_or(0.5).clamp(0.0, 1.0);
            match self.memory.add_long_term_memory(request).await {
                Ok(_) => stored += 1,
                Err(err) => tracing::warn!(error = %err, "failed to store extracted memory"),
            }
        }
        stored
    }
}

fn degraded_result(agent_name: &str, error: &CoreError) -> SubAgentResult {
    SubAgentResult {
        success: false,
        result: String::new(),
        explanation: String::new(),
        tools_used: Vec::new(),
        memory_accessed: 0,
        recommendations: Vec::new(),
        next_steps: String::new(),
        issues: format!("degraded: {error}"),
        execution_time_ms: 0,
        sub_agent: agent_name.to_string(),
        degraded: true,
        error: Some(error.to_string()),
    }
}

const EXTRACTOR_RUBRIC: &str = r#"You extract durable memories from one conversation turn. Return facts, preferences and interests worth remembering about the user beyond this conversation.

## Output Format
Respond with a JSON array (empty if nothing is worth keeping):
[{"type": "fact|preference|interest", "content": "...", "importance": 0.0}]

Rules: only durable information, no restating the request, importance in [0,1]. Output ONLY the JSON array."#;
