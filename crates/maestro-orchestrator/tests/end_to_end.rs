// End-to-end scenarios: a full orchestrator wired to the scripted provider
// and an in-memory store, driven through whole request lifecycles.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use maestro_fallback::BreakerConfig;
use maestro_memory::{
    MemoryError, MemoryQuery, MemoryResult, MemoryStore, MemoryUpdate, Predicate, SqliteStore,
};
use maestro_orchestrator::{Orchestrator, RequestInput, RuntimeConfig};
use maestro_providers::{LlmError, ScriptedProvider, ScriptedTurn};
use maestro_tools::ToolRegistry;
use maestro_types::MemoryEntry;

fn fast_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.fallback.retry.max_retries = 1;
    config.fallback.retry.base_delay_ms = 1;
    config.fallback.retry.max_delay_ms = 2;
    config
}

fn orchestrator_with(
    provider: Arc<ScriptedProvider>,
    config: RuntimeConfig,
) -> Arc<Orchestrator> {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    Orchestrator::new(provider, store, ToolRegistry::with_builtins(), config)
}

fn direct_plan(action: &str) -> ScriptedTurn {
    ScriptedTurn::Text(format!(
        r#"{{"needs_planning": false, "direct_action": "{action}", "reason": "simple request"}}"#
    ))
}

fn agent_success(result: &str) -> ScriptedTurn {
    ScriptedTurn::Text(format!(r#"{{"success": true, "result": "{result}"}}"#))
}

fn no_extraction() -> ScriptedTurn {
    ScriptedTurn::Text("[]".to_string())
}

fn llm_down() -> ScriptedTurn {
    ScriptedTurn::Fail(LlmError::Transport("connection refused".to_string()))
}

// ----------------------------------------------------------------------
// Scenario: conversation with preference learning
// ----------------------------------------------------------------------

#[tokio::test]
async fn conversation_remembers_the_users_name() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        // Turn 1: plan, execute, extract.
        direct_plan("Acknowledge the user's name"),
        agent_success("Nice to meet you, Alice!"),
        ScriptedTurn::Text(
            r#"[{"type": "fact", "content": "The user's name is Alice", "importance": 0.9}]"#
                .to_string(),
        ),
        // Turn 2: plan, execute, extract.
        direct_plan("Recall the user's name"),
        agent_success("Your name is Alice."),
        no_extraction(),
    ]));
    let orchestrator = orchestrator_with(Arc::clone(&provider), fast_config());

    let first = orchestrator
        .handle_request(RequestInput::new("u1", "My name is Alice.").in_session("conv-1"))
        .await;
    assert!(first.success);
    assert!(first.memories_stored >= 2);

    // The extracted fact is queryable long-term memory after turn one.
    let remembered = orchestrator
        .memory()
        .search_long_term_memories("u1", "Alice", 10)
        .await
        .unwrap();
    assert!(!remembered.is_empty());
    assert!(remembered[0].content.contains("Alice"));

    let second = orchestrator
        .handle_request(RequestInput::new("u1", "What is my name?").in_session("conv-1"))
        .await;
    assert!(second.success);
    assert!(second.response.contains("Alice"));

    // The stored fact was injected into a later model prompt.
    let prompts = provider.recorded_prompts();
    assert!(prompts
        .iter()
        .any(|p| p.contains("The user's name is Alice")));
}

// ----------------------------------------------------------------------
// Scenario: arithmetic via the calculate tool
// ----------------------------------------------------------------------

#[tokio::test]
async fn arithmetic_runs_through_the_calculate_tool() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedTurn::Text(
            r#"{"needs_planning": true,
                "analysis": "single computation",
                "tasks": [{"id": "t1", "content": "Compute 15 + 27 * 2",
                           "assigned_sub_agent": "data-agent",
                           "required_tools": ["calculate"],
                           "dependencies": [],
                           "success_criteria": "correct value returned"}],
                "execution_strategy": "direct",
                "risk_assessment": "none"}"#
                .to_string(),
        ),
        ScriptedTurn::Text(
            r#"{"success": true, "result": "The result is below.",
                "tool_calls": [{"name": "calculate", "params": {"expression": "15 + 27 * 2"}}]}"#
                .to_string(),
        ),
        no_extraction(),
    ]));
    let orchestrator = orchestrator_with(Arc::clone(&provider), fast_config());

    let result = orchestrator
        .handle_request(RequestInput::new("u1", "Compute 15 + 27 * 2"))
        .await;

    assert!(result.success);
    assert!(result.response.contains("69"));
    assert_eq!(result.todos_completed, 1);
    assert_eq!(result.sub_agents_used, vec!["data-agent"]);

    let stats = orchestrator
        .sub_agents()
        .stats_for("data-agent")
        .await
        .unwrap();
    assert_eq!(stats.tasks_executed, 1);
}

// ----------------------------------------------------------------------
// Scenario: planning decomposition
// ----------------------------------------------------------------------

#[tokio::test]
async fn complex_request_decomposes_into_ordered_tasks() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedTurn::Text(
            r#"{"needs_planning": true,
                "analysis": "full stack to-do app",
                "tasks": [
                  {"id": "schema", "content": "Design the database schema",
                   "assigned_sub_agent": "data-agent", "dependencies": [],
                   "success_criteria": "schema documented"},
                  {"id": "api", "content": "Implement the REST API",
                   "assigned_sub_agent": "code-agent", "dependencies": ["schema"],
                   "success_criteria": "endpoints respond"},
                  {"id": "ui", "content": "Build the React UI",
                   "assigned_sub_agent": "code-agent", "dependencies": ["api"],
                   "success_criteria": "pages render"},
                  {"id": "tests", "content": "Write integration tests",
                   "assigned_sub_agent": "code-agent", "dependencies": ["api", "ui"],
                   "success_criteria": "suite passes"}
                ],
                "execution_strategy": "sequential by dependency",
                "risk_assessment": "moderate"}"#
                .to_string(),
        ),
        agent_success("Schema: todos(id, title, done)."),
        agent_success("API with CRUD endpoints implemented."),
        agent_success("React UI with a task list view."),
        agent_success("Integration tests covering the API and UI."),
        no_extraction(),
    ]));
    let orchestrator = orchestrator_with(Arc::clone(&provider), fast_config());

    let result = orchestrator
        .handle_request(RequestInput::new(
            "u1",
            "Build a to-do app: schema, REST API, React UI, tests.",
        ))
        .await;

    assert!(result.success);
    assert_eq!(result.todos_completed, 4);
    let builtins = [
        "general-purpose",
        "research-agent",
        "code-agent",
        "data-agent",
        "content-agent",
    ];
    assert!(result
        .sub_agents_used
        .iter()
        .all(|name| builtins.contains(&name.as_str())));
    assert!(result.response.contains("Schema"));
    assert!(result.response.contains("Integration tests"));
}

// ----------------------------------------------------------------------
// Scenario: degraded planning
// ----------------------------------------------------------------------

#[tokio::test]
async fn planning_failure_degrades_to_direct_execution() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        // Planning call fails outright (retries exhausted at 1 attempt).
        llm_down(),
        // The general-purpose agent then handles the raw request.
        agent_success("Here is a summary of the attached file."),
        no_extraction(),
    ]));
    let orchestrator = orchestrator_with(Arc::clone(&provider), fast_config());

    let result = orchestrator
        .handle_request(
            RequestInput::new("u1", "Summarise the attached file.")
                .with_file("notes.txt", "long document body"),
        )
        .await;

    assert!(result.success);
    assert!(result.degraded);
    assert!(result.response.contains("summary"));
    assert_eq!(result.sub_agents_used, vec!["general-purpose"]);
    assert_eq!(result.todos_completed, 0);
    assert!(result.files.contains_key("notes.txt"));
}

// ----------------------------------------------------------------------
// Scenario: short-term eviction
// ----------------------------------------------------------------------

#[tokio::test]
async fn short_term_memories_stay_within_the_session_cap() {
    let mut config = fast_config();
    config.memory.max_short_term_memories = 3;

    let mut turns = Vec::new();
    for i in 1..=4 {
        turns.push(direct_plan(&format!("Answer request number {i}")));
        turns.push(agent_success(&format!("Response number {i}")));
        turns.push(no_extraction());
    }
    let provider = Arc::new(ScriptedProvider::new(turns));
    let orchestrator = orchestrator_with(Arc::clone(&provider), config);

    for i in 1..=4 {
        let result = orchestrator
            .handle_request(
                RequestInput::new("u1", format!("Request number {i}")).in_session("conv-evict"),
            )
            .await;
        assert!(result.success, "turn {i} failed: {:?}", result.error);
        // Distinct creation timestamps keep the LRU ordering deterministic.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let remaining = orchestrator
        .memory()
        .get_short_term_memories("u1", Some("conv-evict"), 10)
        .await
        .unwrap();
    assert_eq!(remaining.len(), 3);
    // Everything from the first turn has been evicted.
    assert!(remaining
        .iter()
        .all(|entry| !entry.content.contains("number 1")));
}

// ----------------------------------------------------------------------
// Scenario: circuit breaker on the LLM component
// ----------------------------------------------------------------------

#[tokio::test]
async fn open_llm_circuit_degrades_requests_and_recovers_after_cooldown() {
    let mut config = fast_config();
    config.fallback.breaker = BreakerConfig {
        failure_threshold: 2,
        failure_window_ms: 10_000,
        cooldown_ms: 100,
    };

    // Request A: planning fails (failure 1), the sub-agent call fails
    // (failure 2, breaker opens). Extraction is then rejected by the open
    // circuit without touching the provider.
    let provider = Arc::new(ScriptedProvider::new(vec![llm_down(), llm_down()]));
    let orchestrator = orchestrator_with(Arc::clone(&provider), config);

    let first = orchestrator
        .handle_request(RequestInput::new("u1", "First request"))
        .await;
    assert!(first.success);
    assert!(first.degraded);
    assert_eq!(provider.remaining(), 0);

    // Request B while OPEN: every LLM call is rejected immediately; the
    // scripted provider would fail the test if it were consulted.
    let second = orchestrator
        .handle_request(RequestInput::new("u1", "Second request"))
        .await;
    assert!(second.success);
    assert!(second.degraded);
    assert_eq!(provider.remaining(), 0);

    // After the cooldown a single probe is admitted; success closes the
    // circuit and the request completes normally.
    tokio::time::sleep(std::time::Duration::from_millis(120)).await;
    provider.push(direct_plan("Answer the third request"));
    provider.push(agent_success("All recovered."));
    provider.push(no_extraction());

    let third = orchestrator
        .handle_request(RequestInput::new("u1", "Third request"))
        .await;
    assert!(third.success, "third request failed: {:?}", third.error);
    assert!(!third.degraded);
    assert!(third.response.contains("recovered"));
    assert_eq!(provider.remaining(), 0);
}

// ----------------------------------------------------------------------
// Boundary behaviours
// ----------------------------------------------------------------------

#[tokio::test]
async fn empty_request_succeeds_without_planning() {
    let provider = Arc::new(ScriptedProvider::text(&[]));
    let orchestrator = orchestrator_with(Arc::clone(&provider), fast_config());

    let result = orchestrator
        .handle_request(RequestInput::new("u1", "   "))
        .await;

    assert!(result.success);
    assert!(!result.response.is_empty());
    assert_eq!(result.todos_completed, 0);
    assert!(result.sub_agents_used.is_empty());
    // No LLM call was made at all.
    assert!(provider.recorded_prompts().is_empty());
    // The turn itself was still recorded (O1).
    assert_eq!(result.memories_stored, 1);
}

#[tokio::test]
async fn successful_turn_always_stores_a_short_term_memory() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        direct_plan("Say hello"),
        agent_success("Hello!"),
        no_extraction(),
    ]));
    let orchestrator = orchestrator_with(Arc::clone(&provider), fast_config());

    let result = orchestrator
        .handle_request(RequestInput::new("u1", "hi").in_session("conv-o1"))
        .await;
    assert!(result.success);

    let stored = orchestrator
        .memory()
        .get_short_term_memories("u1", Some("conv-o1"), 10)
        .await
        .unwrap();
    assert!(!stored.is_empty());
    assert!(stored.iter().any(|e| e.content.contains("hi")));
}

/// Store whose inserts always fail; reads and updates pass through, so the
/// turn proceeds normally until the write-back step.
struct BrokenInsertStore {
    inner: SqliteStore,
}

#[async_trait]
impl MemoryStore for BrokenInsertStore {
    async fn insert(&self, _entry: MemoryEntry) -> MemoryResult<String> {
        Err(MemoryError::Lock("simulated write failure".to_string()))
    }

    async fn query(&self, query: &MemoryQuery) -> MemoryResult<Vec<MemoryEntry>> {
        self.inner.query(query).await
    }

    async fn update(&self, id: &str, fields: MemoryUpdate) -> MemoryResult<bool> {
        self.inner.update(id, fields).await
    }

    async fn delete(&self, id: &str) -> MemoryResult<bool> {
        self.inner.delete(id).await
    }

    async fn count(&self, predicates: &[Predicate]) -> MemoryResult<u64> {
        self.inner.count(predicates).await
    }

    async fn find_by_id(&self, id: &str) -> MemoryResult<Option<MemoryEntry>> {
        self.inner.find_by_id(id).await
    }

    async fn touch_accessed(&self, ids: &[String], at: DateTime<Utc>) -> MemoryResult<()> {
        self.inner.touch_accessed(ids, at).await
    }
}

#[tokio::test]
async fn unrecordable_turn_is_reported_as_failure() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        direct_plan("Say hello"),
        agent_success("Hello!"),
    ]));
    let store = Arc::new(BrokenInsertStore {
        inner: SqliteStore::open_in_memory().unwrap(),
    });
    let orchestrator = Orchestrator::new(provider, store, ToolRegistry::with_builtins(), fast_config());

    let result = orchestrator
        .handle_request(RequestInput::new("u1", "hi"))
        .await;

    // The agent answered, but the turn could not be written back: the
    // caller must not see a success with zero stored memories.
    assert!(!result.success);
    assert_eq!(result.memories_stored, 0);
    let error = result.error.expect("error surfaced");
    assert!(error.contains("simulated write failure"));
}

#[tokio::test]
async fn failed_sub_agents_mark_tasks_failed_but_keep_partial_results() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedTurn::Text(
            r#"{"needs_planning": true,
                "tasks": [
                  {"id": "ok", "content": "Easy part", "dependencies": []},
                  {"id": "doomed", "content": "Hard part", "dependencies": []}
                ]}"#
                .to_string(),
        ),
        agent_success("Easy part done."),
        // The second task's agent call fails outright.
        llm_down(),
        no_extraction(),
    ]));
    let orchestrator = orchestrator_with(Arc::clone(&provider), fast_config());

    let result = orchestrator
        .handle_request(RequestInput::new("u1", "One easy and one doomed task"))
        .await;

    assert!(result.success);
    assert_eq!(result.todos_completed, 1);
    assert!(result.response.contains("Easy part done."));
    assert!(result.degraded);
}
