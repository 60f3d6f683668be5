// Session Data Model
// In-memory state for one user request, from arrival to final response

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::memory::MemoryEntry;
use crate::task::{SubAgentResult, Task};

/// Memory snapshots loaded at turn start
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMemories {
    pub short_term: Vec<MemoryEntry>,
    pub long_term: Vec<MemoryEntry>,
    pub preferences: Vec<MemoryEntry>,
    /// Entries referenced by the union's relationship edges
    pub related: Vec<MemoryEntry>,
}

impl SessionMemories {
    pub fn total(&self) -> usize {
        self.short_term.len() + self.long_term.len() + self.preferences.len() + self.related.len()
    }
}

/// Planner metadata carried alongside the task list
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanMetadata {
    pub analysis: String,
    pub execution_strategy: String,
    pub risk_assessment: String,
}

/// One sub-agent execution recorded against a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentRecord {
    pub task_id: String,
    pub agent_name: String,
    pub result: SubAgentResult,
    pub timestamp: DateTime<Utc>,
}

/// Per-request state. Owned by a single orchestrator call; never shared
/// across requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub request: String,
    /// Virtual filesystem snapshot, filename -> content
    #[serde(default)]
    pub files: HashMap<String, String>,
    #[serde(default)]
    pub memories: SessionMemories,
    #[serde(default)]
    pub todos: Vec<Task>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_metadata: Option<PlanMetadata>,
    #[serde(default)]
    pub sub_agent_results: Vec<SubAgentRecord>,
    #[serde(default)]
    pub response: String,
    pub started_at: DateTime<Utc>,
    /// Set when planning was bypassed or degraded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direct_action: Option<String>,
}

impl Session {
    pub fn new(user_id: impl Into<String>, request: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            request: request.into(),
            files: HashMap::new(),
            memories: SessionMemories::default(),
            todos: Vec::new(),
            plan_metadata: None,
            sub_agent_results: Vec::new(),
            response: String::new(),
            started_at: Utc::now(),
            direct_action: None,
        }
    }
}

/// Aggregate outcome returned to the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalResult {
    pub success: bool,
    pub response: String,
    pub duration_ms: u64,
    #[serde(default)]
    pub memories_stored: usize,
    #[serde(default)]
    pub sub_agents_used: Vec<String>,
    #[serde(default)]
    pub todos_completed: usize,
    #[serde(default)]
    pub files: HashMap<String, String>,
    /// True when the turn ran through the degraded escape hatch
    #[serde(default)]
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
