// Task Data Model
// Planner-produced todos and the structured sub-agent result contract

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    High,
    Medium,
    Low,
}

impl Default for TaskPriority {
    fn default() -> Self {
        TaskPriority::Medium
    }
}

/// State of a task within one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Blocked,
    Cancelled,
}

impl TaskStatus {
    /// Legal transitions: pending -> in_progress -> {completed, failed};
    /// any -> cancelled; blocked <-> pending.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (_, Cancelled) => true,
            (Pending, InProgress) => true,
            (Pending, Blocked) => true,
            (Blocked, Pending) => true,
            (InProgress, Completed) => true,
            (InProgress, Failed) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// A unit of work produced by the planner and executed by one sub-agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Stable within a session
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub priority: TaskPriority,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_sub_agent: Option<String>,
    #[serde(default)]
    pub required_tools: Vec<String>,
    /// Ids of tasks that must be completed before this one may start
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub success_criteria: String,
    #[serde(default)]
    pub estimated_duration: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<SubAgentResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            content: content.into(),
            priority: TaskPriority::Medium,
            status: TaskStatus::Pending,
            assigned_sub_agent: None,
            required_tools: Vec::new(),
            dependencies: Vec::new(),
            success_criteria: String::new(),
            estimated_duration: String::new(),
            result: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a transition, bumping `updated_at`. Illegal transitions are
    /// refused and the task is left unchanged.
    pub fn transition(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = Utc::now();
        true
    }
}

/// Structured result returned by a sub-agent execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentResult {
    pub success: bool,
    pub result: String,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub tools_used: Vec<String>,
    #[serde(default)]
    pub memory_accessed: usize,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub next_steps: String,
    #[serde(default)]
    pub issues: String,
    #[serde(default)]
    pub execution_time_ms: u64,
    #[serde(default)]
    pub sub_agent: String,
    /// Set when the result came from a degraded handler rather than the agent
    #[serde(default)]
    pub degraded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubAgentResult {
    pub fn failure(sub_agent: impl Into<String>, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            success: false,
            result: String::new(),
            explanation: String::new(),
            tools_used: Vec::new(),
            memory_accessed: 0,
            recommendations: Vec::new(),
            next_steps: String::new(),
            issues: error.clone(),
            execution_time_ms: 0,
            sub_agent: sub_agent.into(),
            degraded: false,
            error: Some(error),
        }
    }
}
