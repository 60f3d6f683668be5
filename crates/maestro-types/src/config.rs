use serde::{Deserialize, Serialize};

/// Deadlines propagated from the orchestrator to every outbound call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadlineConfig {
    /// Whole-request budget
    pub request_ms: u64,
    /// Per LLM call
    pub llm_ms: u64,
    /// Per tool call
    pub tool_ms: u64,
}

impl Default for DeadlineConfig {
    fn default() -> Self {
        Self {
            request_ms: 300_000,
            llm_ms: 30_000,
            tool_ms: 30_000,
        }
    }
}
