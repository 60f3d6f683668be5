// Error Taxonomy
// Typed failures consumed by the fallback layer and surfaced to callers

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Component identity, used for per-component fallback strategies and
/// circuit breakers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Llm,
    Memory,
    Tools,
    Planning,
    SubAgents,
    Orchestrator,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Llm => "llm",
            Component::Memory => "memory",
            Component::Tools => "tools",
            Component::Planning => "planning",
            Component::SubAgents => "sub_agents",
            Component::Orchestrator => "orchestrator",
        }
    }
}

impl std::fmt::Display for Component {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The shared error taxonomy. Components map their own failures into this
/// set at the fallback boundary; nothing above that boundary sees raw
/// transport/storage errors.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum CoreError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("operation timed out after {0}ms")]
    Timeout(u64),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("unparseable model output: {0}")]
    InvalidOutput(String),

    #[error("invalid tool parameters: {0}")]
    InvalidParameters(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("circuit open for component {0}")]
    CircuitOpen(Component),

    #[error("not found: {0}")]
    NotFound(String),

    /// Informational: a memory insert was merged into an existing entry
    #[error("conflict resolved by merge: {0}")]
    ConflictResolved(String),

    /// Informational: a synthetic result was produced by a degraded handler
    #[error("degraded result: {0}")]
    DegradedResult(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Short stable name for events and result metadata
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Transport(_) => "transport",
            CoreError::Timeout(_) => "timeout",
            CoreError::RateLimited(_) => "rate_limited",
            CoreError::InvalidOutput(_) => "invalid_output",
            CoreError::InvalidParameters(_) => "invalid_parameters",
            CoreError::UnknownTool(_) => "unknown_tool",
            CoreError::Unauthorized(_) => "unauthorized",
            CoreError::CircuitOpen(_) => "circuit_open",
            CoreError::NotFound(_) => "not_found",
            CoreError::ConflictResolved(_) => "conflict_resolved",
            CoreError::DegradedResult(_) => "degraded_result",
            CoreError::Internal(_) => "internal",
        }
    }

    /// Whether a retry has any chance of succeeding. Schema and parse
    /// failures are deterministic and are not retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Transport(_) | CoreError::Timeout(_) | CoreError::RateLimited(_)
        )
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(CoreError::Transport("reset".into()).is_retryable());
        assert!(CoreError::Timeout(30_000).is_retryable());
        assert!(CoreError::RateLimited("429".into()).is_retryable());
        assert!(!CoreError::InvalidOutput("garbage".into()).is_retryable());
        assert!(!CoreError::CircuitOpen(Component::Llm).is_retryable());
    }

    #[test]
    fn error_serializes_with_kind_tag() {
        let err = CoreError::UnknownTool("frobnicate".into());
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "unknown_tool");
    }
}
