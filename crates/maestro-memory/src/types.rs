// Memory Errors and Configuration

use serde::{Deserialize, Serialize};
use thiserror::Error;

use maestro_types::CoreError;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("lock error: {0}")]
    Lock(String),
}

impl From<MemoryError> for CoreError {
    fn from(err: MemoryError) -> Self {
        match err {
            MemoryError::NotFound(what) => CoreError::NotFound(what),
            MemoryError::InvalidConfig(detail) => CoreError::Internal(detail),
            other => CoreError::Transport(other.to_string()),
        }
    }
}

pub type MemoryResult<T> = Result<T, MemoryError>;

/// Memory manager configuration. Built once at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Lifetime of a short-term entry
    pub short_term_retention_ms: u64,
    /// Per-(user, session) short-term cap
    pub max_short_term_memories: usize,
    /// Per-user long-term cap
    pub max_long_term_memories: usize,
    /// Importance floor for short-term to long-term consolidation
    pub consolidation_threshold: f64,
    /// Confidence floor for overwriting an existing preference
    pub preference_update_threshold: f64,
    /// Jaccard similarity at which a long-term insert merges into an
    /// existing entry instead of creating a new one
    pub merge_similarity_threshold: f64,
    pub cleanup_interval_ms: u64,
    pub consolidation_interval_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            short_term_retention_ms: 86_400_000,
            max_short_term_memories: 100,
            max_long_term_memories: 10_000,
            consolidation_threshold: 0.8,
            preference_update_threshold: 0.0,
            merge_similarity_threshold: 0.9,
            cleanup_interval_ms: 3_600_000,
            consolidation_interval_ms: 21_600_000,
        }
    }
}

/// Per-bucket bounds for `search_with_context`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchContextOptions {
    pub short_term_limit: usize,
    pub long_term_limit: usize,
    pub preference_limit: usize,
    pub related_limit: usize,
}

impl Default for SearchContextOptions {
    fn default() -> Self {
        Self {
            short_term_limit: 10,
            long_term_limit: 10,
            preference_limit: 10,
            related_limit: 5,
        }
    }
}
