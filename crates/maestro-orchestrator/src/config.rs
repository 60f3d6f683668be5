use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use maestro_agents::SubAgentSpec;
use maestro_fallback::FallbackConfig;
use maestro_memory::{MemoryConfig, SearchContextOptions};
use maestro_providers::LlmOptions;
use maestro_types::DeadlineConfig;

/// Whole-runtime configuration, assembled once at construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub fallback: FallbackConfig,
    #[serde(default)]
    pub deadlines: DeadlineConfig,
    #[serde(default)]
    pub llm_options: LlmOptions,
    #[serde(default)]
    pub search: SearchContextOptions,
    /// Additional sub-agent definitions beyond the built-in roster
    #[serde(default)]
    pub extra_sub_agents: Vec<SubAgentSpec>,
}

/// One incoming request. `session_id` groups successive turns of a
/// conversation; omitted, each request forms its own session.
#[derive(Debug, Clone)]
pub struct RequestInput {
    pub user_id: String,
    pub session_id: Option<String>,
    pub request: String,
    pub files: HashMap<String, String>,
}

impl RequestInput {
    pub fn new(user_id: impl Into<String>, request: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            session_id: None,
            request: request.into(),
            files: HashMap::new(),
        }
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_file(mut self, name: impl Into<String>, content: impl Into<String>) -> Self {
        self.files.insert(name.into(), content.into());
        self
    }
}
