// Runtime Events
// Typed observability events published on the event bus. Subscribers are
// informational only; correctness never depends on delivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Component;
use crate::memory::MemoryTier;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    MemoryInserted {
        id: String,
        user_id: String,
        tier: MemoryTier,
        timestamp: DateTime<Utc>,
    },
    MemoryUpdated {
        id: String,
        version: u64,
        timestamp: DateTime<Utc>,
    },
    MemoryDeleted {
        id: String,
        timestamp: DateTime<Utc>,
    },
    MemoriesConsolidated {
        user_id: String,
        count: usize,
        timestamp: DateTime<Utc>,
    },
    MemoriesCleaned {
        count: usize,
        timestamp: DateTime<Utc>,
    },
    PlanningCreated {
        session_id: String,
        task_count: usize,
        timestamp: DateTime<Utc>,
    },
    SubAgentCompleted {
        name: String,
        duration_ms: u64,
        success: bool,
        timestamp: DateTime<Utc>,
    },
    CircuitOpened {
        component: Component,
        timestamp: DateTime<Utc>,
    },
    CircuitClosed {
        component: Component,
        timestamp: DateTime<Utc>,
    },
}

impl RuntimeEvent {
    /// Stable event name matching the published contract
    pub fn name(&self) -> &'static str {
        match self {
            RuntimeEvent::MemoryInserted { .. } => "memory.inserted",
            RuntimeEvent::MemoryUpdated { .. } => "memory.updated",
            RuntimeEvent::MemoryDeleted { .. } => "memory.deleted",
            RuntimeEvent::MemoriesConsolidated { .. } => "memories.consolidated",
            RuntimeEvent::MemoriesCleaned { .. } => "memories.cleaned",
            RuntimeEvent::PlanningCreated { .. } => "planning.created",
            RuntimeEvent::SubAgentCompleted { .. } => "subAgent.completed",
            RuntimeEvent::CircuitOpened { .. } => "circuit.opened",
            RuntimeEvent::CircuitClosed { .. } => "circuit.closed",
        }
    }
}
