pub mod config;
pub mod error;
pub mod event;
pub mod memory;
pub mod plan;
pub mod session;
pub mod task;

pub use config::DeadlineConfig;
pub use error::{Component, CoreError};
pub use event::RuntimeEvent;
pub use memory::{
    MemoryEntry, MemoryKind, MemoryRelationship, MemoryStats, MemoryTier, RelationKind,
};
pub use plan::Plan;
pub use session::{FinalResult, PlanMetadata, Session, SessionMemories, SubAgentRecord};
pub use task::{SubAgentResult, Task, TaskPriority, TaskStatus};
