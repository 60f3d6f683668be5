use serde::{Deserialize, Serialize};

use crate::task::Task;

/// Output of the planning agent. Either the request is simple enough to run
/// directly, or it decomposes into an ordered task list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "needs_planning", rename_all = "snake_case")]
pub enum Plan {
    #[serde(rename = "false")]
    Direct {
        direct_action: String,
        #[serde(default)]
        reason: String,
    },
    #[serde(rename = "true")]
    Planned {
        #[serde(default)]
        analysis: String,
        tasks: Vec<Task>,
        #[serde(default)]
        execution_strategy: String,
        #[serde(default)]
        risk_assessment: String,
    },
}

impl Plan {
    pub fn needs_planning(&self) -> bool {
        matches!(self, Plan::Planned { .. })
    }

    pub fn tasks(&self) -> &[Task] {
        match self {
            Plan::Direct { .. } => &[],
            Plan::Planned { tasks, .. } => tasks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direct_plan_has_no_tasks() {
        let plan = Plan::Direct {
            direct_action: "answer inline".to_string(),
            reason: "trivial request".to_string(),
        };
        assert!(!plan.needs_planning());
        assert!(plan.tasks().is_empty());
    }
}
