// Sub-Agent Definitions
// Flat data-parameterised agents: a name, a prompt, a tool allow-list and a
// priority. Specialisation lives in the prompt and the allow-list, not in a
// type hierarchy.

use serde::{Deserialize, Serialize};

/// One sub-agent definition. `tool_allow_list` entries are tool names; the
/// single entry "*" grants every registered tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentSpec {
    pub name: String,
    pub description: String,
    pub system_prompt: String,
    pub tool_allow_list: Vec<String>,
    pub priority: u32,
}

impl SubAgentSpec {
    pub fn allows_tool(&self, tool: &str) -> bool {
        self.tool_allow_list
            .iter()
            .any(|entry| entry == "*" || entry == tool)
    }
}

pub const GENERAL_PURPOSE: &str = "general-purpose";

const OUTPUT_CONTRACT: &str = r#"## Output Format
Respond with a single JSON object:
{
  "success": true or false,
  "result": "the main deliverable, as text",
  "explanation": "brief note on how you got there",
  "tool_calls": [{"name": "tool_name", "params": { ... }}],
  "recommendations": ["optional follow-ups"],
  "next_steps": "what should happen next, if anything",
  "issues": "problems encountered, empty if none"
}
Output ONLY the JSON object."#;

fn spec(
    name: &str,
    description: &str,
    focus: &str,
    tool_allow_list: &[&str],
    priority: u32,
) -> SubAgentSpec {
    SubAgentSpec {
        name: name.to_string(),
        description: description.to_string(),
        system_prompt: format!(
            "You are the {name} sub-agent in a multi-agent system.\n{focus}\n\n{OUTPUT_CONTRACT}"
        ),
        tool_allow_list: tool_allow_list.iter().map(|t| t.to_string()).collect(),
        priority,
    }
}

/// The built-in roster.
pub fn built_in_sub_agents() -> Vec<SubAgentSpec> {
    vec![
        spec(
            GENERAL_PURPOSE,
            "Versatile agent for any task",
            "Handle the task directly and completely. Prefer giving a usable answer over deferring.",
            &["*"],
            1,
        ),
        spec(
            "research-agent",
            "Investigates questions and gathers information",
            "Focus on research: gather, weigh and cite relevant information. State what is uncertain.",
            &["*"],
            2,
        ),
        spec(
            "code-agent",
            "Writes, reviews and debugs code",
            "Focus on code: produce working, minimal implementations and explain key decisions.",
            &["*"],
            2,
        ),
        spec(
            "data-agent",
            "Analyses data and performs calculations",
            "Focus on data: compute precisely. Use the calculate tool for arithmetic instead of estimating.",
            &["calculate", "write_todos"],
            2,
        ),
        spec(
            "content-agent",
            "Writes and edits documents and reports",
            "Focus on writing: produce clear, well-structured prose matched to the audience.",
            &["write_todos"],
            2,
        ),
    ]
}

/// Keyword classification for tasks without an explicit assignment.
pub fn classify_task(content: &str) -> &'static str {
    let lower = content.to_lowercase();
    let matches = |keywords: &[&str]| keywords.iter().any(|k| lower.contains(k));

    if matches(&["research", "analyze", "analyse", "investigate", "find out", "look up"]) {
        "research-agent"
    } else if matches(&["code", "program", "debug", "function", "class", "implement", "refactor"]) {
        "code-agent"
    } else if matches(&["data", "statistics", "chart", "calculate", "compute", "sum", "average"]) {
        "data-agent"
    } else if matches(&["write", "edit", "document", "report", "draft", "essay"]) {
        "content-agent"
    } else {
        GENERAL_PURPOSE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_in_roster_contains_the_five_kinds() {
        let names: Vec<String> = built_in_sub_agents().into_iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec![
                "general-purpose",
                "research-agent",
                "code-agent",
                "data-agent",
                "content-agent"
            ]
        );
    }

    #[test]
    fn classification_by_keyword() {
        assert_eq!(classify_task("Research the history of Rust"), "research-agent");
        assert_eq!(classify_task("Debug the parser function"), "code-agent");
        assert_eq!(classify_task("Calculate the quarterly totals"), "data-agent");
        assert_eq!(classify_task("Write a summary report"), "content-agent");
        assert_eq!(classify_task("Say hello"), GENERAL_PURPOSE);
    }

    #[test]
    fn allow_list_wildcard_and_exact_match() {
        let agents = built_in_sub_agents();
        let general = &agents[0];
        assert!(general.allows_tool("calculate"));
        assert!(general.allows_tool("anything"));

        let data = agents.iter().find(|a| a.name == "data-agent").unwrap();
        assert!(data.allows_tool("calculate"));
        assert!(!data.allows_tool("bash"));
    }
}
