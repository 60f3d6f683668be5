// Model Output Parsing
// LLM responses are semi-structured text. Parsing runs in three stages:
// (1) fenced JSON block, (2) whole-payload or brace-sliced JSON, (3) a line
// scraper over a fixed key set. Stage failures fall through; the documented
// fallback shapes mean parsing never panics and never errors.

use serde::Deserialize;

use maestro_types::{SubAgentResult, Task, TaskPriority, TaskStatus};

/// A parsed plan before normalisation
#[derive(Debug, Clone)]
pub enum ParsedPlan {
    Direct {
        direct_action: String,
        reason: String,
    },
    Planned {
        analysis: String,
        tasks: Vec<ParsedTask>,
        execution_strategy: String,
        risk_assessment: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParsedTask {
    #[serde(default)]
    pub id: String,
    #[serde(alias = "description", alias = "title")]
    pub content: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default, alias = "estimatedDuration")]
    pub estimated_duration: String,
    #[serde(default, alias = "assignedSubAgent", alias = "agent")]
    pub assigned_sub_agent: Option<String>,
    #[serde(default, alias = "requiredTools")]
    pub required_tools: Vec<String>,
    #[serde(default, alias = "dependsOn")]
    pub dependencies: Vec<String>,
    #[serde(default, alias = "successCriteria")]
    pub success_criteria: String,
}

#[derive(Debug, Clone, Deserialize)]
struct RawPlan {
    #[serde(default, alias = "needsPlanning")]
    needs_planning: Option<bool>,
    #[serde(default, alias = "directAction")]
    direct_action: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    analysis: Option<String>,
    #[serde(default)]
    tasks: Option<Vec<ParsedTask>>,
    #[serde(default, alias = "executionStrategy")]
    execution_strategy: Option<String>,
    #[serde(default, alias = "riskAssessment")]
    risk_assessment: Option<String>,
}

/// Candidate JSON payloads in decreasing order of confidence: fenced blocks
/// first, then the whole response, then the outermost brace/bracket slices.
fn json_candidates(output: &str) -> Vec<String> {
    let mut candidates = Vec::new();

    for marker in ["```json", "```JSON", "```"] {
        if let Some(start) = output.find(marker) {
            let after = &output[start + marker.len()..];
            if let Some(end) = after.find("```") {
                let block = after[..end].trim();
                if !block.is_empty() {
                    candidates.push(block.to_string());
                }
            }
        }
    }

    candidates.push(output.trim().to_string());

    if let (Some(start), Some(end)) = (output.find('{'), output.rfind('}')) {
        if start < end {
            candidates.push(output[start..=end].to_string());
        }
    }
    if let (Some(start), Some(end)) = (output.find('['), output.rfind(']')) {
        if start < end {
            candidates.push(output[start..=end].to_string());
        }
    }

    candidates
}

/// Parse a planner response. Returns None when no stage produced a usable
/// shape; the caller substitutes the fallback plan.
pub fn parse_plan(output: &str) -> Option<ParsedPlan> {
    for candidate in json_candidates(output) {
        if let Ok(raw) = serde_json::from_str::<RawPlan>(&candidate) {
            if let Some(plan) = raw_plan_to_parsed(raw) {
                return Some(plan);
            }
        }
        // A bare task array is accepted as a planned response.
        if let Ok(tasks) = serde_json::from_str::<Vec<ParsedTask>>(&candidate) {
            if !tasks.is_empty() && tasks.iter().all(|t| !t.content.trim().is_empty()) {
                return Some(ParsedPlan::Planned {
                    analysis: String::new(),
                    tasks,
                    execution_strategy: String::new(),
                    risk_assessment: String::new(),
                });
            }
        }
    }

    scrape_plan(output)
}

fn raw_plan_to_parsed(raw: RawPlan) -> Option<ParsedPlan> {
    match raw.needs_planning {
        Some(false) => Some(ParsedPlan::Direct {
            direct_action: raw.direct_action.unwrap_or_default(),
            reason: raw.reason.unwrap_or_default(),
        }),
        Some(true) => {
            let tasks = raw.tasks.unwrap_or_default();
            if tasks.is_empty() {
                return None;
            }
            Some(ParsedPlan::Planned {
                analysis: raw.analysis.unwrap_or_default(),
                tasks,
                execution_strategy: raw.execution_strategy.unwrap_or_default(),
                risk_assessment: raw.risk_assessment.unwrap_or_default(),
            })
        }
        None => {
            // Untagged payloads still count when they carry a task list or a
            // direct action.
            if let Some(tasks) = raw.tasks {
                if !tasks.is_empty() {
                    return Some(ParsedPlan::Planned {
                        analysis: raw.analysis.unwrap_or_default(),
                        tasks,
                        execution_strategy: raw.execution_strategy.unwrap_or_default(),
                        risk_assessment: raw.risk_assessment.unwrap_or_default(),
                    });
                }
            }
            raw.direct_action.map(|direct_action| ParsedPlan::Direct {
                direct_action,
                reason: raw.reason.unwrap_or_default(),
            })
        }
    }
}

/// Stage three: recognise a fixed key set in free text.
fn scrape_plan(output: &str) -> Option<ParsedPlan> {
    let mut needs_planning: Option<bool> = None;
    let mut direct_action: Option<String> = None;
    let mut analysis: Option<String> = None;

    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(value) = scrape_key(trimmed, &["needsPlanning", "needs_planning"]) {
            needs_planning = Some(value.eq_ignore_ascii_case("true"));
        } else if let Some(value) = scrape_key(trimmed, &["directAction", "direct_action"]) {
            direct_action = Some(value.to_string());
        } else if let Some(value) = scrape_key(trimmed, &["analysis"]) {
            analysis = Some(value.to_string());
        }
    }

    match (needs_planning, direct_action) {
        (Some(false), Some(action)) | (None, Some(action)) => Some(ParsedPlan::Direct {
            direct_action: action,
            reason: "recovered from text response".to_string(),
        }),
        (Some(true), _) => Some(ParsedPlan::Planned {
            analysis: analysis.unwrap_or_default(),
            tasks: vec![fallback_task()],
            execution_strategy: String::new(),
            risk_assessment: String::new(),
        }),
        _ => None,
    }
}

fn scrape_key<'a>(line: &'a str, keys: &[&str]) -> Option<&'a str> {
    for key in keys {
        if let Some(rest) = line.strip_prefix(key) {
            let rest = rest.trim_start();
            if let Some(value) = rest.strip_prefix(':') {
                return Some(value.trim().trim_matches(|c| c == '"' || c == ',' || c == '\''));
            }
        }
        // Quoted key form: "needsPlanning": true
        let quoted = format!("\"{key}\"");
        if let Some(idx) = line.find(&quoted) {
            let rest = &line[idx + quoted.len()..];
            if let Some(value) = rest.trim_start().strip_prefix(':') {
                return Some(value.trim().trim_matches(|c| c == '"' || c == ',' || c == '\''));
            }
        }
    }
    None
}

/// The documented last-resort task when nothing else parses.
pub fn fallback_task() -> ParsedTask {
    ParsedTask {
        id: "task_1".to_string(),
        content: "Process user request".to_string(),
        priority: Some("medium".to_string()),
        estimated_duration: String::new(),
        assigned_sub_agent: Some("general-purpose".to_string()),
        required_tools: Vec::new(),
        dependencies: Vec::new(),
        success_criteria: "The request is addressed".to_string(),
    }
}

pub fn parse_priority(raw: Option<&str>) -> TaskPriority {
    match raw.map(str::to_lowercase).as_deref() {
        Some("high") => TaskPriority::High,
        Some("low") => TaskPriority::Low,
        _ => TaskPriority::Medium,
    }
}

/// Turn a parsed task into the runtime shape: `pending`, fresh timestamps,
/// generated id when absent.
pub fn materialize_task(parsed: ParsedTask, index: usize) -> Task {
    let id = if parsed.id.trim().is_empty() {
        format!("task_{}", index + 1)
    } else {
        parsed.id.trim().to_string()
    };
    let mut task = Task::new(id, parsed.content.trim().to_string());
    task.priority = parse_priority(parsed.priority.as_deref());
    task.status = TaskStatus::Pending;
    task.assigned_sub_agent = parsed
        .assigned_sub_agent
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty());
    task.required_tools = parsed.required_tools;
    task.dependencies = parsed
        .dependencies
        .into_iter()
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
        .collect();
    task.success_criteria = parsed.success_criteria;
    task.estimated_duration = parsed.estimated_duration;
    task
}

// ============================================================================
// Sub-agent result parsing
// ============================================================================

/// A tool invocation requested by a sub-agent response
#[derive(Debug, Clone, Deserialize)]
pub struct ParsedToolCall {
    pub name: String,
    #[serde(default, alias = "arguments", alias = "args")]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
struct RawSubAgentResult {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    explanation: Option<String>,
    #[serde(default, alias = "toolCalls")]
    tool_calls: Vec<ParsedToolCall>,
    #[serde(default)]
    recommendations: Vec<String>,
    #[serde(default, alias = "nextSteps")]
    next_steps: Option<String>,
    #[serde(default)]
    issues: Option<String>,
}

/// Parsed sub-agent output plus any tool invocations it requested.
#[derive(Debug, Clone)]
pub struct ParsedSubAgentOutput {
    pub result: SubAgentResult,
    pub tool_calls: Vec<ParsedToolCall>,
}

/// Never fails: non-conforming output is salvaged as a successful raw-text
/// result with an issue note.
pub fn parse_sub_agent_output(output: &str) -> ParsedSubAgentOutput {
    for candidate in json_candidates(output) {
        let Ok(raw) = serde_json::from_str::<RawSubAgentResult>(&candidate) else {
            continue;
        };
        if raw.success.is_none() && raw.result.is_none() {
            continue;
        }
        let result = SubAgentResult {
            success: raw.success.unwrap_or(true),
            result: raw.result.unwrap_or_default(),
            explanation: raw.explanation.unwrap_or_default(),
            tools_used: Vec::new(),
            memory_accessed: 0,
            recommendations: raw.recommendations,
            next_steps: raw.next_steps.unwrap_or_default(),
            issues: raw.issues.unwrap_or_default(),
            execution_time_ms: 0,
            sub_agent: String::new(),
            degraded: false,
            error: None,
        };
        return ParsedSubAgentOutput {
            result,
            tool_calls: raw.tool_calls,
        };
    }

    // Stage three: success/result lines in free text.
    let mut success: Option<bool> = None;
    let mut result_line: Option<String> = None;
    for line in output.lines() {
        let trimmed = line.trim();
        if let Some(value) = scrape_key(trimmed, &["success"]) {
            success = Some(value.eq_ignore_ascii_case("true"));
        } else if let Some(value) = scrape_key(trimmed, &["result"]) {
            result_line = Some(value.to_string());
        }
    }
    if success.is_some() || result_line.is_some() {
        return ParsedSubAgentOutput {
            result: SubAgentResult {
                success: success.unwrap_or(true),
                result: result_line.unwrap_or_else(|| output.trim().to_string()),
                explanation: String::new(),
                tools_used: Vec::new(),
                memory_accessed: 0,
                recommendations: Vec::new(),
                next_steps: String::new(),
                issues: String::new(),
                execution_time_ms: 0,
                sub_agent: String::new(),
                degraded: false,
                error: None,
            },
            tool_calls: Vec::new(),
        };
    }

    ParsedSubAgentOutput {
        result: SubAgentResult {
            success: true,
            result: output.trim().to_string(),
            explanation: String::new(),
            tools_used: Vec::new(),
            memory_accessed: 0,
            recommendations: Vec::new(),
            next_steps: String::new(),
            issues: "non-conforming output".to_string(),
            execution_time_ms: 0,
            sub_agent: String::new(),
            degraded: false,
            error: None,
        },
        tool_calls: Vec::new(),
    }
}

// ============================================================================
// Long-term memory extraction parsing
// ============================================================================

/// One memory proposed by the extractor rubric
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedMemory {
    #[serde(default, alias = "type")]
    pub kind: Option<String>,
    pub content: String,
    #[serde(default)]
    pub importance: Option<f64>,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct WrappedMemories {
    memories: Vec<ExtractedMemory>,
}

/// Parse the extractor response. Garbage yields an empty list, never an
/// error: missing a memory is preferable to failing a turn.
pub fn parse_extracted_memories(output: &str) -> Vec<ExtractedMemory> {
    for candidate in json_candidates(output) {
        if let Ok(memories) = serde_json::from_str::<Vec<ExtractedMemory>>(&candidate) {
            return memories;
        }
        if let Ok(wrapped) = serde_json::from_str::<WrappedMemories>(&candidate) {
            return wrapped.memories;
        }
    }
    Vec::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_json_plan_parses_first() {
        let output = r#"
Here is the plan you asked for:
```json
{
  "needs_planning": true,
  "analysis": "multi step work",
  "tasks": [
    {"id": "task_1", "content": "Design schema", "priority": "high",
     "assignedSubAgent": "data-agent", "dependencies": [],
     "successCriteria": "schema documented"},
    {"id": "task_2", "content": "Build API", "dependencies": ["task_1"]}
  ],
  "executionStrategy": "sequential",
  "riskAssessment": "low"
}
```
"#;
        let plan = parse_plan(output).expect("plan");
        match plan {
            ParsedPlan::Planned {
                analysis, tasks, ..
            } => {
                assert_eq!(analysis, "multi step work");
                assert_eq!(tasks.len(), 2);
                assert_eq!(tasks[0].assigned_sub_agent.as_deref(), Some("data-agent"));
                assert_eq!(tasks[1].dependencies, vec!["task_1"]);
            }
            ParsedPlan::Direct { .. } => panic!("expected planned"),
        }
    }

    #[test]
    fn whole_payload_direct_plan() {
        let output = r#"{"needsPlanning": false, "directAction": "Just answer inline", "reason": "trivial"}"#;
        let plan = parse_plan(output).expect("plan");
        match plan {
            ParsedPlan::Direct {
                direct_action,
                reason,
            } => {
                assert_eq!(direct_action, "Just answer inline");
                assert_eq!(reason, "trivial");
            }
            ParsedPlan::Planned { .. } => panic!("expected direct"),
        }
    }

    #[test]
    fn text_scraper_recovers_direct_action() {
        let output = "I could not produce JSON.\nneedsPlanning: false\ndirectAction: summarize the file\n";
        let plan = parse_plan(output).expect("plan");
        match plan {
            ParsedPlan::Direct { direct_action, .. } => {
                assert_eq!(direct_action, "summarize the file");
            }
            ParsedPlan::Planned { .. } => panic!("expected direct"),
        }
    }

    #[test]
    fn text_scraper_planned_yields_one_general_task() {
        let output = "needsPlanning: true\nanalysis: needs several steps";
        let plan = parse_plan(output).expect("plan");
        match plan {
            ParsedPlan::Planned { tasks, analysis, .. } => {
                assert_eq!(tasks.len(), 1);
                assert_eq!(tasks[0].assigned_sub_agent.as_deref(), Some("general-purpose"));
                assert_eq!(analysis, "needs several steps");
            }
            ParsedPlan::Direct { .. } => panic!("expected planned"),
        }
    }

    #[test]
    fn hopeless_output_yields_none() {
        assert!(parse_plan("the weather is nice today").is_none());
        assert!(parse_plan("").is_none());
    }

    #[test]
    fn bare_task_array_is_a_plan() {
        let output = r#"[{"id": "a", "content": "do the thing"}]"#;
        let plan = parse_plan(output).expect("plan");
        assert!(matches!(plan, ParsedPlan::Planned { ref tasks, .. } if tasks.len() == 1));
    }

    #[test]
    fn sub_agent_json_with_tool_calls() {
        let output = r#"
```json
{"success": true, "result": "computed below",
 "tool_calls": [{"name": "calculate", "params": {"expression": "15 + 27 * 2"}}]}
```
"#;
        let parsed = parse_sub_agent_output(output);
        assert!(parsed.result.success);
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].name, "calculate");
    }

    #[test]
    fn sub_agent_raw_text_is_salvaged() {
        let parsed = parse_sub_agent_output("Sure! Here is a poem about spring.");
        assert!(parsed.result.success);
        assert_eq!(parsed.result.result, "Sure! Here is a poem about spring.");
        assert_eq!(parsed.result.issues, "non-conforming output");
        assert!(parsed.tool_calls.is_empty());
    }

    #[test]
    fn sub_agent_scraper_reads_success_line() {
        let parsed = parse_sub_agent_output("success: false\nresult: could not find the file");
        assert!(!parsed.result.success);
        assert_eq!(parsed.result.result, "could not find the file");
        assert!(parsed.result.issues.is_empty());
    }

    #[test]
    fn extracted_memories_accept_bare_and_wrapped_arrays() {
        let bare = r#"[{"type": "fact", "content": "The user's name is Alice", "importance": 0.9}]"#;
        let memories = parse_extracted_memories(bare);
        assert_eq!(memories.len(), 1);
        assert_eq!(memories[0].kind.as_deref(), Some("fact"));

        let wrapped = r#"{"memories": [{"content": "likes tea"}]}"#;
        let memories = parse_extracted_memories(wrapped);
        assert_eq!(memories.len(), 1);
        assert!(memories[0].kind.is_none());

        assert!(parse_extracted_memories("no structure here").is_empty());
    }

    #[test]
    fn materialize_fills_missing_ids_and_status() {
        let parsed = ParsedTask {
            id: "  ".to_string(),
            content: " Build the API ".to_string(),
            priority: Some("HIGH".to_string()),
            estimated_duration: String::new(),
            assigned_sub_agent: None,
            required_tools: vec![],
            dependencies: vec![" task_1 ".to_string(), String::new()],
            success_criteria: String::new(),
        };
        let task = materialize_task(parsed, 4);
        assert_eq!(task.id, "task_5");
        assert_eq!(task.content, "Build the API");
        assert_eq!(task.priority, TaskPriority::High);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.dependencies, vec!["task_1"]);
    }
}
