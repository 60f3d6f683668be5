// Task Scheduling
// DAG helpers over the planner's task list: structural validation, runnable
// selection, and blocked-state bookkeeping.

use std::collections::{HashMap, HashSet};

use maestro_types::{Task, TaskStatus};

#[derive(Debug, Clone)]
pub enum ScheduleError {
    EmptyTaskList,
    DuplicateTaskId(String),
    InvalidDependency {
        task_id: String,
        dependency_id: String,
    },
    CycleDetected {
        path: Vec<String>,
    },
}

impl std::fmt::Display for ScheduleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyTaskList => write!(f, "task list is empty"),
            Self::DuplicateTaskId(id) => write!(f, "duplicate task id `{}`", id),
            Self::InvalidDependency {
                task_id,
                dependency_id,
            } => write!(
                f,
                "task `{}` depends on unknown task `{}`",
                task_id, dependency_id
            ),
            Self::CycleDetected { path } => {
                write!(f, "cycle in task dependencies: {}", path.join(" -> "))
            }
        }
    }
}

/// Structural validation: non-empty, unique ids, known dependencies, acyclic.
pub fn validate(tasks: &[Task]) -> Result<(), ScheduleError> {
    if tasks.is_empty() {
        return Err(ScheduleError::EmptyTaskList);
    }

    let mut ids = HashSet::new();
    for task in tasks {
        if !ids.insert(task.id.as_str()) {
            return Err(ScheduleError::DuplicateTaskId(task.id.clone()));
        }
    }

    for task in tasks {
        for dep in &task.dependencies {
            if !ids.contains(dep.as_str()) {
                return Err(ScheduleError::InvalidDependency {
                    task_id: task.id.clone(),
                    dependency_id: dep.clone(),
                });
            }
        }
    }

    if let Some(path) = detect_cycle(tasks) {
        return Err(ScheduleError::CycleDetected { path });
    }

    Ok(())
}

pub fn detect_cycle(tasks: &[Task]) -> Option<Vec<String>> {
    let task_map: HashMap<&str, &Task> = tasks.iter().map(|t| (t.id.as_str(), t)).collect();

    for task in tasks {
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        if dfs_cycle(&task.id, &task_map, &mut visited, &mut path) {
            return Some(path);
        }
    }
    None
}

fn dfs_cycle(
    task_id: &str,
    task_map: &HashMap<&str, &Task>,
    visited: &mut HashSet<String>,
    path: &mut Vec<String>,
) -> bool {
    if path.iter().any(|p| p == task_id) {
        path.push(task_id.to_string());
        return true;
    }
    if visited.contains(task_id) {
        return false;
    }

    visited.insert(task_id.to_string());
    path.push(task_id.to_string());

    if let Some(task) = task_map.get(task_id) {
        for dep in &task.dependencies {
            if dfs_cycle(dep, task_map, visited, path) {
                return true;
            }
        }
    }

    path.pop();
    false
}

/// First pending task whose dependencies are all completed, in declared order.
pub fn next_runnable(tasks: &[Task]) -> Option<usize> {
    let completed: HashSet<&str> = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .map(|t| t.id.as_str())
        .collect();

    tasks.iter().position(|task| {
        task.status == TaskStatus::Pending
            && task
                .dependencies
                .iter()
                .all(|dep| completed.contains(dep.as_str()))
    })
}

/// Mark pending tasks with failed or cancelled dependencies as blocked, and
/// release blocked tasks whose dependencies recovered.
pub fn update_blocked(tasks: &mut [Task]) {
    let dead: HashSet<String> = tasks
        .iter()
        .filter(|t| matches!(t.status, TaskStatus::Failed | TaskStatus::Cancelled))
        .map(|t| t.id.clone())
        .collect();

    for task in tasks.iter_mut() {
        let has_dead_dep = task.dependencies.iter().any(|dep| dead.contains(dep));
        if task.status == TaskStatus::Pending && has_dead_dep {
            task.transition(TaskStatus::Blocked);
        } else if task.status == TaskStatus::Blocked && !has_dead_dep {
            task.transition(TaskStatus::Pending);
        }
    }
}

pub fn all_terminal(tasks: &[Task]) -> bool {
    tasks
        .iter()
        .all(|t| t.status.is_terminal() || t.status == TaskStatus::Blocked)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str], status: TaskStatus) -> Task {
        let mut t = Task::new(id, format!("task {id}"));
        t.dependencies = deps.iter().map(|d| d.to_string()).collect();
        t.status = status;
        t
    }

    #[test]
    fn validate_catches_structural_problems() {
        assert!(matches!(validate(&[]), Err(ScheduleError::EmptyTaskList)));

        let dup = vec![
            task("a", &[], TaskStatus::Pending),
            task("a", &[], TaskStatus::Pending),
        ];
        assert!(matches!(
            validate(&dup),
            Err(ScheduleError::DuplicateTaskId(_))
        ));

        let bad_dep = vec![task("a", &["ghost"], TaskStatus::Pending)];
        assert!(matches!(
            validate(&bad_dep),
            Err(ScheduleError::InvalidDependency { .. })
        ));

        let cycle = vec![
            task("a", &["c"], TaskStatus::Pending),
            task("b", &["a"], TaskStatus::Pending),
            task("c", &["b"], TaskStatus::Pending),
        ];
        assert!(matches!(
            validate(&cycle),
            Err(ScheduleError::CycleDetected { .. })
        ));

        let ok = vec![
            task("a", &[], TaskStatus::Pending),
            task("b", &["a"], TaskStatus::Pending),
        ];
        assert!(validate(&ok).is_ok());
    }

    #[test]
    fn next_runnable_respects_dependencies() {
        let tasks = vec![
            task("a", &[], TaskStatus::Completed),
            task("b", &["a"], TaskStatus::Pending),
            task("c", &["b"], TaskStatus::Pending),
        ];
        assert_eq!(next_runnable(&tasks), Some(1));

        let blocked = vec![
            task("a", &[], TaskStatus::Pending),
            task("b", &["a"], TaskStatus::Pending),
        ];
        assert_eq!(next_runnable(&blocked), Some(0));

        let none = vec![task("a", &[], TaskStatus::Completed)];
        assert_eq!(next_runnable(&none), None);
    }

    #[test]
    fn blocked_bookkeeping_follows_failed_dependencies() {
        let mut tasks = vec![
            task("a", &[], TaskStatus::Failed),
            task("b", &["a"], TaskStatus::Pending),
            task("c", &[], TaskStatus::Pending),
        ];
        update_blocked(&mut tasks);
        assert_eq!(tasks[1].status, TaskStatus::Blocked);
        assert_eq!(tasks[2].status, TaskStatus::Pending);

        // Recovery: the failed dependency is retried and completes.
        tasks[0].status = TaskStatus::Completed;
        update_blocked(&mut tasks);
        assert_eq!(tasks[1].status, TaskStatus::Pending);
    }

    #[test]
    fn all_terminal_counts_blocked_as_settled() {
        let tasks = vec![
            task("a", &[], TaskStatus::Completed),
            task("b", &[], TaskStatus::Failed),
            task("c", &["b"], TaskStatus::Blocked),
        ];
        assert!(all_terminal(&tasks));
    }
}
