#![forbid(unsafe_code)]

mod template;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use taskgate_domain::{hash_json, Assertion, Task, TaskStatus};

pub use template::{capture_result, resolve_args, resolve_template_str, resolve_value};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PlanError {
    #[error("invalid plan structure: {0}")]
    Parse(String),
    #[error("task id MUST be non-empty (task #{index})")]
    EmptyTaskId { index: usize },
    #[error("tool name MUST be non-empty for task {task_id}")]
    EmptyToolName { task_id: String },
    #[error("duplicate task id: {0}")]
    DuplicateTaskId(String),
    #[error("task {task_id} depends on unknown task {dependency}")]
    UnknownDependency { task_id: String, dependency: String },
    #[error("task dependency cycle detected among tasks: {}", .0.join(", "))]
    Cycle(Vec<String>),
    #[error("plan serialization failed: {0}")]
    Serialization(String),
}

/// How strictly a task graph is checked before a run starts.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PlanValidation {
    /// Only ids are checked; unknown dependencies and cycles strand the affected tasks as pending.
    #[default]
    Lenient,
    /// Unknown dependencies and cycles are rejected before anything runs.
    Strict,
}

/// A task as written by the planner, before any run state exists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TaskSpec {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(alias = "tool_name")]
    pub tool: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default, alias = "dependencies")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub assertions: Vec<Assertion>,
}

impl From<TaskSpec> for Task {
    fn from(spec: TaskSpec) -> Self {
        let name = spec
            .name
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| spec.id.clone());
        Task {
            id: spec.id,
            name,
            tool_name: spec.tool,
            args: spec.args,
            dependencies: spec.depends_on.into_iter().collect(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            assertions: spec.assertions,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TaskPlan {
    #[serde(default)]
    pub plan_name: Option<String>,
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanEnvelope {
    pub plan_name: Option<String>,
    pub plan_hash: String,
    pub tasks: Vec<Task>,
}

/// Load a task plan (YAML or JSON) from disk and normalize it.
///
/// # Errors
/// Returns an error when the file cannot be read, parsed, or validated.
pub fn load_plan_from_path(path: &Path, validation: PlanValidation) -> anyhow::Result<PlanEnvelope> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read plan {}", path.display()))?;
    normalize_plan_str(&content, validation)
        .with_context(|| format!("invalid plan {}", path.display()))
}

/// Parse and normalize a plan document into run-ready tasks plus a stable hash.
///
/// # Errors
/// Returns an error when parsing fails or the task graph does not validate.
pub fn normalize_plan_str(text: &str, validation: PlanValidation) -> Result<PlanEnvelope, PlanError> {
    // serde_yaml accepts JSON documents as well.
    let plan: TaskPlan =
        serde_yaml::from_str(text).map_err(|err| PlanError::Parse(err.to_string()))?;
    normalize_plan(plan, validation)
}

/// Normalize an in-memory plan.
///
/// # Errors
/// Returns an error when the task graph does not validate.
pub fn normalize_plan(plan: TaskPlan, validation: PlanValidation) -> Result<PlanEnvelope, PlanError> {
    let tasks: Vec<Task> = plan
        .tasks
        .into_iter()
        .map(|mut spec| {
            spec.id = spec.id.trim().to_string();
            spec.tool = spec.tool.trim().to_string();
            spec.depends_on = spec
                .depends_on
                .iter()
                .map(|dep| dep.trim().to_string())
                .filter(|dep| !dep.is_empty())
                .collect();
            Task::from(spec)
        })
        .collect();

    validate_plan(&tasks, validation)?;

    let canonical = serde_json::to_value(&tasks)
        .map_err(|err| PlanError::Serialization(err.to_string()))?;
    let plan_hash = hash_json(&canonical).map_err(|err| PlanError::Serialization(err.to_string()))?;

    Ok(PlanEnvelope {
        plan_name: plan.plan_name,
        plan_hash,
        tasks,
    })
}

/// Check task ids and, in strict mode, the dependency graph.
///
/// # Errors
/// Returns the first structural problem found.
pub fn validate_plan(tasks: &[Task], validation: PlanValidation) -> Result<(), PlanError> {
    let mut ids = BTreeSet::new();
    for (index, task) in tasks.iter().enumerate() {
        if task.id.trim().is_empty() {
            return Err(PlanError::EmptyTaskId { index });
        }
        if task.tool_name.trim().is_empty() {
            return Err(PlanError::EmptyToolName {
                task_id: task.id.clone(),
            });
        }
        if !ids.insert(task.id.as_str()) {
            return Err(PlanError::DuplicateTaskId(task.id.clone()));
        }
    }

    if validation == PlanValidation::Lenient {
        return Ok(());
    }

    for task in tasks {
        for dep in &task.dependencies {
            if !ids.contains(dep.as_str()) {
                return Err(PlanError::UnknownDependency {
                    task_id: task.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    detect_cycle(tasks)
}

/// Reject dependency graphs that can never fully drain.
///
/// # Errors
/// Returns [`PlanError::Cycle`] naming every task that is on or behind a cycle.
pub fn detect_cycle(tasks: &[Task]) -> Result<(), PlanError> {
    let mut remaining: BTreeMap<&str, BTreeSet<&str>> = tasks
        .iter()
        .map(|task| {
            (
                task.id.as_str(),
                task.dependencies.iter().map(String::as_str).collect(),
            )
        })
        .collect();

    loop {
        let ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(id, _)| *id)
            .collect();
        if ready.is_empty() {
            break;
        }

        for id in ready {
            remaining.remove(id);
            for deps in remaining.values_mut() {
                deps.remove(id);
            }
        }
    }

    if remaining.is_empty() {
        return Ok(());
    }

    Err(PlanError::Cycle(
        remaining.keys().map(|id| (*id).to_string()).collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::{detect_cycle, normalize_plan_str, PlanError, PlanValidation};
    use taskgate_domain::Task;

    const PLAN: &str = r"
plan_name: research
tasks:
  - id: search
    tool: web_search
    args: { query: rust }
  - id: summarize
    name: Summarize findings
    tool: summarize
    depends_on: [search, search]
    args: { text: '{{search.results.0}}' }
    assertions:
      - { kind: text_exists, value: Summary }
";

    #[test]
    fn normalize_hash_is_stable() {
        let first = normalize_plan_str(PLAN, PlanValidation::Strict);
        let second = normalize_plan_str(PLAN, PlanValidation::Strict);
        match (first, second) {
            (Ok(first), Ok(second)) => {
                assert_eq!(first.plan_hash, second.plan_hash);
                assert_eq!(first.tasks.len(), 2);
                assert_eq!(first.tasks[1].dependencies.len(), 1);
                assert_eq!(first.tasks[0].name, "search");
                assert_eq!(first.tasks[1].assertions[0].timeout_ms, 5_000);
            }
            (Err(err), _) | (_, Err(err)) => panic!("plan normalization failed: {err}"),
        }
    }

    #[test]
    fn json_plans_are_accepted() {
        let plan = r#"{"tasks": [{"id": "a", "tool_name": "echo", "dependencies": []}]}"#;
        let parsed = normalize_plan_str(plan, PlanValidation::Strict);
        assert!(parsed.is_ok());
        let parsed = parsed.unwrap_or_else(|_| unreachable!());
        assert_eq!(parsed.tasks[0].tool_name, "echo");
    }

    #[test]
    fn duplicate_ids_are_rejected_even_when_lenient() {
        let plan = r"
tasks:
  - { id: a, tool: echo }
  - { id: a, tool: echo }
";
        let parsed = normalize_plan_str(plan, PlanValidation::Lenient);
        assert_eq!(parsed.err(), Some(PlanError::DuplicateTaskId("a".to_string())));
    }

    #[test]
    fn unknown_dependency_only_fails_strict_validation() {
        let plan = r"
tasks:
  - { id: a, tool: echo, depends_on: [ghost] }
";
        assert!(normalize_plan_str(plan, PlanValidation::Lenient).is_ok());
        let strict = normalize_plan_str(plan, PlanValidation::Strict);
        assert_eq!(
            strict.err(),
            Some(PlanError::UnknownDependency {
                task_id: "a".to_string(),
                dependency: "ghost".to_string(),
            })
        );
    }

    #[test]
    fn cycle_reports_every_stranded_task() {
        let tasks = vec![
            Task::new("a", "echo").with_dependencies(["c"]),
            Task::new("b", "echo").with_dependencies(["a"]),
            Task::new("c", "echo").with_dependencies(["b"]),
            Task::new("d", "echo").with_dependencies(["c"]),
            Task::new("e", "echo"),
        ];
        let err = detect_cycle(&tasks).err();
        assert_eq!(
            err,
            Some(PlanError::Cycle(vec![
                "a".to_string(),
                "b".to_string(),
                "c".to_string(),
                "d".to_string(),
            ]))
        );
    }
}
