#![forbid(unsafe_code)]

//! Dependency-driven execution of a task graph.
//!
//! The run loop owns every task's status and the run context. It launches
//! ready tasks into a [`JoinSet`], then waits for any one of them to finish
//! before scanning again. Each launched task goes through the same pipeline:
//! registry lookup, policy evaluation, the approval gate when required, the
//! tool call and finally its assertions.

mod assertions;
mod progress;
mod tools;

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use serde_json::{Map, Value};
use taskgate_approval::ApprovalGate;
use taskgate_domain::{
    now_utc, ApprovalOutcome, Assertion, PolicyDecision, ProgressEvent, ProgressPhase,
    RequesterChannel, RunContext, RunId, RunSummary, Task, TaskStatus, UserMode,
};
use taskgate_policy::{build_context, PolicyEngine};
use taskgate_workflow::{capture_result, resolve_args, validate_plan, PlanEnvelope, PlanError, PlanValidation};
use tokio::task::JoinSet;
use tracing::Instrument;

pub use assertions::{AssertionCheck, AssertionVerifier, UnavailableVerifier};
pub use progress::{ChannelProgressSink, NoopProgressSink, ProgressSink, TracingProgressSink};
pub use tools::{EchoTool, StaticToolRegistry, Tool, ToolEntry, ToolError, ToolRegistry};

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub run_id: Option<RunId>,
    pub user_mode: UserMode,
    pub requester: RequesterChannel,
    /// Upper bound on simultaneously running tasks; `None` runs the whole ready set.
    pub max_concurrency: Option<NonZeroUsize>,
    pub plan_validation: PlanValidation,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_id: None,
            user_mode: UserMode::Standard,
            requester: RequesterChannel::default(),
            max_concurrency: None,
            plan_validation: PlanValidation::Lenient,
        }
    }
}

/// Structural failures only. Individual task failures end up in [`RunSummary`].
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error("task {task_id} is {status}, expected pending")]
    TaskNotPending { task_id: String, status: &'static str },
    #[error("task runner crashed: {0}")]
    Join(String),
}

pub struct Orchestrator {
    tools: Arc<dyn ToolRegistry>,
    policy: Arc<PolicyEngine>,
    approvals: Arc<ApprovalGate>,
    verifier: Arc<dyn AssertionVerifier>,
    progress: Arc<dyn ProgressSink>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        tools: Arc<dyn ToolRegistry>,
        policy: Arc<PolicyEngine>,
        approvals: Arc<ApprovalGate>,
    ) -> Self {
        Self {
            tools,
            policy,
            approvals,
            verifier: Arc::new(UnavailableVerifier),
            progress: Arc::new(NoopProgressSink),
        }
    }

    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<dyn AssertionVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    #[must_use]
    pub fn with_progress_sink(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    /// Run a normalized plan; the summary carries its hash.
    ///
    /// # Errors
    /// See [`Orchestrator::execute`].
    pub async fn execute_plan(
        &self,
        plan: PlanEnvelope,
        config: &RunConfig,
    ) -> Result<RunSummary, OrchestratorError> {
        let mut summary = self.execute(plan.tasks, config).await?;
        summary.plan_hash = Some(plan.plan_hash);
        Ok(summary)
    }

    /// Drive `tasks` until nothing is ready and nothing is running.
    ///
    /// # Errors
    /// Returns an error when the task list fails validation, a task is not
    /// pending on entry, or a task runner aborts unexpectedly.
    pub async fn execute(
        &self,
        tasks: Vec<Task>,
        config: &RunConfig,
    ) -> Result<RunSummary, OrchestratorError> {
        validate_plan(&tasks, config.plan_validation)?;
        if let Some(task) = tasks.iter().find(|task| task.status != TaskStatus::Pending) {
            return Err(OrchestratorError::TaskNotPending {
                task_id: task.id.clone(),
                status: task.status.as_str(),
            });
        }

        let run_id = config.run_id.unwrap_or_default();
        let started_at = now_utc();
        let mut run = RunState::new(tasks);
        let mut in_flight: JoinSet<(usize, Result<TaskSuccess, String>)> = JoinSet::new();
        let limit = config.max_concurrency.map_or(usize::MAX, NonZeroUsize::get);

        tracing::info!(run_id = %run_id, tasks = run.tasks.len(), "run started");

        loop {
            let capacity = limit.saturating_sub(in_flight.len());
            for index in run.ready(capacity) {
                let attempt = self.launch(&mut run, index, run_id, config);
                let runtime = self.task_runtime();
                let span = tracing::info_span!("task", task_id = %attempt.task_id, tool = %attempt.tool_name);
                // A panic anywhere in the pipeline fails this task only.
                let runner = tokio::spawn(runtime.run(attempt).instrument(span));
                in_flight.spawn(async move {
                    let outcome = runner
                        .await
                        .unwrap_or_else(|err| Err(format!("task crashed: {err}")));
                    (index, outcome)
                });
            }

            let Some(joined) = in_flight.join_next().await else {
                break;
            };
            let (index, outcome) = joined.map_err(|err| OrchestratorError::Join(err.to_string()))?;
            self.finish(&mut run, index, outcome);
        }

        let summary = run.into_summary(run_id, started_at);
        if summary.pending > 0 {
            tracing::warn!(
                run_id = %run_id,
                pending = summary.pending,
                "run stopped with tasks that can never become ready"
            );
        }
        tracing::info!(
            run_id = %run_id,
            completed = summary.completed,
            failed = summary.failed,
            pending = summary.pending,
            success = summary.success,
            "run finished"
        );
        Ok(summary)
    }

    fn launch(&self, run: &mut RunState, index: usize, run_id: RunId, config: &RunConfig) -> TaskAttempt {
        let task = &mut run.tasks[index];
        transition(task, TaskStatus::Running);
        self.progress.emit(ProgressEvent {
            phase: ProgressPhase::TaskStart,
            task_id: task.id.clone(),
            content: format!("starting {} with {}", task.name, task.tool_name),
            result: None,
            error: None,
        });

        TaskAttempt {
            task_id: task.id.clone(),
            tool_name: task.tool_name.clone(),
            args: resolve_args(&task.args, &run.context),
            assertions: task.assertions.clone(),
            run_id,
            user_mode: config.user_mode,
            requester: config.requester.clone(),
        }
    }

    fn finish(&self, run: &mut RunState, index: usize, outcome: Result<TaskSuccess, String>) {
        let task = &mut run.tasks[index];
        match outcome {
            Ok(success) => {
                if !transition(task, TaskStatus::Completed) {
                    return;
                }
                if !run.context.insert_once(&task.id, success.value.clone()) {
                    tracing::warn!(task_id = %task.id, "context entry already present; keeping the first");
                }
                task.result = Some(success.raw);
                self.progress.emit(ProgressEvent {
                    phase: ProgressPhase::TaskEnd,
                    task_id: task.id.clone(),
                    content: format!("completed {}", task.name),
                    result: Some(success.value),
                    error: None,
                });
            }
            Err(error) => {
                if !transition(task, TaskStatus::Failed) {
                    return;
                }
                task.error = Some(error.clone());
                self.progress.emit(ProgressEvent {
                    phase: ProgressPhase::TaskError,
                    task_id: task.id.clone(),
                    content: format!("{} failed", task.name),
                    result: None,
                    error: Some(error),
                });
            }
        }
    }

    fn task_runtime(&self) -> TaskRuntime {
        TaskRuntime {
            tools: Arc::clone(&self.tools),
            policy: Arc::clone(&self.policy),
            approvals: Arc::clone(&self.approvals),
            verifier: Arc::clone(&self.verifier),
        }
    }
}

/// Move `task` to `next`; backwards or skipped moves are logged and ignored.
fn transition(task: &mut Task, next: TaskStatus) -> bool {
    if !task.status.can_transition_to(next) {
        tracing::error!(
            task_id = %task.id,
            from = task.status.as_str(),
            to = next.as_str(),
            "illegal task status transition"
        );
        return false;
    }
    task.status = next;
    true
}

struct RunState {
    tasks: Vec<Task>,
    index_by_id: HashMap<String, usize>,
    context: RunContext,
}

impl RunState {
    fn new(tasks: Vec<Task>) -> Self {
        let index_by_id = tasks
            .iter()
            .enumerate()
            .map(|(index, task)| (task.id.clone(), index))
            .collect();
        Self {
            tasks,
            index_by_id,
            context: RunContext::new(),
        }
    }

    /// Pending tasks whose dependencies have all completed, in plan order.
    fn ready(&self, capacity: usize) -> Vec<usize> {
        self.tasks
            .iter()
            .enumerate()
            .filter(|(_, task)| task.status == TaskStatus::Pending)
            .filter(|(_, task)| {
                task.dependencies.iter().all(|dep| {
                    self.index_by_id
                        .get(dep)
                        .is_some_and(|&dep_index| self.tasks[dep_index].status == TaskStatus::Completed)
                })
            })
            .map(|(index, _)| index)
            .take(capacity)
            .collect()
    }

    fn into_summary(self, run_id: RunId, started_at: taskgate_domain::DateTimeUtc) -> RunSummary {
        let count = |status: TaskStatus| self.tasks.iter().filter(|task| task.status == status).count();
        let completed = count(TaskStatus::Completed);
        let failed = count(TaskStatus::Failed);
        let pending = self
            .tasks
            .iter()
            .filter(|task| !task.status.is_terminal())
            .count();

        RunSummary {
            run_id,
            plan_hash: None,
            success: failed == 0 && pending == 0,
            completed,
            failed,
            pending,
            tasks: self.tasks,
            context: self.context.into_inner(),
            started_at,
            finished_at: now_utc(),
        }
    }
}

struct TaskAttempt {
    task_id: String,
    tool_name: String,
    args: Map<String, Value>,
    assertions: Vec<Assertion>,
    run_id: RunId,
    user_mode: UserMode,
    requester: RequesterChannel,
}

struct TaskSuccess {
    raw: String,
    value: Value,
}

struct TaskRuntime {
    tools: Arc<dyn ToolRegistry>,
    policy: Arc<PolicyEngine>,
    approvals: Arc<ApprovalGate>,
    verifier: Arc<dyn AssertionVerifier>,
}

impl TaskRuntime {
    async fn run(self, attempt: TaskAttempt) -> Result<TaskSuccess, String> {
        let Some(entry) = self.tools.lookup(&attempt.tool_name) else {
            return Err(format!("tool not found: {}", attempt.tool_name));
        };

        let args = Value::Object(attempt.args.clone());
        let evaluation = self.policy.evaluate(&build_context(
            &attempt.tool_name,
            args.clone(),
            attempt.user_mode,
            Some(attempt.run_id),
        ));
        tracing::debug!(
            decision = evaluation.decision.as_str(),
            risk = evaluation.risk_level.as_str(),
            "policy consulted"
        );

        match evaluation.decision {
            PolicyDecision::Deny => return Err(format!("policy denied: {}", evaluation.reason)),
            PolicyDecision::NeedsApproval => self.approve(&attempt, &args).await?,
            PolicyDecision::Allow if entry.requires_approval => self.approve(&attempt, &args).await?,
            PolicyDecision::Allow => {}
        }

        let tool = Arc::clone(&entry.tool);
        let tool_args = attempt.args;
        let raw = match tokio::spawn(async move { tool.execute(&tool_args).await }).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(err)) => return Err(format!("tool failed: {err}")),
            Err(err) => return Err(format!("tool failed: tool task aborted: {err}")),
        };

        for assertion in &attempt.assertions {
            match self.verifier.verify(assertion).await {
                AssertionCheck::Passed => {}
                AssertionCheck::NotFound(detail) => {
                    return Err(format!(
                        "assertion failed: {} {:?}: {detail}",
                        assertion.kind.as_str(),
                        assertion.value
                    ));
                }
                AssertionCheck::TimedOut => {
                    return Err(format!(
                        "assertion failed: {} {:?} not satisfied within {}ms",
                        assertion.kind.as_str(),
                        assertion.value,
                        assertion.timeout_ms
                    ));
                }
            }
        }

        Ok(TaskSuccess {
            value: capture_result(&raw),
            raw,
        })
    }

    async fn approve(&self, attempt: &TaskAttempt, args: &Value) -> Result<(), String> {
        match self
            .approvals
            .request_approval(&attempt.tool_name, args, Some(attempt.run_id), &attempt.requester)
            .await
        {
            ApprovalOutcome::Approved => Ok(()),
            ApprovalOutcome::Denied { reason } => Err(format!("approval denied: {reason}")),
            ApprovalOutcome::TimedOut => Err("approval timed out".to_string()),
        }
    }
}
