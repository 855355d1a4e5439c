#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

/// Default timeout applied to assertion checks that do not carry their own.
pub const DEFAULT_ASSERTION_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunId(pub Ulid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        Ulid::from_string(value.trim())
            .map(Self)
            .map_err(|err| anyhow!("invalid run id `{value}`: {err}"))
    }
}

/// Correlation token for one approval round trip.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RequestId(pub Ulid);

impl RequestId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle naming whoever must answer an approval request.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RequesterChannel(pub String);

impl RequesterChannel {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequesterChannel {
    fn default() -> Self {
        Self("local".to_string())
    }
}

impl std::fmt::Display for RequesterChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether `next` is a legal successor of `self`.
    ///
    /// Status only moves forward: pending, then running, then one terminal state.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AssertionKind {
    TextExists,
    SelectorExists,
    UrlContains,
}

impl AssertionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TextExists => "text_exists",
            Self::SelectorExists => "selector_exists",
            Self::UrlContains => "url_contains",
        }
    }
}

fn default_assertion_timeout_ms() -> u64 {
    DEFAULT_ASSERTION_TIMEOUT_MS
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Assertion {
    pub kind: AssertionKind,
    pub value: String,
    #[serde(default = "default_assertion_timeout_ms")]
    pub timeout_ms: u64,
}

impl Assertion {
    #[must_use]
    pub fn new(kind: AssertionKind, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
            timeout_ms: DEFAULT_ASSERTION_TIMEOUT_MS,
        }
    }
}

/// One tool invocation node of a run's dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub tool_name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    #[serde(default)]
    pub dependencies: BTreeSet<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub assertions: Vec<Assertion>,
}

impl Task {
    #[must_use]
    pub fn new(id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            tool_name: tool_name.into(),
            args: Map::new(),
            dependencies: BTreeSet::new(),
            status: TaskStatus::Pending,
            result: None,
            error: None,
            assertions: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_arg(mut self, key: impl Into<String>, value: Value) -> Self {
        self.args.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies
            .extend(dependencies.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_assertion(mut self, assertion: Assertion) -> Self {
        self.assertions.push(assertion);
        self
    }
}

/// Completed task outputs for one run, keyed by task id. Each id is written at most once.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct RunContext {
    entries: BTreeMap<String, Value>,
}

impl RunContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a task output. Returns `false` and leaves the entry untouched if the id was already written.
    pub fn insert_once(&mut self, task_id: &str, value: Value) -> bool {
        if self.entries.contains_key(task_id) {
            return false;
        }
        self.entries.insert(task_id.to_string(), value);
        true
    }

    #[must_use]
    pub fn get(&self, task_id: &str) -> Option<&Value> {
        self.entries.get(task_id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn into_inner(self) -> BTreeMap<String, Value> {
        self.entries
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UserMode {
    #[default]
    Standard,
    Developer,
    Admin,
}

impl UserMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Developer => "developer",
            Self::Admin => "admin",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "standard" => Some(Self::Standard),
            "developer" => Some(Self::Developer),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }

    /// Developer and admin sessions may run medium-risk calls without a prompt.
    #[must_use]
    pub fn tolerates_medium_risk(self) -> bool {
        matches!(self, Self::Developer | Self::Admin)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" | "med" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDecision {
    Allow,
    Deny,
    NeedsApproval,
}

impl PolicyDecision {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::NeedsApproval => "needs_approval",
        }
    }
}

/// Everything the policy engine sees about one prospective tool call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyContext {
    pub tool_name: String,
    pub args: Value,
    pub url: Option<String>,
    pub domain: Option<String>,
    pub user_mode: UserMode,
    pub run_id: Option<RunId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PolicyEvaluation {
    pub decision: PolicyDecision,
    pub risk_level: RiskLevel,
    pub reason: String,
    pub matched_rule: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalRequest {
    pub request_id: RequestId,
    pub run_id: Option<RunId>,
    pub tool_name: String,
    pub args: Value,
    pub requester: RequesterChannel,
    pub created_at: DateTimeUtc,
    pub timeout_ms: u64,
}

impl ApprovalRequest {
    /// The payload shown to the human who has to answer.
    #[must_use]
    pub fn prompt(&self) -> ApprovalPrompt {
        ApprovalPrompt {
            request_id: self.request_id,
            tool_name: self.tool_name.clone(),
            args: self.args.clone(),
            run_id: self.run_id,
            timeout_ms: self.timeout_ms,
        }
    }

    #[must_use]
    pub fn timeout_notice(&self) -> ApprovalTimeoutNotice {
        ApprovalTimeoutNotice {
            request_id: self.request_id,
            tool_name: self.tool_name.clone(),
            run_id: self.run_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalPrompt {
    pub request_id: RequestId,
    pub tool_name: String,
    pub args: Value,
    pub run_id: Option<RunId>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ApprovalResponse {
    pub request_id: RequestId,
    pub approved: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ApprovalTimeoutNotice {
    pub request_id: RequestId,
    pub tool_name: String,
    pub run_id: Option<RunId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ApprovalOutcome {
    Approved,
    Denied { reason: String },
    TimedOut,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    TaskStart,
    TaskEnd,
    TaskError,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    pub phase: ProgressPhase,
    pub task_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub run_id: RunId,
    pub plan_hash: Option<String>,
    pub success: bool,
    pub tasks: Vec<Task>,
    pub context: BTreeMap<String, Value>,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    pub started_at: DateTimeUtc,
    pub finished_at: DateTimeUtc,
}

impl RunSummary {
    #[must_use]
    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == task_id)
    }

    #[must_use]
    pub fn status_of(&self, task_id: &str) -> Option<TaskStatus> {
        self.task(task_id).map(|task| task.status)
    }
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value with stable `serde_json` serialization + SHA-256.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn hash_json(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
}
