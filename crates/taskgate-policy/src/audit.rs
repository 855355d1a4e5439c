use serde::{Deserialize, Serialize};
use taskgate_domain::{DateTimeUtc, PolicyDecision, RiskLevel, RunId};
use tokio::sync::mpsc;
use ulid::Ulid;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum AuditError {
    #[error("audit sink closed")]
    Closed,
    #[error("audit sink failure: {0}")]
    Sink(String),
}

/// One policy decision as it is handed to the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyDecisionRecord {
    pub record_id: Ulid,
    pub run_id: Option<RunId>,
    pub tool_name: String,
    pub domain: Option<String>,
    pub decision: PolicyDecision,
    pub risk_level: RiskLevel,
    pub reason: String,
    pub matched_rule: String,
    pub args_hash: String,
    pub policy_version: u64,
    pub evaluated_at: DateTimeUtc,
}

/// Receives decision records. Implementations must return promptly; the engine never waits on them.
pub trait PolicyAuditSink: Send + Sync {
    #[allow(clippy::missing_errors_doc)]
    fn record(&self, record: &PolicyDecisionRecord) -> Result<(), AuditError>;
}

#[derive(Debug, Clone, Default)]
pub struct NoopAuditSink;

impl PolicyAuditSink for NoopAuditSink {
    fn record(&self, _record: &PolicyDecisionRecord) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Writes each decision as a structured `tracing` event.
#[derive(Debug, Clone, Default)]
pub struct TracingAuditSink;

impl PolicyAuditSink for TracingAuditSink {
    fn record(&self, record: &PolicyDecisionRecord) -> Result<(), AuditError> {
        tracing::info!(
            target: "taskgate::audit",
            record_id = %record.record_id,
            tool = %record.tool_name,
            domain = record.domain.as_deref().unwrap_or("-"),
            decision = record.decision.as_str(),
            risk = record.risk_level.as_str(),
            rule = %record.matched_rule,
            policy_version = record.policy_version,
            args_hash = %record.args_hash,
            "policy decision"
        );
        Ok(())
    }
}

/// Forwards records to an in-process consumer without blocking.
#[derive(Debug, Clone)]
pub struct ChannelAuditSink {
    sender: mpsc::UnboundedSender<PolicyDecisionRecord>,
}

impl ChannelAuditSink {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PolicyDecisionRecord>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl PolicyAuditSink for ChannelAuditSink {
    fn record(&self, record: &PolicyDecisionRecord) -> Result<(), AuditError> {
        self.sender
            .send(record.clone())
            .map_err(|_| AuditError::Closed)
    }
}
