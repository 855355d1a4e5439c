#![forbid(unsafe_code)]

//! Risk classification for prospective tool calls.
//!
//! Rules are evaluated in descending priority against one immutable
//! [`PolicySnapshot`]; the first rule that matches decides. Snapshots are
//! swapped atomically, so an evaluation never observes a half-applied update.

mod audit;
mod risk;
mod rules;
mod sync;
mod tables;

use std::borrow::Cow;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde_json::Value;
use taskgate_domain::{
    hash_json, now_utc, PolicyContext, PolicyDecision, PolicyEvaluation, RiskLevel, RunId,
    UserMode,
};
use ulid::Ulid;

pub use audit::{
    AuditError, ChannelAuditSink, NoopAuditSink, PolicyAuditSink, PolicyDecisionRecord,
    TracingAuditSink,
};
pub use risk::{domain_of, ArgsRisk, LARGE_ARGUMENT_CHARS, SENSITIVE_TOKENS};
pub use rules::{
    PolicyRule, RuleKind, DEFAULT_RISK_PRIORITY, DOMAIN_ALLOWLIST_PRIORITY,
    DOMAIN_BLOCKLIST_PRIORITY,
};
pub use sync::{FilePolicySource, HttpPolicySource, PolicySource, SyncOutcome};
pub use tables::{normalize_domain, PolicyDocument, PolicySnapshot, ToolRuleDefinition};

pub const NO_RULE_MATCHED: &str = "no policy rules matched";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PolicyError {
    #[error("policy parse error: {0}")]
    Parse(String),
    #[error("policy fetch error: {0}")]
    Fetch(String),
    #[error("invalid policy: {0}")]
    Invalid(String),
}

/// Build the policy view of a tool call, deriving `url` and `domain` from a `url` argument.
#[must_use]
pub fn build_context(
    tool_name: &str,
    args: Value,
    user_mode: UserMode,
    run_id: Option<RunId>,
) -> PolicyContext {
    let url = args
        .get("url")
        .and_then(Value::as_str)
        .map(ToString::to_string);
    let domain = url.as_deref().and_then(domain_of);
    PolicyContext {
        tool_name: tool_name.to_string(),
        args,
        url,
        domain,
        user_mode,
        run_id,
    }
}

pub struct PolicyEngine {
    snapshot: ArcSwap<PolicySnapshot>,
    audit: Arc<dyn PolicyAuditSink>,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new(PolicySnapshot::default())
    }
}

impl PolicyEngine {
    #[must_use]
    pub fn new(snapshot: PolicySnapshot) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(snapshot),
            audit: Arc::new(NoopAuditSink),
        }
    }

    /// Engine seeded from a document instead of the builtin tables.
    ///
    /// # Errors
    /// Returns an error when the document holds a malformed rule.
    pub fn from_document(document: &PolicyDocument) -> Result<Self, PolicyError> {
        Ok(Self::new(PolicySnapshot::from_document(document)?))
    }

    #[must_use]
    pub fn with_audit_sink(mut self, sink: Arc<dyn PolicyAuditSink>) -> Self {
        self.audit = sink;
        self
    }

    /// Classify one tool call. Emits an audit record; audit failures are logged and dropped.
    #[must_use]
    pub fn evaluate(&self, context: &PolicyContext) -> PolicyEvaluation {
        let snapshot = self.snapshot.load_full();
        let context = with_derived_domain(context);
        let evaluation = evaluate_snapshot(&snapshot, &context);

        tracing::debug!(
            tool = %context.tool_name,
            domain = context.domain.as_deref().unwrap_or("-"),
            decision = evaluation.decision.as_str(),
            risk = evaluation.risk_level.as_str(),
            rule = %evaluation.matched_rule,
            "policy evaluated"
        );
        self.emit_audit(&context, &evaluation, snapshot.version);

        evaluation
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<PolicySnapshot> {
        self.snapshot.load_full()
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.snapshot.load().version
    }

    /// The active rule chain in evaluation order.
    #[must_use]
    pub fn rules(&self) -> Vec<PolicyRule> {
        self.snapshot.load().rules.clone()
    }

    /// Replace the active tables with ones built from `document`.
    ///
    /// # Errors
    /// Returns an error (and keeps the current tables) when the document is invalid.
    pub fn apply_document(&self, document: &PolicyDocument) -> Result<u64, PolicyError> {
        let prepared = PolicySnapshot::from_document(document)?;
        let mut applied = 0;
        self.snapshot.rcu(|current| {
            let mut next = prepared.clone();
            next.version = current.version + 1;
            applied = next.version;
            next
        });
        Ok(applied)
    }

    /// Fetch from `source` and apply; on any failure the cached tables stay authoritative.
    pub fn sync_from(&self, source: &dyn PolicySource) -> SyncOutcome {
        match source
            .fetch()
            .and_then(|document| self.apply_document(&document))
        {
            Ok(version) => {
                tracing::info!(source = %source.describe(), version, "policy tables updated");
                SyncOutcome::Applied { version }
            }
            Err(err) => {
                let version = self.version();
                tracing::warn!(
                    source = %source.describe(),
                    version,
                    error = %err,
                    "policy sync failed; keeping cached tables"
                );
                SyncOutcome::KeptCached {
                    version,
                    reason: err.to_string(),
                }
            }
        }
    }

    fn emit_audit(&self, context: &PolicyContext, evaluation: &PolicyEvaluation, version: u64) {
        let record = PolicyDecisionRecord {
            record_id: Ulid::new(),
            run_id: context.run_id,
            tool_name: context.tool_name.clone(),
            domain: context.domain.clone(),
            decision: evaluation.decision,
            risk_level: evaluation.risk_level,
            reason: evaluation.reason.clone(),
            matched_rule: evaluation.matched_rule.clone(),
            args_hash: hash_json(&context.args).unwrap_or_default(),
            policy_version: version,
            evaluated_at: now_utc(),
        };
        if let Err(err) = self.audit.record(&record) {
            tracing::warn!(tool = %context.tool_name, error = %err, "policy audit emission failed");
        }
    }
}

/// First-match-wins over the snapshot's ordered rules, failing safe when nothing matches.
#[must_use]
pub fn evaluate_snapshot(snapshot: &PolicySnapshot, context: &PolicyContext) -> PolicyEvaluation {
    snapshot
        .rules
        .iter()
        .find(|rule| rule.matches(context, snapshot))
        .map_or_else(
            || PolicyEvaluation {
                decision: PolicyDecision::NeedsApproval,
                risk_level: RiskLevel::Medium,
                reason: NO_RULE_MATCHED.to_string(),
                matched_rule: "fail_safe".to_string(),
            },
            |rule| rule.evaluate(context, snapshot),
        )
}

fn with_derived_domain(context: &PolicyContext) -> Cow<'_, PolicyContext> {
    if context.domain.is_some() {
        return Cow::Borrowed(context);
    }
    match context.url.as_deref().and_then(domain_of) {
        Some(domain) => {
            let mut owned = context.clone();
            owned.domain = Some(domain);
            Cow::Owned(owned)
        }
        None => Cow::Borrowed(context),
    }
}
