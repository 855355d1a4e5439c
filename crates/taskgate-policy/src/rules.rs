use std::collections::BTreeSet;

use taskgate_domain::{PolicyContext, PolicyDecision, PolicyEvaluation, RiskLevel};

use crate::risk::{args_risk, ArgsRisk};
use crate::tables::PolicySnapshot;

pub const DOMAIN_BLOCKLIST_PRIORITY: i32 = 100;
pub const DOMAIN_ALLOWLIST_PRIORITY: i32 = 90;
pub const DEFAULT_RISK_PRIORITY: i32 = 0;

/// The closed set of rule behaviours. Each kind has one fixed match/evaluate pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleKind {
    DomainBlocklist,
    DomainAllowlist,
    ToolDecision {
        tools: BTreeSet<String>,
        decision: PolicyDecision,
        risk_level: RiskLevel,
    },
    DefaultRisk,
}

impl RuleKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DomainBlocklist => "domain_blocklist",
            Self::DomainAllowlist => "domain_allowlist",
            Self::ToolDecision { .. } => "tool_decision",
            Self::DefaultRisk => "default_risk",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRule {
    pub name: String,
    pub priority: i32,
    pub kind: RuleKind,
}

impl PolicyRule {
    #[must_use]
    pub fn matches(&self, context: &PolicyContext, snapshot: &PolicySnapshot) -> bool {
        match &self.kind {
            RuleKind::DomainBlocklist => context
                .domain
                .as_deref()
                .is_some_and(|domain| snapshot.is_blocked(domain)),
            RuleKind::DomainAllowlist => context
                .domain
                .as_deref()
                .is_some_and(|domain| snapshot.is_allowed(domain)),
            RuleKind::ToolDecision { tools, .. } => tools.contains(&context.tool_name),
            RuleKind::DefaultRisk => true,
        }
    }

    #[must_use]
    pub fn evaluate(&self, context: &PolicyContext, snapshot: &PolicySnapshot) -> PolicyEvaluation {
        match &self.kind {
            RuleKind::DomainBlocklist => PolicyEvaluation {
                decision: PolicyDecision::Deny,
                risk_level: RiskLevel::High,
                reason: format!(
                    "domain {} is blocklisted",
                    context.domain.as_deref().unwrap_or_default()
                ),
                matched_rule: self.name.clone(),
            },
            RuleKind::DomainAllowlist => PolicyEvaluation {
                decision: PolicyDecision::Allow,
                risk_level: RiskLevel::Low,
                reason: format!(
                    "domain {} is allowlisted",
                    context.domain.as_deref().unwrap_or_default()
                ),
                matched_rule: self.name.clone(),
            },
            RuleKind::ToolDecision {
                decision,
                risk_level,
                ..
            } => PolicyEvaluation {
                decision: *decision,
                risk_level: *risk_level,
                reason: format!("tool {} is pinned by rule {}", context.tool_name, self.name),
                matched_rule: self.name.clone(),
            },
            RuleKind::DefaultRisk => evaluate_default_risk(&self.name, context, snapshot),
        }
    }
}

pub(crate) fn default_rules() -> Vec<PolicyRule> {
    vec![
        PolicyRule {
            name: "domain_blocklist".to_string(),
            priority: DOMAIN_BLOCKLIST_PRIORITY,
            kind: RuleKind::DomainBlocklist,
        },
        PolicyRule {
            name: "domain_allowlist".to_string(),
            priority: DOMAIN_ALLOWLIST_PRIORITY,
            kind: RuleKind::DomainAllowlist,
        },
        PolicyRule {
            name: "default_risk".to_string(),
            priority: DEFAULT_RISK_PRIORITY,
            kind: RuleKind::DefaultRisk,
        },
    ]
}

fn evaluate_default_risk(
    rule_name: &str,
    context: &PolicyContext,
    snapshot: &PolicySnapshot,
) -> PolicyEvaluation {
    let tool_risk = snapshot.tool_risk(&context.tool_name);
    // Missing and unlisted domains both count as medium.
    let domain_risk = context
        .domain
        .as_deref()
        .and_then(|domain| snapshot.known_domain_risk(domain))
        .unwrap_or(RiskLevel::Medium);
    let ArgsRisk {
        level: args_risk,
        findings,
    } = args_risk(context, snapshot);

    let escalated = tool_risk.max(domain_risk).max(args_risk);

    let mut reason = format!(
        "escalated risk {} (tool {}, domain {}, args {})",
        escalated.as_str(),
        tool_risk.as_str(),
        domain_risk.as_str(),
        args_risk.as_str()
    );
    if !findings.is_empty() {
        reason.push_str(": ");
        reason.push_str(&findings.join("; "));
    }

    let decision = match escalated {
        RiskLevel::High => PolicyDecision::NeedsApproval,
        RiskLevel::Medium if !context.user_mode.tolerates_medium_risk() => {
            PolicyDecision::NeedsApproval
        }
        RiskLevel::Medium | RiskLevel::Low => PolicyDecision::Allow,
    };

    PolicyEvaluation {
        decision,
        risk_level: escalated,
        reason,
        matched_rule: rule_name.to_string(),
    }
}
