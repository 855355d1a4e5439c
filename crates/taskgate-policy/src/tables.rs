use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use taskgate_domain::{PolicyDecision, RiskLevel};

use crate::rules::{default_rules, PolicyRule, RuleKind};
use crate::PolicyError;

const DEFAULT_TOOL_RISK: &[(&str, RiskLevel)] = &[
    ("echo", RiskLevel::Low),
    ("web_search", RiskLevel::Low),
    ("search", RiskLevel::Low),
    ("read_file", RiskLevel::Low),
    ("get_page_text", RiskLevel::Low),
    ("screenshot", RiskLevel::Low),
    ("verify_text", RiskLevel::Low),
    ("browser_navigate", RiskLevel::Medium),
    ("navigate", RiskLevel::Medium),
    ("click", RiskLevel::Medium),
    ("type_text", RiskLevel::Medium),
    ("http_request", RiskLevel::Medium),
    ("execute_plan", RiskLevel::Medium),
    ("write_file", RiskLevel::High),
    ("delete_file", RiskLevel::High),
    ("send_email", RiskLevel::High),
    ("shell_exec", RiskLevel::High),
    ("payment_submit", RiskLevel::High),
];

const DEFAULT_DOMAIN_RISK: &[(&str, RiskLevel)] = &[
    ("google.com", RiskLevel::Low),
    ("bing.com", RiskLevel::Low),
    ("duckduckgo.com", RiskLevel::Low),
    ("wikipedia.org", RiskLevel::Low),
    ("en.wikipedia.org", RiskLevel::Low),
    ("github.com", RiskLevel::Low),
    ("docs.rs", RiskLevel::Low),
    ("crates.io", RiskLevel::Low),
    ("example.com", RiskLevel::Low),
    ("mail.google.com", RiskLevel::High),
    ("paypal.com", RiskLevel::High),
];

const DEFAULT_NAVIGATION_TOOLS: &[&str] = &["browser_navigate", "navigate", "open_url", "open_tab"];
const DEFAULT_WORKFLOW_TOOLS: &[&str] = &["execute_plan", "run_workflow"];

/// One consistent view of every table the rules read.
///
/// Snapshots are immutable once published; updates build a new one.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicySnapshot {
    pub version: u64,
    pub label: Option<String>,
    pub tool_risk: BTreeMap<String, RiskLevel>,
    pub domain_risk: BTreeMap<String, RiskLevel>,
    pub blocklist: BTreeSet<String>,
    pub allowlist: BTreeSet<String>,
    pub navigation_tools: BTreeSet<String>,
    pub workflow_tools: BTreeSet<String>,
    pub rules: Vec<PolicyRule>,
}

impl Default for PolicySnapshot {
    fn default() -> Self {
        Self {
            version: 0,
            label: Some("builtin".to_string()),
            tool_risk: DEFAULT_TOOL_RISK
                .iter()
                .map(|(tool, risk)| ((*tool).to_string(), *risk))
                .collect(),
            domain_risk: DEFAULT_DOMAIN_RISK
                .iter()
                .map(|(domain, risk)| ((*domain).to_string(), *risk))
                .collect(),
            blocklist: BTreeSet::new(),
            allowlist: BTreeSet::new(),
            navigation_tools: DEFAULT_NAVIGATION_TOOLS
                .iter()
                .map(|tool| (*tool).to_string())
                .collect(),
            workflow_tools: DEFAULT_WORKFLOW_TOOLS
                .iter()
                .map(|tool| (*tool).to_string())
                .collect(),
            rules: default_rules(),
        }
    }
}

impl PolicySnapshot {
    /// Build a snapshot from a document, overlaying the builtin tables unless the document opts out.
    ///
    /// # Errors
    /// Returns an error when a configured rule is malformed.
    pub fn from_document(document: &PolicyDocument) -> Result<Self, PolicyError> {
        let mut snapshot = if document.merge_defaults {
            Self::default()
        } else {
            Self {
                tool_risk: BTreeMap::new(),
                domain_risk: BTreeMap::new(),
                ..Self::default()
            }
        };
        snapshot.label.clone_from(&document.label);

        for (tool, risk) in &document.tool_risk {
            snapshot.tool_risk.insert(tool.trim().to_string(), *risk);
        }
        for (domain, risk) in &document.domain_risk {
            snapshot.domain_risk.insert(normalize_domain(domain), *risk);
        }
        snapshot.blocklist = document.blocklist.iter().map(|d| normalize_domain(d)).collect();
        snapshot.allowlist = document.allowlist.iter().map(|d| normalize_domain(d)).collect();
        if let Some(tools) = &document.navigation_tools {
            snapshot.navigation_tools = tools.iter().map(|tool| tool.trim().to_string()).collect();
        }
        if let Some(tools) = &document.workflow_tools {
            snapshot.workflow_tools = tools.iter().map(|tool| tool.trim().to_string()).collect();
        }

        for definition in &document.rules {
            snapshot.rules.push(definition.to_rule()?);
        }
        sort_rules(&mut snapshot.rules);

        Ok(snapshot)
    }

    #[must_use]
    pub fn tool_risk(&self, tool_name: &str) -> RiskLevel {
        self.tool_risk
            .get(tool_name)
            .copied()
            .unwrap_or(RiskLevel::Medium)
    }

    /// Risk recorded for a domain, or `None` when the domain is unknown.
    #[must_use]
    pub fn known_domain_risk(&self, domain: &str) -> Option<RiskLevel> {
        self.domain_risk.get(&normalize_domain(domain)).copied()
    }

    #[must_use]
    pub fn is_blocked(&self, domain: &str) -> bool {
        self.blocklist.contains(&normalize_domain(domain))
    }

    #[must_use]
    pub fn is_allowed(&self, domain: &str) -> bool {
        self.allowlist.contains(&normalize_domain(domain))
    }
}

/// Descending priority; equal priorities keep their insertion order.
pub(crate) fn sort_rules(rules: &mut [PolicyRule]) {
    rules.sort_by(|lhs, rhs| rhs.priority.cmp(&lhs.priority));
}

/// Lowercase, drop a trailing dot and a leading `www.`.
#[must_use]
pub fn normalize_domain(domain: &str) -> String {
    let lowered = domain.trim().trim_end_matches('.').to_ascii_lowercase();
    match lowered.strip_prefix("www.") {
        Some(stripped) => stripped.to_string(),
        None => lowered,
    }
}

fn default_merge() -> bool {
    true
}

/// Serialized policy overrides, loaded from a file or a remote policy endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PolicyDocument {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default = "default_merge")]
    pub merge_defaults: bool,
    #[serde(default)]
    pub tool_risk: BTreeMap<String, RiskLevel>,
    #[serde(default)]
    pub domain_risk: BTreeMap<String, RiskLevel>,
    #[serde(default)]
    pub blocklist: Vec<String>,
    #[serde(default)]
    pub allowlist: Vec<String>,
    #[serde(default)]
    pub navigation_tools: Option<Vec<String>>,
    #[serde(default)]
    pub workflow_tools: Option<Vec<String>>,
    #[serde(default)]
    pub rules: Vec<ToolRuleDefinition>,
}

impl Default for PolicyDocument {
    fn default() -> Self {
        Self {
            label: None,
            merge_defaults: true,
            tool_risk: BTreeMap::new(),
            domain_risk: BTreeMap::new(),
            blocklist: Vec::new(),
            allowlist: Vec::new(),
            navigation_tools: None,
            workflow_tools: None,
            rules: Vec::new(),
        }
    }
}

impl PolicyDocument {
    /// Parse a YAML or JSON policy document.
    ///
    /// # Errors
    /// Returns [`PolicyError::Parse`] when the text is not a valid document.
    pub fn parse(text: &str) -> Result<Self, PolicyError> {
        serde_yaml::from_str(text).map_err(|err| PolicyError::Parse(err.to_string()))
    }
}

/// A configured rule that pins the decision for a set of tools.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ToolRuleDefinition {
    pub name: String,
    pub priority: i32,
    pub tools: Vec<String>,
    pub decision: PolicyDecision,
    pub risk_level: RiskLevel,
}

impl ToolRuleDefinition {
    fn to_rule(&self) -> Result<PolicyRule, PolicyError> {
        if self.name.trim().is_empty() {
            return Err(PolicyError::Invalid("rule name MUST be non-empty".to_string()));
        }
        if self.tools.is_empty() {
            return Err(PolicyError::Invalid(format!(
                "rule {} MUST name at least one tool",
                self.name
            )));
        }
        Ok(PolicyRule {
            name: self.name.trim().to_string(),
            priority: self.priority,
            kind: RuleKind::ToolDecision {
                tools: self.tools.iter().map(|tool| tool.trim().to_string()).collect(),
                decision: self.decision,
                risk_level: self.risk_level,
            },
        })
    }
}
