use serde_json::Value;
use taskgate_domain::{PolicyContext, RiskLevel};
use url::Url;

use crate::tables::{normalize_domain, PolicySnapshot};

pub const SENSITIVE_TOKENS: &[&str] = &[
    "password",
    "token",
    "secret",
    "key",
    "delete",
    "drop table",
    "rm -rf",
    "sudo",
];

/// Single string arguments longer than this are treated as medium risk.
pub const LARGE_ARGUMENT_CHARS: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgsRisk {
    pub level: RiskLevel,
    pub findings: Vec<String>,
}

/// Host of a URL, normalized for table lookups. Returns `None` for unparseable or host-less URLs.
#[must_use]
pub fn domain_of(raw_url: &str) -> Option<String> {
    let parsed = Url::parse(raw_url.trim()).ok()?;
    parsed.host_str().map(normalize_domain)
}

pub(crate) fn args_risk(context: &PolicyContext, snapshot: &PolicySnapshot) -> ArgsRisk {
    let mut level = RiskLevel::Low;
    let mut findings = Vec::new();

    if snapshot.navigation_tools.contains(&context.tool_name) {
        let destination = context
            .url
            .as_deref()
            .or_else(|| context.args.get("url").and_then(Value::as_str));
        if let Some(finding) = risky_destination(destination, snapshot) {
            level = RiskLevel::High;
            findings.push(finding);
        }
    }

    if snapshot.workflow_tools.contains(&context.tool_name) {
        for (index, destination) in embedded_navigation_targets(&context.args, snapshot) {
            if let Some(finding) = risky_destination(destination, snapshot) {
                level = RiskLevel::High;
                findings.push(format!("step {index}: {finding}"));
            }
        }
    }

    let serialized = context.args.to_string().to_ascii_lowercase();
    let hits: Vec<&str> = SENSITIVE_TOKENS
        .iter()
        .copied()
        .filter(|token| serialized.contains(token))
        .collect();
    if !hits.is_empty() {
        level = RiskLevel::High;
        findings.push(format!("sensitive terms in arguments: {}", hits.join(", ")));
    }

    if let Some(length) = longest_string(&context.args) {
        if length > LARGE_ARGUMENT_CHARS {
            level = level.max(RiskLevel::Medium);
            findings.push(format!("argument of {length} characters"));
        }
    }

    ArgsRisk { level, findings }
}

/// Unknown, unparseable or high-risk destinations all escalate.
fn risky_destination(destination: Option<&str>, snapshot: &PolicySnapshot) -> Option<String> {
    let Some(raw) = destination else {
        return Some("navigation without a destination url".to_string());
    };
    let Some(domain) = domain_of(raw) else {
        return Some(format!("unparseable destination {raw}"));
    };
    match snapshot.known_domain_risk(&domain) {
        None => Some(format!("unknown destination domain {domain}")),
        Some(RiskLevel::High) => Some(format!("high-risk destination domain {domain}")),
        Some(RiskLevel::Low | RiskLevel::Medium) => None,
    }
}

/// Navigation destinations inside a multi-step plan argument, by step index.
fn embedded_navigation_targets<'a>(
    args: &'a Value,
    snapshot: &PolicySnapshot,
) -> Vec<(usize, Option<&'a str>)> {
    let steps = args
        .get("steps")
        .or_else(|| args.get("plan").and_then(|plan| plan.get("steps")))
        .and_then(Value::as_array);
    let Some(steps) = steps else {
        return Vec::new();
    };

    steps
        .iter()
        .enumerate()
        .filter_map(|(index, step)| {
            let tool = ["tool", "tool_name", "action"]
                .iter()
                .find_map(|key| step.get(*key).and_then(Value::as_str))?;
            if !snapshot.navigation_tools.contains(tool) {
                return None;
            }
            let url = step
                .get("args")
                .and_then(|args| args.get("url"))
                .or_else(|| step.get("url"))
                .and_then(Value::as_str);
            Some((index, url))
        })
        .collect()
}

fn longest_string(value: &Value) -> Option<usize> {
    match value {
        Value::String(text) => Some(text.chars().count()),
        Value::Array(items) => items.iter().filter_map(longest_string).max(),
        Value::Object(map) => map.values().filter_map(longest_string).max(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::{args_risk, domain_of};
    use crate::tables::PolicySnapshot;
    use serde_json::{json, Value};
    use taskgate_domain::{PolicyContext, RiskLevel, UserMode};

    fn context(tool: &str, args: Value) -> PolicyContext {
        PolicyContext {
            tool_name: tool.to_string(),
            args,
            url: None,
            domain: None,
            user_mode: UserMode::Standard,
            run_id: None,
        }
    }

    #[test]
    fn domain_of_extracts_normalized_host() {
        assert_eq!(
            domain_of("https://WWW.GitHub.com/rust-lang"),
            Some("github.com".to_string())
        );
        assert_eq!(domain_of("not a url"), None);
        assert_eq!(domain_of("mailto:someone"), None);
    }

    #[test]
    fn navigation_to_unknown_domain_is_high() {
        let snapshot = PolicySnapshot::default();
        let known = args_risk(
            &context("browser_navigate", json!({"url": "https://github.com"})),
            &snapshot,
        );
        assert_eq!(known.level, RiskLevel::Low);

        let unknown = args_risk(
            &context("browser_navigate", json!({"url": "https://unlisted.test/x"})),
            &snapshot,
        );
        assert_eq!(unknown.level, RiskLevel::High);
        assert!(unknown.findings[0].contains("unlisted.test"));

        let high = args_risk(
            &context("navigate", json!({"url": "https://paypal.com"})),
            &snapshot,
        );
        assert_eq!(high.level, RiskLevel::High);
    }

    #[test]
    fn plan_steps_are_scanned_for_destinations() {
        let snapshot = PolicySnapshot::default();
        let safe = args_risk(
            &context(
                "execute_plan",
                json!({"steps": [
                    {"tool": "browser_navigate", "args": {"url": "https://docs.rs"}},
                    {"tool": "click", "args": {"selector": "#go"}}
                ]}),
            ),
            &snapshot,
        );
        assert_eq!(safe.level, RiskLevel::Low);

        let risky = args_risk(
            &context(
                "execute_plan",
                json!({"plan": {"steps": [
                    {"action": "navigate", "url": "https://docs.rs"},
                    {"action": "navigate", "url": "https://shady.test"}
                ]}}),
            ),
            &snapshot,
        );
        assert_eq!(risky.level, RiskLevel::High);
        assert!(risky.findings[0].starts_with("step 1:"));
    }

    #[test]
    fn sensitive_terms_escalate_case_insensitively() {
        let snapshot = PolicySnapshot::default();
        let risk = args_risk(
            &context("echo", json!({"command": "SUDO Rm -Rf /"})),
            &snapshot,
        );
        assert_eq!(risk.level, RiskLevel::High);
        assert!(risk.findings[0].contains("rm -rf"));
        assert!(risk.findings[0].contains("sudo"));
    }

    #[test]
    fn oversized_string_argument_is_medium() {
        let snapshot = PolicySnapshot::default();
        let body = "a".repeat(10_001);
        let risk = args_risk(&context("echo", json!({"body": [body]})), &snapshot);
        assert_eq!(risk.level, RiskLevel::Medium);

        let exact = "b".repeat(10_000);
        let risk = args_risk(&context("echo", json!({"body": exact})), &snapshot);
        assert_eq!(risk.level, RiskLevel::Low);
    }
}
