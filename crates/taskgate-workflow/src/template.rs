use serde_json::{json, Map, Value};
use taskgate_domain::RunContext;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Resolve every templated argument of a task against the run context.
#[must_use]
pub fn resolve_args(args: &Map<String, Value>, context: &RunContext) -> Map<String, Value> {
    args.iter()
        .map(|(key, value)| (key.clone(), resolve_value(value, context)))
        .collect()
}

/// Recursively resolve placeholders inside strings; non-string leaves pass through.
#[must_use]
pub fn resolve_value(value: &Value, context: &RunContext) -> Value {
    match value {
        Value::String(text) => Value::String(resolve_template_str(text, context)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_value(item, context))
                .collect(),
        ),
        Value::Object(map) => Value::Object(resolve_args(map, context)),
        other => other.clone(),
    }
}

/// Substitute `{{taskId.prop.subprop}}` placeholders.
///
/// A placeholder whose task or path is missing is kept verbatim.
#[must_use]
pub fn resolve_template_str(text: &str, context: &RunContext) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find(OPEN) {
        let after_open = &rest[start + OPEN.len()..];
        let Some(end) = after_open.find(CLOSE) else {
            break;
        };
        let expression = &after_open[..end];
        if expression.contains('{') {
            // Another opener sits inside; the real placeholder starts later.
            out.push_str(&rest[..=start]);
            rest = &rest[start + 1..];
            continue;
        }
        let placeholder_len = OPEN.len() + end + CLOSE.len();

        out.push_str(&rest[..start]);
        match lookup_path(expression, context) {
            Some(resolved) => out.push_str(&render(resolved)),
            None => out.push_str(&rest[start..start + placeholder_len]),
        }
        rest = &rest[start + placeholder_len..];
    }

    out.push_str(rest);
    out
}

fn lookup_path<'a>(expression: &str, context: &'a RunContext) -> Option<&'a Value> {
    let expression = expression.trim();
    if expression.is_empty() || expression.contains('}') {
        return None;
    }

    let mut segments = expression.split('.');
    let task_id = segments.next()?;
    let mut current = context.get(task_id)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn render(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Store shape for a tool's raw output: parsed JSON when possible, otherwise `{"raw": ...}`.
#[must_use]
pub fn capture_result(raw: &str) -> Value {
    serde_json::from_str::<Value>(raw).unwrap_or_else(|_| json!({ "raw": raw }))
}

#[cfg(test)]
mod tests {
    use super::{capture_result, resolve_args, resolve_template_str};
    use serde_json::{json, Map, Value};
    use taskgate_domain::RunContext;

    fn context() -> RunContext {
        let mut context = RunContext::new();
        context.insert_once("t1", json!({"text": "X", "nested": {"count": 3}}));
        context.insert_once("search", json!({"results": ["first", "second"]}));
        context.insert_once("page", json!({"raw": "<html>"}));
        context
    }

    #[test]
    fn substitutes_dot_paths() {
        assert_eq!(resolve_template_str("Val: {{t1.text}}", &context()), "Val: X");
        assert_eq!(
            resolve_template_str("{{ t1.nested.count }} items", &context()),
            "3 items"
        );
        assert_eq!(
            resolve_template_str("{{search.results.1}}", &context()),
            "second"
        );
        assert_eq!(resolve_template_str("{{page.raw}}", &context()), "<html>");
    }

    #[test]
    fn unresolved_placeholders_are_left_verbatim() {
        let context = context();
        for text in [
            "Val: {{missing.text}}",
            "Val: {{t1.absent}}",
            "Val: {{t1.text.deeper}}",
            "Val: {{search.results.9}}",
            "Val: {{}}",
            "Val: {{t1.text",
        ] {
            assert_eq!(resolve_template_str(text, &context), text);
        }
    }

    #[test]
    fn mixes_resolved_and_unresolved_placeholders() {
        assert_eq!(
            resolve_template_str("{{t1.text}}-{{nope.x}}-{{t1.text}}", &context()),
            "X-{{nope.x}}-X"
        );
    }

    #[test]
    fn stray_openers_do_not_hide_later_placeholders() {
        let context = context();
        assert_eq!(resolve_template_str("set {{ {{t1.text}}", &context), "set {{ X");
        assert_eq!(resolve_template_str("{{{t1.text}}}", &context), "{X}");
        assert_eq!(
            resolve_template_str("a {{ b {{nope.x}} c {{t1.text}}", &context),
            "a {{ b {{nope.x}} c X"
        );
    }

    #[test]
    fn non_string_values_render_as_json() {
        assert_eq!(
            resolve_template_str("{{t1.nested}}", &context()),
            r#"{"count":3}"#
        );
    }

    #[test]
    fn nested_arguments_resolve_recursively() {
        let mut args = Map::new();
        args.insert("query".to_string(), json!("about {{t1.text}}"));
        args.insert("limit".to_string(), json!(5));
        args.insert(
            "steps".to_string(),
            json!([{"url": "https://{{t1.text}}.example"}, true, null]),
        );

        let resolved = resolve_args(&args, &context());
        assert_eq!(resolved.get("query"), Some(&json!("about X")));
        assert_eq!(resolved.get("limit"), Some(&json!(5)));
        assert_eq!(
            resolved.get("steps"),
            Some(&json!([{"url": "https://X.example"}, true, null]))
        );
    }

    #[test]
    fn capture_parses_json_or_wraps_raw_text() {
        assert_eq!(capture_result(r#"{"text": "hi"}"#), json!({"text": "hi"}));
        assert_eq!(capture_result("[1,2]"), json!([1, 2]));
        assert_eq!(
            capture_result("plain output"),
            json!({"raw": "plain output"})
        );
        assert_eq!(capture_result(""), json!({"raw": Value::String(String::new())}));
    }
}
