//! Lenient extraction of a tool invocation from free-form model output.
//!
//! Models are asked to answer with a single `{"tool_call":{"name":..,"args":{..}}}`
//! object, but in practice they wrap it in code fences, surround it with prose,
//! forget to escape newlines inside strings, or get cut off mid-object. The
//! parser tries progressively more forgiving readings and only gives up when
//! not even a tool name can be recovered.

use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;

/// Literal that must appear in the text before any parsing is attempted.
pub const TOOL_CALL_MARKER: &str = "tool_call";

/// Upper bound on closing braces appended to repair a truncated object.
const MAX_REPAIR_BRACES: usize = 3;

static FENCE_OPEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)```(?:json)?\s*").unwrap());
static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#""name"\s*:\s*"([^"]+)""#).unwrap());
static ARGS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?s)"args"\s*:\s*\{(.*)\}\s*\}?\s*\}?\s*$"#).unwrap());

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub args: Map<String, Value>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, args: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }

    /// Canonical wire form, the same shape the model is instructed to emit.
    pub fn to_json(&self) -> String {
        serde_json::json!({ "tool_call": { "name": self.name, "args": self.args } }).to_string()
    }

    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }
}

/// True when the text mentions a tool call at all, parseable or not.
pub fn mentions_tool_call(text: &str) -> bool {
    text.contains(TOOL_CALL_MARKER)
}

/// Parse the first tool invocation found in `text`.
///
/// Returns `None` only when the marker is absent or no tool name can be
/// recovered. An invocation whose arguments could not be read comes back
/// with empty `args`; the tool itself is responsible for rejecting missing
/// fields.
pub fn parse_tool_call(text: &str) -> Option<ToolCall> {
    let stripped = strip_code_fences(text);
    if !mentions_tool_call(&stripped) {
        return None;
    }

    let start = stripped.find('{')?;
    let mut candidates: Vec<&str> = Vec::with_capacity(2);
    if let Some(end) = balanced_object_end(&stripped, start) {
        candidates.push(&stripped[start..=end]);
    }
    candidates.push(&stripped[start..]);

    for raw in candidates {
        let escaped = escape_control_chars(raw);
        for attempt in [raw, escaped.as_str()] {
            for extra in 0..=MAX_REPAIR_BRACES {
                let mut repaired = String::with_capacity(attempt.len() + extra);
                repaired.push_str(attempt);
                repaired.extend(std::iter::repeat_n('}', extra));
                if let Some(call) = read_tool_call(&repaired) {
                    return Some(call);
                }
            }
        }
    }

    regex_fallback(&stripped)
}

fn strip_code_fences(text: &str) -> String {
    FENCE_OPEN_RE
        .replace_all(text, "")
        .replace("```", "")
        .trim()
        .to_string()
}

/// Byte index of the `}` closing the object opened at `start`, honouring
/// string literals and backslash escapes.
fn balanced_object_end(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        if b == b'\\' && in_string {
            escaped = true;
            continue;
        }
        if b == b'"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        match b {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

fn escape_control_chars(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

fn read_tool_call(candidate: &str) -> Option<ToolCall> {
    let value: Value = serde_json::from_str(candidate).ok()?;
    let call = value.get(TOOL_CALL_MARKER)?;
    let name = call.get("name")?.as_str()?;
    let args = call
        .get("args")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    Some(ToolCall::new(name, args))
}

fn regex_fallback(stripped: &str) -> Option<ToolCall> {
    let name = NAME_RE.captures(stripped)?.get(1)?.as_str().to_string();

    let args = ARGS_RE
        .captures(stripped)
        .and_then(|caps| caps.get(1))
        .and_then(|body| read_args_body(body.as_str()))
        .unwrap_or_default();

    Some(ToolCall::new(name, args))
}

/// The greedy args capture may swallow the envelope's own closing braces,
/// so peel those off one at a time until the body reads as an object.
fn read_args_body(body: &str) -> Option<Map<String, Value>> {
    let escaped = escape_control_chars(body);
    let mut inner = escaped.as_str();
    for _ in 0..=MAX_REPAIR_BRACES {
        let wrapped = format!("{{{}}}", inner);
        if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(&wrapped) {
            return Some(map);
        }
        inner = inner.trim_end().strip_suffix('}')?;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_invocation() {
        let call = parse_tool_call(r#"{"tool_call":{"name":"get_current_time","args":{}}}"#)
            .expect("tool call");
        assert_eq!(call.name, "get_current_time");
        assert!(call.args.is_empty());
    }

    #[test]
    fn parses_fenced_invocation() {
        let text = "```json\n{\"tool_call\":{\"name\":\"run_shell_command\",\"args\":{\"command\":\"ls -la\"}}}\n```";
        let call = parse_tool_call(text).expect("tool call");
        assert_eq!(call.name, "run_shell_command");
        assert_eq!(call.arg_str("command"), Some("ls -la"));
    }

    #[test]
    fn ignores_surrounding_prose() {
        let text = r#"Sure, let me check. {"tool_call":{"name":"list_tasks","args":{"status":"backlog"}}} I'll report back."#;
        let call = parse_tool_call(text).expect("tool call");
        assert_eq!(call.name, "list_tasks");
        assert_eq!(call.arg_str("status"), Some("backlog"));
    }

    #[test]
    fn braces_inside_strings_do_not_end_the_object() {
        let text = r#"{"tool_call":{"name":"echo","args":{"text":"a } b { \" c"}}} trailing"#;
        let call = parse_tool_call(text).expect("tool call");
        assert_eq!(call.name, "echo");
        assert_eq!(call.arg_str("text"), Some("a } b { \" c"));
    }

    #[test]
    fn repairs_truncated_object() {
        let text = r#"{"tool_call":{"name":"run_shell_command","args":{"command":"pwd""#;
        let call = parse_tool_call(text).expect("tool call");
        assert_eq!(call.name, "run_shell_command");
        assert_eq!(call.arg_str("command"), Some("pwd"));
    }

    #[test]
    fn escapes_raw_newlines_inside_strings() {
        let text = "{\"tool_call\":{\"name\":\"create_note\",\"args\":{\"body\":\"line one\nline two\"}}}";
        let call = parse_tool_call(text).expect("tool call");
        assert_eq!(call.name, "create_note");
        assert_eq!(call.arg_str("body"), Some("line one\nline two"));
    }

    #[test]
    fn returns_none_without_marker() {
        assert!(parse_tool_call("The answer is 42.").is_none());
        assert!(parse_tool_call(r#"{"name":"x","args":{}}"#).is_none());
    }

    #[test]
    fn returns_none_when_marker_has_no_object() {
        assert!(parse_tool_call("I could emit a tool_call here but won't").is_none());
    }

    #[test]
    fn falls_back_to_name_with_empty_args() {
        let text = r#"{"tool_call": {"name": "send_email", "args": oops}} thanks"#;
        let call = parse_tool_call(text).expect("tool call");
        assert_eq!(call.name, "send_email");
        assert!(call.args.is_empty());
    }

    #[test]
    fn fallback_recovers_args_when_envelope_is_damaged() {
        let text = "tool_call {\"name\": \"open_url\", \"args\": {\"url\": \"example.com\"}}";
        let call = parse_tool_call(text).expect("tool call");
        assert_eq!(call.name, "open_url");
        assert_eq!(call.arg_str("url"), Some("example.com"));
    }

    #[test]
    fn non_object_args_become_empty() {
        let call = parse_tool_call(r#"{"tool_call":{"name":"x","args":"ls"}}"#).expect("tool call");
        assert_eq!(call.name, "x");
        assert!(call.args.is_empty());
    }

    #[test]
    fn reparsing_canonical_form_is_stable() {
        let text = "```\n{\"tool_call\":{\"name\":\"create_task\",\"args\":{\"title\":\"Fix\",\"priority\":\"high\"}}}\n``` done";
        let first = parse_tool_call(text).expect("tool call");
        let second = parse_tool_call(&first.to_json()).expect("tool call");
        assert_eq!(first, second);
    }

    #[test]
    fn balanced_scan_reports_closing_index() {
        let text = r#"xx {"a":{"b":"}"}} yy"#;
        let start = text.find('{').unwrap();
        let end = balanced_object_end(text, start).unwrap();
        assert_eq!(&text[start..=end], r#"{"a":{"b":"}"}}"#);
    }

    #[test]
    fn unbalanced_scan_returns_none() {
        assert!(balanced_object_end(r#"{"a":{"b":1}"#, 0).is_none());
    }
}
