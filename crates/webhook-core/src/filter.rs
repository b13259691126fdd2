//! Payload filter expression evaluation (spec.md §4.6).
//!
//! `path=value`: dot-separated object key traversal from the payload root.
//! Missing segment or non-object traversal => no match. String terminal
//! nodes compare by string equality; anything else compares by its
//! textual JSON representation. Any other syntax is fail-open (always
//! matches) — the grammar may grow later without breaking existing
//! configurations.

use serde_json::Value;

/// Evaluate `filter_expression` against `payload`. `None`/empty always
/// matches.
pub fn evaluate(filter_expression: Option<&str>, payload: &Value) -> bool {
    let Some(expr) = filter_expression else {
        return true;
    };
    let expr = expr.trim();
    if expr.is_empty() {
        return true;
    }

    let Some((path, expected)) = expr.split_once('=') else {
        // Unrecognized syntax: fail-open.
        return true;
    };

    match traverse(payload, path) {
        Some(node) => compare(node, expected),
        None => false,
    }
}

fn traverse<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut node = root;
    for segment in path.split('.') {
        let obj = node.as_object()?;
        node = obj.get(segment)?;
    }
    Some(node)
}

fn compare(node: &Value, expected: &str) -> bool {
    match node {
        Value::String(s) => s == expected,
        other => other.to_string() == expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_or_absent_always_matches() {
        let payload = json!({"a": 1});
        assert!(evaluate(None, &payload));
        assert!(evaluate(Some(""), &payload));
        assert!(evaluate(Some("   "), &payload));
    }

    #[test]
    fn string_equality_on_terminal_string() {
        let payload = json!({"data": {"id": "c1"}});
        assert!(evaluate(Some("data.id=c1"), &payload));
        assert!(!evaluate(Some("data.id=c2"), &payload));
    }

    #[test]
    fn textual_comparison_for_non_string_terminal() {
        let payload = json!({"data": {"amount": 42}});
        assert!(evaluate(Some("data.amount=42"), &payload));
        assert!(!evaluate(Some("data.amount=43"), &payload));
    }

    #[test]
    fn missing_segment_is_no_match() {
        let payload = json!({"data": {"id": "c1"}});
        assert!(!evaluate(Some("data.missing=c1"), &payload));
        assert!(!evaluate(Some("nope.id=c1"), &payload));
    }

    #[test]
    fn non_object_traversal_is_no_match() {
        let payload = json!({"data": "not-an-object"});
        assert!(!evaluate(Some("data.id=c1"), &payload));
    }

    #[test]
    fn unrecognized_syntax_is_fail_open() {
        let payload = json!({"data": {"id": "c1"}});
        assert!(evaluate(Some("data.id CONTAINS c1"), &payload));
        assert!(evaluate(Some("not an expression at all"), &payload));
    }

    #[test]
    fn root_level_path() {
        assert!(evaluate(Some("type=x"), &json!({"type": "x"})));
        assert!(!evaluate(Some("type=y"), &json!({"type": "x"})));
    }
}
