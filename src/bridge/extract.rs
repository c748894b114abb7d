//! Reply extraction from gateway responses of unknown shape.

use serde_json::Value;

/// Candidate locations of the reply text, most specific shapes last.
pub const REPLY_FIELD_PATHS: &[&str] = &[
    "reply",
    "response",
    "result",
    "message",
    "content",
    "text",
    "data.reply",
    "data.response",
    "data.message",
    "choices.0.message.content",
];

/// Resolve a dotted path such as `data.reply` or `choices.0.message.content`.
///
/// Numeric segments index into arrays; any missing key or out-of-range index
/// yields `None`.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment
            .parse::<usize>()
            .ok()
            .and_then(|index| items.get(index)),
        _ => None,
    })
}

/// Whether a value counts as present (not null, empty, `false` or zero).
fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Pick the reply text out of an already-parsed response.
pub fn reply_from_value(value: &Value) -> String {
    if let Value::String(s) = value {
        return s.clone();
    }

    if value.is_object() {
        let found = REPLY_FIELD_PATHS
            .iter()
            .filter_map(|path| lookup_path(value, path))
            .find(|candidate| is_present(candidate));
        if let Some(found) = found {
            return render(found);
        }
    }

    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Extract `(reply_text, raw_response)` from a successful response body.
///
/// Bodies that are not JSON are returned verbatim and wrapped as
/// `{"text": body}` for the raw response.
pub fn extract_reply(body: &str) -> (String, Value) {
    match serde_json::from_str::<Value>(body) {
        Ok(value) => (reply_from_value(&value), value),
        Err(_) => (
            body.to_string(),
            serde_json::json!({ "text": body }),
        ),
    }
}
