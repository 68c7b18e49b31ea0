/// Ordered-key-path extraction shared by all adapters.
///
/// Different backends place the same logical value under different keys
/// (a session id under `session_id` or `chatId`, aggregate text under any of
/// five keys). Centralizing the lookup order here makes a new backend quirk a
/// one-place change.

use serde_json::Value;

/// One step into a nested JSON document.
#[derive(Debug, Clone, Copy)]
pub enum Step {
    Key(&'static str),
    Index(usize),
}

/// Walk a nested path of object keys and array indices.
pub fn value_at<'a>(json: &'a Value, path: &[Step]) -> Option<&'a Value> {
    let mut current = json;
    for step in path {
        current = match step {
            Step::Key(k) => current.get(k)?,
            Step::Index(i) => current.get(i)?,
        };
    }
    Some(current)
}

/// String at a nested path, if present.
pub fn str_at<'a>(json: &'a Value, path: &[Step]) -> Option<&'a str> {
    value_at(json, path).and_then(|v| v.as_str())
}

/// First string value found under any of the given top-level keys.
pub fn first_str<'a>(json: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| json.get(*k).and_then(|v| v.as_str()))
}

/// Keys a session/chat identifier may appear under, on any event.
pub const SESSION_ID_KEYS: &[&str] = &["session_id", "chatId"];

pub fn session_id(json: &Value) -> Option<&str> {
    first_str(json, SESSION_ID_KEYS)
}

/// Priority order for extracting text from a single aggregate payload.
pub const AGGREGATE_TEXT_KEYS: &[&str] = &["response", "text", "result", "output", "message"];

/// First non-empty string under the aggregate keys.
pub fn aggregate_text(json: &Value) -> Option<&str> {
    AGGREGATE_TEXT_KEYS.iter().find_map(|k| {
        json.get(*k)
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_at_nested() {
        let json: Value = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"hi"}]}}]}"#,
        )
        .unwrap();
        let path = [
            Step::Key("candidates"),
            Step::Index(0),
            Step::Key("content"),
            Step::Key("parts"),
            Step::Index(0),
            Step::Key("text"),
        ];
        assert_eq!(str_at(&json, &path), Some("hi"));
    }

    #[test]
    fn test_value_at_missing_step() {
        let json: Value = serde_json::from_str(r#"{"candidates":[]}"#).unwrap();
        let path = [Step::Key("candidates"), Step::Index(0), Step::Key("text")];
        assert!(str_at(&json, &path).is_none());
    }

    #[test]
    fn test_session_id_under_session_id_key() {
        let json: Value = serde_json::from_str(r#"{"type":"text","session_id":"s-1"}"#).unwrap();
        assert_eq!(session_id(&json), Some("s-1"));
    }

    #[test]
    fn test_session_id_under_chat_id_key() {
        let json: Value = serde_json::from_str(r#"{"type":"result","chatId":"c-9"}"#).unwrap();
        assert_eq!(session_id(&json), Some("c-9"));
    }

    #[test]
    fn test_session_id_prefers_first_key() {
        let json: Value =
            serde_json::from_str(r#"{"session_id":"s-1","chatId":"c-9"}"#).unwrap();
        assert_eq!(session_id(&json), Some("s-1"));
    }

    #[test]
    fn test_aggregate_text_priority() {
        let json: Value =
            serde_json::from_str(r#"{"text":"second","response":"first"}"#).unwrap();
        assert_eq!(aggregate_text(&json), Some("first"));
    }

    #[test]
    fn test_aggregate_text_skips_empty_values() {
        let json: Value =
            serde_json::from_str(r#"{"response":"  ","result":"third"}"#).unwrap();
        assert_eq!(aggregate_text(&json), Some("third"));
    }

    #[test]
    fn test_aggregate_text_none_when_absent() {
        let json: Value = serde_json::from_str(r#"{"stats":{}}"#).unwrap();
        assert!(aggregate_text(&json).is_none());
    }
}
