use serde::{ Serialize, Deserialize };
use serde_json::{ json, Value as JsonValue };

/// Canonical unit of the output stream.
///
/// On the wire a `Text` token is a bare JSON string and an `Error` token is
/// `{"error": message}`, the same shapes the normalizer accepts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Token {
    Text(String),
    Error(String),
}

impl Token {
    pub fn is_error(&self) -> bool {
        matches!(self, Token::Error(_))
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Token::Text(text) => JsonValue::String(text.clone()),
            Token::Error(message) => json!({ "error": message }),
        }
    }
}

/// Normalizes a raw delta value.
///
/// Lists concatenate, an object with an `error` key becomes an error token,
/// anything else is coerced to text (`null` to empty text). A list holding
/// an error object yields that error.
pub fn normalize(raw: &JsonValue) -> Token {
    match raw {
        JsonValue::Array(fragments) => {
            let mut text = String::new();
            for fragment in fragments {
                if let Some(message) = error_message(fragment) {
                    return Token::Error(message);
                }
                push_text(&mut text, fragment);
            }
            Token::Text(text)
        }
        other =>
            match error_message(other) {
                Some(message) => Token::Error(message),
                None => {
                    let mut text = String::new();
                    push_text(&mut text, other);
                    Token::Text(text)
                }
            }
    }
}

/// Message of an `{"error": ...}` object, if `value` is one.
fn error_message(value: &JsonValue) -> Option<String> {
    let error = value.as_object()?.get("error")?;
    Some(match error {
        JsonValue::String(s) => s.clone(),
        JsonValue::Object(inner) =>
            match inner.get("message") {
                Some(JsonValue::String(s)) => s.clone(),
                _ => error.to_string(),
            }
        other => other.to_string(),
    })
}

fn push_text(buf: &mut String, value: &JsonValue) {
    match value {
        JsonValue::String(s) => buf.push_str(s),
        JsonValue::Null => {}
        other => buf.push_str(&other.to_string()),
    }
}

/// Two-channel delta emitted by chat engines for "thinking" models.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub reasoning_content: Option<String>,
}

impl ChannelDelta {
    /// `content` else `reasoning_content` else nothing.
    pub fn preferred_text(&self) -> Option<&str> {
        self.content
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.reasoning_content.as_deref().filter(|s| !s.is_empty()))
    }
}

/// One delta as produced by an engine adapter, before normalization.
#[derive(Clone, Debug, PartialEq)]
pub enum RawDelta {
    /// String, list of strings, or error object.
    Payload(JsonValue),
    Channels(ChannelDelta),
}

impl RawDelta {
    pub fn text(text: impl Into<String>) -> Self {
        RawDelta::Payload(JsonValue::String(text.into()))
    }

    /// `None` when the delta carries nothing worth forwarding.
    pub fn into_token(self) -> Option<Token> {
        match self {
            RawDelta::Payload(value) => Some(normalize(&value)),
            RawDelta::Channels(channels) =>
                channels.preferred_text().map(|text| Token::Text(text.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_concatenates_without_separator() {
        assert_eq!(normalize(&json!(["a", "b", "c"])), Token::Text("abc".into()));
    }

    #[test]
    fn test_error_object_yields_error_token() {
        match normalize(&json!({"error": "x"})) {
            Token::Error(msg) => assert!(msg.contains('x')),
            other => panic!("expected error token, got {:?}", other),
        }
    }

    #[test]
    fn test_nested_error_message_extracted() {
        let token = normalize(&json!({"error": {"message": "context overflow", "code": 400}}));
        assert_eq!(token, Token::Error("context overflow".into()));
    }

    #[test]
    fn test_error_inside_list_is_an_error() {
        let token = normalize(&json!([{"error": "Decryption failed or invalid key."}]));
        assert_eq!(token, Token::Error("Decryption failed or invalid key.".into()));
        assert_eq!(normalize(&json!(["ok", {"error": "late"}])), Token::Error("late".into()));
    }

    #[test]
    fn test_empty_string_is_empty_text() {
        assert_eq!(normalize(&json!("")), Token::Text(String::new()));
        assert_eq!(normalize(&JsonValue::Null), Token::Text(String::new()));
    }

    #[test]
    fn test_scalars_coerced() {
        assert_eq!(normalize(&json!(42)), Token::Text("42".into()));
        assert_eq!(normalize(&json!({"text": "x"})), Token::Text(r#"{"text":"x"}"#.into()));
    }

    #[test]
    fn test_reasoning_only_produces_reasoning_text() {
        let delta = RawDelta::Channels(ChannelDelta {
            content: None,
            reasoning_content: Some("thinking".into()),
        });
        assert_eq!(delta.into_token(), Some(Token::Text("thinking".into())));
    }

    #[test]
    fn test_content_preferred_over_reasoning() {
        let delta = RawDelta::Channels(ChannelDelta {
            content: Some("answer".into()),
            reasoning_content: Some("thinking".into()),
        });
        assert_eq!(delta.into_token(), Some(Token::Text("answer".into())));
    }

    #[test]
    fn test_empty_channels_skipped() {
        let delta = RawDelta::Channels(ChannelDelta::default());
        assert_eq!(delta.into_token(), None);
    }

    #[test]
    fn test_token_wire_shape() {
        assert_eq!(Token::Text("hi".into()).to_json(), json!("hi"));
        assert_eq!(Token::Error("boom".into()).to_json(), json!({"error": "boom"}));
        assert_eq!(normalize(&Token::Error("boom".into()).to_json()), Token::Error("boom".into()));
    }
}
