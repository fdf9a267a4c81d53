use serde::{ Serialize, Deserialize };
use serde_json::Value as JsonValue;

use super::chat::{ ChatMessage, Role };
use crate::error::RelayError;

pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 512;
pub const DEFAULT_TOP_P: f32 = 1.0;

/// Generation controls. Every field is optional; engines fill the gaps with
/// the defaults from [`SamplingParams::resolve`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
}

/// Sampling parameters with every default applied and ranges checked.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResolvedSampling {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    pub stop: Vec<String>,
}

impl SamplingParams {
    pub fn resolve(&self) -> Result<ResolvedSampling, RelayError> {
        let resolved = ResolvedSampling {
            temperature: self.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            max_tokens: self.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            top_p: self.top_p.unwrap_or(DEFAULT_TOP_P),
            presence_penalty: self.presence_penalty.unwrap_or(0.0),
            frequency_penalty: self.frequency_penalty.unwrap_or(0.0),
            stop: self.stop.clone().unwrap_or_default(),
        };

        if !resolved.temperature.is_finite() || resolved.temperature < 0.0 {
            return Err(invalid_sampling("temperature must be >= 0"));
        }
        if resolved.max_tokens == 0 {
            return Err(invalid_sampling("max_tokens must be at least 1"));
        }
        if !(resolved.top_p > 0.0 && resolved.top_p <= 1.0) {
            return Err(invalid_sampling("top_p must be in (0, 1]"));
        }
        for (name, value) in [
            ("presence_penalty", resolved.presence_penalty),
            ("frequency_penalty", resolved.frequency_penalty),
        ] {
            if !(-2.0..=2.0).contains(&value) {
                return Err(invalid_sampling(&format!("{} must be in [-2, 2]", name)));
            }
        }
        Ok(resolved)
    }
}

fn invalid_sampling(detail: &str) -> RelayError {
    RelayError::validation(format!("Invalid sampling parameters: {}", detail))
}

/// The decrypted inner payload: chat history, or the legacy single prompt.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<ChatMessage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default)]
    pub sampling_params: SamplingParams,
}

/// What the engine adapters consume once a request has been validated.
#[derive(Clone, Debug, PartialEq)]
pub enum RequestInput {
    Messages(Vec<ChatMessage>),
    Prompt(String),
}

impl RequestInput {
    /// Chat view of the input; a legacy prompt becomes one user turn.
    pub fn to_messages(&self) -> Vec<ChatMessage> {
        match self {
            RequestInput::Messages(messages) => messages.clone(),
            RequestInput::Prompt(prompt) => vec![ChatMessage::user(prompt.clone())],
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ValidatedRequest {
    pub input: RequestInput,
    pub sampling: ResolvedSampling,
}

impl InferenceRequest {
    pub fn chat(messages: Vec<ChatMessage>, sampling_params: SamplingParams) -> Self {
        Self { messages: Some(messages), prompt: None, sampling_params }
    }

    pub fn legacy_prompt(prompt: impl Into<String>, sampling_params: SamplingParams) -> Self {
        Self { messages: None, prompt: Some(prompt.into()), sampling_params }
    }

    /// Parses a decrypted JSON value. Structural problems in `messages` or
    /// `sampling_params` are reported separately so the client can tell them apart.
    pub fn from_value(value: JsonValue) -> Result<Self, RelayError> {
        let mut object = match value {
            JsonValue::Object(map) => map,
            _ => {
                return Err(RelayError::validation("Request payload must be a JSON object."));
            }
        };

        let sampling_params = match object.remove("sampling_params") {
            None | Some(JsonValue::Null) => SamplingParams::default(),
            Some(raw) =>
                serde_json
                    ::from_value(raw)
                    .map_err(|e| invalid_sampling(&e.to_string()))?,
        };

        let messages = match object.remove("messages") {
            None | Some(JsonValue::Null) => None,
            Some(raw) =>
                Some(
                    serde_json
                        ::from_value::<Vec<ChatMessage>>(raw)
                        .map_err(|e| RelayError::validation(format!("Invalid messages: {}", e)))?
                ),
        };

        let prompt = match object.remove("prompt") {
            None | Some(JsonValue::Null) => None,
            Some(JsonValue::String(s)) => Some(s),
            Some(_) => {
                return Err(RelayError::validation("Prompt must be a string."));
            }
        };

        Ok(Self { messages, prompt, sampling_params })
    }

    pub fn validate(&self) -> Result<ValidatedRequest, RelayError> {
        let input = match (&self.messages, &self.prompt) {
            (Some(messages), _) if !messages.is_empty() => {
                if !messages.iter().any(|m| m.role == Role::User) {
                    return Err(RelayError::validation("Messages contain no user turn."));
                }
                RequestInput::Messages(messages.clone())
            }
            (_, Some(prompt)) if !prompt.is_empty() => RequestInput::Prompt(prompt.clone()),
            _ => {
                return Err(RelayError::validation("No prompt or messages provided in encrypted payload."));
            }
        };
        Ok(ValidatedRequest { input, sampling: self.sampling_params.resolve()? })
    }
}

/// `{"input": {"encrypted_input": ...}}` as posted by the client.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub input: JobInput,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JobInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_input: Option<String>,
}

impl JobRequest {
    pub fn new(envelope: String) -> Self {
        Self { input: JobInput { encrypted_input: Some(envelope) } }
    }
}
