//! Chat templates for prompt-based engines.
//!
//! Only the handful of turn formats the supported models are trained on are
//! rendered natively. A model whose template matches none of them gets a
//! role-labelled transcript of the whole conversation.

use log::warn;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::error::RelayError;
use crate::models::chat::{ format_transcript, ChatMessage, Role };

const TOKENIZER_CONFIG: &str = "tokenizer_config.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatFormat {
    ChatMl,
    Llama3,
    MistralInstruct,
    Gemma,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseChatFormatError {
    message: String,
}

impl fmt::Display for ParseChatFormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseChatFormatError {}

impl FromStr for ChatFormat {
    type Err = ParseChatFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "chatml" => Ok(ChatFormat::ChatMl),
            "llama-3" | "llama3" => Ok(ChatFormat::Llama3),
            "mistral-instruct" | "mistral" | "llama-2" | "llama2" => Ok(ChatFormat::MistralInstruct),
            "gemma" => Ok(ChatFormat::Gemma),
            _ =>
                Err(ParseChatFormatError {
                    message: format!(
                        "Invalid chat format: '{}' (expected chatml, llama-3, mistral-instruct or gemma)",
                        s
                    ),
                }),
        }
    }
}

impl fmt::Display for ChatFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChatFormat::ChatMl => "chatml",
            ChatFormat::Llama3 => "llama-3",
            ChatFormat::MistralInstruct => "mistral-instruct",
            ChatFormat::Gemma => "gemma",
        };
        f.write_str(name)
    }
}

impl ChatFormat {
    /// Name of the equivalent built-in template of `llama-server --chat-template`.
    pub fn llama_cpp_name(&self) -> &'static str {
        match self {
            ChatFormat::ChatMl => "chatml",
            ChatFormat::Llama3 => "llama3",
            ChatFormat::MistralInstruct => "llama2",
            ChatFormat::Gemma => "gemma",
        }
    }

    /// Recognizes a format from the marker tokens in a Jinja chat template.
    pub fn detect(template: &str) -> Option<Self> {
        if template.contains("<|im_start|>") {
            Some(ChatFormat::ChatMl)
        } else if template.contains("<|start_header_id|>") {
            Some(ChatFormat::Llama3)
        } else if template.contains("<start_of_turn>") {
            Some(ChatFormat::Gemma)
        } else if template.contains("[INST]") {
            Some(ChatFormat::MistralInstruct)
        } else {
            None
        }
    }
}

/// Prompt-rendering metadata read from a model snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelMetadata {
    pub eos_token: Option<String>,
    pub chat_template: Option<String>,
}

#[derive(Deserialize)]
struct TokenizerConfig {
    #[serde(default)]
    eos_token: Option<JsonValue>,
    #[serde(default)]
    chat_template: Option<JsonValue>,
}

impl ModelMetadata {
    /// Reads `tokenizer_config.json` from a snapshot directory. A snapshot
    /// without one (e.g. a bare GGUF repo) yields empty metadata.
    pub fn load(model_dir: &Path) -> Result<Self, RelayError> {
        let path = model_dir.join(TOKENIZER_CONFIG);
        if !path.is_file() {
            return Ok(Self::default());
        }
        let raw = fs::read_to_string(&path).map_err(|e|
            RelayError::initialization(format!("Failed to read {}: {}", path.display(), e))
        )?;
        Self::from_json(&raw).map_err(|e|
            RelayError::initialization(format!("Failed to parse {}: {}", path.display(), e))
        )
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        let config: TokenizerConfig = serde_json::from_str(raw)?;
        Ok(Self {
            eos_token: config.eos_token.as_ref().and_then(token_text),
            chat_template: config.chat_template.as_ref().and_then(template_text),
        })
    }
}

/// Special tokens appear either as plain strings or as
/// `{"content": "...", "lstrip": false, ...}` objects.
fn token_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Object(map) => map.get("content").and_then(|c| c.as_str()).map(str::to_string),
        _ => None,
    }
}

/// Either a single template or a list of `{"name", "template"}` entries.
fn template_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Array(entries) => {
            entries
                .iter()
                .find(|e| e.get("name").and_then(|n| n.as_str()) == Some("default"))
                .or_else(|| entries.first())
                .and_then(|e| e.get("template"))
                .and_then(|t| t.as_str())
                .map(str::to_string)
        }
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct PromptRenderer {
    format: Option<ChatFormat>,
}

impl PromptRenderer {
    /// An explicitly requested format wins over detection from metadata.
    pub fn new(requested: Option<ChatFormat>, metadata: &ModelMetadata) -> Self {
        let format = requested.or_else(|| {
            let detected = metadata.chat_template.as_deref().and_then(ChatFormat::detect);
            if detected.is_none() && metadata.chat_template.is_some() {
                warn!("Model chat template not recognized, falling back to a plain transcript");
            }
            detected
        });
        Self { format }
    }

    pub fn format(&self) -> Option<ChatFormat> {
        self.format
    }

    /// Renders the conversation and opens the assistant turn. BOS tokens are
    /// left to the engine's tokenizer.
    pub fn render(&self, messages: &[ChatMessage]) -> String {
        match self.format {
            Some(ChatFormat::ChatMl) => render_chatml(messages),
            Some(ChatFormat::Llama3) => render_llama3(messages),
            Some(ChatFormat::MistralInstruct) => render_mistral(messages),
            Some(ChatFormat::Gemma) => render_gemma(messages),
            None => format_transcript(messages),
        }
    }
}

fn render_chatml(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for msg in messages {
        out.push_str(&format!("<|im_start|>{}\n{}<|im_end|>\n", msg.role, msg.content));
    }
    out.push_str("<|im_start|>assistant\n");
    out
}

fn render_llama3(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for msg in messages {
        out.push_str(
            &format!("<|start_header_id|>{}<|end_header_id|>\n\n{}<|eot_id|>", msg.role, msg.content.trim())
        );
    }
    out.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
    out
}

/// Formats without a system role fold system text into the first user turn.
fn fold_system(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    let mut turns: Vec<ChatMessage> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .cloned()
        .collect();
    if !system.is_empty() {
        if let Some(first_user) = turns.iter_mut().find(|m| m.role == Role::User) {
            first_user.content = format!("{}\n\n{}", system.join("\n"), first_user.content);
        }
    }
    turns
}

fn render_mistral(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for msg in fold_system(messages) {
        match msg.role {
            Role::User => out.push_str(&format!("[INST] {} [/INST]", msg.content.trim())),
            Role::Assistant => out.push_str(&format!(" {}</s>", msg.content.trim())),
            Role::System => {}
        }
    }
    out
}

fn render_gemma(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for msg in fold_system(messages) {
        let role = match msg.role {
            Role::Assistant => "model",
            _ => "user",
        };
        out.push_str(&format!("<start_of_turn>{}\n{}<end_of_turn>\n", role, msg.content.trim()));
    }
    out.push_str("<start_of_turn>model\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation() -> Vec<ChatMessage> {
        vec![
            ChatMessage::system("Be brief."),
            ChatMessage::user("Hi"),
            ChatMessage::assistant("Hello!"),
            ChatMessage::user("Name a colour")
        ]
    }

    #[test]
    fn test_chatml_render() {
        let renderer = PromptRenderer::new(Some(ChatFormat::ChatMl), &ModelMetadata::default());
        assert_eq!(
            renderer.render(&conversation()),
            "<|im_start|>system\nBe brief.<|im_end|>\n<|im_start|>user\nHi<|im_end|>\n\
             <|im_start|>assistant\nHello!<|im_end|>\n<|im_start|>user\nName a colour<|im_end|>\n\
             <|im_start|>assistant\n"
        );
    }

    #[test]
    fn test_mistral_folds_system_prompt() {
        let renderer = PromptRenderer::new(Some(ChatFormat::MistralInstruct), &ModelMetadata::default());
        assert_eq!(
            renderer.render(&conversation()),
            "[INST] Be brief.\n\nHi [/INST] Hello!</s>[INST] Name a colour [/INST]"
        );
    }

    #[test]
    fn test_gemma_uses_model_role() {
        let renderer = PromptRenderer::new(Some(ChatFormat::Gemma), &ModelMetadata::default());
        let prompt = renderer.render(&conversation());
        assert!(prompt.starts_with("<start_of_turn>user\nBe brief.\n\nHi<end_of_turn>\n"));
        assert!(prompt.contains("<start_of_turn>model\nHello!<end_of_turn>\n"));
        assert!(prompt.ends_with("<start_of_turn>model\n"));
    }

    #[test]
    fn test_format_detected_from_template() {
        let metadata = ModelMetadata {
            eos_token: Some("<|eot_id|>".into()),
            chat_template: Some("{% for m in messages %}<|start_header_id|>{{ m.role }}...".into()),
        };
        let renderer = PromptRenderer::new(None, &metadata);
        assert_eq!(renderer.format(), Some(ChatFormat::Llama3));
        assert!(renderer.render(&conversation()).ends_with("<|start_header_id|>assistant<|end_header_id|>\n\n"));
    }

    #[test]
    fn test_requested_format_overrides_detection() {
        let metadata = ModelMetadata { chat_template: Some("<|im_start|>".into()), ..Default::default() };
        let renderer = PromptRenderer::new(Some(ChatFormat::Gemma), &metadata);
        assert_eq!(renderer.format(), Some(ChatFormat::Gemma));
    }

    #[test]
    fn test_unknown_template_keeps_full_history() {
        let renderer = PromptRenderer::new(None, &ModelMetadata::default());
        let prompt = renderer.render(&conversation());
        assert!(prompt.contains("User: Hi"));
        assert!(prompt.contains("Assistant: Hello!"));
        assert!(prompt.ends_with("User: Name a colour\nAssistant:"));
    }

    #[test]
    fn test_metadata_token_shapes() {
        let raw = r#"{
            "eos_token": {"content": "</s>", "lstrip": false},
            "chat_template": [
                {"name": "tool_use", "template": "tools"},
                {"name": "default", "template": "[INST] {{ m }}"}
            ]
        }"#;
        let metadata = ModelMetadata::from_json(raw).unwrap();
        assert_eq!(metadata.eos_token.as_deref(), Some("</s>"));
        assert_eq!(metadata.chat_template.as_deref(), Some("[INST] {{ m }}"));
    }

    #[test]
    fn test_metadata_loaded_from_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(ModelMetadata::load(dir.path()).unwrap(), ModelMetadata::default());

        fs::write(
            dir.path().join(TOKENIZER_CONFIG),
            r#"{"eos_token": "<|im_end|>", "chat_template": "<|im_start|>"}"#
        ).unwrap();
        let metadata = ModelMetadata::load(dir.path()).unwrap();
        assert_eq!(metadata.eos_token.as_deref(), Some("<|im_end|>"));

        fs::write(dir.path().join(TOKENIZER_CONFIG), "{not json").unwrap();
        assert!(matches!(ModelMetadata::load(dir.path()), Err(RelayError::Initialization(_))));
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!("ChatML".parse::<ChatFormat>(), Ok(ChatFormat::ChatMl));
        assert_eq!("llama3".parse::<ChatFormat>(), Ok(ChatFormat::Llama3));
        assert!("alpaca".parse::<ChatFormat>().is_err());
    }
}
