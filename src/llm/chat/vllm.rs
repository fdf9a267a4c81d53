use async_trait::async_trait;
use log::{ debug, info };
use reqwest::Client as HttpClient;
use serde::Serialize;
use serde_json::Value as JsonValue;

use super::{ http_stream_generate, DeltaStream, InferenceEngine, ParsedRecord };
use crate::error::RelayError;
use crate::llm::template::{ ChatFormat, ModelMetadata, PromptRenderer };
use crate::models::{ normalize, RawDelta, RequestInput, Token, ValidatedRequest };
use crate::relay::StreamingMode;

/// `/generate` ends records with NUL on older vLLM releases and with a
/// newline on newer ones. Encoded JSON never contains either byte raw.
pub const GENERATE_DELIMITERS: &[u8] = b"\0\n";

/// Prompt-based adapter for the vLLM API server (`/generate`).
///
/// The server streams NUL-delimited `{"text": [prompt + output]}` records
/// carrying the whole text generated so far, so this adapter declares
/// [`StreamingMode::Cumulative`] and strips the echoed prompt itself.
pub struct PromptCompletionEngine {
    http: HttpClient,
    base_url: String,
    renderer: PromptRenderer,
    eos_token: Option<String>,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    prompt: &'a str,
    stream: bool,
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
    presence_penalty: f32,
    frequency_penalty: f32,
    stop: Vec<String>,
}

impl PromptCompletionEngine {
    pub fn new(
        base_url: &str,
        metadata: ModelMetadata,
        requested_format: Option<ChatFormat>
    ) -> Result<Self, RelayError> {
        let http = HttpClient::builder()
            .build()
            .map_err(|e| RelayError::initialization(format!("HTTP client: {}", e)))?;
        let renderer = PromptRenderer::new(requested_format, &metadata);
        match renderer.format() {
            Some(format) => info!("Rendering prompts with the {} chat format", format),
            None => info!("No chat format known for this model, rendering plain transcripts"),
        }

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            renderer,
            eos_token: metadata.eos_token,
        })
    }

    /// Prompt text sent to the engine for a request.
    pub fn render(&self, input: &RequestInput) -> String {
        match input {
            RequestInput::Prompt(prompt) => prompt.clone(),
            RequestInput::Messages(messages) => self.renderer.render(messages),
        }
    }
}

/// Parses one `/generate` record, removing the prompt vLLM echoes in front
/// of the generated text.
pub fn parse_generate_record(record: &str, prompt: &str) -> ParsedRecord {
    let value: JsonValue = match serde_json::from_str(record) {
        Ok(v) => v,
        Err(e) => {
            debug!("Skipping unparseable engine record: {}", e);
            return ParsedRecord::Skip;
        }
    };

    if value.get("error").is_some() {
        return ParsedRecord::Delta(RawDelta::Payload(value));
    }

    let text = match value.get("text") {
        Some(text) => text,
        None => {
            return ParsedRecord::Skip;
        }
    };
    match normalize(text) {
        Token::Text(full) => {
            let generated = full.strip_prefix(prompt).unwrap_or(&full);
            ParsedRecord::Delta(RawDelta::text(generated))
        }
        Token::Error(message) => ParsedRecord::Delta(RawDelta::Payload(serde_json::json!({ "error": message }))),
    }
}

#[async_trait]
impl InferenceEngine for PromptCompletionEngine {
    fn name(&self) -> &str {
        "vllm"
    }

    fn streaming_mode(&self) -> StreamingMode {
        StreamingMode::Cumulative
    }

    async fn stream_generate(
        &self,
        request: &ValidatedRequest,
        request_id: &str
    ) -> Result<DeltaStream, RelayError> {
        let prompt = self.render(&request.input);
        let sampling = &request.sampling;

        let mut stop = sampling.stop.clone();
        if let Some(eos) = &self.eos_token {
            if !stop.contains(eos) {
                stop.push(eos.clone());
            }
        }

        let body = GenerateRequest {
            prompt: &prompt,
            stream: true,
            temperature: sampling.temperature,
            max_tokens: sampling.max_tokens,
            top_p: sampling.top_p,
            presence_penalty: sampling.presence_penalty,
            frequency_penalty: sampling.frequency_penalty,
            stop,
        };
        info!("[{}] vLLM generate: {} prompt chars, max_tokens={}", request_id, prompt.len(), sampling.max_tokens);

        let url = format!("{}/generate", self.base_url);
        let echoed = prompt.clone();
        http_stream_generate(&self.http, &url, &body, GENERATE_DELIMITERS, move |record| {
            parse_generate_record(record, &echoed)
        }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::RecordBuffer;
    use crate::models::ChatMessage;

    fn parse_body(body: &[u8], prompt: &str) -> Vec<ParsedRecord> {
        let mut buffer = RecordBuffer::any_of(GENERATE_DELIMITERS);
        let mut records = buffer.push(body);
        records.extend(buffer.finish());
        records.iter().map(|r| parse_generate_record(r, prompt)).collect()
    }

    #[test]
    fn test_nul_delimited_body() {
        let body = b"{\"text\": [\"Q: A\"]}\0{\"text\": [\"Q: AB\"]}\0";
        assert_eq!(
            parse_body(body, "Q: "),
            vec![ParsedRecord::Delta(RawDelta::text("A")), ParsedRecord::Delta(RawDelta::text("AB"))]
        );
    }

    #[test]
    fn test_newline_delimited_body() {
        let body = b"{\"text\": [\"Q: A\"]}\n{\"text\": [\"Q: AB\\nC\"]}\n";
        assert_eq!(
            parse_body(body, "Q: "),
            vec![ParsedRecord::Delta(RawDelta::text("A")), ParsedRecord::Delta(RawDelta::text("AB\nC"))]
        );
    }

    #[test]
    fn test_record_strips_echoed_prompt() {
        let record = r#"{"text": ["<|im_start|>user\nHi<|im_end|>\nHello there"]}"#;
        let parsed = parse_generate_record(record, "<|im_start|>user\nHi<|im_end|>\n");
        assert_eq!(parsed, ParsedRecord::Delta(RawDelta::text("Hello there")));
    }

    #[test]
    fn test_record_without_echo_kept_whole() {
        let parsed = parse_generate_record(r#"{"text": ["Hello"]}"#, "Q: ");
        assert_eq!(parsed, ParsedRecord::Delta(RawDelta::text("Hello")));
    }

    #[test]
    fn test_error_record_passed_through() {
        match parse_generate_record(r#"{"error": "engine dead"}"#, "") {
            ParsedRecord::Delta(delta) => {
                assert_eq!(delta.into_token(), Some(Token::Error("engine dead".into())));
            }
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[test]
    fn test_garbage_record_skipped() {
        assert_eq!(parse_generate_record("not json", ""), ParsedRecord::Skip);
        assert_eq!(parse_generate_record(r#"{"status": "ok"}"#, ""), ParsedRecord::Skip);
    }

    #[test]
    fn test_legacy_prompt_sent_verbatim() {
        let metadata = ModelMetadata {
            chat_template: Some("{{ '<|im_start|>' }}".into()),
            ..Default::default()
        };
        let engine = PromptCompletionEngine::new("http://127.0.0.1:8001/", metadata, None).unwrap();
        assert_eq!(engine.render(&RequestInput::Prompt("raw".into())), "raw");
        assert_eq!(
            engine.render(&RequestInput::Messages(vec![ChatMessage::user("Hi")])),
            "<|im_start|>user\nHi<|im_end|>\n<|im_start|>assistant\n"
        );
    }
}
