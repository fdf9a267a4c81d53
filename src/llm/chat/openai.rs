use async_trait::async_trait;
use log::{ debug, info };
use reqwest::{ Client as HttpClient, header::{ HeaderMap, HeaderValue, CONTENT_TYPE } };
use serde::{ Deserialize, Serialize };
use serde_json::Value as JsonValue;

use super::{ http_stream_generate, DeltaStream, InferenceEngine, ParsedRecord };
use crate::error::RelayError;
use crate::models::{ ChannelDelta, ChatMessage, RawDelta, ValidatedRequest };
use crate::relay::StreamingMode;

/// Chat-based adapter for OpenAI-compatible servers (llama.cpp's
/// `llama-server`). Structured messages go straight to the engine, which
/// streams incremental `content` / `reasoning_content` fragments over SSE.
pub struct ChatCompletionEngine {
    http: HttpClient,
    base_url: String,
    model: String,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
    presence_penalty: f32,
    frequency_penalty: f32,
    stop: &'a [String],
}

#[derive(Deserialize)]
struct ChatStreamChunk {
    #[serde(default)]
    choices: Vec<ChatStreamChoice>,
}

#[derive(Deserialize)]
struct ChatStreamChoice {
    #[serde(default)]
    delta: ChannelDelta,
    #[serde(rename = "finish_reason")]
    finish_reason: Option<String>,
}

impl ChatCompletionEngine {
    pub fn new(base_url: &str, model: String) -> Result<Self, RelayError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let http = HttpClient::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| RelayError::initialization(format!("HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        })
    }
}

/// Parses one SSE line of a streamed chat completion.
pub fn parse_sse_line(line: &str) -> ParsedRecord {
    let data = match line.strip_prefix("data:") {
        Some(data) => data.trim(),
        None => {
            return ParsedRecord::Skip;
        }
    };
    if data == "[DONE]" {
        return ParsedRecord::Done;
    }

    let value: JsonValue = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            debug!("JSON parse error: {} for data: {}", e, data);
            return ParsedRecord::Skip;
        }
    };
    if value.get("error").is_some() {
        return ParsedRecord::Delta(RawDelta::Payload(value));
    }

    match serde_json::from_value::<ChatStreamChunk>(value) {
        Ok(chunk) => {
            match chunk.choices.into_iter().next() {
                Some(choice) => {
                    if let Some(reason) = &choice.finish_reason {
                        debug!("Chat stream finished: {}", reason);
                    }
                    ParsedRecord::Delta(RawDelta::Channels(choice.delta))
                }
                None => ParsedRecord::Skip,
            }
        }
        Err(e) => {
            debug!("Unexpected chat chunk shape: {}", e);
            ParsedRecord::Skip
        }
    }
}

#[async_trait]
impl InferenceEngine for ChatCompletionEngine {
    fn name(&self) -> &str {
        "llamacpp"
    }

    fn streaming_mode(&self) -> StreamingMode {
        StreamingMode::Incremental
    }

    async fn stream_generate(
        &self,
        request: &ValidatedRequest,
        request_id: &str
    ) -> Result<DeltaStream, RelayError> {
        let messages = request.input.to_messages();
        let sampling = &request.sampling;
        let body = ChatCompletionRequest {
            model: &self.model,
            messages: &messages,
            stream: true,
            temperature: sampling.temperature,
            max_tokens: sampling.max_tokens,
            top_p: sampling.top_p,
            presence_penalty: sampling.presence_penalty,
            frequency_penalty: sampling.frequency_penalty,
            stop: &sampling.stop,
        };
        info!("[{}] chat completion: {} messages, max_tokens={}", request_id, messages.len(), sampling.max_tokens);

        let url = format!("{}/v1/chat/completions", self.base_url);
        http_stream_generate(&self.http, &url, &body, b"\n", parse_sse_line).await
    }
}
