pub mod session;
pub mod transport;

use futures::{ stream, StreamExt };
use log::debug;
use serde_json::{ json, Value as JsonValue };

use crate::crypto::PayloadCodec;
use crate::error::RelayError;
use crate::models::{ InferenceRequest, JobRequest, RawDelta, Token };
use crate::relay::{ relay_into, EmptyOutputPolicy, Relay, RelayOutcome, StreamingMode };
use transport::{ LineStream, Transport };

pub use session::{ InputEvent, Session, SessionState };
pub use transport::HttpTransport;

/// Extracts the delta carried by one response line.
///
/// Accepts plain JSON lines and SSE `data:` lines. `{"output": …}` yields
/// the output (a list when the platform aggregated the stream), a top-level
/// `{"error": …}` yields an error delta, and status updates or malformed
/// lines yield nothing.
pub fn parse_stream_line(line: &str) -> Option<JsonValue> {
    let line = line.trim();
    let data = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
    if data.is_empty() {
        return None;
    }

    let value: JsonValue = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(_) => {
            debug!("Skipping non-JSON stream line: {}", data);
            return None;
        }
    };

    match value.get("output") {
        Some(output) if !output.is_null() => {
            return Some(output.clone());
        }
        _ => {}
    }
    match value.get("error") {
        Some(error) if !error.is_null() => Some(json!({ "error": error })),
        _ => None,
    }
}

/// Deltas carried by one response line. An aggregated output list is split
/// per element so text streamed before an error is kept.
fn line_deltas(line: &str) -> Vec<Result<RawDelta, RelayError>> {
    match parse_stream_line(line) {
        Some(JsonValue::Array(items)) =>
            items
                .into_iter()
                .map(|item| Ok(RawDelta::Payload(item)))
                .collect(),
        Some(value) => vec![Ok(RawDelta::Payload(value))],
        None => Vec::new(),
    }
}

/// Encrypts requests, submits them and relays the streamed answer.
pub struct ChatClient<T> {
    transport: T,
    codec: PayloadCodec,
}

impl<T: Transport> ChatClient<T> {
    pub fn new(transport: T, codec: PayloadCodec) -> Self {
        Self { transport, codec }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn codec(&self) -> &PayloadCodec {
        &self.codec
    }

    pub async fn submit(&self, request: &InferenceRequest) -> Result<LineStream, RelayError> {
        let envelope = self.codec.encrypt(request)?;
        self.transport.submit(&JobRequest::new(envelope)).await
    }

    /// Relays a submitted response into `sink` and returns the assistant
    /// text plus the terminal error, if any.
    pub async fn receive<F>(&self, lines: LineStream, sink: F) -> RelayOutcome where F: FnMut(&Token) {
        let deltas = lines.flat_map(|line| {
            let items = match line {
                Ok(line) => line_deltas(&line),
                Err(e) => vec![Err(e)],
            };
            stream::iter(items)
        });
        let relay = Relay::new(StreamingMode::Incremental, EmptyOutputPolicy::Error);
        relay_into(Box::pin(deltas), relay, sink).await
    }

    pub async fn send<F>(
        &self,
        request: &InferenceRequest,
        sink: F
    ) -> Result<RelayOutcome, RelayError>
        where F: FnMut(&Token)
    {
        let lines = self.submit(request).await?;
        Ok(self.receive(lines, sink).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_lines() {
        assert_eq!(parse_stream_line(r#"{"output": "Hel"}"#), Some(json!("Hel")));
        assert_eq!(parse_stream_line(r#"data: {"output": "lo"}"#), Some(json!("lo")));
        assert_eq!(
            parse_stream_line(r#"{"status": "COMPLETED", "output": ["a", "b"]}"#),
            Some(json!(["a", "b"]))
        );
    }

    #[test]
    fn test_aggregated_output_split_per_element() {
        let deltas = line_deltas(r#"{"status": "COMPLETED", "output": ["Par", "tial", {"error": "boom"}]}"#);
        let tokens: Vec<_> = deltas
            .into_iter()
            .filter_map(|d| d.unwrap().into_token())
            .collect();
        assert_eq!(
            tokens,
            vec![Token::Text("Par".into()), Token::Text("tial".into()), Token::Error("boom".into())]
        );
        assert!(line_deltas(r#"{"status": "IN_QUEUE"}"#).is_empty());
    }

    #[test]
    fn test_status_and_noise_are_skipped() {
        assert_eq!(parse_stream_line(r#"{"status": "IN_PROGRESS"}"#), None);
        assert_eq!(parse_stream_line("not json"), None);
        assert_eq!(parse_stream_line("   "), None);
    }

    #[test]
    fn test_top_level_error() {
        let value = parse_stream_line(r#"{"status": "FAILED", "error": "handler crashed"}"#).unwrap();
        assert_eq!(crate::models::normalize(&value), Token::Error("handler crashed".into()));
    }
}
