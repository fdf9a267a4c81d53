//! Streaming relay: engine deltas in, canonical tokens out.
//!
//! The relay is a small state machine ([`Relay`]) driven one delta at a time.
//! [`relay_stream`] wraps it as a pull-based `Stream` for the job handler and
//! [`relay_into`] drains it into a sink for callers that need the full text.

use futures::{ Stream, StreamExt };
use log::{ debug, warn };
use serde::{ Deserialize, Serialize };
use std::fmt;
use std::str::FromStr;

use crate::error::RelayError;
use crate::models::{ RawDelta, Token };

pub const NO_OUTPUT_MESSAGE: &str = "No output generated.";

/// Whether an engine re-sends the full text each step or only new fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingMode {
    Cumulative,
    Incremental,
}

/// What to emit when a generation finishes without producing any text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptyOutputPolicy {
    Whitespace,
    Error,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEmptyOutputPolicyError {
    message: String,
}

impl fmt::Display for ParseEmptyOutputPolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseEmptyOutputPolicyError {}

impl FromStr for EmptyOutputPolicy {
    type Err = ParseEmptyOutputPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "whitespace" | "space" => Ok(EmptyOutputPolicy::Whitespace),
            "error" => Ok(EmptyOutputPolicy::Error),
            _ =>
                Err(ParseEmptyOutputPolicyError {
                    message: format!("Invalid empty output policy: '{}' (expected whitespace or error)", s),
                }),
        }
    }
}

impl fmt::Display for EmptyOutputPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmptyOutputPolicy::Whitespace => f.write_str("whitespace"),
            EmptyOutputPolicy::Error => f.write_str("error"),
        }
    }
}

#[derive(Debug)]
pub struct Relay {
    mode: StreamingMode,
    empty_policy: EmptyOutputPolicy,
    previous_full_text: String,
    accumulated: String,
    emitted_text: bool,
    halted: bool,
}

impl Relay {
    pub fn new(mode: StreamingMode, empty_policy: EmptyOutputPolicy) -> Self {
        Self {
            mode,
            empty_policy,
            previous_full_text: String::new(),
            accumulated: String::new(),
            emitted_text: false,
            halted: false,
        }
    }

    /// Text forwarded so far, including any whitespace fallback.
    pub fn text(&self) -> &str {
        &self.accumulated
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Feeds one engine item. Returns the token to forward, if any.
    /// After an error token the relay is halted and ignores further input.
    pub fn push(&mut self, item: Result<RawDelta, RelayError>) -> Option<Token> {
        if self.halted {
            return None;
        }

        let token = match item {
            Ok(delta) => delta.into_token()?,
            Err(e) => Token::Error(e.client_message().to_string()),
        };

        match token {
            Token::Error(message) => {
                self.halted = true;
                Some(Token::Error(message))
            }
            Token::Text(text) => {
                let increment = match self.mode {
                    StreamingMode::Incremental => text,
                    StreamingMode::Cumulative => self.diff_cumulative(text),
                };
                if increment.is_empty() {
                    return None;
                }
                self.accumulated.push_str(&increment);
                self.emitted_text = true;
                Some(Token::Text(increment))
            }
        }
    }

    /// Called once the engine stream is exhausted; applies the empty policy.
    pub fn finish(&mut self) -> Option<Token> {
        if self.halted || self.emitted_text {
            return None;
        }
        self.halted = true;
        debug!("Generation produced no text, applying {} policy", self.empty_policy);
        match self.empty_policy {
            EmptyOutputPolicy::Whitespace => {
                self.accumulated.push(' ');
                Some(Token::Text(" ".to_string()))
            }
            EmptyOutputPolicy::Error => Some(Token::Error(NO_OUTPUT_MESSAGE.to_string())),
        }
    }

    fn diff_cumulative(&mut self, full_text: String) -> String {
        let increment = match full_text.strip_prefix(self.previous_full_text.as_str()) {
            Some(rest) => rest.to_string(),
            None => {
                let common = common_prefix_len(&self.previous_full_text, &full_text);
                warn!(
                    "Cumulative text diverged after {} bytes; forwarding the rewritten tail",
                    common
                );
                full_text[common..].to_string()
            }
        };
        self.previous_full_text = full_text;
        increment
    }
}

/// Byte length of the longest common prefix, on a char boundary of both.
fn common_prefix_len(a: &str, b: &str) -> usize {
    a.char_indices()
        .zip(b.chars())
        .find(|((_, ca), cb)| ca != cb)
        .map(|((i, _), _)| i)
        .unwrap_or_else(|| a.len().min(b.len()))
}

/// Pull-based token stream over an engine delta stream. Ends after the
/// first error token or after the empty-output fallback.
pub fn relay_stream<S>(deltas: S, relay: Relay) -> impl Stream<Item = Token> + Send
    where S: Stream<Item = Result<RawDelta, RelayError>> + Send + Unpin
{
    futures::stream::unfold((deltas, relay, false), |(mut deltas, mut relay, done)| async move {
        if done {
            return None;
        }
        loop {
            match deltas.next().await {
                Some(item) => {
                    if let Some(token) = relay.push(item) {
                        let halted = relay.is_halted();
                        return Some((token, (deltas, relay, halted)));
                    }
                }
                None => {
                    return relay.finish().map(|token| (token, (deltas, relay, true)));
                }
            }
        }
    })
}

/// Outcome of draining a stream into a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    pub text: String,
    pub error: Option<String>,
}

/// Drains `deltas` through a relay, handing each token to `sink`, and
/// returns the accumulated text plus the terminal error, if any.
pub async fn relay_into<S, F>(deltas: S, mut relay: Relay, mut sink: F) -> RelayOutcome
    where S: Stream<Item = Result<RawDelta, RelayError>> + Unpin, F: FnMut(&Token)
{
    let mut deltas = deltas;
    let mut error = None;
    while let Some(item) = deltas.next().await {
        if let Some(token) = relay.push(item) {
            sink(&token);
            if let Token::Error(message) = token {
                error = Some(message);
                break;
            }
        }
    }
    if error.is_none() {
        if let Some(token) = relay.finish() {
            sink(&token);
            if let Token::Error(message) = token {
                error = Some(message);
            }
        }
    }
    RelayOutcome { text: relay.text().to_string(), error }
}
