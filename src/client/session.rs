//! Interactive chat session and the single-shot tool mode.

use log::{ debug, info };
use std::error::Error;
use std::io::Write;
use tokio::io::{ AsyncBufReadExt, BufReader };

use super::transport::Transport;
use super::ChatClient;
use crate::error::RelayError;
use crate::models::{ ChatMessage, InferenceRequest, SamplingParams, Token };
use crate::relay::RelayOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    AwaitingInput,
    SendingRequest,
    StreamingResponse,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    Line(String),
    Eof,
    Interrupt,
}

pub fn is_exit_command(input: &str) -> bool {
    let input = input.trim();
    input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit")
}

fn render_token(out: &mut dyn Write, token: &Token) {
    let _ = match token {
        Token::Text(text) => write!(out, "{}", text),
        Token::Error(message) => write!(out, "\n[Error] {}", message),
    };
    let _ = out.flush();
}

pub struct Session<T> {
    client: ChatClient<T>,
    sampling: SamplingParams,
    history: Vec<ChatMessage>,
    state: SessionState,
}

impl<T: Transport> Session<T> {
    pub fn new(client: ChatClient<T>, system_prompt: &str, sampling: SamplingParams) -> Self {
        Self {
            client,
            sampling,
            history: vec![ChatMessage::system(system_prompt)],
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    pub fn client(&self) -> &ChatClient<T> {
        &self.client
    }

    /// Handles one input event, streaming any answer into `out`, and returns
    /// the state the session settled in.
    pub async fn step(&mut self, event: InputEvent, out: &mut dyn Write) -> SessionState {
        if self.state == SessionState::Terminated {
            return self.state;
        }
        self.state = SessionState::AwaitingInput;

        let line = match event {
            InputEvent::Line(line) => line,
            InputEvent::Eof | InputEvent::Interrupt => {
                self.state = SessionState::Terminated;
                return self.state;
            }
        };
        let input = line.trim();
        if input.is_empty() {
            return self.state;
        }
        if is_exit_command(input) {
            self.state = SessionState::Terminated;
            return self.state;
        }

        self.history.push(ChatMessage::user(input));
        self.state = SessionState::SendingRequest;
        let request = InferenceRequest::chat(self.history.clone(), self.sampling.clone());

        let _ = write!(out, "Assistant: ");
        let outcome = match self.client.submit(&request).await {
            Ok(lines) => {
                self.state = SessionState::StreamingResponse;
                self.client.receive(lines, |token| render_token(out, token)).await
            }
            Err(e) => {
                let message = e.client_message().to_string();
                render_token(out, &Token::Error(message.clone()));
                RelayOutcome { text: String::new(), error: Some(message) }
            }
        };
        let _ = writeln!(out);

        if let Some(error) = &outcome.error {
            debug!("Turn ended with error: {}", error);
        }
        if outcome.text.is_empty() {
            self.history.pop();
        } else {
            self.history.push(ChatMessage::assistant(outcome.text));
        }

        self.state = SessionState::Idle;
        self.state
    }
}

/// Reads stdin line by line until exit, end of input or Ctrl-C. An
/// interrupt while a response streams abandons the local turn only.
pub async fn run_interactive<T: Transport>(
    session: &mut Session<T>
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut out = std::io::stdout();
    println!("Chat started. Type 'exit' or 'quit' to leave.");

    loop {
        print!("\nYou: ");
        out.flush()?;

        let event = tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) => InputEvent::Line(line),
                None => InputEvent::Eof,
            },
            _ = tokio::signal::ctrl_c() => InputEvent::Interrupt,
        };

        let state = tokio::select! {
            state = session.step(event, &mut out) => state,
            _ = tokio::signal::ctrl_c() => SessionState::Terminated,
        };
        if state == SessionState::Terminated {
            break;
        }
    }

    info!("Session ended after {} messages", session.history().len());
    println!();
    Ok(())
}

/// Builds the single request of tool mode. Piped context follows the prompt
/// after a blank line; either one alone is used as is.
pub fn tool_request(
    prompt: Option<&str>,
    context: Option<&str>,
    system_prompt: &str,
    sampling: SamplingParams,
    legacy_prompt: bool
) -> Option<InferenceRequest> {
    let prompt = prompt.map(str::trim).filter(|p| !p.is_empty());
    let context = context.map(str::trim).filter(|c| !c.is_empty());
    let text = match (prompt, context) {
        (Some(prompt), Some(context)) => format!("{}\n\n{}", prompt, context),
        (Some(text), None) | (None, Some(text)) => text.to_string(),
        (None, None) => {
            return None;
        }
    };

    Some(if legacy_prompt {
        InferenceRequest::legacy_prompt(text, sampling)
    } else {
        InferenceRequest::chat(
            vec![ChatMessage::system(system_prompt), ChatMessage::user(text)],
            sampling
        )
    })
}

/// Streams one answer into `out`. Any error, in transport or in the
/// stream, is returned so the process can exit non-zero.
pub async fn run_tool<T: Transport>(
    client: &ChatClient<T>,
    request: &InferenceRequest,
    out: &mut dyn Write
) -> Result<String, RelayError> {
    let outcome = client.send(request, |token| {
        if let Token::Text(text) = token {
            let _ = write!(out, "{}", text);
            let _ = out.flush();
        }
    }).await?;
    let _ = writeln!(out);

    match outcome.error {
        Some(message) => Err(RelayError::inference(message)),
        None => Ok(outcome.text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::transport::LineStream;
    use crate::crypto::PayloadCodec;
    use crate::models::{ JobRequest, Role };
    use crate::relay::NO_OUTPUT_MESSAGE;
    use async_trait::async_trait;
    use futures::{ stream, StreamExt };
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockTransport {
        replies: Mutex<VecDeque<Result<Vec<&'static str>, RelayError>>>,
        jobs: Mutex<Vec<JobRequest>>,
    }

    impl MockTransport {
        fn with_replies(replies: Vec<Result<Vec<&'static str>, RelayError>>) -> Self {
            Self { replies: Mutex::new(replies.into()), jobs: Mutex::new(Vec::new()) }
        }

        fn job_count(&self) -> usize {
            self.jobs.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn submit(&self, job: &JobRequest) -> Result<LineStream, RelayError> {
            self.jobs.lock().unwrap().push(job.clone());
            let reply = self.replies.lock().unwrap().pop_front().unwrap_or(Ok(Vec::new()));
            reply.map(|lines| {
                stream::iter(lines.into_iter().map(|l| Ok(l.to_string()))).boxed()
            })
        }
    }

    fn session(replies: Vec<Result<Vec<&'static str>, RelayError>>) -> Session<MockTransport> {
        let codec = PayloadCodec::from_key(Some(&PayloadCodec::generate_key())).unwrap();
        let client = ChatClient::new(MockTransport::with_replies(replies), codec);
        Session::new(client, "You are terse.", SamplingParams::default())
    }

    fn sent_request(session: &Session<MockTransport>, index: usize) -> InferenceRequest {
        let jobs = session.client().transport().jobs.lock().unwrap();
        let envelope = jobs[index].input.encrypted_input.clone().unwrap();
        let value = session.client().codec().decrypt(&envelope).unwrap();
        InferenceRequest::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_quit_terminates_without_request() {
        for word in ["QUIT", "exit", " Quit "] {
            let mut s = session(vec![]);
            let mut out = Vec::new();
            let state = s.step(InputEvent::Line(word.to_string()), &mut out).await;
            assert_eq!(state, SessionState::Terminated);
            assert_eq!(s.client().transport().job_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_blank_line_and_eof() {
        let mut s = session(vec![]);
        let mut out = Vec::new();
        assert_eq!(s.step(InputEvent::Line("   ".into()), &mut out).await, SessionState::AwaitingInput);
        assert_eq!(s.client().transport().job_count(), 0);
        assert_eq!(s.step(InputEvent::Eof, &mut out).await, SessionState::Terminated);
        assert_eq!(s.step(InputEvent::Line("hello".into()), &mut out).await, SessionState::Terminated);
    }

    #[tokio::test]
    async fn test_turn_appends_assistant_text() {
        let mut s = session(
            vec![
                Ok(vec![r#"{"output": "Hi"}"#, r#"{"output": " there"}"#, r#"{"status": "COMPLETED"}"#]),
                Ok(vec![r#"{"output": "Sure."}"#])
            ]
        );
        let mut out = Vec::new();
        assert_eq!(s.step(InputEvent::Line("hello".into()), &mut out).await, SessionState::Idle);
        assert_eq!(s.history().len(), 3);
        assert_eq!(s.history()[2], ChatMessage::assistant("Hi there"));
        assert!(String::from_utf8_lossy(&out).contains("Hi there"));

        s.step(InputEvent::Line("again".into()), &mut out).await;
        let second = sent_request(&s, 1);
        let messages = second.messages.unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[3], ChatMessage::user("again"));
        assert_eq!(s.history().last().map(|m| m.role), Some(Role::Assistant));
    }

    #[tokio::test]
    async fn test_error_without_text_withdraws_user_turn() {
        let mut s = session(vec![Ok(vec![r#"{"output": {"error": "Decryption failed or invalid key."}}"#])]);
        let mut out = Vec::new();
        assert_eq!(s.step(InputEvent::Line("hello".into()), &mut out).await, SessionState::Idle);
        assert_eq!(s.history().len(), 1);
        assert!(String::from_utf8_lossy(&out).contains("[Error] Decryption failed"));
    }

    #[tokio::test]
    async fn test_error_after_partial_text_keeps_it() {
        let mut s = session(
            vec![Ok(vec![r#"{"output": "Partial"}"#, r#"{"output": {"error": "engine died"}}"#, r#"{"output": "ignored"}"#])]
        );
        let mut out = Vec::new();
        s.step(InputEvent::Line("hello".into()), &mut out).await;
        assert_eq!(s.history().last(), Some(&ChatMessage::assistant("Partial")));
        assert!(!String::from_utf8_lossy(&out).contains("ignored"));
    }

    #[tokio::test]
    async fn test_aggregated_error_result_withdraws_user_turn() {
        let mut s = session(
            vec![Ok(vec![r#"{"status": "COMPLETED", "output": [{"error": "Decryption failed or invalid key."}]}"#])]
        );
        let mut out = Vec::new();
        assert_eq!(s.step(InputEvent::Line("hello".into()), &mut out).await, SessionState::Idle);
        assert_eq!(s.history().len(), 1);
        let rendered = String::from_utf8_lossy(&out);
        assert!(rendered.contains("[Error] Decryption failed or invalid key."));
        assert!(!rendered.contains("{\"error\""));
    }

    #[tokio::test]
    async fn test_aggregated_result_keeps_text_before_error() {
        let mut s = session(
            vec![Ok(vec![r#"{"status": "COMPLETED", "output": ["Hi", " the", {"error": "engine died"}]}"#])]
        );
        let mut out = Vec::new();
        s.step(InputEvent::Line("hello".into()), &mut out).await;
        assert_eq!(s.history().last(), Some(&ChatMessage::assistant("Hi the")));
        assert!(String::from_utf8_lossy(&out).contains("[Error] engine died"));
    }

    #[tokio::test]
    async fn test_body_without_output_is_no_output_error() {
        let mut s = session(vec![Ok(vec![r#"{"status": "IN_PROGRESS"}"#, r#"{"status": "COMPLETED"}"#])]);
        let mut out = Vec::new();
        assert_eq!(s.step(InputEvent::Line("hello".into()), &mut out).await, SessionState::Idle);
        assert_eq!(s.history().len(), 1);
        assert!(String::from_utf8_lossy(&out).contains(&format!("[Error] {}", NO_OUTPUT_MESSAGE)));
    }

    #[tokio::test]
    async fn test_transport_failure_is_rendered_inline() {
        let mut s = session(vec![Err(RelayError::inference("Error: 401 Unauthorized"))]);
        let mut out = Vec::new();
        assert_eq!(s.step(InputEvent::Line("hello".into()), &mut out).await, SessionState::Idle);
        assert_eq!(s.history().len(), 1);
        assert!(String::from_utf8_lossy(&out).contains("401"));
    }

    #[test]
    fn test_tool_request_combines_prompt_and_context() {
        let request = tool_request(
            Some("Summarize"),
            Some("fn main() {}\n"),
            "sys",
            SamplingParams::default(),
            false
        ).unwrap();
        let messages = request.messages.unwrap();
        assert_eq!(messages[1].content, "Summarize\n\nfn main() {}");

        let legacy = tool_request(None, Some("just context"), "sys", SamplingParams::default(), true);
        assert_eq!(legacy.unwrap().prompt.as_deref(), Some("just context"));
        assert!(tool_request(Some(" "), None, "sys", SamplingParams::default(), false).is_none());
    }

    #[tokio::test]
    async fn test_tool_mode_fails_on_stream_error() {
        let codec = PayloadCodec::from_key(Some(&PayloadCodec::generate_key())).unwrap();
        let client = ChatClient::new(
            MockTransport::with_replies(vec![Ok(vec![r#"{"output": {"error": "boom"}}"#])]),
            codec
        );
        let request = InferenceRequest::legacy_prompt("hi", SamplingParams::default());
        let mut out = Vec::new();
        let err = run_tool(&client, &request, &mut out).await.unwrap_err();
        assert_eq!(err, RelayError::inference("boom"));
    }
}
