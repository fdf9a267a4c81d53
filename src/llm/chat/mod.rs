pub mod openai;
pub mod vllm;

use async_trait::async_trait;
use futures::{ Stream, StreamExt };
use log::{ debug, warn };
use reqwest::Client as HttpClient;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::RelayError;
use crate::framing::RecordBuffer;
use crate::models::{ RawDelta, ValidatedRequest };
use crate::relay::StreamingMode;

pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<RawDelta, RelayError>> + Send>>;

/// Uniform streaming surface over the engine shapes the server can drive.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    fn name(&self) -> &str;

    /// Declares whether deltas carry cumulative or incremental text.
    fn streaming_mode(&self) -> StreamingMode;

    async fn stream_generate(
        &self,
        request: &ValidatedRequest,
        request_id: &str
    ) -> Result<DeltaStream, RelayError>;
}

/// Result of parsing one record of an engine response body.
#[derive(Debug, PartialEq)]
pub enum ParsedRecord {
    Delta(RawDelta),
    Skip,
    Done,
}

/// Posts `payload` and streams the response body record by record through
/// `parser`.
///
/// Connection and HTTP status failures are returned before any delta is
/// produced. The reader task hands deltas over a single-slot channel, so it
/// never runs more than one delta ahead of the consumer and stops once the
/// consumer is dropped.
pub async fn http_stream_generate<P>(
    http: &HttpClient,
    url: &str,
    payload: impl serde::Serialize,
    delimiters: &'static [u8],
    parser: P
) -> Result<DeltaStream, RelayError>
    where P: Fn(&str) -> ParsedRecord + Send + 'static
{
    let resp = http
        .post(url)
        .json(&payload)
        .send().await
        .map_err(|e| RelayError::inference(format!("Engine request failed: {}", e)))?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(
            RelayError::inference(format!("Engine returned HTTP {}: {}", status, body.trim()))
        );
    }

    let (tx, rx) = mpsc::channel(1);
    let mut bytes = resp.bytes_stream();

    tokio::spawn(async move {
        let mut buffer = RecordBuffer::any_of(delimiters);
        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(buf) => {
                    for record in buffer.push(&buf) {
                        match parser(&record) {
                            ParsedRecord::Delta(delta) => {
                                if tx.send(Ok(delta)).await.is_err() {
                                    debug!("Delta consumer dropped, stopping engine reader");
                                    return;
                                }
                            }
                            ParsedRecord::Skip => {}
                            ParsedRecord::Done => {
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("Engine stream interrupted: {}", e);
                    let _ = tx.send(
                        Err(RelayError::inference(format!("Engine stream interrupted: {}", e)))
                    ).await;
                    return;
                }
            }
        }
        if let Some(record) = buffer.finish() {
            if let ParsedRecord::Delta(delta) = parser(&record) {
                let _ = tx.send(Ok(delta)).await;
            }
        }
    });

    Ok(Box::pin(ReceiverStream::new(rx)))
}
