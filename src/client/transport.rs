use async_trait::async_trait;
use futures::stream::{ self, BoxStream };
use futures::StreamExt;
use log::debug;
use reqwest::Client as HttpClient;
use std::collections::VecDeque;
use url::Url;

use crate::error::RelayError;
use crate::framing::RecordBuffer;
use crate::models::JobRequest;

/// Response body split into lines. Body read failures arrive in-band.
pub type LineStream = BoxStream<'static, Result<String, RelayError>>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Posts one job and returns its response body line by line. Connection
    /// and HTTP status failures are returned before any line.
    async fn submit(&self, job: &JobRequest) -> Result<LineStream, RelayError>;
}

/// `POST {base}/v2/{endpoint_id}/runsync` with a bearer key.
pub struct HttpTransport {
    http: HttpClient,
    url: Url,
    api_key: Option<String>,
}

impl HttpTransport {
    pub fn new(
        base_url: &str,
        endpoint_id: &str,
        api_key: Option<String>
    ) -> Result<Self, RelayError> {
        let url = runsync_url(base_url, endpoint_id)?;
        Ok(Self {
            http: HttpClient::new(),
            url,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

pub fn runsync_url(base_url: &str, endpoint_id: &str) -> Result<Url, RelayError> {
    let endpoint_id = endpoint_id.trim();
    if endpoint_id.is_empty() {
        return Err(RelayError::validation("ENDPOINT_ID is not set."));
    }
    let base = format!("{}/", base_url.trim_end_matches('/'));
    Url::parse(&base)
        .and_then(|base| base.join(&format!("v2/{}/runsync", endpoint_id)))
        .map_err(|e| RelayError::validation(format!("Invalid endpoint URL: {}", e)))
}

#[async_trait]
impl Transport for HttpTransport {
    async fn submit(&self, job: &JobRequest) -> Result<LineStream, RelayError> {
        debug!("Submitting job to {}", self.url);
        let mut req = self.http.post(self.url.clone()).json(job);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RelayError::inference(format!("Error: {} {}", status, body.trim())));
        }

        let body = resp.bytes_stream().boxed();
        let lines = stream::unfold(
            (body, RecordBuffer::lines(), VecDeque::new(), false),
            |(mut body, mut buffer, mut pending, mut done)| async move {
                loop {
                    if let Some(line) = pending.pop_front() {
                        return Some((Ok(line), (body, buffer, pending, done)));
                    }
                    if done {
                        return None;
                    }
                    match body.next().await {
                        Some(Ok(chunk)) => pending.extend(buffer.push(&chunk)),
                        Some(Err(e)) => {
                            done = true;
                            return Some((Err(RelayError::from(e)), (body, buffer, pending, done)));
                        }
                        None => {
                            done = true;
                            pending.extend(buffer.finish());
                        }
                    }
                }
            }
        );
        Ok(lines.boxed())
    }
}
