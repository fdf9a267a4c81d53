pub mod api;

use futures::stream::{ self, BoxStream };
use futures::StreamExt;
use governor::{ RateLimiter, Quota, state::{ InMemoryState, NotKeyed }, clock::DefaultClock };
use log::{ info, warn };
use std::error::Error;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use uuid::Uuid;

use crate::crypto::PayloadCodec;
use crate::error::RelayError;
use crate::llm::chat::InferenceEngine;
use crate::models::{ InferenceRequest, JobRequest, Token, ValidatedRequest };
use crate::relay::{ relay_stream, EmptyOutputPolicy, Relay };

pub type JobLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Process-scoped state shared by every job. Built once at startup; jobs
/// only read from it.
pub struct AppContext {
    pub codec: PayloadCodec,
    pub engine: Arc<dyn InferenceEngine>,
    pub empty_policy: EmptyOutputPolicy,
    pub api_key: Option<String>,
    pub limiter: JobLimiter,
}

impl AppContext {
    pub fn new(
        codec: PayloadCodec,
        engine: Arc<dyn InferenceEngine>,
        empty_policy: EmptyOutputPolicy,
        api_key: Option<String>,
        max_jobs_per_second: u32
    ) -> Self {
        let api_key = api_key.filter(|k| !k.trim().is_empty());
        if api_key.is_some() {
            info!("Server configured with API Key authentication.");
        } else {
            warn!("Server configured WITHOUT API Key authentication. Jobs are open.");
        }

        let per_second = NonZeroU32::new(max_jobs_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            codec,
            engine,
            empty_policy,
            api_key,
            limiter: RateLimiter::direct(Quota::per_second(per_second)),
        }
    }
}

/// Decrypts and validates the job input.
pub fn decode_job(codec: &PayloadCodec, job: JobRequest) -> Result<ValidatedRequest, RelayError> {
    let envelope = job.input.encrypted_input
        .filter(|e| !e.trim().is_empty())
        .ok_or_else(|| RelayError::validation("No encrypted_input found."))?;

    let value = codec.decrypt(&envelope)?;
    InferenceRequest::from_value(value)?.validate()
}

/// Runs one job and returns its token stream. Every per-request failure is
/// reported as a single error token on that stream.
pub async fn handle_job(ctx: Arc<AppContext>, job: JobRequest) -> BoxStream<'static, Token> {
    let request_id = Uuid::new_v4().to_string();

    let request = match decode_job(&ctx.codec, job) {
        Ok(request) => request,
        Err(e) => {
            warn!("[{}] Rejected job: {}", request_id, e);
            return stream::once(async move { Token::Error(e.client_message().to_string()) }).boxed();
        }
    };

    let deltas = match ctx.engine.stream_generate(&request, &request_id).await {
        Ok(deltas) => deltas,
        Err(e) => {
            warn!("[{}] Generation Error: {}", request_id, e);
            return stream::once(async move { Token::Error(e.client_message().to_string()) }).boxed();
        }
    };

    let relay = Relay::new(ctx.engine.streaming_mode(), ctx.empty_policy);
    relay_stream(deltas, relay)
        .inspect(move |token| {
            if let Token::Error(message) = token {
                warn!("[{}] Stream ended with error: {}", request_id, message);
            }
        })
        .boxed()
}

pub struct Server {
    addr: String,
    ctx: Arc<AppContext>,
    tls: Option<(String, String)>,
}

impl Server {
    pub fn new(addr: String, ctx: Arc<AppContext>, tls: Option<(String, String)>) -> Self {
        Self { addr, ctx, tls }
    }

    pub async fn run(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let addr: SocketAddr = self.addr.parse()?;
        let app = api::router(self.ctx.clone());

        match &self.tls {
            Some((cert_path, key_path)) => {
                info!(
                    "TLS enabled. Loading certificate from '{}' and key from '{}'",
                    cert_path,
                    key_path
                );
                let tls_config = axum_server::tls_rustls::RustlsConfig
                    ::from_pem_file(cert_path, key_path).await?;
                info!("HTTPS job server listening on: https://{}", addr);
                axum_server::bind_rustls(addr, tls_config).serve(app.into_make_service()).await?;
            }
            None => {
                let listener = tokio::net::TcpListener::bind(addr).await?;
                info!("HTTP job server listening on: http://{}", addr);
                axum::serve(listener, app.into_make_service())
                    .with_graceful_shutdown(shutdown_signal()).await?;
            }
        }
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        futures::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
