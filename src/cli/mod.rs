use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::llm::registry::{ parse_model_list, ResolverKind };
use crate::llm::template::ChatFormat;
use crate::llm::{ EngineConfig, EngineKind };
use crate::models::SamplingParams;
use crate::relay::EmptyOutputPolicy;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Encrypted streaming inference job server", long_about = None)]
pub struct ServerArgs {
    /// Host address and port for the job server to listen on.
    #[arg(long, env = "SERVER_ADDR", default_value = "0.0.0.0:8000")]
    pub server_addr: String,

    /// Optional bearer key. If set, every job must carry `Authorization: Bearer <key>`.
    #[arg(long, env = "API_KEY")]
    pub api_key: Option<String>,

    /// Shared Fernet key used to decrypt job payloads.
    #[arg(long, env = "ENCRYPTION_KEY", hide_env_values = true)]
    pub encryption_key: Option<String>,

    // --- Engine Args ---
    /// Inference engine (vllm, llamacpp)
    #[arg(long, env = "ENGINE", default_value = "vllm")]
    pub engine: EngineKind,

    /// Attach to an engine already listening at this URL instead of spawning one.
    #[arg(long, env = "ENGINE_URL")]
    pub engine_url: Option<String>,

    /// Override the engine executable.
    #[arg(long, env = "ENGINE_BIN")]
    pub engine_bin: Option<String>,

    /// Local port for a spawned engine.
    #[arg(long, env = "ENGINE_PORT", default_value = "8001")]
    pub engine_port: u16,

    /// Seconds to wait for the engine to report healthy.
    #[arg(long, env = "ENGINE_STARTUP_TIMEOUT", default_value = "900")]
    pub engine_startup_timeout: u64,

    #[arg(long, env = "SERVED_MODEL_NAME")]
    pub served_model_name: Option<String>,

    // --- Model Registry Args ---
    /// Comma-separated model repository ids. The first one is served.
    #[arg(long, env = "MODELS", default_value = "")]
    pub models: String,

    /// Model cache directory.
    #[arg(long, env = "MODEL_DIR", default_value = "/models")]
    pub model_dir: PathBuf,

    /// How model snapshots are materialized (hub-cli, cache)
    #[arg(long, env = "MODEL_RESOLVER", default_value = "hub-cli")]
    pub model_resolver: ResolverKind,

    #[arg(long, env = "MAX_MODEL_LEN", default_value = "4096")]
    pub max_model_len: u32,

    #[arg(long, env = "GPU_MEMORY_UTILIZATION", default_value = "0.95")]
    pub gpu_memory_utilization: f32,

    #[arg(long, env = "FLASH_ATTN", default_value = "false")]
    pub flash_attn: bool,

    /// Chat format (chatml, llama-3, mistral-instruct, gemma). Detected from the model when unset.
    #[arg(long, env = "CHAT_FORMAT")]
    pub chat_format: Option<ChatFormat>,

    // --- Job Args ---
    /// What a generation with no output streams (whitespace, error)
    #[arg(long, env = "EMPTY_OUTPUT_POLICY", default_value = "whitespace")]
    pub empty_output_policy: EmptyOutputPolicy,

    #[arg(long, env = "MAX_JOBS_PER_SECOND", default_value = "10")]
    pub max_jobs_per_second: u32,

    #[arg(long, env = "ENABLE_TLS", default_value = "false")]
    pub enable_tls: bool,

    /// Path to the TLS certificate file (PEM format). Requires --tls-key-path.
    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// Path to the TLS private key file (PEM format). Requires --tls-cert-path.
    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    /// Enable debug logging/output
    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,
}

impl ServerArgs {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            kind: self.engine,
            engine_url: self.engine_url.clone().filter(|u| !u.trim().is_empty()),
            engine_bin: self.engine_bin.clone(),
            engine_port: self.engine_port,
            startup_timeout: Duration::from_secs(self.engine_startup_timeout),
            served_model_name: self.served_model_name.clone(),
            models: parse_model_list(&self.models),
            model_dir: self.model_dir.clone(),
            resolver: self.model_resolver,
            max_model_len: self.max_model_len,
            gpu_memory_utilization: self.gpu_memory_utilization,
            flash_attn: self.flash_attn,
            chat_format: self.chat_format,
        }
    }

    /// Certificate and key paths, only when TLS is enabled and both are set.
    pub fn tls_paths(&self) -> Option<(String, String)> {
        if !self.enable_tls {
            return None;
        }
        match (&self.tls_cert_path, &self.tls_key_path) {
            (Some(cert), Some(key)) => Some((cert.clone(), key.clone())),
            _ => None,
        }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Chat with an encrypted inference endpoint", long_about = None)]
pub struct ClientArgs {
    /// Prompt for a single request. Without it (and without piped input) an interactive chat starts.
    pub prompt: Option<String>,

    #[arg(short = 's', long = "system", env = "SYSTEM_PROMPT", default_value = DEFAULT_SYSTEM_PROMPT)]
    pub system: String,

    #[arg(long = "temp", env = "TEMPERATURE", default_value = "0.7")]
    pub temperature: f32,

    #[arg(long, env = "MAX_TOKENS", default_value = "512")]
    pub max_tokens: u32,

    #[arg(long, env = "TOP_P", default_value = "1.0")]
    pub top_p: f32,

    #[arg(long, env = "PRESENCE_PENALTY")]
    pub presence_penalty: Option<f32>,

    #[arg(long, env = "FREQUENCY_PENALTY")]
    pub frequency_penalty: Option<f32>,

    /// Stop sequence. May be repeated; `STOP` sets a single one.
    #[arg(long, env = "STOP")]
    pub stop: Vec<String>,

    #[arg(long, env = "RELAY_BASE_URL", default_value = "https://api.runpod.ai")]
    pub base_url: String,

    #[arg(long, env = "ENDPOINT_ID")]
    pub endpoint_id: Option<String>,

    #[arg(long, env = "API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    #[arg(long, env = "ENCRYPTION_KEY", hide_env_values = true)]
    pub encryption_key: Option<String>,

    /// Send the single-prompt request shape instead of chat messages.
    #[arg(long, env = "LEGACY_PROMPT", default_value = "false")]
    pub legacy_prompt: bool,

    /// Print a fresh encryption key and exit.
    #[arg(long, default_value = "false")]
    pub generate_key: bool,

    #[arg(long, env = "DEBUG", default_value = "false")]
    pub debug: bool,
}

impl ClientArgs {
    pub fn sampling_params(&self) -> SamplingParams {
        SamplingParams {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            top_p: Some(self.top_p),
            presence_penalty: self.presence_penalty,
            frequency_penalty: self.frequency_penalty,
            stop: if self.stop.is_empty() { None } else { Some(self.stop.clone()) },
        }
    }
}
