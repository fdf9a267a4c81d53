pub mod chat;
pub mod launcher;
pub mod registry;
pub mod template;

use log::info;
use serde::{ Deserialize, Serialize };
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

use self::chat::openai::ChatCompletionEngine;
use self::chat::vllm::PromptCompletionEngine;
use self::chat::InferenceEngine;
use self::launcher::EngineProcess;
use self::registry::{ ModelResolver, ResolverKind };
use self::template::{ ChatFormat, ModelMetadata };
use crate::error::RelayError;

/// Which inference engine backs the server. vLLM is driven through its
/// prompt-completion API, llama.cpp through its chat-completion API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Vllm,
    LlamaCpp,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEngineKindError {
    message: String,
}

impl fmt::Display for ParseEngineKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ParseEngineKindError {}

impl FromStr for EngineKind {
    type Err = ParseEngineKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "vllm" => Ok(EngineKind::Vllm),
            "llamacpp" | "llama.cpp" | "llama-cpp" | "llama_cpp" => Ok(EngineKind::LlamaCpp),
            _ =>
                Err(ParseEngineKindError {
                    message: format!("Invalid engine type: '{}'", s),
                }),
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::Vllm => f.write_str("vllm"),
            EngineKind::LlamaCpp => f.write_str("llamacpp"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub kind: EngineKind,
    /// Attach to an already running engine instead of spawning one.
    pub engine_url: Option<String>,
    pub engine_bin: Option<String>,
    pub engine_port: u16,
    pub startup_timeout: Duration,
    pub served_model_name: Option<String>,
    pub models: Vec<String>,
    pub model_dir: PathBuf,
    pub resolver: ResolverKind,
    pub max_model_len: u32,
    pub gpu_memory_utilization: f32,
    pub flash_attn: bool,
    pub chat_format: Option<ChatFormat>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::Vllm,
            engine_url: None,
            engine_bin: None,
            engine_port: 8001,
            startup_timeout: Duration::from_secs(900),
            served_model_name: None,
            models: Vec::new(),
            model_dir: PathBuf::from("/models"),
            resolver: ResolverKind::HubCli,
            max_model_len: 4096,
            gpu_memory_utilization: 0.95,
            flash_attn: false,
            chat_format: None,
        }
    }
}

/// A constructed engine together with the child process serving it, if
/// this process spawned one. Dropping it stops the child.
pub struct LoadedEngine {
    pub engine: Arc<dyn InferenceEngine>,
    pub process: Option<EngineProcess>,
}

/// Resolves the primary model, reads its metadata, starts (or attaches to)
/// the engine and builds the matching adapter.
pub async fn load_engine(
    config: &EngineConfig,
    resolver: &dyn ModelResolver
) -> Result<LoadedEngine, RelayError> {
    let model_path = registry::prepare_models(resolver, &config.models, &config.model_dir).await?;
    info!("Loading model from: {}", model_path.display());

    let metadata = ModelMetadata::load(&model_path)?;
    info!(
        "Model metadata: eos_token={:?}, chat_template={}",
        metadata.eos_token,
        if metadata.chat_template.is_some() { "present" } else { "absent" }
    );

    let process = launcher::start_engine(config, &model_path).await?;
    let model_name = config.served_model_name
        .clone()
        .unwrap_or_else(|| model_path.display().to_string());

    let engine: Arc<dyn InferenceEngine> = match config.kind {
        EngineKind::Vllm =>
            Arc::new(
                PromptCompletionEngine::new(process.base_url(), metadata, config.chat_format)?
            ),
        EngineKind::LlamaCpp =>
            Arc::new(ChatCompletionEngine::new(process.base_url(), model_name)?),
    };

    let process = if process.is_spawned() { Some(process) } else { None };
    Ok(LoadedEngine { engine, process })
}

/// Process-wide engine slot. The first successful `get_or_init` loads the
/// engine; later calls return the same instance without touching the model.
#[derive(Default)]
pub struct EngineSlot {
    cell: OnceCell<LoadedEngine>,
}

impl EngineSlot {
    pub fn new() -> Self {
        Self { cell: OnceCell::new() }
    }

    pub async fn get_or_init(
        &self,
        config: &EngineConfig,
        resolver: &dyn ModelResolver
    ) -> Result<Arc<dyn InferenceEngine>, RelayError> {
        let loaded = self.cell.get_or_try_init(|| async {
            info!("--- Initializing {} engine ---", config.kind);
            let loaded = load_engine(config, resolver).await?;
            info!("--- {} engine ready ---", config.kind);
            Ok::<_, RelayError>(loaded)
        }).await?;
        Ok(loaded.engine.clone())
    }

    /// Installs an already constructed engine. Returns `false` when the slot
    /// was filled before.
    pub fn install(&self, engine: Arc<dyn InferenceEngine>) -> bool {
        self.cell.set(LoadedEngine { engine, process: None }).is_ok()
    }

    pub fn get(&self) -> Option<Arc<dyn InferenceEngine>> {
        self.cell.get().map(|loaded| loaded.engine.clone())
    }
}
