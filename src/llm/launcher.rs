//! Engine construction: spawn the inference server next to this process, or
//! attach to one that is already running, then wait until it is healthy.

use log::{ info, warn };
use reqwest::Client as HttpClient;
use std::path::Path;
use std::process::Stdio;
use std::time::{ Duration, Instant };
use tokio::process::{ Child, Command };

use super::registry::find_gguf;
use super::{ EngineConfig, EngineKind };
use crate::error::RelayError;

const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A running engine endpoint. When the engine was spawned by this process
/// the child is killed on drop.
#[derive(Debug)]
pub struct EngineProcess {
    base_url: String,
    child: Option<Child>,
}

impl EngineProcess {
    pub fn attached(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), child: None }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn is_spawned(&self) -> bool {
        self.child.is_some()
    }
}

/// Program and arguments that start the configured engine on `model_path`.
pub fn build_command(
    config: &EngineConfig,
    model_path: &Path
) -> Result<(String, Vec<String>), RelayError> {
    let port = config.engine_port.to_string();
    match config.kind {
        EngineKind::Vllm => {
            let (program, mut args) = match &config.engine_bin {
                Some(bin) => (bin.clone(), Vec::new()),
                None =>
                    (
                        "python3".to_string(),
                        vec!["-m".to_string(), "vllm.entrypoints.api_server".to_string()],
                    ),
            };
            args.extend([
                "--model".to_string(),
                model_path.display().to_string(),
                "--host".to_string(),
                "127.0.0.1".to_string(),
                "--port".to_string(),
                port,
                "--gpu-memory-utilization".to_string(),
                config.gpu_memory_utilization.to_string(),
                "--max-model-len".to_string(),
                config.max_model_len.to_string(),
                "--dtype".to_string(),
                "auto".to_string(),
            ]);
            if let Some(name) = &config.served_model_name {
                args.extend(["--served-model-name".to_string(), name.clone()]);
            }
            Ok((program, args))
        }
        EngineKind::LlamaCpp => {
            let gguf = find_gguf(model_path).ok_or_else(|| {
                RelayError::initialization(
                    format!("No .gguf file found in {}", model_path.display())
                )
            })?;
            let program = config.engine_bin.clone().unwrap_or_else(|| "llama-server".to_string());
            let mut args = vec![
                "-m".to_string(),
                gguf.display().to_string(),
                "--host".to_string(),
                "127.0.0.1".to_string(),
                "--port".to_string(),
                port,
                "-c".to_string(),
                config.max_model_len.to_string(),
                "-ngl".to_string(),
                "999".to_string(),
            ];
            if config.flash_attn {
                args.push("--flash-attn".to_string());
            }
            if let Some(format) = config.chat_format {
                args.extend(["--chat-template".to_string(), format.llama_cpp_name().to_string()]);
            }
            if let Some(name) = &config.served_model_name {
                args.extend(["--alias".to_string(), name.clone()]);
            }
            Ok((program, args))
        }
    }
}

pub async fn start_engine(
    config: &EngineConfig,
    model_path: &Path
) -> Result<EngineProcess, RelayError> {
    let http = HttpClient::new();

    if let Some(url) = &config.engine_url {
        info!("Attaching to running {} engine at {}", config.kind, url);
        let process = EngineProcess::attached(url.trim_end_matches('/'));
        wait_until_healthy(&http, process.base_url(), config.startup_timeout, None).await?;
        return Ok(process);
    }

    let (program, args) = build_command(config, model_path)?;
    info!("Starting engine: {} {}", program, args.join(" "));
    let mut child = Command::new(&program)
        .args(&args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| RelayError::initialization(format!("Failed to start {}: {}", program, e)))?;

    let base_url = format!("http://127.0.0.1:{}", config.engine_port);
    wait_until_healthy(&http, &base_url, config.startup_timeout, Some(&mut child)).await?;
    Ok(EngineProcess { base_url, child: Some(child) })
}

/// Polls `GET {base_url}/health` until it answers 2xx. Fails when the
/// timeout elapses or the spawned child exits first.
pub async fn wait_until_healthy(
    http: &HttpClient,
    base_url: &str,
    timeout: Duration,
    mut child: Option<&mut Child>
) -> Result<(), RelayError> {
    let url = format!("{}/health", base_url);
    let started = Instant::now();

    loop {
        if let Some(child) = child.as_mut() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    return Err(
                        RelayError::initialization(format!("Engine exited during startup: {}", status))
                    );
                }
                Ok(None) => {}
                Err(e) => warn!("Could not poll engine process: {}", e),
            }
        }

        match http.get(&url).timeout(Duration::from_secs(5)).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!("Engine healthy after {:.1}s", started.elapsed().as_secs_f32());
                return Ok(());
            }
            Ok(resp) => info!("Engine not ready yet ({})", resp.status()),
            Err(_) => {}
        }

        if started.elapsed() >= timeout {
            return Err(
                RelayError::initialization(
                    format!("Engine at {} not healthy after {}s", base_url, timeout.as_secs())
                )
            );
        }
        tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
    }
}
