pub mod cli;
pub mod client;
pub mod crypto;
pub mod error;
pub mod framing;
pub mod llm;
pub mod models;
pub mod relay;
pub mod server;

use cli::{ ClientArgs, ServerArgs };
use client::session::{ run_interactive, run_tool, tool_request };
use client::{ ChatClient, HttpTransport, Session };
use crypto::PayloadCodec;
use llm::registry::new_resolver;
use llm::EngineSlot;
use log::{ info, warn };
use server::{ AppContext, Server };
use std::error::Error;
use std::io::IsTerminal;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

pub async fn run_server(args: ServerArgs) -> Result<(), Box<dyn Error + Send + Sync>> {
    let codec = PayloadCodec::from_key(args.encryption_key.as_deref())?;
    let config = args.engine_config();

    info!("--- Core Configuration ---");
    info!("Server Address: {}", args.server_addr);
    info!("Engine: {}", config.kind);
    match &config.engine_url {
        Some(url) => info!("Engine URL (attached): {}", url),
        None => info!("Engine Port (spawned): {}", config.engine_port),
    }
    info!("Models: {:?}", config.models);
    info!("Model Directory: {}", config.model_dir.display());
    info!("Model Resolver: {}", config.resolver);
    info!("Max Model Length: {}", config.max_model_len);
    info!("GPU Memory Utilization: {}", config.gpu_memory_utilization);
    info!("Flash Attention: {}", config.flash_attn);
    info!(
        "Chat Format: {}",
        config.chat_format.map(|f| f.to_string()).unwrap_or_else(|| "auto".to_string())
    );
    info!("Empty Output Policy: {}", args.empty_output_policy);
    info!("Max Jobs Per Second: {}", args.max_jobs_per_second);
    info!("Encryption Key Fingerprint: {}", codec.fingerprint());
    info!("API Key Configured: {}", args.api_key.as_deref().map(|k| !k.is_empty()).unwrap_or(false));
    info!("-------------------------");

    let tls = args.tls_paths();
    if args.enable_tls && tls.is_none() {
        warn!("ENABLE_TLS is set but TLS_CERT_PATH or TLS_KEY_PATH is missing. Serving plain HTTP.");
    }

    // Holds the spawned engine process for the lifetime of the server.
    let slot = EngineSlot::new();
    let resolver = new_resolver(config.resolver);
    let engine = slot.get_or_init(&config, resolver.as_ref()).await?;

    let ctx = Arc::new(
        AppContext::new(
            codec,
            engine,
            args.empty_output_policy,
            args.api_key.clone(),
            args.max_jobs_per_second
        )
    );
    let server = Server::new(args.server_addr.clone(), ctx, tls);
    server.run().await?;

    Ok(())
}

pub async fn run_client(args: ClientArgs) -> Result<(), Box<dyn Error + Send + Sync>> {
    if args.generate_key {
        println!("{}", PayloadCodec::generate_key());
        return Ok(());
    }

    let codec = PayloadCodec::from_key(args.encryption_key.as_deref())?;
    let endpoint_id = args.endpoint_id.clone().unwrap_or_default();
    let transport = HttpTransport::new(&args.base_url, &endpoint_id, args.api_key.clone())?;
    info!("Endpoint: {}", transport.url());
    info!("Encryption Key Fingerprint: {}", codec.fingerprint());
    if args.api_key.as_deref().map(str::is_empty).unwrap_or(true) {
        warn!("API_KEY is not set. Requests are sent without authorization.");
    }
    let client = ChatClient::new(transport, codec);

    let piped = if std::io::stdin().is_terminal() {
        None
    } else {
        let mut context = String::new();
        tokio::io::stdin().read_to_string(&mut context).await?;
        Some(context).filter(|c| !c.trim().is_empty())
    };

    if args.prompt.is_some() || piped.is_some() {
        let request = tool_request(
            args.prompt.as_deref(),
            piped.as_deref(),
            &args.system,
            args.sampling_params(),
            args.legacy_prompt
        ).ok_or("Nothing to send: the prompt is empty.")?;
        let mut out = std::io::stdout();
        run_tool(&client, &request, &mut out).await?;
        return Ok(());
    }

    let mut session = Session::new(client, &args.system, args.sampling_params());
    run_interactive(&mut session).await
}
