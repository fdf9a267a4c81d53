use cipher_relay::cli::ClientArgs;
use cipher_relay::run_client;
use clap::Parser;
use dotenv::dotenv;
use std::error::Error;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    dotenv().ok();
    let args = ClientArgs::parse();
    // stdout carries the answer; logs go to stderr and stay quiet by default.
    let level = if args.debug { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .target(env_logger::Target::Stderr)
        .init();

    run_client(args).await
}
