use anyhow::Result;
use clap::Parser;

mod cli;
mod health;
mod http;
mod serve;
mod services;
mod sessions;
mod state;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve {
            bind,
            port,
            seed,
        } => {
            let mut config = mmg_config::GatewayConfig::from_env();
            if let Some(bind) = bind {
                config.http_bind = bind;
            }
            if let Some(port) = port {
                config.http_port = port;
            }
            if let Some(seed) = seed {
                config.seed_path = Some(seed.into());
            }
            serve::run(config).await
        }
        Commands::Status { url } => cli::handle_status_command(&url).await,
        Commands::CheckConfig { seed } => cli::handle_check_config_command(seed).await,
    }
}
