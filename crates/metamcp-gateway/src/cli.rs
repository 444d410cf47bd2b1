use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "metamcp-gateway", version, about = "MetaMCP aggregation gateway")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the gateway.
    Serve {
        /// Bind address (default 127.0.0.1, METAMCP_HTTP_BIND).
        #[arg(long)]
        bind: Option<String>,
        /// Listen port (default 12008, METAMCP_HTTP_PORT).
        #[arg(long)]
        port: Option<u16>,
        /// Repository seed file (TOML).
        #[arg(long)]
        seed: Option<String>,
    },
    /// Query a running gateway's health endpoint.
    Status {
        /// Base URL of the gateway.
        #[arg(long, default_value = "http://127.0.0.1:12008")]
        url: String,
    },
    /// Validate the seed file and print the resolved configuration.
    CheckConfig {
        /// Repository seed file (TOML).
        #[arg(long)]
        seed: Option<String>,
    },
}

pub async fn handle_status_command(base_url: &str) -> Result<()> {
    let url = format!("{}/health", base_url.trim_end_matches('/'));
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("gateway is not reachable at {url}"))?;

    let status = response.status();
    let body: serde_json::Value = response
        .json()
        .await
        .context("health endpoint returned a non-JSON body")?;
    println!("{}", serde_json::to_string_pretty(&body)?);

    if !status.is_success() {
        bail!("gateway reports degraded health (HTTP {status})");
    }
    Ok(())
}

pub async fn handle_check_config_command(seed: Option<String>) -> Result<()> {
    let mut config = mmg_config::GatewayConfig::from_env();
    if let Some(seed) = seed {
        config.seed_path = Some(seed.into());
    }

    if let Some(path) = &config.seed_path {
        let repo = mmg_repo::MemoryRepository::from_seed_path(path)
            .await
            .with_context(|| format!("seed file failed validation: {}", path.display()))?;
        let servers = mmg_repo::ServerStore::find_all(&repo).await?;
        println!(
            "seed ok: {} server definition(s) at {}",
            servers.len(),
            path.display()
        );
    } else {
        println!("no seed file configured; the repository starts empty");
    }

    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
