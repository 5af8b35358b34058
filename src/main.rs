//! tunman: SSH reverse-tunnel fabric.
//!
//! One binary, four programs: the `web`, `pubsub` and `forward` servers
//! expose backends over SSH channels; `manager` keeps an upstream server's
//! remote forwards in sync with local Docker containers.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use tunman::auth::{AuthService, Authorizer, AuthorizedKeys};
use tunman::config::{ManagerConfig, RawForwardConfig, ServerConfig};
use tunman::manager;
use tunman::server::{self, ServerState};
use tunman::tunnel::RawTunnel;
use tunman::web::WebTunnel;

#[derive(Parser, Debug)]
#[command(name = "tunman", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/tunman/config.toml")]
    config: PathBuf,

    /// Override the SSH listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve a per-session HTTP endpoint over direct-tcpip local forwards
    Web,
    /// Run the pub/sub bus: remote forwards plus the ls/emit commands
    Pubsub,
    /// Terminate direct-tcpip channels against a fixed backend dialed over SSH
    Forward,
    /// Reconcile Docker containers into remote forwards on an upstream server
    Manager,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Web => {
            let config = load_server_config(&cli)?;
            let tunnel = WebTunnel::new(Arc::new(WebTunnel::identity_router));
            let state = ServerState::new(build_authorizer(&config)?).with_tunnel(Arc::new(tunnel));
            info!("starting web tunnel server on {}", config.listen_addr);
            server::run_server(&config, Arc::new(state)).await
        }
        Command::Pubsub => {
            let config = load_server_config(&cli)?;
            let state = ServerState::new(build_authorizer(&config)?).with_pubsub();
            info!("starting pub/sub server on {}", config.listen_addr);
            server::run_server(&config, Arc::new(state)).await
        }
        Command::Forward => {
            let config = load_server_config(&cli)?;
            let raw = RawForwardConfig::from_env().context("forward backend configuration")?;
            info!(
                "starting forward server on {} for backend {} ({})",
                config.listen_addr, raw.remote_address, raw.remote_protocol
            );
            let state =
                ServerState::new(build_authorizer(&config)?).with_tunnel(Arc::new(RawTunnel::new(raw)));
            server::run_server(&config, Arc::new(state)).await
        }
        Command::Manager => {
            let config = ManagerConfig::from_env().context("manager configuration")?;
            info!(
                "starting tunnel manager against {} as {}",
                config.upstream.remote_hostname, config.upstream.remote_user
            );
            manager::run(config).await
        }
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else if let Ok(level) = std::env::var("LOG_LEVEL") {
        EnvFilter::new(level)
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_server_config(cli: &Cli) -> Result<ServerConfig> {
    let mut config = ServerConfig::load_or_default(&cli.config)
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    config.apply_env();
    if let Some(listen) = &cli.listen {
        config.listen_addr = listen.clone();
    }
    Ok(config)
}

fn build_authorizer(config: &ServerConfig) -> Result<Authorizer> {
    if let Some(url) = &config.auth_url {
        info!("authenticating keys against {url}");
        return Ok(Authorizer::Service(AuthService::new(
            url.clone(),
            config.auth_token.clone(),
        )));
    }
    if let Some(path) = &config.authorized_keys {
        return Ok(Authorizer::AuthorizedKeys(AuthorizedKeys::load(path)?));
    }
    warn!("no authorized keys or auth service configured, accepting every key");
    Ok(Authorizer::Open)
}
