//! CLI binary for the realtime gate.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use realtime_gate::token::{RealtimeTokenClient, TokenRequest};
use realtime_gate::transport::{connect_websocket, realtime_url};
use realtime_gate::{GateConfig, SessionOrchestrator, run_session};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// How long the restore frame and close handshake get after the session ends.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

/// Voice-activated command capture over a realtime model session.
#[derive(Parser)]
#[command(name = "realtime-gate", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Realtime credential to use instead of minting one from the backend.
    #[arg(long, env = "REALTIME_GATE_REALTIME_KEY", hide_env_values = true)]
    realtime_key: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Connect and run the capture session until Ctrl-C.
    Run,

    /// Print the effective configuration as TOML.
    PrintConfig,

    /// Write a default configuration file.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },

    /// Mint a realtime credential and print its session id and expiry.
    MintToken,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout is left for print-config output.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("realtime_gate=info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(GateConfig::default_config_path);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let config = load_config(&config_path, cli.config.is_some())?;
            run(config, cli.realtime_key).await
        }
        Command::PrintConfig => {
            let config = load_config(&config_path, cli.config.is_some())?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Command::InitConfig { force } => init_config(&config_path, force),
        Command::MintToken => {
            let config = load_config(&config_path, cli.config.is_some())?;
            let client = RealtimeTokenClient::new(&config.token)?;
            let token = client.mint(&TokenRequest::from_config(&config)).await?;
            println!(
                "session {} expires at {}",
                token.session_id.as_deref().unwrap_or("-"),
                token
                    .expires_at
                    .map_or_else(|| "-".to_owned(), |t| t.to_string())
            );
            Ok(())
        }
    }
}

/// Load the config file (defaults if the default path is absent), apply
/// environment overrides and validate.
fn load_config(path: &Path, explicit: bool) -> anyhow::Result<GateConfig> {
    let mut config = if explicit || path.exists() {
        GateConfig::from_file(path)
            .map_err(|e| anyhow::anyhow!("failed to load {}: {e}", path.display()))?
    } else {
        GateConfig::default()
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

fn init_config(path: &Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    GateConfig::default().save_to_file(path)?;
    println!("wrote {}", path.display());
    Ok(())
}

async fn run(config: GateConfig, realtime_key: Option<String>) -> anyhow::Result<()> {
    let bearer = match realtime_key.filter(|k| !k.trim().is_empty()) {
        Some(key) => key,
        None => {
            let client = RealtimeTokenClient::new(&config.token)?;
            client.mint(&TokenRequest::from_config(&config)).await?.value
        }
    };

    let url = realtime_url(&config.realtime)?;
    info!("connecting to {}", url);
    let (sink, events, socket) = connect_websocket(&url, &bearer)?;

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let mut orchestrator = SessionOrchestrator::new(config);
    let result = run_session(&mut orchestrator, Box::new(sink), events, cancel).await;
    socket.finish(SHUTDOWN_GRACE).await;
    result.map_err(|e| {
        tracing::error!(error = %e, "session ended with error");
        anyhow::anyhow!("session failed: {e}")
    })?;

    info!("session shut down cleanly");
    Ok(())
}
