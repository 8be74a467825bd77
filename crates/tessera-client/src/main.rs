//! Tessera CLI
//!
//! Pairs with a peer over HTTP and exchanges encoded messages, streams
//! chunk-encrypted uploads, and manages the local secure item store.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use tessera_client::sdr_cmd::{SdrAction, SdrKey};
use tessera_client::{ChannelError, HttpTransport, channel_cmd, check_cmd, sdr_cmd};

#[derive(Parser, Debug)]
#[command(name = "tessera")]
#[command(version, about = "Paired encoder/decoder client", long_about = None)]
struct Cli {
    /// Config file layered over the global settings.
    #[arg(long, env = "TESSERA_CONFIG")]
    config: Option<PathBuf>,

    /// Peer base URL (overrides config).
    #[arg(long)]
    server: Option<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pair, then send messages (interactive when none are given).
    Send {
        messages: Vec<String>,
        /// Pad or truncate every message to the configured fixed length.
        #[arg(long)]
        fixed_length: bool,
    },
    /// Pair, then stream a file to the peer.
    Upload { path: PathBuf },
    /// Round-trip a value through a locally seeded encoder/decoder pair.
    Check {
        #[arg(default_value = "hello")]
        value: String,
    },
    /// Secure item store.
    Sdr {
        #[command(flatten)]
        key: SdrKey,
        #[command(subcommand)]
        action: SdrAction,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = tessera_core::config::load_config(cli.config.as_deref())?;
    if let Some(server) = cli.server {
        config.server.url = server;
    }

    tessera_core::tracing_init::init_tracing(
        &format!(
            "tessera={level},tessera_client={level},tessera_crypto={level}",
            level = config.log_level
        ),
        cli.log_json,
    );
    info!(version = env!("CARGO_PKG_VERSION"), "Starting tessera");

    let result = match cli.command {
        Command::Send {
            messages,
            fixed_length,
        } => {
            let transport = Arc::new(transport(&config)?);
            channel_cmd::send(transport, &config, messages, fixed_length).await
        }
        Command::Upload { path } => {
            let transport = Arc::new(transport(&config)?);
            channel_cmd::upload(transport, &config, &path).await
        }
        Command::Check { value } => check_cmd::run(&config, &value),
        Command::Sdr { key, action } => sdr_cmd::run(action, key, &config),
    };

    if let Err(e) = &result {
        if let Some(code) = failure_code(e) {
            error!(code = %code, "{e}");
        }
    }
    result
}

fn transport(config: &tessera_core::Config) -> anyhow::Result<HttpTransport> {
    let client_id = uuid::Uuid::new_v4().to_string();
    Ok(HttpTransport::new(&config.server, &client_id)?)
}

/// Stable code for pairing and transport failures.
fn failure_code(err: &anyhow::Error) -> Option<String> {
    match err.downcast_ref::<ChannelError>()? {
        ChannelError::Pairing(e) => Some(e.code()),
        ChannelError::Transport(e) => Some(e.code()),
        ChannelError::Crypto(e) => e.status().map(|s| s.name().to_string()),
        _ => None,
    }
}
