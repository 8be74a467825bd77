//! Secure item store subcommands: write, read, remove, clear.
//!
//! User-facing output uses writeln! to stdout (this is a CLI binary, not debug output).

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Context;

use tessera_core::Config;
use tessera_crypto::{SecretBuf, SecureItemStore};

/// Store key material shared by every invocation against the same directory.
#[derive(clap::Args, Debug)]
pub struct SdrKey {
    /// Store entropy as hex (at least 32 bytes).
    #[arg(long, env = "TESSERA_SDR_ENTROPY", hide_env_values = true)]
    entropy: String,

    /// Base nonce the item nonces are derived from.
    #[arg(long, env = "TESSERA_SDR_NONCE", hide_env_values = true)]
    nonce: u64,

    /// Store directory (overrides the configured one).
    #[arg(long)]
    dir: Option<PathBuf>,
}

/// SDR subcommand actions.
#[derive(clap::Subcommand, Debug)]
pub enum SdrAction {
    /// Encrypt and store a value.
    Write {
        /// Item name.
        name: String,
        /// Value to store.
        value: String,
    },
    /// Print a stored value.
    Read {
        /// Item name.
        name: String,
    },
    /// Remove one item.
    Remove {
        /// Item name.
        name: String,
    },
    /// Remove every item and the store directory.
    Clear,
}

/// Execute an SDR subcommand.
pub fn run(action: SdrAction, key: SdrKey, config: &Config) -> anyhow::Result<()> {
    let mut store = open(key, config)?;
    let mut out = io::stdout();
    match action {
        SdrAction::Write { name, value } => {
            store.write_str(&name, &value, false)?;
            writeln!(out, "Stored {name}")?;
        }
        SdrAction::Read { name } => {
            let value = store
                .read_string(&name)
                .with_context(|| format!("Failed to read {name}"))?;
            writeln!(out, "{value}")?;
        }
        SdrAction::Remove { name } => {
            store.remove(&name)?;
            writeln!(out, "Removed {name}")?;
        }
        SdrAction::Clear => {
            store.remove_all()?;
            writeln!(out, "Cleared {}", store.dir().display())?;
        }
    }
    Ok(())
}

fn open(key: SdrKey, config: &Config) -> anyhow::Result<SecureItemStore> {
    let dir = key
        .dir
        .or_else(|| config.sdr_dir())
        .ok_or_else(|| anyhow::anyhow!("No SDR directory configured. Use --dir <path>"))?;
    let entropy = hex::decode(key.entropy.trim()).context("SDR entropy is not valid hex")?;
    Ok(SecureItemStore::open(dir, SecretBuf::new(entropy), key.nonce)?)
}
