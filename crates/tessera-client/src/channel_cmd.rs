//! Channel subcommands: send and upload.
//!
//! Both pair a fresh channel first; pairing state lives only for the
//! duration of the command.

use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::warn;

use tessera_core::Config;
use tessera_crypto::Encode;

use crate::channel::SecureChannel;
use crate::transport::HttpTransport;

/// Pair and send each message, or stdin lines until `quit` when none are given.
pub async fn send(
    transport: Arc<HttpTransport>,
    config: &Config,
    messages: Vec<String>,
    fixed_length: bool,
) -> anyhow::Result<()> {
    if fixed_length {
        let channel = SecureChannel::fixed_length(transport, Handle::current(), config);
        exchange(channel, messages).await
    } else {
        let channel = SecureChannel::new(transport, Handle::current(), config);
        exchange(channel, messages).await
    }
}

async fn exchange<E>(
    mut channel: SecureChannel<HttpTransport, E>,
    messages: Vec<String>,
) -> anyhow::Result<()>
where
    E: Encode + Clone + Send + 'static,
{
    channel.pair().await?;
    let mut out = io::stdout();

    if !messages.is_empty() {
        for message in messages {
            send_one(&mut channel, &message, &mut out).await?;
        }
        return Ok(());
    }

    writeln!(out, "Paired. Type a message, or quit to exit.")?;
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if line.eq_ignore_ascii_case("quit") {
            break;
        }
        if line.is_empty() {
            continue;
        }
        send_one(&mut channel, line, &mut out).await?;
    }
    Ok(())
}

async fn send_one<E>(
    channel: &mut SecureChannel<HttpTransport, E>,
    message: &str,
    out: &mut impl Write,
) -> anyhow::Result<()>
where
    E: Encode + Clone + Send + 'static,
{
    let reply = channel.send(message.as_bytes()).await?;
    if reply.is_success() {
        writeln!(out, "{}", String::from_utf8_lossy(&reply.data))?;
    } else {
        warn!(status = reply.status.name(), "Reply dropped");
        writeln!(out, "(reply rejected: {})", reply.status)?;
    }
    Ok(())
}

/// Pair and stream one file.
pub async fn upload(
    transport: Arc<HttpTransport>,
    config: &Config,
    path: &Path,
) -> anyhow::Result<()> {
    let mut channel = SecureChannel::new(transport, Handle::current(), config);
    channel.pair().await?;
    let response = channel.upload_file(path).await?;
    writeln!(io::stdout(), "{response}")?;
    Ok(())
}
