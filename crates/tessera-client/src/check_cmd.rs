//! Local engine self-check: no peer, no network.

use std::io::{self, Write};

use tessera_core::Config;
use tessera_crypto::Decoded;
use tessera_crypto::local::self_check;

use crate::channel::engine_config;

/// Encode `value` with a freshly seeded local pair and decode it again.
pub fn run(config: &Config, value: &str) -> anyhow::Result<()> {
    let decoded = self_check(engine_config(config), value.as_bytes())?;
    let report = verdict(&decoded, value)?;
    writeln!(io::stdout(), "{report}")?;
    Ok(())
}

fn verdict(decoded: &Decoded, value: &str) -> anyhow::Result<String> {
    if !decoded.is_success() {
        anyhow::bail!("Decode failed: {}", decoded.status.description());
    }
    if decoded.data != value.as_bytes() {
        anyhow::bail!("Decoded value does not match the original");
    }
    Ok(format!("Round trip OK: {value}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tessera_crypto::Status;

    #[test]
    fn configured_window_passes() {
        let mut config = Config::default();
        config.session.sequence_window = -8;
        run(&config, "hello").unwrap();
    }

    #[test]
    fn mismatch_and_rejection_are_failures() {
        let ok = Decoded {
            data: b"hello".to_vec(),
            ..Decoded::default()
        };
        assert_eq!(verdict(&ok, "hello").unwrap(), "Round trip OK: hello");
        assert!(verdict(&ok, "other").is_err());
        assert!(verdict(&Decoded::rejected(Status::SeqOutsideWindow), "").is_err());
    }
}
