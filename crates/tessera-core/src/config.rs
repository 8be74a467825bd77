//! Configuration resolution for Tessera.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/tessera/settings.json)
//! 3. Explicit config file (`--config`)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)
//!
//! File layers merge key by key: a file only overrides the fields it names.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};

/// Largest sequence window magnitude the decoder supports.
pub const MAX_SEQUENCE_WINDOW: i32 = 63;

/// Complete Tessera configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pairing: PairingConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub sdr: SdrConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            pairing: PairingConfig::default(),
            session: SessionConfig::default(),
            stream: StreamConfig::default(),
            sdr: SdrConfig::default(),
            log_level: default_log_level(),
        }
    }
}

/// Remote peer endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub url: String,
    pub pair_route: String,
    pub send_route: String,
    pub upload_route: String,
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:5000/".to_string(),
            pair_route: "api/pairone".to_string(),
            send_route: "api/mte/send-data".to_string(),
            upload_route: "api/mke/uploadstream".to_string(),
            request_timeout_secs: 10,
        }
    }
}

/// Handshake configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    /// Upper bound on the blocking wait for the pairing round trip (seconds).
    pub entropy_timeout_secs: u64,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            entropy_timeout_secs: 15,
        }
    }
}

/// Encoder/decoder configuration applied to every paired session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Signed sequence window: 0 verification-only, >0 forward-only, <0 async.
    pub sequence_window: i32,
    /// Maximum encode/decode timestamp skew in milliseconds, 0 disables the check.
    pub timestamp_window_ms: u64,
    /// Payload length used by the fixed-length encoder.
    pub fixed_length: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sequence_window: 0,
            timestamp_window_ms: 0,
            fixed_length: 100,
        }
    }
}

/// Streaming upload configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub chunk_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self { chunk_size: 1024 }
    }
}

/// Secure item store configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SdrConfig {
    /// Directory holding durable items. Defaults to the platform data dir.
    pub dir: Option<PathBuf>,
}

impl Config {
    /// Reject values the rest of the workspace cannot honour.
    pub fn validate(&self) -> Result<()> {
        if !(-MAX_SEQUENCE_WINDOW..=MAX_SEQUENCE_WINDOW).contains(&self.session.sequence_window) {
            return Err(Error::Config(format!(
                "sequence_window must be within -{MAX_SEQUENCE_WINDOW}..={MAX_SEQUENCE_WINDOW}, got {}",
                self.session.sequence_window
            )));
        }
        if self.stream.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be greater than zero".into()));
        }
        if self.session.fixed_length == 0 {
            return Err(Error::Config("fixed_length must be greater than zero".into()));
        }
        if self.pairing.entropy_timeout_secs == 0 {
            return Err(Error::Config(
                "entropy_timeout_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Durable item directory, falling back to the platform default.
    pub fn sdr_dir(&self) -> Option<PathBuf> {
        self.sdr.dir.clone().or_else(default_sdr_dir)
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(explicit_file: Option<&Path>) -> Result<Config> {
    let mut layers = Vec::new();

    if let Some(global_path) = global_config_path() {
        if global_path.exists() {
            debug!(path = %global_path.display(), "Loading global config");
            layers.push(load_config_file(&global_path)?);
        }
    }

    if let Some(path) = explicit_file {
        debug!(path = %path.display(), "Loading config file");
        layers.push(load_config_file(path)?);
    }

    let mut config = resolve(layers)?;
    apply_env_overrides(&mut config);
    config.validate()?;
    debug!(
        server = %config.server.url,
        sequence_window = config.session.sequence_window,
        "Config resolved"
    );

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    config_root().map(|p| p.join("settings.json"))
}

/// Default directory for durable secure items.
pub fn default_sdr_dir() -> Option<PathBuf> {
    config_root().map(|p| p.join("sdr"))
}

fn config_root() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".tessera"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/tessera"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("tessera"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Lay file layers over the defaults, lowest priority first.
fn resolve(layers: impl IntoIterator<Item = Value>) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;
    for layer in layers {
        merge_values(&mut merged, layer);
    }
    Ok(serde_json::from_value(merged)?)
}

/// Objects merge recursively; any other overlay value replaces the base.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge_values(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn env_override(name: &str) -> Option<String> {
    let value = std::env::var(name).ok()?;
    debug!(var = name, "Config override from environment");
    Some(value)
}

fn apply_env_overrides(config: &mut Config) {
    if let Some(val) = env_override("TESSERA_SERVER_URL") {
        config.server.url = val;
    }
    if let Some(val) = env_override("TESSERA_ENTROPY_TIMEOUT_SECS") {
        if let Ok(n) = val.parse() {
            config.pairing.entropy_timeout_secs = n;
        }
    }
    if let Some(val) = env_override("TESSERA_SEQUENCE_WINDOW") {
        if let Ok(n) = val.parse() {
            config.session.sequence_window = n;
        }
    }
    if let Some(val) = env_override("TESSERA_CHUNK_SIZE") {
        if let Ok(n) = val.parse() {
            config.stream.chunk_size = n;
        }
    }
    if let Some(val) = env_override("TESSERA_SDR_DIR") {
        config.sdr.dir = Some(PathBuf::from(val));
    }
    if let Some(val) = env_override("TESSERA_LOG_LEVEL") {
        config.log_level = val;
    }
}
