use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Bridge-wide configuration. Everything has a sensible default, so an
/// empty TOML file (or no file at all) yields a working bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Root directory holding the metadata file and one credential
    /// subdirectory per session id.
    #[serde(default = "d_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub sessions: SessionsConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            data_dir: d_data_dir(),
            sessions: SessionsConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from a TOML file. A missing file is not an
    /// error — defaults apply.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session lifecycle timeouts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Bounds on how long callers are held during session creation and
/// readiness waits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// How long `create` waits for the first QR challenge or ready signal
    /// before failing with `CreationTimeout`.
    #[serde(default = "d_30")]
    pub creation_timeout_secs: u64,

    /// How long the readiness gate waits for a session to reach READY
    /// before failing with `ServiceUnavailable`.
    #[serde(default = "d_30")]
    pub ready_timeout_secs: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            creation_timeout_secs: 30,
            ready_timeout_secs: 30,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reconnect policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Controls how a session is re-initiated after an unexpected disconnect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt.
    #[serde(default = "d_5")]
    pub initial_delay_secs: u64,

    /// Cap on the delay between attempts.
    #[serde(default = "d_60")]
    pub max_delay_secs: u64,

    /// Multiplier applied after each failed attempt.
    #[serde(default = "d_factor")]
    pub backoff_factor: f64,

    /// Maximum consecutive reconnect attempts before giving up.
    /// `0` means unlimited.
    #[serde(default)]
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_secs: 5,
            max_delay_secs: 60,
            backoff_factor: 2.0,
            max_attempts: 0,
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_data_dir() -> PathBuf {
    PathBuf::from("./chatbridge-data")
}
fn d_30() -> u64 {
    30
}
fn d_5() -> u64 {
    5
}
fn d_60() -> u64 {
    60
}
fn d_factor() -> f64 {
    2.0
}
