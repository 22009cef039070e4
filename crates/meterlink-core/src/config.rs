//! Configuration file support for meterlink
//!
//! Configuration is stored in TOML format at:
//! - Linux: `~/.config/meterlink/config.toml`
//! - macOS: `~/Library/Application Support/meterlink/config.toml`
//! - Windows: `%APPDATA%\meterlink\config.toml`

use crate::engine::DEFAULT_INTERVAL_MS;
use crate::error::{Error, Result};
use crate::meter::FaderType;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default engine address for `watch` and `engine`.
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:4455";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where to reach the engine
    pub connection: ConnectionSettings,
    /// Defaults for newly created meters
    pub meter: MeterSettings,
    /// Simulated engine settings
    pub engine: EngineSettings,
}

/// Client connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Engine address (host:port)
    pub address: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
        }
    }
}

/// Meter defaults
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeterSettings {
    /// Poll interval requested after creation, in milliseconds
    pub update_interval_ms: u32,
    /// Fader scale passed to `Create`
    pub fader: FaderType,
}

impl Default for MeterSettings {
    fn default() -> Self {
        Self {
            update_interval_ms: DEFAULT_INTERVAL_MS,
            fader: FaderType::Cubic,
        }
    }
}

/// Simulated engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Address the engine listens on
    pub listen: String,
    /// Channel count of the simulated sources
    pub channels: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            listen: DEFAULT_ADDRESS.to_string(),
            channels: 2,
        }
    }
}

impl Config {
    /// Load configuration from the default config file location
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Err(Error::Config(format!("Config file not found at {:?}", path)))
        }
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration or return default if not found
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }

    /// Get the default configuration file path
    pub fn config_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = ProjectDirs::from("", "", "meterlink") {
            Ok(proj_dirs.config_dir().join("config.toml"))
        } else {
            Err(Error::Config("Could not determine config directory".to_string()))
        }
    }

    /// Create a default config file with comments
    pub fn create_default_config_file() -> Result<PathBuf> {
        let path = Self::config_path()?;
        Self::write_default_config(&path)?;
        Ok(path)
    }

    /// Write the commented default config to `path`
    pub fn write_default_config(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, DEFAULT_CONFIG)?;
        Ok(())
    }
}

const DEFAULT_CONFIG: &str = r#"# meterlink configuration file

[connection]
# Engine address used by `meterlink watch`
address = "127.0.0.1:4455"

[meter]
# Poll interval in milliseconds
update_interval_ms = 50

# Fader scale: "cubic", "iec" or "log"
fader = "cubic"

[engine]
# Address `meterlink engine` listens on
listen = "127.0.0.1:4455"

# Channels per simulated source
channels = 2
"#;
