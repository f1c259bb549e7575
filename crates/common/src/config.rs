use std::fs;
use std::ops::Range;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

pub const DEFAULT_START_PORT: u16 = 3000;
pub const DEFAULT_END_PORT: u16 = 4000;
pub const DEFAULT_IDENTIFY_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_EXECUTABLE_DIR: &str = "/usr/local/bin/";
pub const DEFAULT_SECRET: &str = "change-me-in-production";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("port range [{start}, {end}) is empty")]
    EmptyPortRange { start: u16, end: u16 },
    #[error("identify timeout must be greater than zero")]
    ZeroTimeout,
}

/// Control-plane settings for the master.
///
/// Resolution order is file -> environment -> CLI flags; the CLI layer lives
/// in the `jobd` binary and simply overwrites fields after `load`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ControlConfig {
    pub start_port: u16,
    /// Exclusive.
    pub end_port: u16,
    pub bind_address: String,
    pub identify_timeout_secs: u64,
    /// Addresses handed to workers. Empty means detect from the interfaces.
    pub advertised_addresses: Vec<String>,
    pub executable_dir: String,
    pub journal_path: Option<String>,
    pub journal_secret: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            start_port: DEFAULT_START_PORT,
            end_port: DEFAULT_END_PORT,
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            identify_timeout_secs: DEFAULT_IDENTIFY_TIMEOUT_SECS,
            advertised_addresses: Vec::new(),
            executable_dir: DEFAULT_EXECUTABLE_DIR.to_string(),
            journal_path: None,
            journal_secret: DEFAULT_SECRET.to_string(),
        }
    }
}

impl ControlConfig {
    /// Load from an optional TOML file, then apply `JOBD_*` environment
    /// overrides. A missing or broken file falls back to defaults.
    pub fn load(config_path: Option<&Path>) -> Self {
        let mut config = match config_path {
            Some(path) => Self::from_file(path),
            None => Self::default(),
        };
        config.apply_env();
        config
    }

    fn from_file(path: &Path) -> Self {
        let contents = match fs::read_to_string(path) {
            Ok(value) => value,
            Err(err) => {
                warn!("Failed to read config file {}: {}", path.display(), err);
                return Self::default();
            }
        };

        match toml::from_str::<Self>(&contents) {
            Ok(cfg) => {
                info!("Loaded control configuration from {}", path.display());
                cfg
            }
            Err(err) => {
                warn!("Failed to parse {}: {}", path.display(), err);
                Self::default()
            }
        }
    }

    pub fn apply_env(&mut self) {
        if let Some(port) = parse_env_u16("JOBD_START_PORT") {
            self.start_port = port;
        }
        if let Some(port) = parse_env_u16("JOBD_END_PORT") {
            self.end_port = port;
        }
        if let Some(secs) = parse_env_u64("JOBD_IDENTIFY_TIMEOUT") {
            self.identify_timeout_secs = secs;
        }
        if let Some(addr) = env_string("JOBD_BIND_ADDRESS") {
            self.bind_address = addr;
        }
        if let Some(list) = env_string("JOBD_ADVERTISED_ADDRESSES") {
            self.advertised_addresses = list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(dir) = env_string("JOBD_EXECUTABLE_DIR") {
            self.executable_dir = dir;
        }
        if let Some(path) = env_string("JOBD_JOURNAL") {
            self.journal_path = Some(path);
        }
        if let Some(secret) = env_string("JOBD_SECRET") {
            self.journal_secret = secret;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.start_port >= self.end_port {
            return Err(ConfigError::EmptyPortRange {
                start: self.start_port,
                end: self.end_port,
            });
        }
        if self.identify_timeout_secs == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    pub fn port_range(&self) -> Range<u16> {
        self.start_port..self.end_port
    }

    pub fn identify_timeout(&self) -> Duration {
        Duration::from_secs(self.identify_timeout_secs)
    }

    /// Bare executable names are looked up in `executable_dir`; anything with
    /// a path separator is used as given.
    pub fn resolve_executable(&self, name: &str) -> String {
        if name.contains('/') || self.executable_dir.is_empty() {
            return name.to_string();
        }
        Path::new(&self.executable_dir)
            .join(name)
            .to_string_lossy()
            .into_owned()
    }
}

fn env_string(name: &str) -> Option<String> {
    let value = std::env::var(name).ok()?;
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn parse_env_u64(name: &str) -> Option<u64> {
    let raw = env_string(name)?;
    match raw.parse::<u64>() {
        Ok(value) => Some(value),
        Err(err) => {
            warn!("Invalid {} value '{}': {}", name, raw, err);
            None
        }
    }
}

fn parse_env_u16(name: &str) -> Option<u16> {
    let raw = env_string(name)?;
    match raw.parse::<u16>() {
        Ok(value) => Some(value),
        Err(err) => {
            warn!("Invalid {} value '{}': {}", name, raw, err);
            None
        }
    }
}
