//! Configuration file parsing
//!
//! Parses TOML configuration files for a storage node.

use crate::p2p::tcp::{DEFAULT_ENVELOPE_BUFFER, DEFAULT_MAX_DECODE_ERRORS};
use crate::store::{plain_path_transform, sha1_path_transform, PathTransform, DEFAULT_ROOT};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Node configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Node settings
    pub node: NodeConfig,

    /// Connection handling
    #[serde(default)]
    pub transport: TransportConfig,
}

/// Node settings
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Address to listen on, e.g. "127.0.0.1:3000"
    pub listen_addr: String,

    /// Directory holding stored files
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,

    /// Key to path mapping
    #[serde(default)]
    pub path_transform: TransformKind,

    /// Peers dialed at startup
    #[serde(default)]
    pub bootstrap: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_storage_root() -> PathBuf {
    PathBuf::from(DEFAULT_ROOT)
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Path transform selection
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransformKind {
    #[default]
    Sha1,
    Plain,
}

impl TransformKind {
    pub fn transform(self) -> PathTransform {
        match self {
            TransformKind::Sha1 => sha1_path_transform,
            TransformKind::Plain => plain_path_transform,
        }
    }
}

/// Transport settings
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// Consecutive decode errors before a connection is dropped
    #[serde(default = "default_max_decode_errors")]
    pub max_decode_errors: usize,

    /// Envelopes buffered ahead of the dispatch loop
    #[serde(default = "default_envelope_buffer")]
    pub envelope_buffer: usize,
}

fn default_max_decode_errors() -> usize {
    DEFAULT_MAX_DECODE_ERRORS
}

fn default_envelope_buffer() -> usize {
    DEFAULT_ENVELOPE_BUFFER
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_decode_errors: DEFAULT_MAX_DECODE_ERRORS,
            envelope_buffer: DEFAULT_ENVELOPE_BUFFER,
        }
    }
}

impl Config {
    /// Configuration for a node listening on `listen_addr` with defaults elsewhere
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            node: NodeConfig {
                listen_addr: listen_addr.into(),
                storage_root: default_storage_root(),
                path_transform: TransformKind::default(),
                bootstrap: Vec::new(),
                log_level: default_log_level(),
            },
            transport: TransportConfig::default(),
        }
    }

    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.listen_addr.trim().is_empty() {
            return Err(ConfigError::Invalid("listen_addr must not be empty".to_string()));
        }

        let mut seen = HashSet::new();
        for addr in &self.node.bootstrap {
            if addr == &self.node.listen_addr {
                return Err(ConfigError::Invalid(format!(
                    "bootstrap list contains the node's own address {}",
                    addr
                )));
            }
            if !seen.insert(addr) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate bootstrap address: {}",
                    addr
                )));
            }
        }

        if self.transport.max_decode_errors == 0 {
            return Err(ConfigError::Invalid(
                "max_decode_errors must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
