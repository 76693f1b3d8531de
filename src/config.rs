//! Controller configuration, persisted as TOML.
//!
//! Loaded from `$XDG_CONFIG_HOME/wasp-nest/config.toml` when present. Every
//! field has a default, so an empty or missing file yields a working
//! controller that speaks the stock agent handshake.

use std::path::Path;

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::cipher::CipherMethod;
use crate::protocol::chunk::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_LEN};

/// Errors from loading or saving configuration.
#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config: {path}")]
    #[diagnostic(
        code(nest::config::read),
        help("Ensure the config file exists and is readable.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {path}: {message}")]
    #[diagnostic(
        code(nest::config::parse),
        help(
            "Check the TOML syntax. `nest config init` writes a file with every \
             default spelled out."
        )
    )]
    Parse { path: String, message: String },

    #[error("failed to write config: {path}")]
    #[diagnostic(
        code(nest::config::write),
        help("Ensure you have write permissions to the config directory.")
    )]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {message}")]
    #[diagnostic(code(nest::config::invalid), help("{message}"))]
    Invalid { message: String },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Handshake constants.
///
/// The two reserved bytes differ across agent builds (agents send 0x00, the
/// stock controller answers 0x01), so both are configurable and need not match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeConfig {
    #[serde(default = "default_magic")]
    pub magic: u32,
    /// Reserved byte the agent must send.
    #[serde(default)]
    pub inbound_reserved: u8,
    /// Reserved byte the controller sends.
    #[serde(default = "default_outbound_reserved")]
    pub outbound_reserved: u8,
    /// Cipher the controller uses for its own traffic.
    #[serde(default)]
    pub outbound_method: CipherMethod,
    /// Seed for an outbound XOR cipher; random when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound_offset: Option<u8>,
}

fn default_magic() -> u32 {
    0x7563_6573
}
fn default_outbound_reserved() -> u8 {
    0x01
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            magic: default_magic(),
            inbound_reserved: 0x00,
            outbound_reserved: default_outbound_reserved(),
            outbound_method: CipherMethod::None,
            outbound_offset: None,
        }
    }
}

/// Framing limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Largest chunk record the controller emits (1..=65535).
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,
    /// Largest primary frame the controller accepts.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
}

fn default_max_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_max_frame_size() -> usize {
    16 * 1024 * 1024
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: default_max_chunk_size(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

/// Top-level controller configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// How long the server waits for sessions after an interrupt before
    /// aborting them. Draining sessions pause for half of it.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default)]
    pub handshake: HandshakeConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

fn default_bind() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    7777
}
fn default_shutdown_grace_secs() -> u64 {
    3
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            handshake: HandshakeConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// `bind:port` listen address.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn shutdown_grace(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Pause a draining session takes before closing on interrupt.
    pub fn session_pause(&self) -> std::time::Duration {
        self.shutdown_grace() / 2
    }

    /// Check value ranges the type system cannot express.
    pub fn validate(&self) -> ConfigResult<()> {
        let chunk = self.transport.max_chunk_size;
        if chunk == 0 || chunk > MAX_CHUNK_LEN {
            return Err(ConfigError::Invalid {
                message: format!(
                    "transport.max_chunk_size must be between 1 and {MAX_CHUNK_LEN}, got {chunk}"
                ),
            });
        }
        if self.transport.max_frame_size == 0 {
            return Err(ConfigError::Invalid {
                message: "transport.max_frame_size must be positive".into(),
            });
        }
        if self.handshake.outbound_offset == Some(u8::MAX) {
            return Err(ConfigError::Invalid {
                message: "handshake.outbound_offset must be below 255".into(),
            });
        }
        Ok(())
    }

    /// Load from a TOML file and validate.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise return defaults.
    pub fn load_or_default(path: &Path) -> ConfigResult<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save to a TOML file.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            source: e,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_stock_agent() {
        let cfg = ControllerConfig::default();
        assert_eq!(cfg.port, 7777);
        assert_eq!(cfg.handshake.magic, 0x7563_6573);
        assert_eq!(cfg.handshake.inbound_reserved, 0x00);
        assert_eq!(cfg.handshake.outbound_reserved, 0x01);
        assert_eq!(cfg.handshake.outbound_method, CipherMethod::None);
        assert_eq!(cfg.transport.max_chunk_size, 255);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn config_roundtrip_toml() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("config.toml");

        let cfg = ControllerConfig {
            port: 9000,
            handshake: HandshakeConfig {
                outbound_method: CipherMethod::XorStream,
                outbound_offset: Some(17),
                ..Default::default()
            },
            ..Default::default()
        };
        cfg.save(&path).unwrap();

        let loaded = ControllerConfig::load(&path).unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "port = 4444\n[handshake]\noutbound_method = \"xor\"\n").unwrap();

        let cfg = ControllerConfig::load(&path).unwrap();
        assert_eq!(cfg.port, 4444);
        assert_eq!(cfg.bind, "0.0.0.0");
        assert_eq!(cfg.handshake.outbound_method, CipherMethod::XorStream);
        assert_eq!(cfg.handshake.magic, 0x7563_6573);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = ControllerConfig::load_or_default(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(cfg, ControllerConfig::default());
    }

    #[test]
    fn sessions_pause_inside_the_server_grace() {
        let cfg = ControllerConfig::default();
        assert_eq!(cfg.session_pause(), std::time::Duration::from_millis(1500));
        assert!(cfg.session_pause() < cfg.shutdown_grace());

        let cfg = ControllerConfig {
            shutdown_grace_secs: 0,
            ..Default::default()
        };
        assert!(cfg.session_pause().is_zero());
    }

    #[test]
    fn oversized_chunk_is_rejected() {
        let cfg = ControllerConfig {
            transport: TransportConfig {
                max_chunk_size: 70_000,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid { .. })));
    }
}
