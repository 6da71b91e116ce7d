//! SecureChat configuration
//!
//! Server and client settings loaded from TOML. Every field has a default, so
//! a partial file (or no file) is valid; command line flags are applied on
//! top by the CLI.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{ChatError, Result};

// ----------------------------------------------------------------------------
// Server Configuration
// ----------------------------------------------------------------------------

/// Settings for a chat server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the listener binds to
    pub bind_address: String,
    /// Number of connection handlers in the pool
    pub pool_size: usize,
    /// Server key store (certificate and private keys)
    pub keystore: PathBuf,
    /// Trusted root authority file
    pub trusted_root: PathBuf,
    /// Seconds a new connection has to complete the handshake
    pub handshake_timeout_secs: u64,
    /// Seconds a single outbound delivery may take before the session is closed
    pub delivery_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:7000".to_string(),
            pool_size: 10,
            keystore: PathBuf::from("certs/server.toml"),
            trusted_root: PathBuf::from("certs/root.toml"),
            handshake_timeout_secs: 10,
            delivery_timeout_secs: 5,
        }
    }
}

impl ServerConfig {
    /// Load from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the settings are usable
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(ChatError::config("pool_size must be at least 1"));
        }
        if self.bind_address.trim().is_empty() {
            return Err(ChatError::config("bind_address must not be empty"));
        }
        if self.handshake_timeout_secs == 0 || self.delivery_timeout_secs == 0 {
            return Err(ChatError::config("timeouts must be at least one second"));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Client Configuration
// ----------------------------------------------------------------------------

/// Settings for a chat client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server address to connect to
    pub server_address: String,
    /// Identifier announced during the handshake
    pub username: String,
    /// Client key store (certificate and private keys)
    pub keystore: PathBuf,
    /// Trusted root authority file
    pub trusted_root: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1:7000".to_string(),
            username: String::new(),
            keystore: PathBuf::from("certs/client.toml"),
            trusted_root: PathBuf::from("certs/root.toml"),
        }
    }
}

impl ClientConfig {
    /// Load from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Ok(toml::from_str(&contents)?)
    }

    /// Check the settings are usable
    pub fn validate(&self) -> Result<()> {
        if self.username.trim().is_empty() {
            return Err(ChatError::config("username must not be empty"));
        }
        if self.server_address.trim().is_empty() {
            return Err(ChatError::config("server_address must not be empty"));
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_server_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.toml");
        std::fs::write(&path, "pool_size = 3\n").unwrap();

        let config = ServerConfig::load_from_file(&path).unwrap();
        assert_eq!(config.pool_size, 3);
        assert_eq!(config.bind_address, ServerConfig::default().bind_address);
    }

    #[test]
    fn test_zero_pool_rejected() {
        let config = ServerConfig {
            pool_size: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ChatError::Config { .. })));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = ServerConfig {
            delivery_timeout_secs: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_client_requires_username() {
        assert!(ClientConfig::default().validate().is_err());

        let config = ClientConfig {
            username: "alice".into(),
            ..ClientConfig::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.toml");
        std::fs::write(&path, "username = [").unwrap();
        assert!(matches!(
            ClientConfig::load_from_file(&path),
            Err(ChatError::Config { .. })
        ));
    }
}
