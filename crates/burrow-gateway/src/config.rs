//! Gateway configuration file
//!
//! A single YAML document describing where the gateway and the admin API
//! listen, where key files live, and which clients (agent identities) exist
//! with their tunnel rules. Rule ids are runtime-only and never written back.

use burrow_proto::{PublicProtocol, TunnelRule};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write config file {path:?}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse YAML config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory holding `<identity>.key` files; keys stay in memory if unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_dir: Option<PathBuf>,

    #[serde(default)]
    pub gateway: GatewaySection,

    /// Admin HTTP API; disabled when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin: Option<AdminSection>,

    #[serde(default)]
    pub clients: Vec<ClientConfig>,
}

/// Control listener for agent connections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_gateway_ip")]
    pub ip: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Periodically log the online sessions
    #[serde(default)]
    pub debug_info: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdminSection {
    #[serde(default = "default_admin_ip")]
    pub ip: String,
    #[serde(default = "default_admin_port")]
    pub port: u16,
    /// Expected value of the `x-access-key` header
    pub access_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub identity: String,
    #[serde(default)]
    pub listeners: Vec<ListenerConfig>,
}

/// A tunnel rule as stored on disk: no id, identity implied by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub public_protocol: PublicProtocol,
    pub public_ip: String,
    pub public_port: u16,
    pub internal_ip: String,
    pub internal_port: u16,
    #[serde(default)]
    pub encrypt: bool,
}

impl ListenerConfig {
    /// Rule for `identity` with an empty id, to be assigned on install.
    pub fn to_rule(&self, identity: &str) -> TunnelRule {
        TunnelRule {
            id: String::new(),
            identity: identity.to_string(),
            public_protocol: self.public_protocol,
            public_ip: self.public_ip.clone(),
            public_port: self.public_port,
            internal_ip: self.internal_ip.clone(),
            internal_port: self.internal_port,
            encrypt: self.encrypt,
        }
    }
}

impl From<&TunnelRule> for ListenerConfig {
    fn from(rule: &TunnelRule) -> Self {
        Self {
            public_protocol: rule.public_protocol,
            public_ip: rule.public_ip.clone(),
            public_port: rule.public_port,
            internal_ip: rule.internal_ip.clone(),
            internal_port: rule.internal_port,
            encrypt: rule.encrypt,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_gateway_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_gateway_port() -> u16 {
    9527
}

fn default_admin_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
    9528
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            ip: default_gateway_ip(),
            port: default_gateway_port(),
            debug_info: false,
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            key_dir: None,
            gateway: GatewaySection::default(),
            admin: None,
            clients: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Load config from a specific file path
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Parse config from YAML string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to a file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn gateway_addr(&self) -> String {
        format!("{}:{}", self.gateway.ip, self.gateway.port)
    }

    pub fn admin_addr(&self) -> Option<String> {
        self.admin.as_ref().map(|a| format!("{}:{}", a.ip, a.port))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut identities = HashSet::new();
        let mut endpoints = HashSet::new();

        for client in &self.clients {
            if client.identity.trim().is_empty() {
                return Err(ConfigError::Invalid("client identity is empty".to_string()));
            }
            if !identities.insert(client.identity.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate client identity: {}",
                    client.identity
                )));
            }

            for listener in &client.listeners {
                // Port 0 binds an ephemeral port and can repeat
                if listener.public_port == 0 {
                    continue;
                }
                let endpoint = (
                    listener.public_protocol,
                    listener.public_ip.as_str(),
                    listener.public_port,
                );
                if !endpoints.insert(endpoint) {
                    return Err(ConfigError::Invalid(format!(
                        "public endpoint {} {}:{} is used twice",
                        listener.public_protocol, listener.public_ip, listener.public_port
                    )));
                }
            }
        }
        Ok(())
    }
}
