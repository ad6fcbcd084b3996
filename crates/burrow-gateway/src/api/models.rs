//! Request and response bodies of the admin API

use burrow_proto::TunnelRule;
use serde::{Deserialize, Serialize};

pub use crate::config::ListenerConfig as TunnelRequest;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub clients: usize,
    pub online: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub identity: String,
    pub online: bool,
    pub tunnels: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientList {
    pub clients: Vec<ClientInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnlineResponse {
    pub identity: String,
    pub online: bool,
}

/// Base64 tunnel key to provision on the agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyResponse {
    pub identity: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelList {
    pub tunnels: Vec<TunnelRule>,
}

/// Cumulative bytes for one rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelStats {
    pub identity: String,
    pub rule_id: String,
    pub input: u64,
    pub output: u64,
}

/// Error response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}
