//! Tunnel rule model

use serde::{Deserialize, Serialize};

use crate::messages::{PublicProtocol, TunnelDescriptor};

/// One public endpoint mapped to one backend behind an agent.
///
/// `id` is assigned by the management layer when the rule is installed;
/// rules loaded from a file without one get a fresh id at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelRule {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub identity: String,
    pub public_protocol: PublicProtocol,
    pub public_ip: String,
    pub public_port: u16,
    pub internal_ip: String,
    pub internal_port: u16,
    #[serde(default)]
    pub encrypt: bool,
}

impl TunnelRule {
    pub fn public_addr(&self) -> String {
        format!("{}:{}", self.public_ip, self.public_port)
    }

    /// Descriptor sent to the agent for every flow served by this rule.
    pub fn descriptor(&self) -> TunnelDescriptor {
        TunnelDescriptor {
            identity: self.identity.clone(),
            public_protocol: self.public_protocol,
            public_ip: self.public_ip.clone(),
            public_port: self.public_port,
            internal_ip: self.internal_ip.clone(),
            internal_port: self.internal_port,
        }
    }
}
