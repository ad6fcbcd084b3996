//! Burrow agent
//!
//! Runs behind NAT next to the services it exposes. Keeps one control
//! connection to the gateway alive and serves every stream the gateway
//! pushes over it by dialing the described local backend.

pub mod agent;
pub mod forwarder;

pub use agent::{Agent, AgentConfig, AgentError, DEFAULT_RECONNECT_DELAY};
pub use forwarder::{handle_stream, ForwarderError};
