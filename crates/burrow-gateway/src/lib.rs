//! Burrow gateway
//!
//! The public side of a burrow deployment: accepts agent control
//! connections, runs one listener per tunnel rule, and exposes the
//! management surface (listener manager, relay facade, admin API).

pub mod api;
pub mod config;
pub mod gateway;
pub mod manager;
pub mod relay;

pub use api::{build_router, AdminServer};
pub use config::{AdminSection, ClientConfig, ConfigError, GatewayConfig, GatewaySection, ListenerConfig};
pub use gateway::{Gateway, GatewayError};
pub use manager::{ListenerManager, ManagerError};
pub use relay::{Relay, RelayError};
