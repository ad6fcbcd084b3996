//! Public UDP listener for a tunnel rule

pub mod server;

pub use server::{UdpServerError, UdpTunnelServer};
