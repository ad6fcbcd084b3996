//! Public TCP listener for a tunnel rule

pub mod server;

pub use server::{TcpServerError, TcpTunnelServer};
