//! Burrow wire protocol
//!
//! Message types exchanged between the gateway and an agent: the control
//! handshake, the per-flow encryption negotiation and tunnel descriptor, and
//! the frame that carries one relayed UDP datagram. Also hosts the tunnel
//! rule model shared by the gateway and its management layer.

pub mod messages;
pub mod rule;

pub use messages::{
    EncryptFlag, Handshake, ProtocolError, PublicProtocol, TunnelDescriptor, UdpDatagram,
};
pub use rule::TunnelRule;

/// Protocol version carried in every framed message
pub const PROTOCOL_VERSION: u8 = 0;

/// Size of the `[version][command][length]` frame header
pub const HEADER_LEN: usize = 4;

/// Largest body a frame can describe (16-bit length field)
pub const MAX_BODY_LEN: usize = u16::MAX as usize;
