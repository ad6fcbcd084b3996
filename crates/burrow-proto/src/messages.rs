//! Framed control messages
//!
//! Handshake, descriptor and datagram frames share a 4-byte header:
//! `[version][command][body length, u16 BE]` followed by the body. The
//! encryption negotiation is a bare 2-byte `[0x04][on|off]` frame.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{HEADER_LEN, MAX_BODY_LEN, PROTOCOL_VERSION};

const CMD_DESCRIBE: u8 = 0x00;
const CMD_HANDSHAKE: u8 = 0x01;
const CMD_UDP_DATA: u8 = 0x02;

const CMD_ENCRYPT: u8 = 0x04;
const ENCRYPT_ON: u8 = 0x01;
const ENCRYPT_OFF: u8 = 0x00;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid protocol version: {0}")]
    InvalidVersion(u8),

    #[error("invalid command: {0:#04x}")]
    InvalidCommand(u8),

    #[error("invalid handshake command: {0:#04x}")]
    InvalidHandshake(u8),

    #[error("invalid udp datagram command: {0:#04x}")]
    InvalidDatagram(u8),

    #[error("invalid encrypt flag frame: [{0:#04x}, {1:#04x}]")]
    InvalidEncryptFlag(u8, u8),

    #[error("body of {0} bytes exceeds the 65535 byte frame limit")]
    BodyTooLarge(usize),

    #[error("malformed message body: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Public-side transport of a tunnel rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublicProtocol {
    Tcp,
    Udp,
}

impl fmt::Display for PublicProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublicProtocol::Tcp => write!(f, "tcp"),
            PublicProtocol::Udp => write!(f, "udp"),
        }
    }
}

/// First message an agent sends on its control connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    pub identity: String,
}

impl Handshake {
    pub fn new(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
        }
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        encode_json(CMD_HANDSHAKE, self)
    }

    /// Reads a handshake. Only the command byte is checked; a mismatch is
    /// reported as [`ProtocolError::InvalidHandshake`].
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let header = read_header(reader).await?;
        if header.command != CMD_HANDSHAKE {
            return Err(ProtocolError::InvalidHandshake(header.command));
        }
        let body = read_body(reader, header.len).await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

/// Sent once per flow so the agent knows which backend to dial
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelDescriptor {
    pub identity: String,
    pub public_protocol: PublicProtocol,
    pub public_ip: String,
    pub public_port: u16,
    pub internal_ip: String,
    pub internal_port: u16,
}

impl TunnelDescriptor {
    pub fn internal_addr(&self) -> String {
        format!("{}:{}", self.internal_ip, self.internal_port)
    }

    pub fn public_addr(&self) -> String {
        format!("{}:{}", self.public_ip, self.public_port)
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        encode_json(CMD_DESCRIBE, self)
    }

    pub async fn read_from<R>(reader: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let header = read_header(reader).await?;
        if header.version != PROTOCOL_VERSION {
            return Err(ProtocolError::InvalidVersion(header.version));
        }
        if header.command != CMD_DESCRIBE {
            return Err(ProtocolError::InvalidCommand(header.command));
        }
        let body = read_body(reader, header.len).await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

/// Per-flow announcement of whether the stream is cipher-wrapped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptFlag {
    On,
    Off,
}

impl EncryptFlag {
    pub const LEN: usize = 2;

    pub fn is_on(self) -> bool {
        matches!(self, EncryptFlag::On)
    }

    pub fn encode(self) -> [u8; Self::LEN] {
        match self {
            EncryptFlag::On => [CMD_ENCRYPT, ENCRYPT_ON],
            EncryptFlag::Off => [CMD_ENCRYPT, ENCRYPT_OFF],
        }
    }

    pub fn decode(frame: [u8; Self::LEN]) -> Result<Self, ProtocolError> {
        match frame {
            [CMD_ENCRYPT, ENCRYPT_ON] => Ok(EncryptFlag::On),
            [CMD_ENCRYPT, ENCRYPT_OFF] => Ok(EncryptFlag::Off),
            [a, b] => Err(ProtocolError::InvalidEncryptFlag(a, b)),
        }
    }

    pub async fn read_from<R>(reader: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let mut frame = [0u8; Self::LEN];
        reader.read_exact(&mut frame).await?;
        Self::decode(frame)
    }
}

impl From<bool> for EncryptFlag {
    fn from(encrypt: bool) -> Self {
        if encrypt {
            EncryptFlag::On
        } else {
            EncryptFlag::Off
        }
    }
}

/// One relayed UDP datagram; the payload is carried verbatim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram(pub Bytes);

impl UdpDatagram {
    pub fn payload(&self) -> &Bytes {
        &self.0
    }

    pub fn into_payload(self) -> Bytes {
        self.0
    }

    /// Frames `payload` without copying it into an intermediate owner.
    pub fn encode_payload(payload: &[u8]) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        put_header(&mut buf, CMD_UDP_DATA, payload.len())?;
        buf.put_slice(payload);
        Ok(buf.freeze())
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        Self::encode_payload(&self.0)
    }

    pub async fn read_from<R>(reader: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let header = read_header(reader).await?;
        if header.command != CMD_UDP_DATA {
            return Err(ProtocolError::InvalidDatagram(header.command));
        }
        let body = read_body(reader, header.len).await?;
        Ok(UdpDatagram(Bytes::from(body)))
    }
}

struct Header {
    version: u8,
    command: u8,
    len: usize,
}

fn put_header(buf: &mut BytesMut, command: u8, body_len: usize) -> Result<(), ProtocolError> {
    let len = u16::try_from(body_len).map_err(|_| ProtocolError::BodyTooLarge(body_len))?;
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(command);
    buf.put_u16(len);
    Ok(())
}

fn encode_json<T: Serialize>(command: u8, message: &T) -> Result<Bytes, ProtocolError> {
    let body = serde_json::to_vec(message)?;
    if body.len() > MAX_BODY_LEN {
        return Err(ProtocolError::BodyTooLarge(body.len()));
    }
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    put_header(&mut buf, command, body.len())?;
    buf.put_slice(&body);
    Ok(buf.freeze())
}

async fn read_header<R>(reader: &mut R) -> Result<Header, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut raw = [0u8; HEADER_LEN];
    reader.read_exact(&mut raw).await?;
    Ok(Header {
        version: raw[0],
        command: raw[1],
        len: u16::from_be_bytes([raw[2], raw[3]]) as usize,
    })
}

async fn read_body<R>(reader: &mut R, len: usize) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(body)
}
