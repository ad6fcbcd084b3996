//! Per-identity symmetric tunnel keys

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("key is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("key must be {expected} bytes, got {actual}")]
    Length { expected: usize, actual: usize },
}

/// 32-byte key shared out-of-band between the gateway and one agent
#[derive(Clone, PartialEq, Eq)]
pub struct TunnelKey([u8; TunnelKey::LEN]);

impl TunnelKey {
    pub const LEN: usize = 32;

    pub fn new(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; Self::LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        let raw = STANDARD.decode(encoded.trim())?;
        let bytes: [u8; Self::LEN] = raw.as_slice().try_into().map_err(|_| KeyError::Length {
            expected: Self::LEN,
            actual: raw.len(),
        })?;
        Ok(Self(bytes))
    }
}

// Keep key material out of logs.
impl fmt::Debug for TunnelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TunnelKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base64_roundtrip() {
        let key = TunnelKey::generate();
        let encoded = key.to_base64();
        assert_eq!(encoded.len(), 44);
        assert_eq!(TunnelKey::from_base64(&encoded).unwrap(), key);
        // Key files may end with a newline
        assert_eq!(TunnelKey::from_base64(&format!("{encoded}\n")).unwrap(), key);
    }

    #[test]
    fn test_generate_is_random() {
        assert_ne!(TunnelKey::generate(), TunnelKey::generate());
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(
            TunnelKey::from_base64("not base64!"),
            Err(KeyError::Encoding(_))
        ));
        assert!(matches!(
            TunnelKey::from_base64(&STANDARD.encode([1u8; 16])),
            Err(KeyError::Length {
                expected: 32,
                actual: 16
            })
        ));
    }

    #[test]
    fn test_debug_hides_material() {
        let key = TunnelKey::new([7u8; 32]);
        assert_eq!(format!("{key:?}"), "TunnelKey(..)");
    }
}
