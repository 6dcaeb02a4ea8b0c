//! Payload codecs for sensor readings.
//!
//! A codec turns a `SensorReading` into the opaque `data` string carried in
//! the device token and back. `AesCbcCodec` is what the firmware speaks;
//! `Base64Codec` is the legacy debug mode with no confidentiality at all.

pub mod error;
pub mod cbc;
pub mod plain;

pub use error::EncryptionError;
pub use cbc::AesCbcCodec;
pub use plain::Base64Codec;

use crate::error::{IngestError, Result};
use crate::types::SensorReading;

pub const IV_LEN: usize = 16;
const BLOCK_LEN: usize = 16;

pub trait PayloadCodec: Send + Sync {
    fn kind(&self) -> CodecKind;
    fn encode(&self, reading: &SensorReading, secret: &str) -> Result<String>;
    fn decode(&self, wire: &str, secret: &str) -> Result<SensorReading>;
    fn is_secure(&self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    AesCbc,
    /// Not secure: the payload is only Base64-wrapped JSON.
    Base64,
}

impl CodecKind {
    pub fn build(&self) -> Box<dyn PayloadCodec> {
        match self {
            CodecKind::AesCbc => Box::new(AesCbcCodec::new()),
            CodecKind::Base64 => {
                log::warn!("Base64 payload codec selected: readings travel without encryption");
                Box::new(Base64Codec::new())
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CodecKind::AesCbc => "aes-128-cbc",
            CodecKind::Base64 => "base64",
        }
    }
}

impl std::str::FromStr for CodecKind {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "aes" | "aes-128-cbc" | "aes_cbc" | "aescbc" => Ok(CodecKind::AesCbc),
            "base64" | "plain" | "none" => Ok(CodecKind::Base64),
            other => Err(IngestError::ConfigError(format!("Unknown payload codec '{}'", other))),
        }
    }
}

/// IV plus CBC ciphertext. On the wire the IV is prepended, never sent apart:
/// `base64(iv || ciphertext)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedEnvelope {
    pub iv: [u8; IV_LEN],
    pub ciphertext: Vec<u8>,
}

impl EncryptedEnvelope {
    pub fn to_wire(&self) -> String {
        let mut bytes = Vec::with_capacity(IV_LEN + self.ciphertext.len());
        bytes.extend_from_slice(&self.iv);
        bytes.extend_from_slice(&self.ciphertext);
        base64::encode(bytes)
    }

    pub fn from_wire(wire: &str) -> std::result::Result<Self, EncryptionError> {
        let bytes = base64::decode(wire.trim())
            .map_err(|e| EncryptionError::DecryptionError(format!("Envelope is not base64: {}", e)))?;

        if bytes.len() < IV_LEN + BLOCK_LEN {
            return Err(EncryptionError::DecryptionError(format!(
                "Envelope too short: {} bytes", bytes.len()
            )));
        }
        if (bytes.len() - IV_LEN) % BLOCK_LEN != 0 {
            return Err(EncryptionError::DecryptionError(
                "Ciphertext length must be a multiple of 16 bytes".to_string()
            ));
        }

        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&bytes[..IV_LEN]);

        Ok(Self {
            iv,
            ciphertext: bytes[IV_LEN..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_form_prepends_iv() {
        let envelope = EncryptedEnvelope {
            iv: [7u8; IV_LEN],
            ciphertext: vec![1u8; 32],
        };

        let raw = base64::decode(envelope.to_wire()).unwrap();
        assert_eq!(raw.len(), 48);
        assert_eq!(&raw[..16], &[7u8; 16]);
        assert_eq!(EncryptedEnvelope::from_wire(&envelope.to_wire()).unwrap(), envelope);
    }

    #[test]
    fn test_from_wire_rejects_malformed() {
        assert!(EncryptedEnvelope::from_wire("not base64!!").is_err());
        assert!(EncryptedEnvelope::from_wire(&base64::encode([0u8; 16])).is_err());
        assert!(EncryptedEnvelope::from_wire(&base64::encode([0u8; 40])).is_err());
    }

    #[test]
    fn test_codec_kind_selection() {
        assert_eq!("AES-128-CBC".parse::<CodecKind>().unwrap(), CodecKind::AesCbc);
        assert_eq!("base64".parse::<CodecKind>().unwrap(), CodecKind::Base64);
        assert!("rot13".parse::<CodecKind>().is_err());

        assert!(CodecKind::AesCbc.build().is_secure());
        assert!(!CodecKind::Base64.build().is_secure());
    }
}
