use crate::encryption::{CodecKind, EncryptionError, PayloadCodec};
use crate::error::Result;
use crate::types::SensorReading;

/// Legacy debug codec: `base64(json)`. The secret is ignored, so anyone who
/// sees the token can read the payload. Never use it against production
/// receivers.
#[derive(Debug, Clone, Default)]
pub struct Base64Codec;

impl Base64Codec {
    pub fn new() -> Self {
        Self
    }
}

impl PayloadCodec for Base64Codec {
    fn kind(&self) -> CodecKind {
        CodecKind::Base64
    }

    fn encode(&self, reading: &SensorReading, _secret: &str) -> Result<String> {
        Ok(base64::encode(reading.to_json()?))
    }

    fn decode(&self, wire: &str, _secret: &str) -> Result<SensorReading> {
        let json = base64::decode(wire.trim())
            .map_err(|e| EncryptionError::DecryptionError(format!("Payload is not base64: {}", e)))?;
        SensorReading::from_json(&json)
    }

    fn is_secure(&self) -> bool {
        false
    }
}
