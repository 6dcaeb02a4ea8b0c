use crate::encryption::error::EncryptionError;
use crate::encryption::{CodecKind, EncryptedEnvelope, PayloadCodec, IV_LEN};
use crate::error::Result;
use crate::types::SensorReading;
use aes::Aes128;
use cipher::{
    BlockDecryptMut, BlockEncryptMut,
    KeyIvInit,
    block_padding::Pkcs7,
};
use rand::{rngs::OsRng, RngCore};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

pub const KEY_LEN: usize = 16;

/// AES key from a hex device secret: the first 16 decoded bytes.
///
/// Secrets longer than 32 hex characters are truncated, which keeps parity
/// with what the firmware does for over-long secrets.
pub fn derive_key(secret: &str) -> std::result::Result<[u8; KEY_LEN], EncryptionError> {
    let hex_len = KEY_LEN * 2;
    if secret.len() < hex_len {
        return Err(EncryptionError::InvalidKey(format!(
            "Secret must hold at least {} hex characters, got {}", hex_len, secret.len()
        )));
    }

    let mut key = [0u8; KEY_LEN];
    hex::decode_to_slice(&secret.as_bytes()[..hex_len], &mut key)
        .map_err(|e| EncryptionError::InvalidKey(format!("Secret is not hex: {}", e)))?;
    Ok(key)
}

/// AES-128-CBC with PKCS#7 padding and a fresh random IV per call.
#[derive(Debug, Clone, Default)]
pub struct AesCbcCodec;

impl AesCbcCodec {
    pub fn new() -> Self {
        Self
    }

    pub fn seal(&self, reading: &SensorReading, secret: &str) -> Result<EncryptedEnvelope> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);
        self.seal_with_iv(reading, secret, iv)
    }

    // Only tests pin the IV.
    pub(crate) fn seal_with_iv(
        &self,
        reading: &SensorReading,
        secret: &str,
        iv: [u8; IV_LEN],
    ) -> Result<EncryptedEnvelope> {
        let key = derive_key(secret)?;
        let plaintext = reading.to_json()?;

        let ciphertext = Aes128CbcEnc::new_from_slices(&key, &iv)
            .map_err(|e| EncryptionError::EncryptionError(e.to_string()))?
            .encrypt_padded_vec_mut::<Pkcs7>(&plaintext);

        Ok(EncryptedEnvelope { iv, ciphertext })
    }

    pub fn open(&self, envelope: &EncryptedEnvelope, secret: &str) -> Result<SensorReading> {
        let key = derive_key(secret)?;

        let plaintext = Aes128CbcDec::new_from_slices(&key, &envelope.iv)
            .map_err(|e| EncryptionError::DecryptionError(e.to_string()))?
            .decrypt_padded_vec_mut::<Pkcs7>(&envelope.ciphertext)
            .map_err(|_| EncryptionError::DecryptionError("Invalid padding".to_string()))?;

        SensorReading::from_json(&plaintext)
    }
}

impl PayloadCodec for AesCbcCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::AesCbc
    }

    fn encode(&self, reading: &SensorReading, secret: &str) -> Result<String> {
        Ok(self.seal(reading, secret)?.to_wire())
    }

    fn decode(&self, wire: &str, secret: &str) -> Result<SensorReading> {
        let envelope = EncryptedEnvelope::from_wire(wire)?;
        self.open(&envelope, secret)
    }

    fn is_secure(&self) -> bool {
        true
    }
}
