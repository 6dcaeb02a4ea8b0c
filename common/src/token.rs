//! Device bearer tokens.
//!
//! The encrypted payload travels inside an HS256 JWT whose claims are exactly
//! `{"data","sub","iat","exp"}` in that order. The same device secret that
//! keyed the payload codec keys the HMAC, and the token carries no hint of
//! which secret produced it.

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use crate::encryption::{CodecKind, PayloadCodec};
use crate::error::{IngestError, Result};
use crate::types::SensorReading;

type HmacSha256 = Hmac<Sha256>;

/// Fixed validity window of every token.
pub const TOKEN_TTL_SECS: i64 = 3600;

const HEADER_JSON: &str = r#"{"alg":"HS256","typ":"JWT"}"#;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub data: String,
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenHeader {
    alg: String,
}

/// Three dot-joined base64url segments: header, claims, signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedToken(String);

impl SignedToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn segments(&self) -> Vec<&str> {
        self.0.split('.').collect()
    }
}

impl std::fmt::Display for SignedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnvelopeSigner;

impl EnvelopeSigner {
    pub fn new() -> Self {
        Self
    }

    pub fn sign(&self, envelope: &str, device_id: &str, secret: &str) -> Result<SignedToken> {
        self.sign_at(envelope, device_id, secret, Utc::now().timestamp())
    }

    pub fn sign_at(&self, envelope: &str, device_id: &str, secret: &str, iat: i64) -> Result<SignedToken> {
        if secret.is_empty() {
            return Err(IngestError::KeyError("Signing secret is empty".to_string()));
        }

        let claims = TokenClaims {
            data: envelope.to_string(),
            sub: device_id.to_string(),
            iat,
            exp: iat + TOKEN_TTL_SECS,
        };

        let header = encode_segment(HEADER_JSON.as_bytes());
        let payload = encode_segment(&serde_json::to_vec(&claims)?);
        let signing_input = format!("{}.{}", header, payload);
        let signature = compute_signature(&signing_input, secret)?;

        Ok(SignedToken(format!("{}.{}", signing_input, signature)))
    }
}

/// base64url(HMAC-SHA256(secret, signing_input)) without padding.
pub fn compute_signature(signing_input: &str, secret: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| IngestError::KeyError(e.to_string()))?;
    mac.update(signing_input.as_bytes());
    Ok(encode_segment(&mac.finalize().into_bytes()))
}

/// Receiver-side check: structure, algorithm, signature (constant time) and
/// expiry against `now` in Unix seconds.
pub fn verify_token(token: &str, secret: &str, now: i64) -> Result<TokenClaims> {
    let mut parts = token.split('.');
    let (header, payload, signature) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(p), Some(s), None) if !h.is_empty() && !p.is_empty() && !s.is_empty() => (h, p, s),
        _ => return Err(IngestError::TokenError("Token must have three non-empty segments".to_string())),
    };

    let signing_input = format!("{}.{}", header, payload);

    let header: TokenHeader = serde_json::from_slice(&decode_segment(header)?)
        .map_err(|e| IngestError::TokenError(format!("Bad header: {}", e)))?;
    if header.alg != "HS256" {
        return Err(IngestError::TokenError(format!("Unsupported algorithm {}", header.alg)));
    }

    let signature = decode_segment(signature)?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| IngestError::KeyError(e.to_string()))?;
    mac.update(signing_input.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| IngestError::TokenError("Signature mismatch".to_string()))?;

    let claims: TokenClaims = serde_json::from_slice(&decode_segment(payload)?)
        .map_err(|e| IngestError::TokenError(format!("Bad claims: {}", e)))?;
    if claims.exp <= now {
        return Err(IngestError::TokenError(format!("Token expired at {}", claims.exp)));
    }

    Ok(claims)
}

fn encode_segment(bytes: &[u8]) -> String {
    base64::encode_config(bytes, base64::URL_SAFE_NO_PAD)
}

fn decode_segment(segment: &str) -> Result<Vec<u8>> {
    base64::decode_config(segment, base64::URL_SAFE_NO_PAD)
        .map_err(|e| IngestError::TokenError(format!("Segment is not base64url: {}", e)))
}

/// Codec and signer in one step: reading in, bearer token out.
pub struct EnvelopeBuilder {
    codec: Box<dyn PayloadCodec>,
    signer: EnvelopeSigner,
}

impl EnvelopeBuilder {
    pub fn new(codec: Box<dyn PayloadCodec>) -> Self {
        Self {
            codec,
            signer: EnvelopeSigner::new(),
        }
    }

    pub fn from_kind(kind: CodecKind) -> Self {
        Self::new(kind.build())
    }

    pub fn codec(&self) -> &dyn PayloadCodec {
        self.codec.as_ref()
    }

    pub fn build(&self, reading: &SensorReading, device_id: &str, secret: &str) -> Result<SignedToken> {
        let data = self.codec.encode(reading, secret)?;
        self.signer.sign(&data, device_id, secret)
    }
}
