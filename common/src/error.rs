use std::time::Duration;
use thiserror::Error;
use crate::encryption::error::EncryptionError;

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IngestError {
    #[error("Key error: {0}")]
    KeyError(String),
    #[error("Encoding error: {0}")]
    EncodingError(String),
    #[error("Decoding error: {0}")]
    DecodingError(String),
    #[error("Token error: {0}")]
    TokenError(String),
    #[error("Device not found: {0}")]
    NotFoundError(String),
    #[error("Secret store unavailable: {0}")]
    StoreUnavailableError(String),
    #[error("Transport error: {0}")]
    TransportError(String),
    #[error("Rejected by receiver ({status}): {body}")]
    AuthRejected { status: u16, body: String },
    #[error("Secret renewal rejected: {0}")]
    RenewalRejected(String),
    #[error("Connection error: {0}")]
    ConnectionError(String),
    #[error("No acknowledgment within {0:?}")]
    TimeoutError(Duration),
    #[error("Publish error: {0}")]
    PublishError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Coarse classification used by event sinks and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    Key,
    Encoding,
    Decoding,
    Token,
    NotFound,
    StoreUnavailable,
    Transport,
    AuthRejected,
    Rejected,
    RenewalRejected,
    NoRenewalPossible,
    Connection,
    Timeout,
    Publish,
    Config,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Key => "key",
            ErrorKind::Encoding => "encoding",
            ErrorKind::Decoding => "decoding",
            ErrorKind::Token => "token",
            ErrorKind::NotFound => "not_found",
            ErrorKind::StoreUnavailable => "store_unavailable",
            ErrorKind::Transport => "transport",
            ErrorKind::AuthRejected => "auth_rejected",
            ErrorKind::Rejected => "rejected",
            ErrorKind::RenewalRejected => "renewal_rejected",
            ErrorKind::NoRenewalPossible => "no_renewal_possible",
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Publish => "publish",
            ErrorKind::Config => "config",
        }
    }

    /// Operational failures a caller may retry with backoff. Key, encoding and
    /// configuration problems need operator intervention; auth rejections go
    /// through secret rotation instead.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Transport | ErrorKind::Connection | ErrorKind::Timeout | ErrorKind::Publish
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl IngestError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::KeyError(_) => ErrorKind::Key,
            Self::EncodingError(_) => ErrorKind::Encoding,
            Self::DecodingError(_) => ErrorKind::Decoding,
            Self::TokenError(_) => ErrorKind::Token,
            Self::NotFoundError(_) => ErrorKind::NotFound,
            Self::StoreUnavailableError(_) => ErrorKind::StoreUnavailable,
            Self::TransportError(_) => ErrorKind::Transport,
            Self::AuthRejected { .. } => ErrorKind::AuthRejected,
            Self::RenewalRejected(_) => ErrorKind::RenewalRejected,
            Self::ConnectionError(_) => ErrorKind::Connection,
            Self::TimeoutError(_) => ErrorKind::Timeout,
            Self::PublishError(_) => ErrorKind::Publish,
            Self::ConfigError(_) => ErrorKind::Config,
        }
    }
}

impl From<EncryptionError> for IngestError {
    fn from(err: EncryptionError) -> Self {
        match err {
            EncryptionError::InvalidKey(msg) => IngestError::KeyError(msg),
            EncryptionError::EncryptionError(msg) => IngestError::EncodingError(msg),
            EncryptionError::DecryptionError(msg) => IngestError::DecodingError(msg),
        }
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        IngestError::EncodingError(err.to_string())
    }
}
