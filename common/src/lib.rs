pub mod error;
pub mod types;
pub mod config;
pub mod security;
pub mod encryption;
pub mod token;

pub use error::{ErrorKind, IngestError, Result};
pub use types::*;
pub use config::*;
pub use security::DeviceCredential;
pub use token::{EnvelopeBuilder, EnvelopeSigner, SignedToken, TokenClaims};
