use serde::{Serialize, Deserialize};

/// A device's shared secret pair as held by the secret store.
///
/// `current_secret` is hex text; its first 16 decoded bytes are the AES key
/// and the text itself keys the token HMAC. `previous_secret` is kept for one
/// rotation grace period and is what the renewal call exchanges.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCredential {
    pub device_id: String,
    pub current_secret: String,
    pub previous_secret: Option<String>,
}

impl DeviceCredential {
    pub fn new(device_id: impl Into<String>, current_secret: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            current_secret: current_secret.into(),
            previous_secret: None,
        }
    }

    pub fn with_previous(mut self, previous_secret: impl Into<String>) -> Self {
        self.previous_secret = Some(previous_secret.into());
        self
    }

    /// The credential as it looks after the receiver issued `new_secret`.
    /// Nothing is persisted; the next cycle re-reads the store.
    pub fn rotated(&self, new_secret: impl Into<String>) -> Self {
        Self {
            device_id: self.device_id.clone(),
            current_secret: new_secret.into(),
            previous_secret: Some(self.current_secret.clone()),
        }
    }
}

// Secrets never reach log output.
impl std::fmt::Debug for DeviceCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCredential")
            .field("device_id", &self.device_id)
            .field("current_secret", &"<redacted>")
            .field("previous_secret", &self.previous_secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewSecretRequest {
    pub old_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenewSecretResponse {
    pub secret_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotated_keeps_one_grace_secret() {
        let credential = DeviceCredential::new("42", "aa".repeat(16)).with_previous("bb".repeat(16));
        let rotated = credential.rotated("cc".repeat(16));

        assert_eq!(rotated.device_id, "42");
        assert_eq!(rotated.current_secret, "cc".repeat(16));
        assert_eq!(rotated.previous_secret, Some("aa".repeat(16)));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let credential = DeviceCredential::new("42", "0123456789abcdef0123456789abcdef");
        let printed = format!("{:?}", credential);
        assert!(printed.contains("42"));
        assert!(!printed.contains("0123456789abcdef"));
    }

    #[test]
    fn test_renewal_wire_names() {
        let body = serde_json::to_string(&RenewSecretRequest { old_secret: "abc".into() }).unwrap();
        assert_eq!(body, r#"{"old_secret":"abc"}"#);

        let response: RenewSecretResponse = serde_json::from_str(r#"{"secret_key":"def"}"#).unwrap();
        assert_eq!(response.secret_key, "def");
    }
}
