use async_trait::async_trait;
use common::security::{RenewSecretRequest, RenewSecretResponse};
use common::{DeliveryResult, IngestError, Result, SignedToken, TransportKind};
use log::{debug, warn};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use super::Transport;
use crate::rotation::SecretRenewer;

#[derive(Deserialize)]
struct IngestReply {
    message: Option<String>,
}

/// POSTs the token as a bearer credential. The body is an empty JSON object;
/// everything the receiver needs is inside the token.
pub async fn send_http(client: &Client, token: &SignedToken, url: &str) -> DeliveryResult {
    match client
        .post(url)
        .bearer_auth(token.as_str())
        .json(&json!({}))
        .send()
        .await
    {
        Ok(response) => {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();

            if status.is_success() {
                let message = serde_json::from_str::<IngestReply>(&body)
                    .ok()
                    .and_then(|reply| reply.message);
                debug!("{} accepted the payload ({})", url, status);
                DeliveryResult::Ok(message)
            } else {
                warn!("{} rejected the payload: {} - {}", url, status, body);
                DeliveryResult::Rejected {
                    status: status.as_u16(),
                    body,
                }
            }
        }
        Err(e) => {
            warn!("Failed to reach {}: {}", url, e);
            DeliveryResult::TransportError(e.to_string())
        }
    }
}

pub struct HttpTransport {
    client: Client,
    url: String,
}

impl HttpTransport {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IngestError::TransportError(e.to_string()))?;

        Ok(Self::with_client(client, endpoint))
    }

    pub fn with_client(client: Client, endpoint: &str) -> Self {
        Self {
            client,
            url: format!("{}/payload/http", endpoint.trim_end_matches('/')),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    async fn deliver(&self, token: &SignedToken) -> DeliveryResult {
        send_http(&self.client, token, &self.url).await
    }
}

/// Exchanges a device's old secret for a freshly issued one.
pub struct HttpRenewer {
    client: Client,
    endpoint: String,
}

impl HttpRenewer {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IngestError::TransportError(e.to_string()))?;

        Ok(Self::with_client(client, endpoint))
    }

    pub fn with_client(client: Client, endpoint: &str) -> Self {
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl SecretRenewer for HttpRenewer {
    async fn renew(&self, device_id: &str, old_secret: &str) -> Result<String> {
        let url = format!("{}/device/renew-secret/{}", self.endpoint, device_id);
        let request = RenewSecretRequest {
            old_secret: old_secret.to_string(),
        };

        let response = self.client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| IngestError::RenewalRejected(format!("Renewal request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(IngestError::RenewalRejected(format!("{} - {}", status, text)));
        }

        let renewed: RenewSecretResponse = response
            .json()
            .await
            .map_err(|e| IngestError::RenewalRejected(format!("Unreadable renewal response: {}", e)))?;

        if renewed.secret_key.is_empty() {
            return Err(IngestError::RenewalRejected("Renewal returned an empty secret".to_string()));
        }

        Ok(renewed.secret_key)
    }
}
