//! Transport bindings for signed device tokens.
//!
//! HTTP and MQTT carry the same token byte for byte; neither binding
//! retries on its own.

pub mod http;
pub mod mqtt;

pub use http::{HttpRenewer, HttpTransport, send_http};
pub use mqtt::{
    ConnectionState, MqttConnection, MqttConnector, MqttLink, MqttTransport,
    RumqttConnector, send_mqtt,
};

use async_trait::async_trait;
use common::{DeliveryResult, Result, SenderConfig, SignedToken, TransportKind};

#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    async fn deliver(&self, token: &SignedToken) -> DeliveryResult;

    /// Release long-lived handles. Called once when a run stops.
    async fn close(&self) {}
}

/// Which bindings a run sends through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TransportChoice {
    Http,
    Mqtt,
    Both,
}

impl TransportChoice {
    pub fn build(&self, config: &SenderConfig) -> Result<Vec<Box<dyn Transport>>> {
        let mut transports: Vec<Box<dyn Transport>> = Vec::new();
        if matches!(self, TransportChoice::Http | TransportChoice::Both) {
            transports.push(Box::new(HttpTransport::new(&config.endpoint, config.http_timeout)?));
        }
        if matches!(self, TransportChoice::Mqtt | TransportChoice::Both) {
            transports.push(Box::new(MqttTransport::from_config(&config.mqtt)));
        }
        Ok(transports)
    }
}
