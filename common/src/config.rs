use std::time::Duration;
use crate::encryption::CodecKind;
use crate::error::{IngestError, Result};
use crate::types::TimestampUnit;

pub const DEFAULT_ENDPOINT: &str = "http://localhost:3000";
pub const DEFAULT_MQTT_TOPIC: &str = "device/data";
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Base URL of the ingestion API, e.g. `http://localhost:3000`.
    pub endpoint: String,
    pub device_id: String,
    pub timestamp_unit: TimestampUnit,
    pub codec: CodecKind,
    pub interval: Duration,
    /// Attempts per cycle for transient delivery failures, the first included.
    pub max_attempts: u32,
    /// Pause before the first repeat; doubles for each one after.
    pub retry_backoff: Duration,
    pub http_timeout: Duration,
    pub mqtt: MqttConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic: String,
    pub qos: u8,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub ack_timeout: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: None,
            username: None,
            password: None,
            topic: DEFAULT_MQTT_TOPIC.to_string(),
            qos: 0,
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }
}

/// Where device secrets are read from.
#[derive(Clone)]
pub enum StoreConfig {
    MySql { url: String },
    Redis { url: String },
    Static { secret: String, previous_secret: Option<String> },
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreConfig::MySql { .. } => write!(f, "MySql"),
            StoreConfig::Redis { url } => write!(f, "Redis({})", url),
            StoreConfig::Static { .. } => write!(f, "Static"),
        }
    }
}

impl SenderConfig {
    pub fn load() -> Result<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Builds the config from any variable lookup; `load` uses the process
    /// environment.
    pub fn from_vars<F>(var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let timestamp_unit = var("TIMESTAMP_UNIT")
            .ok_or_else(|| IngestError::ConfigError(
                "TIMESTAMP_UNIT must be set to 'seconds' or 'milliseconds' to match the receiver".to_string()
            ))?
            .parse::<TimestampUnit>()?;

        let codec = match var("PAYLOAD_CODEC") {
            Some(value) => value.parse::<CodecKind>()?,
            None => CodecKind::AesCbc,
        };

        let store = if let Some(url) = var("DATABASE_URL") {
            StoreConfig::MySql { url }
        } else if let Some(url) = var("REDIS_URL") {
            StoreConfig::Redis { url }
        } else if let Some(secret) = var("DEVICE_SECRET") {
            StoreConfig::Static {
                secret,
                previous_secret: var("DEVICE_OLD_SECRET"),
            }
        } else {
            return Err(IngestError::ConfigError(
                "One of DATABASE_URL, REDIS_URL or DEVICE_SECRET must be set".to_string()
            ));
        };

        let mqtt = MqttConfig {
            host: var("MQTT_HOST").unwrap_or_else(|| "localhost".to_string()),
            port: parse_or(&var, "MQTT_PORT", 1883)?,
            client_id: var("MQTT_CLIENT_ID"),
            username: var("MQTT_USERNAME"),
            password: var("MQTT_PASSWORD"),
            topic: var("MQTT_TOPIC").unwrap_or_else(|| DEFAULT_MQTT_TOPIC.to_string()),
            qos: parse_or(&var, "MQTT_QOS", 0u8)?,
            keep_alive: Duration::from_secs(parse_or(&var, "MQTT_KEEP_ALIVE_SECS", 30)?),
            connect_timeout: Duration::from_secs(parse_or(&var, "MQTT_CONNECT_TIMEOUT_SECS", 10)?),
            ack_timeout: Duration::from_secs(parse_or(&var, "MQTT_ACK_TIMEOUT_SECS", 10)?),
        };
        if mqtt.qos > 2 {
            return Err(IngestError::ConfigError(format!("MQTT_QOS must be 0, 1 or 2, got {}", mqtt.qos)));
        }

        let interval_secs: u64 = parse_or(&var, "SEND_INTERVAL_SECS", 5)?;
        if interval_secs == 0 {
            return Err(IngestError::ConfigError("SEND_INTERVAL_SECS must be at least 1".to_string()));
        }

        let max_attempts: u32 = parse_or(&var, "SEND_MAX_ATTEMPTS", 3)?;
        if max_attempts == 0 {
            return Err(IngestError::ConfigError("SEND_MAX_ATTEMPTS must be at least 1".to_string()));
        }

        Ok(Self {
            endpoint: var("INGEST_ENDPOINT").unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            device_id: var("DEVICE_ID").unwrap_or_else(|| "1".to_string()),
            timestamp_unit,
            codec,
            interval: Duration::from_secs(interval_secs),
            max_attempts,
            retry_backoff: Duration::from_millis(parse_or(&var, "SEND_RETRY_BACKOFF_MS", 500)?),
            http_timeout: Duration::from_secs(parse_or(&var, "HTTP_TIMEOUT_SECS", 10)?),
            mqtt,
            store,
        })
    }
}

fn parse_or<F, T>(var: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match var(key) {
        Some(raw) => raw.trim().parse().map_err(|_| {
            IngestError::ConfigError(format!("{} has an invalid value '{}'", key, raw))
        }),
        None => Ok(default),
    }
}
