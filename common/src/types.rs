use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use chrono::Utc;
use crate::error::{IngestError, Result};

/// Unit of `SensorReading::timestamp`. Must match what the receiving
/// firmware/server expects, so it is never defaulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimestampUnit {
    Seconds,
    Milliseconds,
}

impl TimestampUnit {
    pub fn now(&self) -> i64 {
        match self {
            TimestampUnit::Seconds => Utc::now().timestamp(),
            TimestampUnit::Milliseconds => Utc::now().timestamp_millis(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimestampUnit::Seconds => "seconds",
            TimestampUnit::Milliseconds => "milliseconds",
        }
    }
}

impl std::str::FromStr for TimestampUnit {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "seconds" | "s" => Ok(TimestampUnit::Seconds),
            "milliseconds" | "ms" => Ok(TimestampUnit::Milliseconds),
            other => Err(IngestError::ConfigError(format!(
                "Unknown timestamp unit '{}', expected 'seconds' or 'milliseconds'", other
            ))),
        }
    }
}

/// One sample of every channel, serialized as a flat JSON object:
/// `{"V0":7.2,"V1":25.5,"timestamp":1700000000}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    #[serde(flatten)]
    channels: BTreeMap<String, f64>,
    timestamp: i64,
}

impl SensorReading {
    /// Values are rounded to two decimals, matching the precision the
    /// firmware reports.
    pub fn new<I, K>(channels: I, timestamp: i64) -> Result<Self>
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        let mut rounded = BTreeMap::new();
        for (name, value) in channels {
            let name = name.into();
            if name == "timestamp" {
                return Err(IngestError::EncodingError(
                    "'timestamp' is reserved and cannot be used as a channel id".to_string()
                ));
            }
            let value = round2(value);
            if !value.is_finite() {
                return Err(IngestError::EncodingError(format!(
                    "Channel {} has a value that cannot be represented: {}", name, value
                )));
            }
            rounded.insert(name, value);
        }

        Ok(Self { channels: rounded, timestamp })
    }

    pub fn stamped_now<I, K>(channels: I, unit: TimestampUnit) -> Result<Self>
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        Self::new(channels, unit.now())
    }

    pub fn channels(&self) -> &BTreeMap<String, f64> {
        &self.channels
    }

    pub fn value(&self, channel: &str) -> Option<f64> {
        self.channels.get(channel).copied()
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| IngestError::EncodingError(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| IngestError::DecodingError(e.to_string()))
    }
}

/// Values too large to scale by 100 already have no fractional part and are
/// kept as they are.
fn round2(value: f64) -> f64 {
    let scaled = value * 100.0;
    if scaled.is_finite() {
        scaled.round() / 100.0
    } else {
        value
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportKind {
    Http,
    Mqtt,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Http => "http",
            TransportKind::Mqtt => "mqtt",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of handing one token to a transport binding.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryResult {
    /// Accepted; carries the receiver's human-readable message when it sent one.
    Ok(Option<String>),
    /// Receiver answered with a non-2xx status.
    Rejected { status: u16, body: String },
    /// Network-level HTTP failure (timeout, DNS, refused).
    TransportError(String),
    /// Broker refused the publish.
    PublishError(String),
    /// Link was not connected or dropped before the ack.
    ConnectionError(String),
    /// No ack within the bound.
    TimeoutError(Duration),
}

impl DeliveryResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, DeliveryResult::Ok(_))
    }

    /// 401/403 rejections are the trigger for secret rotation.
    pub fn is_auth_rejected(&self) -> bool {
        matches!(self, DeliveryResult::Rejected { status: 401 | 403, .. })
    }

    /// Failures worth another attempt after a pause: network, broker and
    /// ack timeouts. Receiver rejections are final for the cycle.
    pub fn is_retryable(&self) -> bool {
        self.error_kind().map_or(false, |kind| kind.is_retryable())
    }

    pub fn error_kind(&self) -> Option<crate::error::ErrorKind> {
        use crate::error::ErrorKind;
        match self {
            DeliveryResult::Ok(_) => None,
            DeliveryResult::Rejected { .. } if self.is_auth_rejected() => Some(ErrorKind::AuthRejected),
            DeliveryResult::Rejected { .. } => Some(ErrorKind::Rejected),
            DeliveryResult::TransportError(_) => Some(ErrorKind::Transport),
            DeliveryResult::PublishError(_) => Some(ErrorKind::Publish),
            DeliveryResult::ConnectionError(_) => Some(ErrorKind::Connection),
            DeliveryResult::TimeoutError(_) => Some(ErrorKind::Timeout),
        }
    }
}

impl std::fmt::Display for DeliveryResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryResult::Ok(Some(message)) => write!(f, "ok: {}", message),
            DeliveryResult::Ok(None) => write!(f, "ok"),
            DeliveryResult::Rejected { status, body } => write!(f, "rejected ({}): {}", status, body),
            DeliveryResult::TransportError(msg) => write!(f, "transport error: {}", msg),
            DeliveryResult::PublishError(msg) => write!(f, "publish error: {}", msg),
            DeliveryResult::ConnectionError(msg) => write!(f, "connection error: {}", msg),
            DeliveryResult::TimeoutError(bound) => write!(f, "no ack within {:?}", bound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_reading_rounds_to_two_decimals() {
        let reading = SensorReading::new(vec![("V0", 7.204), ("V1", 25.496)], 1_700_000_000).unwrap();
        assert_eq!(reading.value("V0"), Some(7.2));
        assert_eq!(reading.value("V1"), Some(25.5));
    }

    #[test]
    fn test_reading_json_layout() {
        let reading = SensorReading::new(vec![("V1", 25.5), ("V0", 7.2)], 1_700_000_000).unwrap();
        let json = String::from_utf8(reading.to_json().unwrap()).unwrap();
        assert_eq!(json, r#"{"V0":7.2,"V1":25.5,"timestamp":1700000000}"#);

        let parsed = SensorReading::from_json(json.as_bytes()).unwrap();
        assert_eq!(parsed, reading);
    }

    #[test]
    fn test_reading_rejects_reserved_and_non_finite() {
        assert!(SensorReading::new(vec![("timestamp", 1.0)], 0).is_err());
        assert!(SensorReading::new(vec![("V0", f64::NAN)], 0).is_err());
        assert!(SensorReading::new(vec![("V0", f64::INFINITY)], 0).is_err());
    }

    #[test]
    fn test_timestamp_unit_parsing() {
        assert_eq!("seconds".parse::<TimestampUnit>().unwrap(), TimestampUnit::Seconds);
        assert_eq!("MS".parse::<TimestampUnit>().unwrap(), TimestampUnit::Milliseconds);
        assert!("minutes".parse::<TimestampUnit>().is_err());

        let seconds = TimestampUnit::Seconds.now();
        let millis = TimestampUnit::Milliseconds.now();
        assert!(millis / 1000 - seconds <= 1);
    }

    #[test]
    fn test_auth_rejection_classification() {
        let unauthorized = DeliveryResult::Rejected { status: 401, body: "expired".into() };
        let forbidden = DeliveryResult::Rejected { status: 403, body: String::new() };
        let server_error = DeliveryResult::Rejected { status: 500, body: String::new() };

        assert!(unauthorized.is_auth_rejected());
        assert!(forbidden.is_auth_rejected());
        assert!(!server_error.is_auth_rejected());
        assert_eq!(server_error.error_kind(), Some(ErrorKind::Rejected));
        assert_eq!(unauthorized.error_kind(), Some(ErrorKind::AuthRejected));
    }

    #[test]
    fn test_retryable_deliveries() {
        assert!(DeliveryResult::TransportError("refused".into()).is_retryable());
        assert!(DeliveryResult::ConnectionError("dropped".into()).is_retryable());
        assert!(DeliveryResult::TimeoutError(Duration::from_secs(10)).is_retryable());
        assert!(!DeliveryResult::Rejected { status: 401, body: String::new() }.is_retryable());
        assert!(!DeliveryResult::Rejected { status: 500, body: String::new() }.is_retryable());
        assert!(!DeliveryResult::Ok(None).is_retryable());
    }

    #[test]
    fn test_huge_values_survive_json() {
        let reading = SensorReading::new(vec![("V0", 1e307), ("V1", -1e307)], 1_700_000_000).unwrap();
        assert_eq!(reading.value("V0"), Some(1e307));

        let json = reading.to_json().unwrap();
        assert!(!String::from_utf8_lossy(&json).contains("null"));
        assert_eq!(SensorReading::from_json(&json).unwrap(), reading);
    }
}
