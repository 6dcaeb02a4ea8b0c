//! Secret rotation on auth rejection.
//!
//! A cycle tries the current secret first. A 401/403 with a previous secret
//! on file triggers one renewal call and exactly one retry with the issued
//! secret; anything else ends the cycle. The issued secret is never written
//! back, the receiver persists it and the next cycle reads it from the store.

use async_trait::async_trait;
use common::{
    DeliveryResult, DeviceCredential, EnvelopeBuilder, ErrorKind, IngestError, Result,
    SensorReading, TransportKind,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use crate::events::{EventSink, SendEvent};
use crate::transport::Transport;

#[async_trait]
pub trait SecretRenewer: Send + Sync {
    /// Exchanges `old_secret` for a newly issued secret.
    async fn renew(&self, device_id: &str, old_secret: &str) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    /// The reading could not be encrypted or signed.
    Envelope(IngestError),
    /// The credential could not be read.
    Store(IngestError),
    /// The first attempt failed for a reason rotation cannot fix.
    Delivery(DeliveryResult),
    NoRenewalPossible,
    RenewalRejected(String),
    /// The single retry with the renewed secret failed too.
    RetryFailed(DeliveryResult),
}

impl FailureReason {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FailureReason::Envelope(e) | FailureReason::Store(e) => e.kind(),
            FailureReason::Delivery(result) | FailureReason::RetryFailed(result) => {
                result.error_kind().unwrap_or(ErrorKind::Transport)
            }
            FailureReason::NoRenewalPossible => ErrorKind::NoRenewalPossible,
            FailureReason::RenewalRejected(_) => ErrorKind::RenewalRejected,
        }
    }

    /// Only a transient failure of the first attempt is worth repeating.
    /// Anything after a renewal already used its single retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureReason::Delivery(result) if result.is_retryable())
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Envelope(e) => write!(f, "could not build envelope: {}", e),
            FailureReason::Store(e) => write!(f, "could not read credential: {}", e),
            FailureReason::Delivery(result) => write!(f, "{}", result),
            FailureReason::NoRenewalPossible => write!(f, "secret rejected and no previous secret to renew with"),
            FailureReason::RenewalRejected(msg) => write!(f, "renewal rejected: {}", msg),
            FailureReason::RetryFailed(result) => write!(f, "retry with renewed secret failed: {}", result),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Delivered {
        /// Whether the renewed secret carried the accepted token.
        rotated: bool,
        message: Option<String>,
        latency: Duration,
    },
    Failed(FailureReason),
}

impl CycleOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, CycleOutcome::Delivered { .. })
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            CycleOutcome::Failed(reason) => Some(reason),
            CycleOutcome::Delivered { .. } => None,
        }
    }
}

pub struct RotationClient {
    builder: Arc<EnvelopeBuilder>,
    renewer: Arc<dyn SecretRenewer>,
    events: Arc<dyn EventSink>,
}

impl RotationClient {
    pub fn new(
        builder: Arc<EnvelopeBuilder>,
        renewer: Arc<dyn SecretRenewer>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self { builder, renewer, events }
    }

    pub async fn send(
        &self,
        credential: &DeviceCredential,
        reading: &SensorReading,
        transport: &dyn Transport,
    ) -> CycleOutcome {
        match self.try_send(credential, reading, transport).await {
            Ok(outcome) => outcome,
            Err(reason) => self.fail(transport.kind(), reason),
        }
    }

    /// Same as `send` but hands the failure back without reporting it, so a
    /// caller can decide to try again.
    pub(crate) async fn try_send(
        &self,
        credential: &DeviceCredential,
        reading: &SensorReading,
        transport: &dyn Transport,
    ) -> std::result::Result<CycleOutcome, FailureReason> {
        let kind = transport.kind();
        let device_id = credential.device_id.as_str();
        let started = Instant::now();

        let first = self
            .attempt(reading, device_id, &credential.current_secret, transport)
            .await
            .map_err(FailureReason::Envelope)?;

        if let DeliveryResult::Ok(message) = first {
            return Ok(self.delivered(kind, false, message, started));
        }

        self.events.emit(&SendEvent::Rejected { transport: kind, result: first.clone() });
        if !first.is_auth_rejected() {
            return Err(FailureReason::Delivery(first));
        }

        let previous = credential
            .previous_secret
            .as_deref()
            .ok_or(FailureReason::NoRenewalPossible)?;

        self.events.emit(&SendEvent::RenewalRequested {
            transport: kind,
            device_id: device_id.to_string(),
        });
        let renewed = self
            .renewer
            .renew(device_id, previous)
            .await
            .map(|secret| credential.rotated(secret))
            .map_err(|e| FailureReason::RenewalRejected(e.to_string()))?;
        self.events.emit(&SendEvent::SecretRenewed {
            transport: kind,
            device_id: device_id.to_string(),
        });

        let retried = self
            .attempt(reading, device_id, &renewed.current_secret, transport)
            .await
            .map_err(FailureReason::Envelope)?;
        match retried {
            DeliveryResult::Ok(message) => Ok(self.delivered(kind, true, message, started)),
            retried => {
                self.events.emit(&SendEvent::Rejected { transport: kind, result: retried.clone() });
                Err(FailureReason::RetryFailed(retried))
            }
        }
    }

    async fn attempt(
        &self,
        reading: &SensorReading,
        device_id: &str,
        secret: &str,
        transport: &dyn Transport,
    ) -> Result<DeliveryResult> {
        let token = self.builder.build(reading, device_id, secret)?;
        Ok(transport.deliver(&token).await)
    }

    fn delivered(
        &self,
        transport: TransportKind,
        rotated: bool,
        message: Option<String>,
        started: Instant,
    ) -> CycleOutcome {
        let latency = started.elapsed();
        self.events.emit(&SendEvent::Delivered {
            transport,
            rotated,
            latency,
            message: message.clone(),
        });
        CycleOutcome::Delivered { rotated, message, latency }
    }

    pub(crate) fn fail(&self, transport: TransportKind, reason: FailureReason) -> CycleOutcome {
        self.events.emit(&SendEvent::CycleFailed {
            transport,
            kind: reason.kind(),
            reason: reason.to_string(),
        });
        CycleOutcome::Failed(reason)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use common::encryption::{CodecKind, PayloadCodec};
    use common::token::verify_token;
    use common::SignedToken;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use crate::events::SendStats;

    pub const CURRENT: &str = "0123456789abcdef0123456789abcdef";
    pub const PREVIOUS: &str = "fedcba9876543210fedcba9876543210";
    pub const ISSUED: &str = "00112233445566778899aabbccddeeff";

    /// Replays scripted results; the last one repeats.
    pub struct ScriptedTransport {
        script: Mutex<VecDeque<DeliveryResult>>,
        pub tokens: Mutex<Vec<SignedToken>>,
    }

    impl ScriptedTransport {
        pub fn new(script: Vec<DeliveryResult>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                tokens: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> usize {
            self.tokens.lock().len()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::Http
        }

        async fn deliver(&self, token: &SignedToken) -> DeliveryResult {
            self.tokens.lock().push(token.clone());
            let mut script = self.script.lock();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script.front().cloned().unwrap()
            }
        }
    }

    pub struct MockRenewer {
        pub issued: Result<String>,
        pub calls: AtomicUsize,
        pub seen_old_secret: Mutex<Option<String>>,
    }

    impl MockRenewer {
        pub fn issuing(secret: &str) -> Self {
            Self {
                issued: Ok(secret.to_string()),
                calls: AtomicUsize::new(0),
                seen_old_secret: Mutex::new(None),
            }
        }

        pub fn refusing() -> Self {
            Self {
                issued: Err(IngestError::RenewalRejected("401 Unauthorized - invalid old secret".to_string())),
                calls: AtomicUsize::new(0),
                seen_old_secret: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl SecretRenewer for MockRenewer {
        async fn renew(&self, _device_id: &str, old_secret: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.seen_old_secret.lock() = Some(old_secret.to_string());
            self.issued.clone()
        }
    }

    fn unauthorized() -> DeliveryResult {
        DeliveryResult::Rejected { status: 401, body: "invalid token".to_string() }
    }

    fn reading() -> SensorReading {
        SensorReading::new(vec![("V0", 7.2), ("V1", 25.5)], 1_700_000_000).unwrap()
    }

    fn client(renewer: Arc<MockRenewer>, stats: Arc<SendStats>) -> RotationClient {
        RotationClient::new(
            Arc::new(EnvelopeBuilder::from_kind(CodecKind::AesCbc)),
            renewer,
            stats,
        )
    }

    #[tokio::test]
    async fn test_first_attempt_success_skips_renewal() {
        let renewer = Arc::new(MockRenewer::issuing(ISSUED));
        let stats = Arc::new(SendStats::new());
        let transport = ScriptedTransport::new(vec![DeliveryResult::Ok(Some("stored".into()))]);
        let credential = DeviceCredential::new("7", CURRENT).with_previous(PREVIOUS);

        let outcome = client(renewer.clone(), stats.clone()).send(&credential, &reading(), &transport).await;

        assert!(matches!(outcome, CycleOutcome::Delivered { rotated: false, .. }));
        assert_eq!(renewer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(transport.calls(), 1);
        assert_eq!(stats.delivered(TransportKind::Http), 1);
    }

    #[tokio::test]
    async fn test_rejection_without_previous_secret() {
        let renewer = Arc::new(MockRenewer::issuing(ISSUED));
        let transport = ScriptedTransport::new(vec![unauthorized()]);
        let credential = DeviceCredential::new("7", CURRENT);

        let outcome = client(renewer.clone(), Arc::new(SendStats::new()))
            .send(&credential, &reading(), &transport)
            .await;

        assert_eq!(outcome, CycleOutcome::Failed(FailureReason::NoRenewalPossible));
        assert_eq!(renewer.calls.load(Ordering::SeqCst), 0);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_refused_renewal_ends_cycle() {
        let renewer = Arc::new(MockRenewer::refusing());
        let stats = Arc::new(SendStats::new());
        let transport = ScriptedTransport::new(vec![unauthorized()]);
        let credential = DeviceCredential::new("7", CURRENT).with_previous(PREVIOUS);

        let outcome = client(renewer.clone(), stats.clone()).send(&credential, &reading(), &transport).await;

        assert!(matches!(outcome, CycleOutcome::Failed(FailureReason::RenewalRejected(_))));
        assert_eq!(renewer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.calls(), 1);
        assert_eq!(stats.failures_of(ErrorKind::RenewalRejected), 1);
    }

    #[tokio::test]
    async fn test_rotation_is_bounded_to_one_retry() {
        let renewer = Arc::new(MockRenewer::issuing(ISSUED));
        let transport = ScriptedTransport::new(vec![unauthorized()]);
        let credential = DeviceCredential::new("7", CURRENT).with_previous(PREVIOUS);

        let outcome = client(renewer.clone(), Arc::new(SendStats::new()))
            .send(&credential, &reading(), &transport)
            .await;

        assert!(matches!(outcome, CycleOutcome::Failed(FailureReason::RetryFailed(_))));
        assert_eq!(renewer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_rotation_scenario_uses_issued_secret() {
        let renewer = Arc::new(MockRenewer::issuing(ISSUED));
        let stats = Arc::new(SendStats::new());
        let transport = ScriptedTransport::new(vec![unauthorized(), DeliveryResult::Ok(None)]);
        let credential = DeviceCredential::new("7", CURRENT).with_previous(PREVIOUS);

        let outcome = client(renewer.clone(), stats.clone()).send(&credential, &reading(), &transport).await;

        assert!(matches!(outcome, CycleOutcome::Delivered { rotated: true, .. }));
        assert_eq!(renewer.seen_old_secret.lock().as_deref(), Some(PREVIOUS));

        let tokens = transport.tokens.lock();
        let now = chrono::Utc::now().timestamp();
        assert!(verify_token(tokens[0].as_str(), CURRENT, now).is_ok());
        let claims = verify_token(tokens[1].as_str(), ISSUED, now).unwrap();
        assert!(verify_token(tokens[1].as_str(), CURRENT, now).is_err());

        let decoded = common::encryption::AesCbcCodec::new().decode(&claims.data, ISSUED).unwrap();
        assert_eq!(decoded, reading());

        let summary = stats.summary();
        assert_eq!(summary.transports[0].rotations, 1);
        assert_eq!(summary.transports[0].delivered, 1);
    }

    #[tokio::test]
    async fn test_non_auth_failure_is_not_rotated() {
        let renewer = Arc::new(MockRenewer::issuing(ISSUED));
        let transport = ScriptedTransport::new(vec![DeliveryResult::Rejected {
            status: 500,
            body: "db down".to_string(),
        }]);
        let credential = DeviceCredential::new("7", CURRENT).with_previous(PREVIOUS);

        let outcome = client(renewer.clone(), Arc::new(SendStats::new()))
            .send(&credential, &reading(), &transport)
            .await;

        let reason = outcome.failure().unwrap();
        assert_eq!(reason.kind(), ErrorKind::Rejected);
        assert_eq!(renewer.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_only_transient_first_failures_are_retryable() {
        assert!(FailureReason::Delivery(DeliveryResult::TransportError("refused".into())).is_retryable());
        assert!(FailureReason::Delivery(DeliveryResult::TimeoutError(Duration::from_secs(10))).is_retryable());
        assert!(!FailureReason::Delivery(unauthorized()).is_retryable());
        assert!(!FailureReason::RetryFailed(DeliveryResult::TransportError("refused".into())).is_retryable());
        assert!(!FailureReason::NoRenewalPossible.is_retryable());
    }

    #[tokio::test]
    async fn test_bad_secret_fails_before_sending() {
        let renewer = Arc::new(MockRenewer::issuing(ISSUED));
        let transport = ScriptedTransport::new(vec![DeliveryResult::Ok(None)]);
        let credential = DeviceCredential::new("7", "not-hex");

        let outcome = client(renewer, Arc::new(SendStats::new()))
            .send(&credential, &reading(), &transport)
            .await;

        assert_eq!(outcome.failure().map(FailureReason::kind), Some(ErrorKind::Key));
        assert_eq!(transport.calls(), 0);
    }
}
