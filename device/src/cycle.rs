use common::{EnvelopeBuilder, SenderConfig, SensorReading};
use std::sync::Arc;
use std::time::Duration;
use crate::events::{EventSink, SendEvent};
use crate::rotation::{CycleOutcome, FailureReason, RotationClient, SecretRenewer};
use crate::store::SecretStore;
use crate::transport::Transport;

/// How often a cycle repeats after a transient delivery failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts in total, the first included.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self { max_attempts: 1, initial_backoff: Duration::ZERO }
    }

    pub fn from_config(config: &SenderConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: config.retry_backoff,
        }
    }

    /// Pause after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.initial_backoff
            .checked_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .unwrap_or(Duration::MAX)
    }
}

/// One reading, one transport: read the credential, send, rotate if needed.
/// Network, broker and ack failures are repeated within the cycle; the
/// caller's next cycle waits until this one returns.
pub struct SendCycle {
    store: Arc<dyn SecretStore>,
    rotation: RotationClient,
    events: Arc<dyn EventSink>,
    retry: RetryPolicy,
}

impl SendCycle {
    pub fn new(
        store: Arc<dyn SecretStore>,
        builder: Arc<EnvelopeBuilder>,
        renewer: Arc<dyn SecretRenewer>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            rotation: RotationClient::new(builder, renewer, events.clone()),
            events,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn run(&self, device_id: &str, reading: &SensorReading, transport: &dyn Transport) -> CycleOutcome {
        let kind = transport.kind();
        self.events.emit(&SendEvent::CycleStarted {
            transport: kind,
            device_id: device_id.to_string(),
        });

        let mut attempt = 1;
        loop {
            let credential = match self.store.fetch_credential(device_id).await {
                Ok(credential) => credential,
                Err(e) => return self.rotation.fail(kind, FailureReason::Store(e)),
            };

            let reason = match self.rotation.try_send(&credential, reading, transport).await {
                Ok(outcome) => return outcome,
                Err(reason) => reason,
            };

            if attempt >= self.retry.max_attempts || !reason.is_retryable() {
                return self.rotation.fail(kind, reason);
            }

            let delay = self.retry.backoff(attempt);
            self.events.emit(&SendEvent::RetryScheduled {
                transport: kind,
                attempt,
                delay,
                reason: reason.to_string(),
            });
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::encryption::CodecKind;
    use common::{DeliveryResult, DeviceCredential, ErrorKind, TransportKind};
    use crate::events::SendStats;
    use crate::rotation::tests::{MockRenewer, ScriptedTransport, CURRENT, ISSUED, PREVIOUS};
    use crate::store::StaticSecretStore;

    fn reading() -> SensorReading {
        SensorReading::new(vec![("V0", 1.0)], 1_700_000_000).unwrap()
    }

    fn cycle(store: Arc<StaticSecretStore>, stats: Arc<SendStats>) -> SendCycle {
        SendCycle::new(
            store,
            Arc::new(EnvelopeBuilder::from_kind(CodecKind::AesCbc)),
            Arc::new(MockRenewer::issuing(ISSUED)),
            stats,
        )
    }

    #[tokio::test]
    async fn test_unknown_device_is_store_failure() {
        let store = Arc::new(StaticSecretStore::new());
        let stats = Arc::new(SendStats::new());
        let transport = ScriptedTransport::new(vec![DeliveryResult::Ok(None)]);

        let outcome = cycle(store, stats.clone()).run("42", &reading(), &transport).await;

        assert!(matches!(outcome, CycleOutcome::Failed(FailureReason::Store(_))));
        assert_eq!(transport.calls(), 0);
        assert_eq!(stats.failures_of(ErrorKind::NotFound), 1);
    }

    fn transient() -> DeliveryResult {
        DeliveryResult::TransportError("connection refused".to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried_with_backoff() {
        let store = Arc::new(StaticSecretStore::with_credential(DeviceCredential::new("7", CURRENT)));
        let stats = Arc::new(SendStats::new());
        let transport = ScriptedTransport::new(vec![transient(), transient(), DeliveryResult::Ok(None)]);
        let started = tokio::time::Instant::now();

        let outcome = cycle(store, stats.clone()).run("7", &reading(), &transport).await;

        assert!(outcome.is_delivered());
        assert_eq!(transport.calls(), 3);
        // 500ms after the first failure, 1s after the second.
        assert_eq!(started.elapsed(), Duration::from_millis(1500));

        let summary = stats.summary();
        assert_eq!(summary.transports[0].cycles, 1);
        assert_eq!(summary.transports[0].delivered, 1);
        assert_eq!(summary.transports[0].failed, 0);
        assert_eq!(summary.transports[0].retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let store = Arc::new(StaticSecretStore::with_credential(DeviceCredential::new("7", CURRENT)));
        let stats = Arc::new(SendStats::new());
        let transport = ScriptedTransport::new(vec![transient()]);

        let outcome = cycle(store, stats.clone()).run("7", &reading(), &transport).await;

        assert!(matches!(outcome, CycleOutcome::Failed(FailureReason::Delivery(DeliveryResult::TransportError(_)))));
        assert_eq!(transport.calls(), 3);
        assert_eq!(stats.failed(TransportKind::Http), 1);
        assert_eq!(stats.failures_of(ErrorKind::Transport), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejections_are_not_retried() {
        let store = Arc::new(StaticSecretStore::with_credential(DeviceCredential::new("7", CURRENT)));
        let transport = ScriptedTransport::new(vec![DeliveryResult::Rejected {
            status: 500,
            body: "db down".to_string(),
        }]);

        let outcome = cycle(store, Arc::new(SendStats::new())).run("7", &reading(), &transport).await;

        assert!(!outcome.is_delivered());
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_attempt_policy() {
        let store = Arc::new(StaticSecretStore::with_credential(DeviceCredential::new("7", CURRENT)));
        let transport = ScriptedTransport::new(vec![transient(), DeliveryResult::Ok(None)]);

        let outcome = cycle(store, Arc::new(SendStats::new()))
            .with_retry(RetryPolicy::none())
            .run("7", &reading(), &transport)
            .await;

        assert!(!outcome.is_delivered());
        assert_eq!(transport.calls(), 1);
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_secs(1));
        assert_eq!(policy.backoff(3), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_credential_is_read_every_cycle() {
        let store = Arc::new(StaticSecretStore::with_credential(
            DeviceCredential::new("7", PREVIOUS),
        ));
        let stats = Arc::new(SendStats::new());
        let transport = ScriptedTransport::new(vec![DeliveryResult::Ok(None)]);
        let cycle = cycle(store.clone(), stats.clone());

        assert!(cycle.run("7", &reading(), &transport).await.is_delivered());

        // The receiver rotated the secret out of band.
        store.put(DeviceCredential::new("7", CURRENT).with_previous(PREVIOUS));
        assert!(cycle.run("7", &reading(), &transport).await.is_delivered());

        let tokens = transport.tokens.lock();
        let now = chrono::Utc::now().timestamp();
        assert!(common::token::verify_token(tokens[0].as_str(), PREVIOUS, now).is_ok());
        assert!(common::token::verify_token(tokens[1].as_str(), CURRENT, now).is_ok());
        assert_eq!(stats.delivered(TransportKind::Http), 2);
    }
}
