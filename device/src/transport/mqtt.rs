use async_trait::async_trait;
use common::{DeliveryResult, IngestError, MqttConfig, Result, SignedToken, TransportKind};
use log::{debug, info, warn};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;
use super::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// A broker session that can carry one publish at a time.
#[async_trait]
pub trait MqttLink: Send + Sync {
    fn state(&self) -> ConnectionState;

    /// Resolves once the broker has taken the message at the link's QoS.
    /// Fails with `PublishError` when the client refuses the request and
    /// `ConnectionError` when the session drops first.
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()>;

    async fn close(&self);
}

#[async_trait]
pub trait MqttConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn MqttLink>>;
}

#[derive(Debug)]
enum LinkEvent {
    Sent(u16),
    Acked(u16),
    Failed(String),
}

/// rumqttc session. The event loop runs on its own task and reports state
/// and packet events back over channels.
pub struct MqttConnection {
    client: AsyncClient,
    qos: QoS,
    state: watch::Receiver<ConnectionState>,
    events: AsyncMutex<mpsc::UnboundedReceiver<LinkEvent>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MqttConnection {
    pub async fn connect(config: &MqttConfig) -> Result<Self> {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("ingest-device-{}", Uuid::new_v4()));

        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(true);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = AsyncClient::new(options, 10);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive(eventloop, state_tx, event_tx));

        let connection = Self {
            client,
            qos: qos_level(config.qos),
            state: state_rx,
            events: AsyncMutex::new(event_rx),
            driver: Mutex::new(Some(driver)),
            closed: AtomicBool::new(false),
        };

        let mut watcher = connection.state.clone();
        let settled = timeout(
            config.connect_timeout,
            watcher.wait_for(|state| *state != ConnectionState::Connecting),
        )
        .await
        .map(|waited| waited.map(|state| *state));

        match settled {
            Ok(Ok(ConnectionState::Connected)) => {
                info!("Connected to MQTT broker {}:{}", config.host, config.port);
                Ok(connection)
            }
            Ok(_) => {
                connection.close().await;
                Err(IngestError::ConnectionError(format!(
                    "Broker {}:{} closed the connection", config.host, config.port
                )))
            }
            Err(_) => {
                connection.close().await;
                Err(IngestError::ConnectionError(format!(
                    "No CONNACK from {}:{} within {:?}", config.host, config.port, config.connect_timeout
                )))
            }
        }
    }
}

async fn drive(
    mut eventloop: EventLoop,
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    state.send_replace(ConnectionState::Connected);
                } else {
                    warn!("Broker refused the session: {:?}", ack.code);
                    let _ = events.send(LinkEvent::Failed(format!("Connection refused: {:?}", ack.code)));
                    break;
                }
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                let _ = events.send(LinkEvent::Acked(ack.pkid));
            }
            Ok(Event::Incoming(Packet::PubComp(comp))) => {
                let _ = events.send(LinkEvent::Acked(comp.pkid));
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                let _ = events.send(LinkEvent::Failed("Broker sent DISCONNECT".to_string()));
                break;
            }
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                let _ = events.send(LinkEvent::Sent(pkid));
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT connection lost: {}", e);
                let _ = events.send(LinkEvent::Failed(e.to_string()));
                break;
            }
        }
    }

    state.send_replace(ConnectionState::Disconnected);
}

/// Leftovers from an abandoned publish must not complete the next one.
fn drain_stale(events: &mut mpsc::UnboundedReceiver<LinkEvent>) {
    while events.try_recv().is_ok() {}
}

/// QoS 0 completes once the packet is written; QoS 1 and 2 wait for the
/// PUBACK or PUBCOMP carrying the packet id of that write.
async fn await_completion(events: &mut mpsc::UnboundedReceiver<LinkEvent>, qos: QoS) -> Result<()> {
    let mut sent = None;
    loop {
        match events.recv().await {
            Some(LinkEvent::Sent(pkid)) => {
                if qos == QoS::AtMostOnce {
                    return Ok(());
                }
                sent = Some(pkid);
            }
            Some(LinkEvent::Acked(pkid)) if sent == Some(pkid) => return Ok(()),
            Some(LinkEvent::Acked(pkid)) => debug!("Ignoring ack for packet {}", pkid),
            Some(LinkEvent::Failed(reason)) => return Err(IngestError::ConnectionError(reason)),
            None => return Err(IngestError::ConnectionError("MQTT event loop stopped".to_string())),
        }
    }
}

fn qos_level(level: u8) -> QoS {
    match level {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

#[async_trait]
impl MqttLink for MqttConnection {
    fn state(&self) -> ConnectionState {
        if self.closed.load(Ordering::SeqCst) {
            return ConnectionState::Disconnected;
        }
        *self.state.borrow()
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let mut events = self.events.lock().await;
        drain_stale(&mut events);

        self.client
            .publish(topic, self.qos, false, payload.to_vec())
            .await
            .map_err(|e| IngestError::PublishError(e.to_string()))?;

        await_completion(&mut events, self.qos).await
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let _ = self.client.try_disconnect();
        let driver = self.driver.lock().take();
        if let Some(mut handle) = driver {
            if timeout(Duration::from_secs(1), &mut handle).await.is_err() {
                handle.abort();
            }
        }
        debug!("MQTT link closed");
    }
}

pub struct RumqttConnector {
    config: MqttConfig,
}

impl RumqttConnector {
    pub fn new(config: MqttConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MqttConnector for RumqttConnector {
    async fn connect(&self) -> Result<Box<dyn MqttLink>> {
        Ok(Box::new(MqttConnection::connect(&self.config).await?))
    }
}

/// Publishes the raw token string on `topic` and waits at most `ack_timeout`
/// for the broker. On timeout the link is closed; callers reconnect.
pub async fn send_mqtt(
    token: &SignedToken,
    link: &dyn MqttLink,
    topic: &str,
    ack_timeout: Duration,
) -> DeliveryResult {
    let state = link.state();
    if state != ConnectionState::Connected {
        return DeliveryResult::ConnectionError(format!("MQTT link is {}", state));
    }

    match timeout(ack_timeout, link.publish(topic, token.as_str().as_bytes())).await {
        Ok(Ok(())) => DeliveryResult::Ok(None),
        Ok(Err(IngestError::PublishError(msg))) => DeliveryResult::PublishError(msg),
        Ok(Err(e)) => DeliveryResult::ConnectionError(e.to_string()),
        Err(_) => {
            warn!("No acknowledgment on {} within {:?}, dropping the link", topic, ack_timeout);
            link.close().await;
            DeliveryResult::TimeoutError(ack_timeout)
        }
    }
}

/// Long-lived MQTT binding. Connects on first use and again after any
/// timeout or connection failure; the link lock keeps publishes serialized.
pub struct MqttTransport {
    connector: Box<dyn MqttConnector>,
    link: AsyncMutex<Option<Box<dyn MqttLink>>>,
    topic: String,
    ack_timeout: Duration,
}

impl MqttTransport {
    pub fn new(connector: Box<dyn MqttConnector>, topic: impl Into<String>, ack_timeout: Duration) -> Self {
        Self {
            connector,
            link: AsyncMutex::new(None),
            topic: topic.into(),
            ack_timeout,
        }
    }

    pub fn from_config(config: &MqttConfig) -> Self {
        Self::new(
            Box::new(RumqttConnector::new(config.clone())),
            config.topic.clone(),
            config.ack_timeout,
        )
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl Transport for MqttTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Mqtt
    }

    async fn deliver(&self, token: &SignedToken) -> DeliveryResult {
        let mut slot = self.link.lock().await;

        let usable = match &*slot {
            Some(link) => link.state() == ConnectionState::Connected,
            None => false,
        };
        if !usable {
            if let Some(stale) = slot.take() {
                stale.close().await;
            }
            match self.connector.connect().await {
                Ok(link) => *slot = Some(link),
                Err(e) => return DeliveryResult::ConnectionError(e.to_string()),
            }
        }

        let result = match &*slot {
            Some(link) => send_mqtt(token, link.as_ref(), &self.topic, self.ack_timeout).await,
            None => DeliveryResult::ConnectionError("No MQTT link".to_string()),
        };

        if matches!(result, DeliveryResult::TimeoutError(_) | DeliveryResult::ConnectionError(_)) {
            if let Some(link) = slot.take() {
                link.close().await;
            }
        }

        result
    }

    async fn close(&self) {
        if let Some(link) = self.link.lock().await.take() {
            link.close().await;
            info!("Disconnected from MQTT broker");
        }
    }
}
