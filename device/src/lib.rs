//! Device side of the sensor ingest protocol: secret lookup, HTTP and MQTT
//! delivery of signed envelopes, and secret rotation on rejection.

pub mod cycle;
pub mod events;
pub mod logging;
pub mod rotation;
pub mod runner;
pub mod sensor;
pub mod store;
pub mod transport;

pub use cycle::{RetryPolicy, SendCycle};
pub use events::{EventSink, FanOut, LogSink, SendEvent, SendStats, StatsSummary};
pub use rotation::{CycleOutcome, FailureReason, RotationClient, SecretRenewer};
pub use runner::RealtimeSender;
pub use sensor::SimulatedSensor;
pub use store::{open_store, SecretStore, StaticSecretStore};
pub use transport::{HttpRenewer, HttpTransport, MqttTransport, Transport, TransportChoice};
