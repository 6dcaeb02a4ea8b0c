//! Secret store accessors.
//!
//! Every send cycle reads the device credential fresh; nothing is cached
//! between cycles because the receiver may rotate secrets at any time.

mod mysql_store;
mod redis_store;

pub use mysql_store::MySqlSecretStore;
pub use redis_store::RedisSecretStore;

use async_trait::async_trait;
use common::{DeviceCredential, IngestError, Result, StoreConfig};
use parking_lot::RwLock;
use std::collections::HashMap;

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Fails with `NotFoundError` when the device has no row and with
    /// `StoreUnavailableError` on connectivity problems. Neither is retried here.
    async fn fetch_credential(&self, device_id: &str) -> Result<DeviceCredential>;
}

/// In-memory store, fed from configuration or by tests.
#[derive(Default)]
pub struct StaticSecretStore {
    credentials: RwLock<HashMap<String, DeviceCredential>>,
}

impl StaticSecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credential(credential: DeviceCredential) -> Self {
        let store = Self::new();
        store.put(credential);
        store
    }

    pub fn put(&self, credential: DeviceCredential) {
        self.credentials.write().insert(credential.device_id.clone(), credential);
    }
}

#[async_trait]
impl SecretStore for StaticSecretStore {
    async fn fetch_credential(&self, device_id: &str) -> Result<DeviceCredential> {
        self.credentials
            .read()
            .get(device_id)
            .cloned()
            .ok_or_else(|| IngestError::NotFoundError(device_id.to_string()))
    }
}

pub async fn open_store(config: &StoreConfig, device_id: &str) -> Result<Box<dyn SecretStore>> {
    match config {
        StoreConfig::MySql { url } => {
            log::info!("Reading device secrets from MySQL");
            Ok(Box::new(MySqlSecretStore::connect(url).await?))
        }
        StoreConfig::Redis { url } => {
            log::info!("Reading device secrets from Redis at {}", url);
            Ok(Box::new(RedisSecretStore::open(url)?))
        }
        StoreConfig::Static { secret, previous_secret } => {
            log::info!("Using the configured secret for device {}", device_id);
            let mut credential = DeviceCredential::new(device_id, secret.clone());
            credential.previous_secret = previous_secret.clone();
            Ok(Box::new(StaticSecretStore::with_credential(credential)))
        }
    }
}
