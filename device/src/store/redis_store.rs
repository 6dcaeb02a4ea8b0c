use async_trait::async_trait;
use common::{DeviceCredential, IngestError, Result};
use redis::aio::MultiplexedConnection;
use redis::Client as RedisClient;
use std::collections::HashMap;
use super::SecretStore;

/// Reads secrets from a Redis hash `device:{id}` with fields `secret_key`
/// and `old_secret`.
pub struct RedisSecretStore {
    redis_client: RedisClient,
}

impl RedisSecretStore {
    pub fn open(url: &str) -> Result<Self> {
        let redis_client = RedisClient::open(url)
            .map_err(|e| IngestError::StoreUnavailableError(e.to_string()))?;
        Ok(Self { redis_client })
    }
}

#[async_trait]
impl SecretStore for RedisSecretStore {
    async fn fetch_credential(&self, device_id: &str) -> Result<DeviceCredential> {
        let mut conn = self.redis_client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| IngestError::StoreUnavailableError(e.to_string()))?;

        let mut fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(format!("device:{}", device_id))
            .query_async::<MultiplexedConnection, HashMap<String, String>>(&mut conn)
            .await
            .map_err(|e| IngestError::StoreUnavailableError(e.to_string()))?;

        let current_secret = fields
            .remove("secret_key")
            .ok_or_else(|| IngestError::NotFoundError(device_id.to_string()))?;

        Ok(DeviceCredential {
            device_id: device_id.to_string(),
            current_secret,
            previous_secret: fields.remove("old_secret").filter(|s| !s.is_empty()),
        })
    }
}
