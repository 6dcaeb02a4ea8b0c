use async_trait::async_trait;
use common::{DeviceCredential, IngestError, Result};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use std::time::Duration;
use super::SecretStore;

const FETCH_CREDENTIAL: &str = "SELECT secret_key, old_secret FROM devices WHERE id = ?";

#[derive(sqlx::FromRow)]
struct SecretRow {
    secret_key: String,
    old_secret: Option<String>,
}

/// Reads secrets from the dashboard's `devices` table.
pub struct MySqlSecretStore {
    pool: MySqlPool,
}

impl MySqlSecretStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .map_err(|e| IngestError::StoreUnavailableError(e.to_string()))?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl SecretStore for MySqlSecretStore {
    async fn fetch_credential(&self, device_id: &str) -> Result<DeviceCredential> {
        let row = sqlx::query_as::<_, SecretRow>(FETCH_CREDENTIAL)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| IngestError::StoreUnavailableError(e.to_string()))?;

        match row {
            Some(row) => Ok(DeviceCredential {
                device_id: device_id.to_string(),
                current_secret: row.secret_key,
                previous_secret: row.old_secret.filter(|s| !s.is_empty()),
            }),
            None => Err(IngestError::NotFoundError(device_id.to_string())),
        }
    }
}
