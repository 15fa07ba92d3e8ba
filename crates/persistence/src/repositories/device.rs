//! Device repository for database operations.

use async_trait::async_trait;
use chrono::Utc;
use domain::models::Device;
use domain::store::{DeviceSessionRecord, DeviceStore, StoreError};
use sqlx::PgPool;
use uuid::Uuid;

use crate::entities::DeviceEntity;
use crate::metrics::QueryTimer;

/// Repository for device rows and their session columns.
#[derive(Clone)]
pub struct DeviceRepository {
    pool: PgPool,
}

impl DeviceRepository {
    /// Creates a new DeviceRepository with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn insert(&self, device: &Device) -> Result<(), sqlx::Error> {
        let timer = QueryTimer::new("insert_device");
        let result = sqlx::query(
            r#"
            INSERT INTO devices (id, user_id, name, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(device.id)
        .bind(device.user_id)
        .bind(&device.name)
        .bind(device.status.as_str())
        .bind(device.created_at)
        .bind(device.updated_at)
        .execute(&self.pool)
        .await;
        timer.observe(&result);
        result.map(|_| ())
    }

    /// Find a device by its id.
    pub async fn find_by_id(&self, device_id: Uuid) -> Result<Option<DeviceEntity>, sqlx::Error> {
        let timer = QueryTimer::new("find_device_by_id");
        let result = sqlx::query_as::<_, DeviceEntity>(
            r#"
            SELECT id, user_id, name, status, session_token, qr_payload, qr_issued_at,
                   last_error, last_activity_at, created_at, updated_at
            FROM devices
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await;
        timer.observe(&result);
        result
    }

    pub async fn find_by_user(&self, user_id: Uuid) -> Result<Vec<DeviceEntity>, sqlx::Error> {
        let timer = QueryTimer::new("find_devices_by_user");
        let result = sqlx::query_as::<_, DeviceEntity>(
            r#"
            SELECT id, user_id, name, status, session_token, qr_payload, qr_issued_at,
                   last_error, last_activity_at, created_at, updated_at
            FROM devices
            WHERE user_id = $1 AND deleted_at IS NULL
            ORDER BY created_at ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await;
        timer.observe(&result);
        result
    }

    /// Marks the device deleted and clears its session columns. The row
    /// stays so broadcast history keeps its device reference.
    pub async fn soft_delete_by_id(&self, device_id: Uuid) -> Result<u64, sqlx::Error> {
        let timer = QueryTimer::new("soft_delete_device");
        let result = sqlx::query(
            r#"
            UPDATE devices
            SET deleted_at = NOW(),
                status = 'disconnected',
                session_token = NULL,
                qr_payload = NULL,
                qr_issued_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(device_id)
        .execute(&self.pool)
        .await;
        timer.observe(&result);
        Ok(result?.rows_affected())
    }

    /// Writes the session columns of one device.
    pub async fn update_session(&self, record: &DeviceSessionRecord) -> Result<u64, sqlx::Error> {
        let timer = QueryTimer::new("update_device_session");
        let result = sqlx::query(
            r#"
            UPDATE devices
            SET status = $2,
                session_token = $3,
                qr_payload = $4,
                qr_issued_at = $5,
                last_error = $6,
                last_activity_at = $7,
                updated_at = $8
            WHERE id = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(record.device_id)
        .bind(record.status.as_str())
        .bind(record.session_token.as_deref())
        .bind(record.qr_payload.as_deref())
        .bind(record.qr_issued_at)
        .bind(record.last_error.as_deref())
        .bind(record.last_activity_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await;
        timer.observe(&result);
        Ok(result?.rows_affected())
    }

    /// Resets every device that claims a live session. Used at startup, when
    /// no provider handle from the previous process survives.
    pub async fn disconnect_all_live(&self) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE devices
            SET status = 'disconnected',
                session_token = NULL,
                qr_payload = NULL,
                qr_issued_at = NULL,
                updated_at = NOW()
            WHERE status IN ('connecting', 'qr_pending', 'connected')
              AND deleted_at IS NULL
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl DeviceStore for DeviceRepository {
    async fn create(&self, device: &Device) -> Result<(), StoreError> {
        Ok(self.insert(device).await?)
    }

    async fn find(&self, device_id: Uuid) -> Result<Option<Device>, StoreError> {
        self.find_by_id(device_id)
            .await?
            .map(Device::try_from)
            .transpose()
    }

    async fn list_for_user(&self, user_id: Uuid) -> Result<Vec<Device>, StoreError> {
        self.find_by_user(user_id)
            .await?
            .into_iter()
            .map(Device::try_from)
            .collect()
    }

    async fn delete(&self, device_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.soft_delete_by_id(device_id).await? > 0)
    }

    async fn save_session(&self, record: &DeviceSessionRecord) -> Result<(), StoreError> {
        if self.update_session(record).await? == 0 {
            tracing::warn!(device_id = %record.device_id, "Session saved for missing device");
        }
        Ok(())
    }

    async fn reset_live_sessions(&self) -> Result<u64, StoreError> {
        Ok(self.disconnect_all_live().await?)
    }
}
