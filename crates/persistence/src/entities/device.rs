//! Device entity (database row mapping).

use chrono::{DateTime, Utc};
use domain::models::{Device, DeviceStatus};
use domain::store::StoreError;
use sqlx::FromRow;
use uuid::Uuid;

/// Database row mapping for the devices table.
#[derive(Debug, Clone, FromRow)]
pub struct DeviceEntity {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub status: String,
    pub session_token: Option<String>,
    pub qr_payload: Option<String>,
    pub qr_issued_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DeviceEntity> for Device {
    type Error = StoreError;

    fn try_from(entity: DeviceEntity) -> Result<Self, Self::Error> {
        let status: DeviceStatus = entity.status.parse().map_err(StoreError::Corrupt)?;
        Ok(Self {
            id: entity.id,
            user_id: entity.user_id,
            name: entity.name,
            status,
            session_token: entity.session_token,
            qr_payload: entity.qr_payload,
            qr_issued_at: entity.qr_issued_at,
            last_error: entity.last_error,
            last_activity_at: entity.last_activity_at,
            created_at: entity.created_at,
            updated_at: entity.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(status: &str) -> DeviceEntity {
        let now = Utc::now();
        DeviceEntity {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            name: "Front desk".to_string(),
            status: status.to_string(),
            session_token: Some("tok".to_string()),
            qr_payload: None,
            qr_issued_at: None,
            last_error: None,
            last_activity_at: Some(now),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_device_entity_to_domain() {
        let e = entity("qr_pending");
        let id = e.id;
        let device = Device::try_from(e).unwrap();
        assert_eq!(device.id, id);
        assert_eq!(device.status, DeviceStatus::QrPending);
        assert_eq!(device.session_token.as_deref(), Some("tok"));
    }

    #[test]
    fn test_device_entity_unknown_status_is_corrupt() {
        let err = Device::try_from(entity("paired")).unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }
}
