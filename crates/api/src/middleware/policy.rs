//! Typed capability policy.
//!
//! Handlers call [`require`] before touching the core; the core itself never
//! looks at scopes.

use std::fmt;
use std::str::FromStr;

use crate::error::ApiError;
use crate::middleware::user_auth::UserAuth;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    DevicesRead,
    DevicesManage,
    BroadcastsRead,
    BroadcastsWrite,
    MessagesSend,
    EventsSubscribe,
}

impl Capability {
    pub const ALL: [Capability; 6] = [
        Capability::DevicesRead,
        Capability::DevicesManage,
        Capability::BroadcastsRead,
        Capability::BroadcastsWrite,
        Capability::MessagesSend,
        Capability::EventsSubscribe,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::DevicesRead => "devices:read",
            Capability::DevicesManage => "devices:manage",
            Capability::BroadcastsRead => "broadcasts:read",
            Capability::BroadcastsWrite => "broadcasts:write",
            Capability::MessagesSend => "messages:send",
            Capability::EventsSubscribe => "events:subscribe",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("unknown capability: {}", s))
    }
}

/// Fails with 403 unless the caller holds `capability`.
pub fn require(auth: &UserAuth, capability: Capability) -> Result<(), ApiError> {
    if auth.has(capability) {
        Ok(())
    } else {
        tracing::debug!(user_id = %auth.user_id, capability = %capability, "Capability missing");
        Err(ApiError::Forbidden(format!("missing capability {}", capability)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn auth(capabilities: Vec<Capability>) -> UserAuth {
        UserAuth {
            user_id: Uuid::new_v4(),
            jti: "jti".to_string(),
            capabilities,
        }
    }

    #[test]
    fn test_capability_strings_roundtrip() {
        for capability in Capability::ALL {
            assert_eq!(capability.as_str().parse::<Capability>().unwrap(), capability);
        }
        assert!("admin".parse::<Capability>().is_err());
    }

    #[test]
    fn test_require() {
        let caller = auth(vec![Capability::BroadcastsRead]);
        assert!(require(&caller, Capability::BroadcastsRead).is_ok());
        assert!(matches!(
            require(&caller, Capability::BroadcastsWrite),
            Err(ApiError::Forbidden(_))
        ));
    }
}
