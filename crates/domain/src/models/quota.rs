//! Quota domain model.

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Metered resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Messages,
    Devices,
    ApiRequests,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [
        ResourceKind::Messages,
        ResourceKind::Devices,
        ResourceKind::ApiRequests,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Messages => "messages",
            ResourceKind::Devices => "devices",
            ResourceKind::ApiRequests => "api_requests",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "messages" => Ok(ResourceKind::Messages),
            "devices" => Ok(ResourceKind::Devices),
            "api_requests" => Ok(ResourceKind::ApiRequests),
            other => Err(format!("unknown resource kind: {}", other)),
        }
    }
}

/// Limit for one resource within a period.
///
/// Serialized as a number, or the string `"unlimited"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaLimit {
    Limited(i64),
    Unlimited,
}

impl QuotaLimit {
    /// Builds a limit from a plan column where negative means unlimited.
    pub fn from_plan_value(value: Option<i64>) -> Self {
        match value {
            Some(v) if v >= 0 => QuotaLimit::Limited(v),
            _ => QuotaLimit::Unlimited,
        }
    }

    /// Whether one more unit is allowed on top of `used`.
    pub fn allows(&self, used: i64) -> bool {
        match self {
            QuotaLimit::Limited(limit) => used < *limit,
            QuotaLimit::Unlimited => true,
        }
    }

    pub fn as_option(&self) -> Option<i64> {
        match self {
            QuotaLimit::Limited(limit) => Some(*limit),
            QuotaLimit::Unlimited => None,
        }
    }
}

impl Serialize for QuotaLimit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            QuotaLimit::Limited(limit) => serializer.serialize_i64(*limit),
            QuotaLimit::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

impl fmt::Display for QuotaLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuotaLimit::Limited(limit) => write!(f, "{}", limit),
            QuotaLimit::Unlimited => f.write_str("unlimited"),
        }
    }
}

/// Per-plan limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlanLimits {
    pub messages: QuotaLimit,
    pub devices: QuotaLimit,
    pub api_requests: QuotaLimit,
}

impl PlanLimits {
    pub fn get(&self, kind: ResourceKind) -> QuotaLimit {
        match kind {
            ResourceKind::Messages => self.messages,
            ResourceKind::Devices => self.devices,
            ResourceKind::ApiRequests => self.api_requests,
        }
    }

    pub fn unlimited() -> Self {
        Self {
            messages: QuotaLimit::Unlimited,
            devices: QuotaLimit::Unlimited,
            api_requests: QuotaLimit::Unlimited,
        }
    }
}

/// Result of a quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaCheck {
    pub resource: ResourceKind,
    pub allowed: bool,
    pub current: i64,
    pub limit: QuotaLimit,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

/// Calendar-month accounting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QuotaPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl QuotaPeriod {
    /// The month containing `now`, with boundaries at local midnight of the
    /// first day in the reference offset.
    pub fn containing(now: DateTime<Utc>, offset: FixedOffset) -> Self {
        let local = now.with_timezone(&offset);
        let (year, month) = (local.year(), local.month());
        let (next_year, next_month) = if month == 12 {
            (year + 1, 1)
        } else {
            (year, month + 1)
        };

        Self {
            start: month_start(year, month, offset),
            end: month_start(next_year, next_month, offset),
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start && at < self.end
    }
}

fn month_start(year: i32, month: u32, offset: FixedOffset) -> DateTime<Utc> {
    let naive = NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default();
    // A fixed offset maps every local time to exactly one instant
    offset
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

/// Persisted usage counter, keyed by `(user_id, resource, period_start)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaCounter {
    pub user_id: Uuid,
    pub resource: ResourceKind,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub count: i64,
}
