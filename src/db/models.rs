//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Label reported for an endpoint that has never been successfully probed.
pub const UNKNOWN_LABEL: &str = "unknown";

/// A tracked endpoint.
///
/// Identity is the opaque `address` string (host:port or equivalent). The
/// live polling state (sample buffer, retry counter) is owned by the
/// scheduler; this row is the durable projection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    pub name: String,
    pub last_label: String,
    pub failure_count: i64,
    /// When false, transitions on this endpoint never reach subscribers.
    pub notifications_enabled: bool,
    pub last_transition: Option<DateTime<Utc>>,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            address: String::new(),
            name: String::new(),
            last_label: UNKNOWN_LABEL.to_string(),
            failure_count: 0,
            notifications_enabled: true,
            last_transition: None,
        }
    }
}

/// One historical period of a given activity label on a given endpoint,
/// bucketed by day. Keyed by (address, label, day).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub address: String,
    pub label: String,
    /// Date bucket, "YYYY-MM-DD".
    pub day: String,
    /// Cumulative minutes the label was current. Only ever increases.
    pub playtime_minutes: i64,
    /// How many times this label became current. Only ever increases.
    pub occurrences: i64,
    pub avg_population: i64,
    pub last_observed: DateTime<Utc>,
}

/// A subscriber's interest pattern: either an exact label or a textual
/// pattern, both matched case-insensitively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub subscriber_id: i64,
    pub pattern: String,
}

/// A persistent rendering destination for one endpoint and tracking group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryTarget {
    pub address: String,
    pub group_id: i64,
    pub sink_id: i64,
    /// Reference to the last rendered message, 0 if none yet.
    pub last_message_ref: i64,
}
