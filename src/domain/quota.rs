//! Quota bookkeeping records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One successful costed call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEntry {
    pub operation: String,
    pub units: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Point-in-time view of a provider's quota window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaStatus {
    pub used: u32,
    pub remaining: u32,
    pub limit: u32,
    pub reset_at: DateTime<Utc>,
    pub can_proceed: bool,
}
