//! Admission gate for a daily-quota external API.
//!
//! Usage is an append-only log; "used today" is the sum of entries inside the
//! current day-window, which starts at `reset_hour` in the configured
//! timezone. No explicit zeroing happens at the reset boundary.
//!
//! The log is process-local. Two processes sharing one API key each see only
//! their own spend, so a single active ingestion process is assumed.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{QuotaStatus, UsageEntry};

/// How long usage entries are kept in memory
const RETENTION_DAYS: i64 = 2;

/// Quota limits for one provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Units available per day-window (default: 10000)
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,

    /// Headroom never spent by admission (default: 500)
    #[serde(default = "default_reserve_buffer")]
    pub reserve_buffer: u32,

    /// Local hour at which the window resets (default: 0)
    #[serde(default)]
    pub reset_hour: u32,
}

fn default_daily_limit() -> u32 {
    10_000
}
fn default_reserve_buffer() -> u32 {
    500
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_limit: default_daily_limit(),
            reserve_buffer: default_reserve_buffer(),
            reset_hour: 0,
        }
    }
}

/// Refused reservation
#[derive(Debug, Clone, Error)]
pub enum QuotaError {
    #[error("Quota refused for {operation}: requested {requested}, remaining {remaining} (buffer {buffer}), resets at {reset_at}")]
    Exhausted {
        operation: String,
        requested: u32,
        remaining: u32,
        buffer: u32,
        reset_at: DateTime<Utc>,
    },
}

impl QuotaError {
    pub fn reset_at(&self) -> DateTime<Utc> {
        match self {
            Self::Exhausted { reset_at, .. } => *reset_at,
        }
    }
}

/// Quota tracker for one provider
pub struct QuotaTracker {
    provider: String,
    config: QuotaConfig,
    timezone: Tz,
    log: Mutex<Vec<UsageEntry>>,
}

impl QuotaTracker {
    pub fn new(provider: impl Into<String>, config: QuotaConfig, timezone: Tz) -> Self {
        Self {
            provider: provider.into(),
            config,
            timezone,
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }

    fn log(&self) -> MutexGuard<'_, Vec<UsageEntry>> {
        self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed the log with previously persisted entries
    pub fn restore(&self, entries: Vec<UsageEntry>) {
        let mut log = self.log();
        log.extend(entries);
        log.sort_by_key(|e| e.timestamp);
    }

    /// Reset instant for a local calendar date
    fn reset_on(&self, date: NaiveDate) -> DateTime<Utc> {
        let naive = date
            .and_hms_opt(self.config.reset_hour.min(23), 0, 0)
            .unwrap_or_default();
        let local = self
            .timezone
            .from_local_datetime(&naive)
            .earliest()
            // Reset hour falls into a DST gap
            .or_else(|| {
                self.timezone
                    .from_local_datetime(&(naive + Duration::hours(1)))
                    .earliest()
            });
        match local {
            Some(ts) => ts.with_timezone(&Utc),
            None => Utc.from_utc_datetime(&naive),
        }
    }

    /// Next reset: today's reset instant if still ahead, else tomorrow's
    pub fn get_next_reset_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.with_timezone(&self.timezone).date_naive();
        let today_reset = self.reset_on(today);
        if now >= today_reset {
            self.reset_on(today + Duration::days(1))
        } else {
            today_reset
        }
    }

    /// Start of the day-window containing `now`
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.with_timezone(&self.timezone).date_naive();
        let today_reset = self.reset_on(today);
        if now >= today_reset {
            today_reset
        } else {
            self.reset_on(today - Duration::days(1))
        }
    }

    fn used_at(&self, log: &[UsageEntry], now: DateTime<Utc>) -> u32 {
        let start = self.window_start(now);
        log.iter()
            .filter(|e| e.timestamp >= start && e.timestamp <= now)
            .map(|e| e.units)
            .sum()
    }

    pub fn check_quota_status(&self) -> QuotaStatus {
        self.check_quota_status_at(Utc::now())
    }

    pub fn check_quota_status_at(&self, now: DateTime<Utc>) -> QuotaStatus {
        let used = self.used_at(&self.log(), now);
        let remaining = self.config.daily_limit.saturating_sub(used);
        QuotaStatus {
            used,
            remaining,
            limit: self.config.daily_limit,
            reset_at: self.get_next_reset_time(now),
            can_proceed: remaining > self.config.reserve_buffer,
        }
    }

    /// Advisory admission check. Never mutates the log.
    pub fn reserve_quota(&self, operation: &str, units: u32) -> bool {
        self.reserve_quota_at(operation, units, Utc::now())
    }

    pub fn reserve_quota_at(&self, operation: &str, units: u32, now: DateTime<Utc>) -> bool {
        self.try_reserve_at(operation, units, now).is_ok()
    }

    /// Like `reserve_quota`, but explains a refusal
    pub fn try_reserve(&self, operation: &str, units: u32) -> Result<(), QuotaError> {
        self.try_reserve_at(operation, units, Utc::now())
    }

    pub fn try_reserve_at(
        &self,
        operation: &str,
        units: u32,
        now: DateTime<Utc>,
    ) -> Result<(), QuotaError> {
        let status = self.check_quota_status_at(now);
        let needed = units.saturating_add(self.config.reserve_buffer);
        if status.remaining < needed {
            return Err(QuotaError::Exhausted {
                operation: operation.to_string(),
                requested: units,
                remaining: status.remaining,
                buffer: self.config.reserve_buffer,
                reset_at: status.reset_at,
            });
        }
        Ok(())
    }

    /// Record units actually spent by a successful call
    pub fn consume_quota(
        &self,
        operation: &str,
        units: u32,
        metadata: Option<serde_json::Value>,
    ) -> UsageEntry {
        self.consume_quota_at(operation, units, metadata, Utc::now())
    }

    pub fn consume_quota_at(
        &self,
        operation: &str,
        units: u32,
        metadata: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> UsageEntry {
        let entry = UsageEntry {
            operation: operation.to_string(),
            units,
            timestamp: now,
            metadata,
        };

        let mut log = self.log();
        log.push(entry.clone());

        let cutoff = now - Duration::days(RETENTION_DAYS);
        log.retain(|e| e.timestamp >= cutoff);

        entry
    }

    /// Number of entries currently held in memory
    pub fn log_len(&self) -> usize {
        self.log().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn tracker(limit: u32, buffer: u32, reset_hour: u32) -> QuotaTracker {
        QuotaTracker::new(
            "youtube",
            QuotaConfig {
                daily_limit: limit,
                reserve_buffer: buffer,
                reset_hour,
            },
            chrono_tz::UTC,
        )
    }

    #[test]
    fn test_can_proceed_is_strictly_above_buffer() {
        let quota = tracker(10_000, 500, 0);
        let now = at("2024-05-10T12:00:00Z");

        quota.consume_quota_at("seed", 9_500, None, now);
        let status = quota.check_quota_status_at(now);
        assert_eq!(status.used, 9_500);
        assert_eq!(status.remaining, 500);
        assert!(!status.can_proceed);

        let quota = tracker(10_000, 500, 0);
        quota.consume_quota_at("seed", 9_499, None, now);
        assert!(quota.check_quota_status_at(now).can_proceed);
    }

    #[test]
    fn test_reserve_refuses_within_buffer_without_mutating() {
        let quota = tracker(10_000, 500, 0);
        let now = at("2024-05-10T12:00:00Z");
        quota.consume_quota_at("seed", 9_600, None, now);

        // 9600 + 100 > 10000 - 500
        assert!(!quota.reserve_quota_at("search", 100, now));
        // 9600 + 1 > 9500
        assert!(!quota.reserve_quota_at("details", 1, now));

        let status = quota.check_quota_status_at(now);
        assert_eq!(status.used, 9_600);
        assert_eq!(quota.log_len(), 1);
    }

    #[test]
    fn test_reserve_allows_exact_fit() {
        let quota = tracker(1_000, 100, 0);
        let now = at("2024-05-10T12:00:00Z");
        quota.consume_quota_at("seed", 800, None, now);

        // remaining 200 == 100 units + 100 buffer
        assert!(quota.reserve_quota_at("list", 100, now));
        assert!(!quota.reserve_quota_at("list", 101, now));
    }

    #[test]
    fn test_refusal_reports_reset_time() {
        let quota = tracker(100, 10, 0);
        let now = at("2024-05-10T12:00:00Z");
        quota.consume_quota_at("seed", 95, None, now);

        let err = quota.try_reserve_at("search", 100, now).unwrap_err();
        assert_eq!(err.reset_at(), at("2024-05-11T00:00:00Z"));
    }

    #[test]
    fn test_usage_resets_at_reset_hour() {
        let quota = tracker(10_000, 500, 8);
        quota.consume_quota_at("search", 9_000, None, at("2024-05-10T09:00:00Z"));

        assert_eq!(
            quota
                .check_quota_status_at(at("2024-05-11T07:59:59Z"))
                .used,
            9_000
        );

        let after = quota.check_quota_status_at(at("2024-05-11T08:00:00Z"));
        assert_eq!(after.used, 0);
        assert_eq!(after.remaining, 10_000);
        assert!(after.can_proceed);
    }

    #[test]
    fn test_next_reset_time() {
        let quota = tracker(10_000, 500, 8);

        assert_eq!(
            quota.get_next_reset_time(at("2024-05-10T07:00:00Z")),
            at("2024-05-10T08:00:00Z")
        );
        assert_eq!(
            quota.get_next_reset_time(at("2024-05-10T08:00:00Z")),
            at("2024-05-11T08:00:00Z")
        );
        assert_eq!(
            quota.get_next_reset_time(at("2024-05-10T23:00:00Z")),
            at("2024-05-11T08:00:00Z")
        );
    }

    #[test]
    fn test_reset_hour_follows_timezone() {
        let quota = QuotaTracker::new(
            "youtube",
            QuotaConfig::default(),
            chrono_tz::America::Los_Angeles,
        );

        // Midnight Pacific during daylight time is 07:00 UTC
        assert_eq!(
            quota.get_next_reset_time(at("2024-07-01T12:00:00Z")),
            at("2024-07-02T07:00:00Z")
        );
    }

    #[test]
    fn test_consume_purges_entries_older_than_two_days() {
        let quota = tracker(10_000, 500, 0);
        quota.consume_quota_at("old", 5, None, at("2024-05-01T10:00:00Z"));
        quota.consume_quota_at("old", 5, None, at("2024-05-02T10:00:00Z"));
        assert_eq!(quota.log_len(), 2);

        quota.consume_quota_at("new", 1, None, at("2024-05-04T11:00:00Z"));
        assert_eq!(quota.log_len(), 1);
    }

    #[test]
    fn test_restore_seeds_current_window() {
        let quota = tracker(10_000, 500, 0);
        let now = at("2024-05-10T12:00:00Z");
        quota.restore(vec![UsageEntry {
            operation: "search.list".to_string(),
            units: 300,
            timestamp: at("2024-05-10T01:00:00Z"),
            metadata: None,
        }]);

        assert_eq!(quota.check_quota_status_at(now).used, 300);
    }
}
