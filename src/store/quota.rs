//! Quota usage persistence.
//!
//! The quota tracker keeps its authoritative log in memory; these rows let a
//! restarted process recover the spend of the current window.

use chrono::{DateTime, Utc};
use rusqlite::params;

use super::{from_millis, to_millis, Store, StoreError};
use crate::domain::quota::{QuotaStatus, UsageEntry};

impl Store {
    pub fn record_quota_usage(&self, provider: &str, entry: &UsageEntry) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let metadata = entry
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            "INSERT INTO quota_usage (provider, operation, units, metadata, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                provider,
                entry.operation,
                entry.units,
                metadata,
                to_millis(entry.timestamp)
            ],
        )?;
        Ok(())
    }

    /// Usage entries recorded at or after `since`, oldest first
    pub fn load_quota_usage(
        &self,
        provider: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<UsageEntry>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT operation, units, metadata, recorded_at FROM quota_usage
             WHERE provider = ?1 AND recorded_at >= ?2 ORDER BY recorded_at",
        )?;
        let rows = stmt
            .query_map(params![provider, to_millis(since)], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(operation, units, metadata, at)| -> Result<UsageEntry, StoreError> {
                Ok(UsageEntry {
                    operation,
                    units,
                    timestamp: from_millis(at),
                    metadata: metadata.map(|m| serde_json::from_str(&m)).transpose()?,
                })
            })
            .collect()
    }

    /// Drop usage rows older than `before`
    pub fn purge_quota_usage(&self, provider: &str, before: DateTime<Utc>) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let removed = conn.execute(
            "DELETE FROM quota_usage WHERE provider = ?1 AND recorded_at < ?2",
            params![provider, to_millis(before)],
        )?;
        Ok(removed)
    }

    pub fn save_quota_snapshot(&self, provider: &str, status: &QuotaStatus) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO quota_snapshots (provider, used, remaining, daily_limit, reset_at, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (provider) DO UPDATE SET
                used = excluded.used,
                remaining = excluded.remaining,
                daily_limit = excluded.daily_limit,
                reset_at = excluded.reset_at,
                recorded_at = excluded.recorded_at",
            params![
                provider,
                status.used,
                status.remaining,
                status.limit,
                to_millis(status.reset_at),
                to_millis(Utc::now())
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_usage_reload_respects_window() {
        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();

        for (units, age_hours) in [(100, 30), (1, 2), (50, 1)] {
            store
                .record_quota_usage(
                    "youtube",
                    &UsageEntry {
                        operation: "search.list".to_string(),
                        units,
                        timestamp: now - Duration::hours(age_hours),
                        metadata: None,
                    },
                )
                .unwrap();
        }

        let recent = store
            .load_quota_usage("youtube", now - Duration::hours(24))
            .unwrap();
        assert_eq!(recent.iter().map(|e| e.units).sum::<u32>(), 51);

        let removed = store
            .purge_quota_usage("youtube", now - Duration::hours(24))
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.load_quota_usage("other", now - Duration::days(3)).unwrap().is_empty());
    }
}
