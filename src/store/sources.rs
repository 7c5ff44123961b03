//! Source registration, lookup and pause/resume.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};

use super::{from_millis, opt_from_millis, to_millis, Store, StoreError};
use crate::domain::{Source, SourceFamily, SourceKind};

const SOURCE_COLUMNS: &str = "id, name, kind, url, metadata, active, last_checked, created_at";

/// Fixed id of the source owning operator-submitted URLs
pub const MANUAL_SOURCE_ID: &str = "manual";

fn row_to_source(row: &Row<'_>) -> rusqlite::Result<Source> {
    let metadata: String = row.get(4)?;
    let kind: SourceKind = serde_json::from_str(&metadata)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;

    Ok(Source {
        id: row.get(0)?,
        name: row.get(1)?,
        kind,
        url: row.get(3)?,
        active: row.get::<_, i64>(5)? != 0,
        last_checked: opt_from_millis(row.get(6)?),
        created_at: from_millis(row.get(7)?),
    })
}

impl Store {
    /// Register a source (replaces an existing row with the same id)
    pub fn insert_source(&self, source: &Source) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO sources (id, name, kind, url, metadata, active, last_checked, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                source.id,
                source.name,
                source.kind.as_str(),
                source.url,
                serde_json::to_string(&source.kind)?,
                source.active as i64,
                source.last_checked.map(to_millis),
                to_millis(source.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_source(&self, id: &str) -> Result<Option<Source>, StoreError> {
        let conn = self.conn()?;
        let source = conn
            .query_row(
                &format!("SELECT {} FROM sources WHERE id = ?1", SOURCE_COLUMNS),
                params![id],
                row_to_source,
            )
            .optional()?;
        Ok(source)
    }

    /// All sources, oldest first
    pub fn list_sources(&self) -> Result<Vec<Source>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM sources ORDER BY created_at",
            SOURCE_COLUMNS
        ))?;
        let sources = stmt
            .query_map([], row_to_source)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sources)
    }

    /// Active sources pulled by the given family
    pub fn list_active_sources(&self, family: SourceFamily) -> Result<Vec<Source>, StoreError> {
        Ok(self
            .list_sources()?
            .into_iter()
            .filter(|s| s.active && s.kind.family() == Some(family))
            .collect())
    }

    /// Pause or resume a source. Returns false if the id is unknown.
    pub fn set_source_active(&self, id: &str, active: bool) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE sources SET active = ?2 WHERE id = ?1",
            params![id, active as i64],
        )?;
        Ok(changed > 0)
    }

    pub fn touch_source_checked(&self, id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sources SET last_checked = ?2 WHERE id = ?1",
            params![id, to_millis(at)],
        )?;
        Ok(())
    }

    /// Persist new kind metadata (cursor state) for a source
    pub fn update_source_kind(&self, id: &str, kind: &SourceKind) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE sources SET kind = ?2, metadata = ?3 WHERE id = ?1",
            params![id, kind.as_str(), serde_json::to_string(kind)?],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("source {}", id)));
        }
        Ok(())
    }

    /// The source that owns one-off operator submissions, created on first use
    pub fn ensure_manual_source(&self) -> Result<Source, StoreError> {
        if let Some(source) = self.get_source(MANUAL_SOURCE_ID)? {
            return Ok(source);
        }

        let mut source = Source::new("Manual submissions", SourceKind::Manual, "manual://");
        source.id = MANUAL_SOURCE_ID.to_string();
        self.insert_source(&source)?;
        Ok(source)
    }

    /// (total, active) source counts
    pub fn count_sources(&self) -> Result<(u64, u64), StoreError> {
        let conn = self.conn()?;
        let counts = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(active), 0) FROM sources",
            [],
            |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64)),
        )?;
        Ok(counts)
    }
}
