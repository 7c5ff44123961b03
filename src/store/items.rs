//! Raw items, content and story persistence.
//!
//! The raw-item upsert is keyed by `(source_id, external_id)` and signals
//! "already seen" with `None`. Content/story creation runs in one
//! transaction so that a content hash can never produce two stories.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{from_millis, new_id, opt_from_millis, to_millis, Store, StoreError};
use crate::domain::{Content, ItemKind, NewRawItem, RawItem, RawItemStatus, Story};

const RAW_ITEM_COLUMNS: &str = "id, source_id, external_id, url, title, kind, metadata, status, attempts, published_at, discovered_at";
const STORY_COLUMNS: &str = "id, content_id, content_hash, canonical_url, title, published_at, cluster_key, analysis, created_at";

/// Extracted content ready to be stored
#[derive(Debug, Clone)]
pub struct NewContent {
    pub raw_item_id: String,
    pub text: String,
    pub content_hash: String,
    pub lang: Option<String>,
}

/// Story fields used when the content hash is new
#[derive(Debug, Clone)]
pub struct StoryDraft {
    pub canonical_url: String,
    pub title: String,
    pub published_at: Option<DateTime<Utc>>,
    pub cluster_key: String,
}

/// Result of attaching content to the story graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DedupOutcome {
    /// No story had this hash; one was created
    NewStory { story_id: String, content_id: String },
    /// A story with the same hash exists; the content was linked to it
    Attached { story_id: String, content_id: String },
}

impl DedupOutcome {
    pub fn story_id(&self) -> &str {
        match self {
            Self::NewStory { story_id, .. } | Self::Attached { story_id, .. } => story_id,
        }
    }
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn row_to_raw_item(row: &Row<'_>) -> rusqlite::Result<RawItem> {
    let kind: String = row.get(5)?;
    let metadata: String = row.get(6)?;
    let status: String = row.get(7)?;

    Ok(RawItem {
        id: row.get(0)?,
        source_id: row.get(1)?,
        external_id: row.get(2)?,
        url: row.get(3)?,
        title: row.get(4)?,
        kind: kind
            .parse::<ItemKind>()
            .map_err(|e| conversion_error(5, std::io::Error::other(e.to_string())))?,
        metadata: serde_json::from_str(&metadata).map_err(|e| conversion_error(6, e))?,
        status: status
            .parse::<RawItemStatus>()
            .map_err(|e| conversion_error(7, std::io::Error::other(e.to_string())))?,
        attempts: row.get(8)?,
        published_at: opt_from_millis(row.get(9)?),
        discovered_at: from_millis(row.get(10)?),
    })
}

fn row_to_story(row: &Row<'_>) -> rusqlite::Result<Story> {
    let analysis: Option<String> = row.get(7)?;
    let analysis = analysis
        .map(|a| serde_json::from_str(&a))
        .transpose()
        .map_err(|e| conversion_error(7, e))?;

    Ok(Story {
        id: row.get(0)?,
        content_id: row.get(1)?,
        content_hash: row.get(2)?,
        canonical_url: row.get(3)?,
        title: row.get(4)?,
        published_at: opt_from_millis(row.get(5)?),
        cluster_key: row.get(6)?,
        analysis,
        created_at: from_millis(row.get(8)?),
    })
}

/// Insert on an open connection or transaction; `None` when already seen
pub(crate) fn insert_raw_item(conn: &Connection, item: &NewRawItem) -> Result<Option<String>, StoreError> {
    let id = new_id();
    let inserted = conn.execute(
        "INSERT INTO raw_items (id, source_id, external_id, url, title, kind, metadata, status, attempts, published_at, discovered_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', 0, ?8, ?9)
         ON CONFLICT (source_id, external_id) DO NOTHING",
        params![
            id,
            item.source_id,
            item.external_id,
            item.url,
            item.title,
            item.kind.as_str(),
            serde_json::to_string(&item.metadata)?,
            item.published_at.map(to_millis),
            to_millis(Utc::now()),
        ],
    )?;

    Ok(if inserted > 0 { Some(id) } else { None })
}

impl Store {
    /// Insert a raw item unless (source_id, external_id) is already known.
    ///
    /// Returns the new id, or `None` when the item was already seen.
    pub fn upsert_raw_item(&self, item: &NewRawItem) -> Result<Option<String>, StoreError> {
        let conn = self.conn()?;
        insert_raw_item(&conn, item)
    }

    pub fn get_raw_item(&self, id: &str) -> Result<Option<RawItem>, StoreError> {
        let conn = self.conn()?;
        let item = conn
            .query_row(
                &format!("SELECT {} FROM raw_items WHERE id = ?1", RAW_ITEM_COLUMNS),
                params![id],
                row_to_raw_item,
            )
            .optional()?;
        Ok(item)
    }

    pub fn find_raw_item(
        &self,
        source_id: &str,
        external_id: &str,
    ) -> Result<Option<RawItem>, StoreError> {
        let conn = self.conn()?;
        let item = conn
            .query_row(
                &format!(
                    "SELECT {} FROM raw_items WHERE source_id = ?1 AND external_id = ?2",
                    RAW_ITEM_COLUMNS
                ),
                params![source_id, external_id],
                row_to_raw_item,
            )
            .optional()?;
        Ok(item)
    }

    /// Record the outcome of a fetch attempt. Failures bump `attempts`.
    pub fn mark_raw_item(
        &self,
        id: &str,
        status: RawItemStatus,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let bump = matches!(status, RawItemStatus::Failed) as i64;
        let changed = conn.execute(
            "UPDATE raw_items SET status = ?2, last_error = ?3, attempts = attempts + ?4 WHERE id = ?1",
            params![id, status.as_str(), error, bump],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("raw item {}", id)));
        }
        Ok(())
    }

    pub fn count_raw_items_by_status(&self) -> Result<HashMap<String, u64>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM raw_items GROUP BY status")?;
        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64)))?
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(counts)
    }

    pub fn find_story_id_by_content_hash(&self, hash: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn()?;
        let id = conn
            .query_row(
                "SELECT id FROM stories WHERE content_hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    /// Store content for a raw item and create or attach its story.
    ///
    /// Redelivery of the same raw item reuses the stored content; if that
    /// content created the story, `NewStory` is reported again so downstream
    /// analysis can be re-enqueued.
    pub fn attach_content(
        &self,
        content: &NewContent,
        draft: &StoryDraft,
    ) -> Result<DedupOutcome, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = to_millis(Utc::now());

        let existing: Option<(String, String)> = tx
            .query_row(
                "SELECT id, content_hash FROM contents WHERE raw_item_id = ?1",
                params![content.raw_item_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (content_id, hash) = match existing {
            Some(found) => found,
            None => {
                let id = new_id();
                tx.execute(
                    "INSERT INTO contents (id, raw_item_id, text, content_hash, lang, extracted_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        id,
                        content.raw_item_id,
                        content.text,
                        content.content_hash,
                        content.lang,
                        now
                    ],
                )?;
                (id, content.content_hash.clone())
            }
        };

        let story: Option<(String, String)> = tx
            .query_row(
                "SELECT id, content_id FROM stories WHERE content_hash = ?1",
                params![hash],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let outcome = match story {
            Some((story_id, owner)) if owner == content_id => DedupOutcome::NewStory {
                story_id,
                content_id,
            },
            Some((story_id, _)) => {
                tx.execute(
                    "INSERT OR IGNORE INTO story_observations (story_id, content_id, observed_at)
                     VALUES (?1, ?2, ?3)",
                    params![story_id, content_id, now],
                )?;
                DedupOutcome::Attached {
                    story_id,
                    content_id,
                }
            }
            None => {
                let story_id = new_id();
                tx.execute(
                    "INSERT INTO stories (id, content_id, content_hash, canonical_url, title, published_at, cluster_key, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        story_id,
                        content_id,
                        hash,
                        draft.canonical_url,
                        draft.title,
                        draft.published_at.map(to_millis),
                        draft.cluster_key,
                        now
                    ],
                )?;
                DedupOutcome::NewStory {
                    story_id,
                    content_id,
                }
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    pub fn get_story(&self, id: &str) -> Result<Option<Story>, StoreError> {
        let conn = self.conn()?;
        let story = conn
            .query_row(
                &format!("SELECT {} FROM stories WHERE id = ?1", STORY_COLUMNS),
                params![id],
                row_to_story,
            )
            .optional()?;
        Ok(story)
    }

    pub fn get_content(&self, id: &str) -> Result<Option<Content>, StoreError> {
        let conn = self.conn()?;
        let content = conn
            .query_row(
                "SELECT id, raw_item_id, text, content_hash, lang, extracted_at FROM contents WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Content {
                        id: row.get(0)?,
                        raw_item_id: row.get(1)?,
                        text: row.get(2)?,
                        content_hash: row.get(3)?,
                        lang: row.get(4)?,
                        extracted_at: from_millis(row.get(5)?),
                    })
                },
            )
            .optional()?;
        Ok(content)
    }

    /// Content ids observed for a story beyond the one that created it
    pub fn story_observations(&self, story_id: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT content_id FROM story_observations WHERE story_id = ?1 ORDER BY observed_at",
        )?;
        let ids = stmt
            .query_map(params![story_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    pub fn set_story_analysis(
        &self,
        story_id: &str,
        analysis: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE stories SET analysis = ?2, analyzed_at = ?3 WHERE id = ?1",
            params![story_id, serde_json::to_string(analysis)?, to_millis(Utc::now())],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("story {}", story_id)));
        }
        Ok(())
    }

    /// (contents, stories) row counts
    pub fn count_contents_and_stories(&self) -> Result<(u64, u64), StoreError> {
        let conn = self.conn()?;
        let counts = conn.query_row(
            "SELECT (SELECT COUNT(*) FROM contents), (SELECT COUNT(*) FROM stories)",
            [],
            |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64)),
        )?;
        Ok(counts)
    }
}
