//! Local store for recap.
//!
//! Holds three tables in one SQLite database:
//! - `records`: normalized messages and pages, upserted by `(source, id)`
//! - `sync_state`: one watermark per source
//! - `summary_cache`: the latest summary per `(scope, kind)`

use std::path::Path;
use std::str::FromStr;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool};
use tracing::{info, instrument, warn};

pub mod model;

pub use model::{CacheRow, NormalizedRecord, Source, SyncWatermark, TimeFilter, DAY_SECS};

type RecordRow = (
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    i64,
    bool,
    bool,
    bool,
    String,
);

const RECORD_COLUMNS: &str =
    "source, id, parent_id, sender, title, body, timestamp, unread, from_me, has_media, source_meta";

#[derive(Clone)]
pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::from_str("sqlite:")?
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema(true).await?;
        info!("Local store opened at {}", db_path.display());
        Ok(store)
    }

    /// Single-connection in-memory store. The connection is pinned so the
    /// database lives as long as the pool.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema(false).await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    #[instrument(skip_all)]
    async fn init_schema(&self, wal: bool) -> Result<()> {
        if wal {
            sqlx::query("PRAGMA journal_mode=WAL;")
                .execute(&self.pool)
                .await?;
        }
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS records (\
                source TEXT NOT NULL,\
                id TEXT NOT NULL,\
                parent_id TEXT,\
                sender TEXT,\
                title TEXT,\
                body TEXT NOT NULL,\
                timestamp INTEGER NOT NULL,\
                unread INTEGER NOT NULL DEFAULT 0,\
                from_me INTEGER NOT NULL DEFAULT 0,\
                has_media INTEGER NOT NULL DEFAULT 0,\
                source_meta TEXT NOT NULL DEFAULT 'null',\
                PRIMARY KEY (source, id)\
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_records_source_ts ON records(source, timestamp)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sync_state (\
                source TEXT PRIMARY KEY,\
                last_sync_at INTEGER NOT NULL,\
                records_synced INTEGER NOT NULL DEFAULT 0\
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS summary_cache (\
                scope TEXT NOT NULL,\
                kind TEXT NOT NULL,\
                payload TEXT NOT NULL,\
                created_at_ms INTEGER NOT NULL,\
                PRIMARY KEY (scope, kind)\
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn upsert(&self, record: &NormalizedRecord) -> Result<()> {
        upsert_query(record)?.execute(&self.pool).await?;
        Ok(())
    }

    /// Upsert a batch in one transaction.
    ///
    /// Returns how many records were not stored before. Overwrites of known
    /// ids, and repeats inside the batch, are written but not counted.
    pub async fn bulk_upsert(&self, records: &[NormalizedRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let before: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records")
            .fetch_one(&mut *tx)
            .await?;
        for record in records {
            upsert_query(record)?.execute(&mut *tx).await?;
        }
        let after: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records")
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok((after - before).max(0) as usize)
    }

    pub async fn get_record(&self, source: Source, id: &str) -> Result<Option<NormalizedRecord>> {
        let sql = format!("SELECT {} FROM records WHERE source = ?1 AND id = ?2", RECORD_COLUMNS);
        let row = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(source.as_str())
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(record_from_row))
    }

    /// Records for `source` inside `filter`, newest first.
    pub async fn query(
        &self,
        source: Source,
        filter: TimeFilter,
        now: DateTime<Utc>,
    ) -> Result<Vec<NormalizedRecord>> {
        let since = filter.cutoff(now).unwrap_or(i64::MIN);
        let sql = format!(
            "SELECT {} FROM records WHERE source = ?1 AND timestamp >= ?2 ORDER BY timestamp DESC",
            RECORD_COLUMNS
        );
        let rows = sqlx::query_as::<_, RecordRow>(&sql)
            .bind(source.as_str())
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().filter_map(record_from_row).collect())
    }

    pub async fn record_count(&self, source: Source) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM records WHERE source = ?1")
            .bind(source.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn get_watermark(&self, source: Source) -> Result<Option<SyncWatermark>> {
        let row = sqlx::query_as::<_, (i64, i64)>(
            "SELECT last_sync_at, records_synced FROM sync_state WHERE source = ?1",
        )
        .bind(source.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(last_sync_at, records_synced)| SyncWatermark {
            source,
            last_sync_at,
            records_synced,
        }))
    }

    /// Advance the watermark for `source`. `last_sync_at` never moves backwards.
    pub async fn set_watermark(&self, source: Source, at: i64, count: usize) -> Result<SyncWatermark> {
        let (last_sync_at, records_synced) = sqlx::query_as::<_, (i64, i64)>(
            "INSERT INTO sync_state (source, last_sync_at, records_synced) VALUES (?1, ?2, ?3) \
            ON CONFLICT(source) DO UPDATE SET \
                last_sync_at = MAX(sync_state.last_sync_at, excluded.last_sync_at), \
                records_synced = excluded.records_synced \
            RETURNING last_sync_at, records_synced",
        )
        .bind(source.as_str())
        .bind(at)
        .bind(count as i64)
        .fetch_one(&self.pool)
        .await?;

        if last_sync_at > at {
            warn!(
                "Watermark for {} kept at {} (requested {})",
                source, last_sync_at, at
            );
        }

        Ok(SyncWatermark {
            source,
            last_sync_at,
            records_synced,
        })
    }

    /// Forget the watermark so the next sync pulls the full window again.
    pub async fn clear_watermark(&self, source: Source) -> Result<()> {
        sqlx::query("DELETE FROM sync_state WHERE source = ?1")
            .bind(source.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn watermarks(&self) -> Result<Vec<SyncWatermark>> {
        let rows = sqlx::query_as::<_, (String, i64, i64)>(
            "SELECT source, last_sync_at, records_synced FROM sync_state ORDER BY source",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .filter_map(|(source, last_sync_at, records_synced)| {
                Source::from_str(&source).ok().map(|source| SyncWatermark {
                    source,
                    last_sync_at,
                    records_synced,
                })
            })
            .collect())
    }

    pub async fn get_cache_entry(&self, scope: &str, kind: &str) -> Result<Option<CacheRow>> {
        let row = sqlx::query_as::<_, (String, i64)>(
            "SELECT payload, created_at_ms FROM summary_cache WHERE scope = ?1 AND kind = ?2",
        )
        .bind(scope)
        .bind(kind)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(payload, created_at_ms)| CacheRow {
            scope: scope.to_string(),
            kind: kind.to_string(),
            payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::String(payload)),
            created_at_ms,
        }))
    }

    /// Create or replace the entry for `(row.scope, row.kind)`.
    pub async fn put_cache_entry(&self, row: &CacheRow) -> Result<()> {
        let payload = serde_json::to_string(&row.payload)?;
        sqlx::query(
            "INSERT INTO summary_cache (scope, kind, payload, created_at_ms) VALUES (?1, ?2, ?3, ?4) \
            ON CONFLICT(scope, kind) DO UPDATE SET \
                payload = excluded.payload, \
                created_at_ms = excluded.created_at_ms",
        )
        .bind(&row.scope)
        .bind(&row.kind)
        .bind(payload)
        .bind(row.created_at_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn cache_entries(&self) -> Result<Vec<CacheRow>> {
        let rows = sqlx::query_as::<_, (String, String, String, i64)>(
            "SELECT scope, kind, payload, created_at_ms FROM summary_cache ORDER BY scope, kind",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(scope, kind, payload, created_at_ms)| CacheRow {
                scope,
                kind,
                payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::String(payload)),
                created_at_ms,
            })
            .collect())
    }

    /// Flush and close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn upsert_query(record: &NormalizedRecord) -> Result<sqlx::query::Query<'_, Sqlite, SqliteArguments<'_>>> {
    let meta = serde_json::to_string(&record.source_meta)?;
    Ok(sqlx::query(
        "INSERT INTO records (source, id, parent_id, sender, title, body, timestamp, unread, from_me, has_media, source_meta) \
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11) \
        ON CONFLICT(source, id) DO UPDATE SET \
            parent_id=excluded.parent_id, \
            sender=excluded.sender, \
            title=excluded.title, \
            body=excluded.body, \
            timestamp=excluded.timestamp, \
            unread=excluded.unread, \
            from_me=excluded.from_me, \
            has_media=excluded.has_media, \
            source_meta=excluded.source_meta",
    )
    .bind(record.source.as_str())
    .bind(&record.id)
    .bind(&record.parent_id)
    .bind(&record.sender)
    .bind(&record.title)
    .bind(&record.body)
    .bind(record.timestamp)
    .bind(record.unread)
    .bind(record.from_me)
    .bind(record.has_media)
    .bind(meta))
}

fn record_from_row(row: RecordRow) -> Option<NormalizedRecord> {
    let (source, id, parent_id, sender, title, body, timestamp, unread, from_me, has_media, meta) = row;
    let source = Source::from_str(&source).ok()?;
    Some(NormalizedRecord {
        source,
        id,
        parent_id,
        sender,
        title,
        body,
        timestamp,
        unread,
        from_me,
        has_media,
        source_meta: serde_json::from_str(&meta).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_upsert_same_id_overwrites() {
        let store = LocalStore::in_memory().await.unwrap();
        let ts = now().timestamp();

        let first = NormalizedRecord::new(Source::Chat, "C1:100.0", "first draft", ts);
        store.upsert(&first).await.unwrap();

        let mut second = NormalizedRecord::new(Source::Chat, "C1:100.0", "edited", ts + 5);
        second.unread = true;
        store.upsert(&second).await.unwrap();

        assert_eq!(store.record_count(Source::Chat).await.unwrap(), 1);
        let stored = store.get_record(Source::Chat, "C1:100.0").await.unwrap().unwrap();
        assert_eq!(stored.body, "edited");
        assert_eq!(stored.timestamp, ts + 5);
        assert!(stored.unread);
    }

    #[tokio::test]
    async fn test_ids_are_scoped_per_source() {
        let store = LocalStore::in_memory().await.unwrap();
        let ts = now().timestamp();
        store
            .bulk_upsert(&[
                NormalizedRecord::new(Source::Chat, "42", "chat", ts),
                NormalizedRecord::new(Source::Mail, "42", "mail", ts),
            ])
            .await
            .unwrap();

        assert_eq!(store.record_count(Source::Chat).await.unwrap(), 1);
        assert_eq!(store.record_count(Source::Mail).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_bulk_upsert_counts_only_new_records() {
        let store = LocalStore::in_memory().await.unwrap();
        let ts = now().timestamp();
        let batch = vec![
            NormalizedRecord::new(Source::Mail, "a", "first", ts),
            NormalizedRecord::new(Source::Mail, "b", "second", ts),
        ];
        assert_eq!(store.bulk_upsert(&batch).await.unwrap(), 2);
        assert_eq!(store.bulk_upsert(&batch).await.unwrap(), 0);

        // Same message seen under two labels, next to one unseen id.
        let overlapping = vec![
            NormalizedRecord::new(Source::Mail, "c", "third", ts),
            NormalizedRecord::new(Source::Mail, "c", "third", ts),
            NormalizedRecord::new(Source::Mail, "a", "first, edited", ts + 1),
        ];
        assert_eq!(store.bulk_upsert(&overlapping).await.unwrap(), 1);
        assert_eq!(store.record_count(Source::Mail).await.unwrap(), 3);
        let edited = store.get_record(Source::Mail, "a").await.unwrap().unwrap();
        assert_eq!(edited.body, "first, edited");
    }

    #[tokio::test]
    async fn test_query_applies_time_filter() {
        let store = LocalStore::in_memory().await.unwrap();
        let ts = now().timestamp();
        store
            .bulk_upsert(&[
                NormalizedRecord::new(Source::Mail, "recent", "a", ts - 3600),
                NormalizedRecord::new(Source::Mail, "last-week", "b", ts - 3 * DAY_SECS),
                NormalizedRecord::new(Source::Mail, "old", "c", ts - 20 * DAY_SECS),
            ])
            .await
            .unwrap();

        let week = store.query(Source::Mail, TimeFilter::Week, now()).await.unwrap();
        let ids: Vec<_> = week.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["recent", "last-week"]);

        let all = store.query(Source::Mail, TimeFilter::All, now()).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_watermark_never_moves_backwards() {
        let store = LocalStore::in_memory().await.unwrap();
        assert!(store.get_watermark(Source::Workspace).await.unwrap().is_none());

        let ts = now().timestamp();
        store.set_watermark(Source::Workspace, ts, 3).await.unwrap();
        let wm = store.set_watermark(Source::Workspace, ts - 100, 1).await.unwrap();
        assert_eq!(wm.last_sync_at, ts);
        assert_eq!(wm.records_synced, 1);

        store.clear_watermark(Source::Workspace).await.unwrap();
        assert!(store.get_watermark(Source::Workspace).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cache_entry_last_write_wins() {
        let store = LocalStore::in_memory().await.unwrap();
        let mut row = CacheRow {
            scope: "chat".to_string(),
            kind: "today".to_string(),
            payload: serde_json::json!("quiet day"),
            created_at_ms: 1_000,
        };
        store.put_cache_entry(&row).await.unwrap();

        row.payload = serde_json::json!({"text": "busy day"});
        row.created_at_ms = 2_000;
        store.put_cache_entry(&row).await.unwrap();

        let loaded = store.get_cache_entry("chat", "today").await.unwrap().unwrap();
        assert_eq!(loaded.payload["text"], "busy day");
        assert_eq!(loaded.created_at_ms, 2_000);
        assert_eq!(store.cache_entries().await.unwrap().len(), 1);
        assert!(store.get_cache_entry("chat", "week").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_on_disk_persists() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("recap.db");
        let ts = now().timestamp();

        let store = LocalStore::open(&path).await.unwrap();
        store.set_watermark(Source::Chat, ts, 2).await.unwrap();
        store.close().await;

        let reopened = LocalStore::open(&path).await.unwrap();
        let wm = reopened.get_watermark(Source::Chat).await.unwrap().unwrap();
        assert_eq!(wm.last_sync_at, ts);
        reopened.close().await;
    }
}
