//! SQLite measurement store
//!
//! Tables:
//! - `t_measurement_topic` - one row per `"<quantity>_<aggregation>_<step>@<asset>"`
//! - `t_measurement` - `(timestamp, topic_id)` keyed values as mantissa + scale
//!
//! The schema is created with IF NOT EXISTS when the connector is built.

use super::{
    DeletedAsset, MeasurementStore, RangeQuery, RowPage, StoreConnector, StoreError, StoredRow,
    TopicInfo,
};
use crate::codec::Number;
use crate::pipeline::cache::UpsertBatch;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS t_measurement_topic (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    topic TEXT NOT NULL UNIQUE,
    units TEXT NOT NULL DEFAULT '',
    device_name TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS t_measurement (
    timestamp INTEGER NOT NULL,
    value INTEGER NOT NULL,
    scale INTEGER NOT NULL,
    topic_id INTEGER NOT NULL,
    PRIMARY KEY (timestamp, topic_id)
);

CREATE INDEX IF NOT EXISTS idx_measurement_topic_timestamp
    ON t_measurement(topic_id, timestamp);
CREATE INDEX IF NOT EXISTS idx_measurement_topic_device
    ON t_measurement_topic(device_name);
";

/// WAL + NORMAL sync: readers (queries) never block the flush writer
fn apply_pragmas(conn: &Connection) -> Result<(), StoreError> {
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    log::trace!("sqlite journal_mode={}", mode);
    Ok(())
}

pub struct SqliteConnector {
    path: PathBuf,
}

impl SqliteConnector {
    /// Create the database file (and parent directory) and its tables
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Io(std::io::Error::new(
                        e.kind(),
                        format!("Failed to create database directory {}: {}", parent.display(), e),
                    ))
                })?;
            }
        }

        let conn = Connection::open(&path)?;
        apply_pragmas(&conn)?;
        conn.execute_batch(SCHEMA)?;

        log::info!("✅ Measurement store ready: {}", path.display());

        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StoreConnector for SqliteConnector {
    fn connect(&self) -> Result<Box<dyn MeasurementStore>, StoreError> {
        let store = SqliteStore::open(&self.path)?;
        store.ping()?;
        Ok(Box::new(store))
    }

    fn describe(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(Self { conn })
    }

    fn row_to_stored(timestamp: i64, mantissa: i64, scale: i64) -> StoredRow {
        StoredRow {
            timestamp,
            value: Number::new(mantissa, scale as i16),
        }
    }
}

impl MeasurementStore for SqliteStore {
    fn ping(&self) -> Result<(), StoreError> {
        let one: i64 = self
            .conn
            .query_row("SELECT 1", [], |row| row.get(0))
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        if one != 1 {
            return Err(StoreError::Unavailable("unexpected ping result".to_string()));
        }
        Ok(())
    }

    fn lookup_topic(&self, topic: &str) -> Result<Option<TopicInfo>, StoreError> {
        let found = self
            .conn
            .query_row(
                "SELECT id, units FROM t_measurement_topic WHERE topic = ?1",
                params![topic],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        match found {
            Some((id, units)) => {
                let topic_id = u16::try_from(id)
                    .map_err(|_| StoreError::TopicIdExhausted(topic.to_string()))?;
                Ok(Some(TopicInfo { topic_id, units }))
            }
            None => Ok(None),
        }
    }

    fn resolve_topic_id(
        &mut self,
        topic: &str,
        units: &str,
        device: &str,
    ) -> Result<u16, StoreError> {
        let tx = self.conn.transaction()?;
        let id: i64 = tx.query_row(
            "INSERT INTO t_measurement_topic (topic, units, device_name)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(topic) DO UPDATE SET
                units = excluded.units,
                device_name = excluded.device_name
             RETURNING id",
            params![topic, units, device],
            |row| row.get(0),
        )?;

        // Dropping the transaction rolls back a topic we cannot address
        let topic_id =
            u16::try_from(id).map_err(|_| StoreError::TopicIdExhausted(topic.to_string()))?;
        tx.commit()?;
        Ok(topic_id)
    }

    fn insert_batch(&mut self, batch: &UpsertBatch) -> Result<usize, StoreError> {
        if batch.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.transaction()?;
        let mut affected = tx.execute(&batch.statement(), [])?;

        // A topic deleted after its id was resolved must not keep rows
        let mut topic_ids: Vec<u16> = batch.rows().iter().map(|row| row.topic_id).collect();
        topic_ids.sort_unstable();
        topic_ids.dedup();
        for topic_id in topic_ids {
            let known: bool = tx.query_row(
                "SELECT EXISTS(SELECT 1 FROM t_measurement_topic WHERE id = ?1)",
                params![topic_id],
                |row| row.get(0),
            )?;
            if !known {
                let orphans =
                    tx.execute("DELETE FROM t_measurement WHERE topic_id = ?1", params![topic_id])?;
                log::warn!("⚠️  Discarded {} rows of deleted topic id {}", orphans, topic_id);
                affected = affected.saturating_sub(orphans);
            }
        }
        tx.commit()?;

        log::debug!("✅ Upserted {} measurements", affected);
        Ok(affected)
    }

    fn select_page(
        &self,
        query: &RangeQuery,
        resume_after: Option<i64>,
        limit: usize,
    ) -> Result<RowPage, StoreError> {
        // Keyset paging: timestamp when ordered, rowid otherwise
        let sql = if query.ordered {
            "SELECT timestamp, value, scale, timestamp
             FROM t_measurement
             WHERE topic_id = ?1 AND timestamp BETWEEN ?2 AND ?3
               AND (?4 IS NULL OR timestamp > ?4)
             ORDER BY timestamp ASC
             LIMIT ?5"
        } else {
            "SELECT timestamp, value, scale, rowid
             FROM t_measurement
             WHERE topic_id = ?1 AND timestamp BETWEEN ?2 AND ?3
               AND (?4 IS NULL OR rowid > ?4)
             ORDER BY rowid ASC
             LIMIT ?5"
        };

        let limit = limit.max(1);
        let mut stmt = self.conn.prepare_cached(sql)?;
        let mapped = stmt.query_map(
            params![
                query.topic_id,
                query.start,
                query.end,
                resume_after,
                limit as i64
            ],
            |row| {
                Ok((
                    Self::row_to_stored(row.get(0)?, row.get(1)?, row.get(2)?),
                    row.get::<_, i64>(3)?,
                ))
            },
        )?;

        let mut rows = Vec::with_capacity(limit);
        let mut last_key = None;
        for result in mapped {
            let (row, key) = result?;
            rows.push(row);
            last_key = Some(key);
        }

        let resume_key = if rows.len() == limit { last_key } else { None };
        Ok(RowPage { rows, resume_key })
    }

    fn delete_rows(&mut self, asset: &str) -> Result<DeletedAsset, StoreError> {
        let tx = self.conn.transaction()?;

        let ids: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM t_measurement_topic
                 WHERE device_name = ?1
                    OR substr(topic, length(topic) - length(?1)) = '@' || ?1",
            )?;
            let mapped = stmt.query_map(params![asset], |row| row.get(0))?;
            mapped.collect::<Result<_, _>>()?
        };

        let mut deleted = DeletedAsset::default();
        for id in &ids {
            deleted.measurements +=
                tx.execute("DELETE FROM t_measurement WHERE topic_id = ?1", params![id])?;
            tx.execute("DELETE FROM t_measurement_topic WHERE id = ?1", params![id])?;
            if let Ok(topic_id) = u16::try_from(*id) {
                deleted.topic_ids.push(topic_id);
            }
        }
        tx.commit()?;

        Ok(deleted)
    }
}
