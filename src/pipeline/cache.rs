//! Write-back cache for measurement rows
//!
//! Rows from every feed accumulate here and leave as one bulk upsert. Two
//! independent triggers make the cache ready for a flush:
//! - size: `max_rows` pending rows (bounds memory and statement size)
//! - delay: `max_delay` elapsed since the first pending row (bounds staleness)

use crate::codec::Number;
use std::time::{Duration, Instant};

pub const MAX_ROWS_DEFAULT: usize = 10_000;
pub const MAX_DELAY_DEFAULT: Duration = Duration::from_secs(60);

pub const ENV_MAX_ROW: &str = "BIOS_DBSTORE_MAX_ROW";
pub const ENV_MAX_DELAY: &str = "BIOS_DBSTORE_MAX_DELAY";

/// One pending measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeasurementRow {
    pub timestamp: i64,
    pub value: Number,
    pub topic_id: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub max_rows: usize,
    pub max_delay: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_rows: MAX_ROWS_DEFAULT,
            max_delay: MAX_DELAY_DEFAULT,
        }
    }
}

impl CacheConfig {
    /// Load flush thresholds from environment variables
    ///
    /// - `BIOS_DBSTORE_MAX_ROW` (default: 10000)
    /// - `BIOS_DBSTORE_MAX_DELAY` seconds (default: 60)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env` with an arbitrary variable source
    ///
    /// Only strictly positive integers override a default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_MAX_ROW) {
            match raw.trim().parse::<usize>() {
                Ok(rows) if rows > 0 => config.max_rows = rows,
                _ => log::warn!("⚠️  Ignoring {}='{}' (expected positive integer)", ENV_MAX_ROW, raw),
            }
            log::info!("use {} {} as max row insertion bulk limit", ENV_MAX_ROW, config.max_rows);
        }

        if let Some(raw) = lookup(ENV_MAX_DELAY) {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => config.max_delay = Duration::from_secs(secs),
                _ => log::warn!("⚠️  Ignoring {}='{}' (expected positive integer)", ENV_MAX_DELAY, raw),
            }
            log::info!(
                "use {} {}s as max delay before multi row insertion",
                ENV_MAX_DELAY,
                config.max_delay.as_secs()
            );
        }

        config
    }
}

/// Bulk "insert or update on conflict" covering every drained row
///
/// A conflict on `(timestamp, topic_id)` keeps the key and overwrites
/// `value`/`scale`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertBatch {
    rows: Vec<MeasurementRow>,
}

impl UpsertBatch {
    pub fn rows(&self) -> &[MeasurementRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// SQL text of the bulk upsert, empty when there is nothing to write
    ///
    /// Every bound value is an integer, so rendering them inline is safe.
    pub fn statement(&self) -> String {
        if self.rows.is_empty() {
            return String::new();
        }

        let mut sql = String::with_capacity(self.rows.len() * 32 + 160);
        sql.push_str("INSERT INTO t_measurement (timestamp, value, scale, topic_id) VALUES ");
        for (i, row) in self.rows.iter().enumerate() {
            if i > 0 {
                sql.push(',');
            }
            sql.push_str(&format!(
                "({},{},{},{})",
                row.timestamp, row.value.mantissa, row.value.scale, row.topic_id
            ));
        }
        sql.push_str(
            " ON CONFLICT(timestamp, topic_id) DO UPDATE SET value = excluded.value, scale = excluded.scale",
        );
        sql
    }
}

pub struct WriteBackCache {
    rows: Vec<MeasurementRow>,
    config: CacheConfig,
    first_row_at: Instant,
}

impl WriteBackCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            rows: Vec::new(),
            config,
            first_row_at: Instant::now(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Append a row; the first row of a batch restarts the delay clock
    ///
    /// No upper bound is enforced here, callers flush on `is_ready_for_flush`.
    pub fn push_back(&mut self, timestamp: i64, value: Number, topic_id: u16) {
        if self.rows.is_empty() {
            self.first_row_at = Instant::now();
        }
        self.rows.push(MeasurementRow {
            timestamp,
            value,
            topic_id,
        });
    }

    pub fn is_ready_for_flush(&self) -> bool {
        self.is_ready_at(Instant::now())
    }

    /// Flush readiness evaluated at an explicit instant
    pub fn is_ready_at(&self, now: Instant) -> bool {
        if self.rows.is_empty() {
            return false;
        }
        if self.rows.len() >= self.config.max_rows {
            log::trace!("cache ready: max_rows ({}) reached", self.config.max_rows);
            return true;
        }
        if now.saturating_duration_since(self.first_row_at) >= self.config.max_delay {
            log::trace!("cache ready: max_delay ({}s) elapsed", self.config.max_delay.as_secs());
            return true;
        }
        false
    }

    /// Take every pending row as one upsert batch and reset the cache
    ///
    /// An empty cache yields an empty batch and is left untouched.
    pub fn drain_as_upsert_batch(&mut self) -> UpsertBatch {
        if self.rows.is_empty() {
            return UpsertBatch::default();
        }
        let rows = std::mem::take(&mut self.rows);
        self.first_row_at = Instant::now();
        log::trace!("drained {} rows for bulk upsert", rows.len());
        UpsertBatch { rows }
    }

    /// Drop pending rows that belong to the given topics
    pub fn discard_topics(&mut self, topic_ids: &[u16]) -> usize {
        let before = self.rows.len();
        self.rows.retain(|row| !topic_ids.contains(&row.topic_id));
        before - self.rows.len()
    }
}
