//! Relational store seam
//!
//! The agent never holds a connection for longer than one unit of work: a
//! stream event, a scrape cycle, a flush or a query. Every unit calls
//! `StoreConnector::connect`, which hands back a pinged connection.

pub mod cursor;
pub mod sqlite;

pub use cursor::Rows;
pub use sqlite::{SqliteConnector, SqliteStore};

use crate::codec::Number;
use crate::pipeline::cache::UpsertBatch;

#[derive(Debug)]
pub enum StoreError {
    Database(rusqlite::Error),
    Io(std::io::Error),
    /// Connection opened but failed its liveness check
    Unavailable(String),
    /// Every `u16` topic id is already taken
    TopicIdExhausted(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(err)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database(e) => write!(f, "Database error: {}", e),
            StoreError::Io(e) => write!(f, "IO error: {}", e),
            StoreError::Unavailable(msg) => write!(f, "Store unavailable: {}", msg),
            StoreError::TopicIdExhausted(topic) => {
                write!(f, "No topic id left for '{}'", topic)
            }
        }
    }
}

impl std::error::Error for StoreError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicInfo {
    pub topic_id: u16,
    pub units: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredRow {
    pub timestamp: i64,
    pub value: Number,
}

impl StoredRow {
    /// `(timestamp, value)` with the value reconstructed as a double
    pub fn to_point(&self) -> (i64, f64) {
        (self.timestamp, self.value.to_f64())
    }
}

/// Inclusive `[start, end]` range of one topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeQuery {
    pub topic_id: u16,
    pub start: i64,
    pub end: i64,
    pub ordered: bool,
}

/// One page of a range scan
///
/// `resume_key` is the keyset position to continue from, `None` once the
/// range is exhausted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowPage {
    pub rows: Vec<StoredRow>,
    pub resume_key: Option<i64>,
}

/// What an asset delete removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletedAsset {
    pub measurements: usize,
    pub topic_ids: Vec<u16>,
}

/// One open connection to the measurement store
pub trait MeasurementStore: Send {
    /// Liveness check, run by connectors before handing out a connection
    fn ping(&self) -> Result<(), StoreError>;

    /// Topic id and units for `"<quantity>_<aggregation>_<step>@<asset>"`
    fn lookup_topic(&self, topic: &str) -> Result<Option<TopicInfo>, StoreError>;

    /// Topic id for `topic`, creating the topic row when missing
    ///
    /// Units and device name of an existing topic are refreshed.
    fn resolve_topic_id(&mut self, topic: &str, units: &str, device: &str)
        -> Result<u16, StoreError>;

    /// Execute one bulk upsert atomically, returning the affected row count
    fn insert_batch(&mut self, batch: &UpsertBatch) -> Result<usize, StoreError>;

    /// At most `limit` rows of `query` strictly after `resume_after`
    fn select_page(
        &self,
        query: &RangeQuery,
        resume_after: Option<i64>,
        limit: usize,
    ) -> Result<RowPage, StoreError>;

    /// Remove every measurement and topic belonging to `asset`
    fn delete_rows(&mut self, asset: &str) -> Result<DeletedAsset, StoreError>;
}

/// Opens validated connections; shared by every task of the agent
pub trait StoreConnector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn MeasurementStore>, StoreError>;

    /// Human-readable target for logging
    fn describe(&self) -> String;
}
