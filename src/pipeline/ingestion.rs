//! Stream feeds: metric ingestion and asset deletion
//!
//! Metric feed:
//! 1. Skip metrics without the computed marker (`x-cm-type`)
//! 2. Normalize the textual value with the active codec
//! 3. Connect to the store, resolve (or create) the `type@name` topic
//! 4. Push into the shared cache, flushing in place when the size trigger fires
//!
//! Asset feed: a `delete` removes the asset's rows from the store right away,
//! bypassing the cache, and discards its pending cached rows.

use super::cache::MeasurementRow;
use super::shared::{FlushError, SharedCache};
use crate::codec::{normalize_value, CodecError, DecimalCodec};
use crate::proto::{AssetMessage, MetricMessage};
use crate::store::{DeletedAsset, StoreConnector, StoreError};
use crate::throttle::LogThrottle;
use std::sync::Arc;

#[derive(Debug)]
pub enum IngestError {
    Codec(CodecError),
    Store(StoreError),
}

impl From<CodecError> for IngestError {
    fn from(err: CodecError) -> Self {
        IngestError::Codec(err)
    }
}

impl From<StoreError> for IngestError {
    fn from(err: StoreError) -> Self {
        IngestError::Store(err)
    }
}

impl From<FlushError> for IngestError {
    fn from(err: FlushError) -> Self {
        IngestError::Store(err.source)
    }
}

impl std::fmt::Display for IngestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestError::Codec(e) => write!(f, "Codec error: {}", e),
            IngestError::Store(e) => write!(f, "Store error: {}", e),
        }
    }
}

impl std::error::Error for IngestError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Not a computed metric
    Skipped,
    /// Row cached; `flushed` rows were written by a size-triggered flush
    Cached { flushed: usize },
}

pub struct Ingestor {
    connector: Arc<dyn StoreConnector>,
    cache: SharedCache,
    codec: DecimalCodec,
    store_errors: LogThrottle,
}

impl Ingestor {
    pub fn new(connector: Arc<dyn StoreConnector>, cache: SharedCache, codec: DecimalCodec) -> Self {
        Self {
            connector,
            cache,
            codec,
            store_errors: LogThrottle::default(),
        }
    }

    pub fn cache(&self) -> &SharedCache {
        &self.cache
    }

    pub fn ingest_metric(&mut self, metric: &MetricMessage) -> Result<IngestOutcome, IngestError> {
        if !metric.is_computed() {
            log::trace!("ignoring non-computed metric {}", metric.topic());
            return Ok(IngestOutcome::Skipped);
        }

        let topic = metric.topic();
        let value = normalize_value(&metric.value, self.codec).map_err(|e| {
            log::warn!("⚠️  Dropping {}: value '{}' rejected ({})", topic, metric.value, e);
            e
        })?;

        let mut store = match self.connector.connect() {
            Ok(store) => store,
            Err(e) => {
                crate::throttled_error!(self.store_errors, "❌ Can't connect to the database: {}", e);
                return Err(e.into());
            }
        };

        let topic_id = store
            .resolve_topic_id(&topic, &metric.unit, &metric.name)
            .map_err(|e| {
                crate::throttled_error!(self.store_errors, "❌ Can't resolve topic {}: {}", topic, e);
                e
            })?;

        let row = MeasurementRow {
            timestamp: metric.time,
            value,
            topic_id,
        };
        let flushed = self.cache.push_and_flush_if_ready(row, store.as_mut())?;

        log::debug!("cached {} = {:?} (topic_id={})", topic, value, topic_id);
        Ok(IngestOutcome::Cached { flushed })
    }

    /// Returns what was deleted, `None` for operations other than delete
    pub fn handle_asset(&mut self, asset: &AssetMessage) -> Result<Option<DeletedAsset>, IngestError> {
        if !asset.is_delete() {
            log::debug!("Ignore operation '{}' on the asset '{}'", asset.operation, asset.name);
            return Ok(None);
        }

        log::debug!("Asset '{}' is deleted -> delete all its measurements", asset.name);

        let mut store = match self.connector.connect() {
            Ok(store) => store,
            Err(e) => {
                crate::throttled_error!(self.store_errors, "❌ Can't connect to the database: {}", e);
                return Err(e.into());
            }
        };

        let deleted = store.delete_rows(&asset.name).map_err(|e| {
            log::error!("❌ Failed to delete measurements of '{}': {}", asset.name, e);
            e
        })?;
        let discarded = self.cache.discard_topics(&deleted.topic_ids);

        log::info!(
            "🗑️  Asset '{}' deleted: {} measurements, {} topics, {} pending rows discarded",
            asset.name,
            deleted.measurements,
            deleted.topic_ids.len(),
            discarded
        );
        Ok(Some(deleted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Number;
    use crate::pipeline::cache::CacheConfig;
    use crate::proto::COMPUTED_MARKER;
    use crate::store::{MeasurementStore, RangeQuery, Rows, SqliteConnector};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    struct DownConnector;

    impl StoreConnector for DownConnector {
        fn connect(&self) -> Result<Box<dyn MeasurementStore>, StoreError> {
            Err(StoreError::Unavailable("connection refused".to_string()))
        }
        fn describe(&self) -> String {
            "down".to_string()
        }
    }

    fn computed(metric_type: &str, name: &str, value: &str, time: i64) -> MetricMessage {
        let mut aux = BTreeMap::new();
        aux.insert(COMPUTED_MARKER.to_string(), "avg".to_string());
        MetricMessage {
            metric_type: metric_type.to_string(),
            name: name.to_string(),
            value: value.to_string(),
            unit: "W".to_string(),
            time,
            ttl: 900,
            aux,
        }
    }

    fn setup(max_rows: usize) -> (NamedTempFile, Arc<SqliteConnector>, Ingestor) {
        let file = NamedTempFile::new().unwrap();
        let connector = Arc::new(SqliteConnector::new(file.path()).unwrap());
        let cache = SharedCache::new(CacheConfig {
            max_rows,
            max_delay: Duration::from_secs(60),
        });
        let ingestor = Ingestor::new(connector.clone(), cache, DecimalCodec::Exact);
        (file, connector, ingestor)
    }

    fn stored_values(connector: &SqliteConnector, topic: &str) -> Vec<(i64, Number)> {
        let store = connector.connect().unwrap();
        let Some(info) = store.lookup_topic(topic).unwrap() else {
            return Vec::new();
        };
        let query = RangeQuery {
            topic_id: info.topic_id,
            start: i64::MIN,
            end: i64::MAX,
            ordered: true,
        };
        Rows::new(store.as_ref(), query)
            .map(|r| {
                let row = r.unwrap();
                (row.timestamp, row.value)
            })
            .collect()
    }

    #[test]
    fn test_non_computed_metric_skipped() {
        let (_file, _connector, mut ingestor) = setup(10);
        let mut metric = computed("realpower_avg_15m", "ups-1", "12.5", 1000);
        metric.aux.clear();

        assert_eq!(ingestor.ingest_metric(&metric).unwrap(), IngestOutcome::Skipped);
        assert!(ingestor.cache().is_empty());
    }

    #[test]
    fn test_metric_cached_then_flushed_on_size() {
        let (_file, connector, mut ingestor) = setup(2);

        let first = ingestor
            .ingest_metric(&computed("realpower_avg_15m", "ups-1", "12.5", 1000))
            .unwrap();
        assert_eq!(first, IngestOutcome::Cached { flushed: 0 });
        assert!(stored_values(&connector, "realpower_avg_15m@ups-1").is_empty());

        let second = ingestor
            .ingest_metric(&computed("realpower_avg_15m", "ups-1", "13", 1900))
            .unwrap();
        assert_eq!(second, IngestOutcome::Cached { flushed: 2 });

        assert_eq!(
            stored_values(&connector, "realpower_avg_15m@ups-1"),
            vec![(1000, Number::new(125, -1)), (1900, Number::new(13, 0))]
        );
    }

    #[test]
    fn test_invalid_value_dropped() {
        let (_file, _connector, mut ingestor) = setup(10);
        let result = ingestor.ingest_metric(&computed("load_avg_15m", "srv-1", "abc", 1000));

        assert!(matches!(result, Err(IngestError::Codec(_))));
        assert!(ingestor.cache().is_empty());
    }

    #[test]
    fn test_store_down_drops_metric() {
        let cache = SharedCache::new(CacheConfig::default());
        let mut ingestor = Ingestor::new(Arc::new(DownConnector), cache, DecimalCodec::Exact);

        for _ in 0..3 {
            let result = ingestor.ingest_metric(&computed("load_avg_15m", "srv-1", "1", 1000));
            assert!(matches!(result, Err(IngestError::Store(_))));
        }
        assert!(ingestor.cache().is_empty());
    }

    #[test]
    fn test_asset_delete_bypasses_cache() {
        let (_file, connector, mut ingestor) = setup(2);

        ingestor.ingest_metric(&computed("voltage_avg_15m", "pdu-1", "230", 1)).unwrap();
        ingestor.ingest_metric(&computed("voltage_avg_15m", "pdu-1", "231", 2)).unwrap();
        ingestor.ingest_metric(&computed("voltage_avg_15m", "pdu-1", "232", 3)).unwrap();
        assert_eq!(ingestor.cache().len(), 1);

        let delete = AssetMessage {
            name: "pdu-1".to_string(),
            operation: "delete".to_string(),
            aux: BTreeMap::new(),
        };
        let deleted = ingestor.handle_asset(&delete).unwrap().unwrap();

        assert_eq!(deleted.measurements, 2);
        assert!(ingestor.cache().is_empty());
        assert!(stored_values(&connector, "voltage_avg_15m@pdu-1").is_empty());
    }

    #[test]
    fn test_asset_other_operation_ignored() {
        let (_file, _connector, mut ingestor) = setup(10);
        let update = AssetMessage {
            name: "pdu-1".to_string(),
            operation: "update".to_string(),
            aux: BTreeMap::new(),
        };
        assert!(ingestor.handle_asset(&update).unwrap().is_none());
    }
}
