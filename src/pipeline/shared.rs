//! Single lock discipline around the write-back cache
//!
//! Both feeds and the flush timer mutate the cache only through `SharedCache`.
//! The lock is held for one push, or for one drain plus its bulk insert, so a
//! flush is atomic with respect to concurrent pushes.

use super::cache::{CacheConfig, MeasurementRow, WriteBackCache};
use crate::store::{MeasurementStore, StoreError};
use std::sync::{Arc, Mutex, MutexGuard};

/// A flush whose bulk insert failed; the drained rows are gone
#[derive(Debug)]
pub struct FlushError {
    pub dropped: usize,
    pub source: StoreError,
}

impl std::fmt::Display for FlushError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Flush dropped {} rows: {}", self.dropped, self.source)
    }
}

impl std::error::Error for FlushError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl From<FlushError> for StoreError {
    fn from(err: FlushError) -> Self {
        err.source
    }
}

#[derive(Clone)]
pub struct SharedCache {
    inner: Arc<Mutex<WriteBackCache>>,
}

impl SharedCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(WriteBackCache::new(config))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WriteBackCache> {
        // A panic mid-push leaves the rows vector consistent
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, row: MeasurementRow) {
        self.lock().push_back(row.timestamp, row.value, row.topic_id);
    }

    /// Push a row, then flush in the same critical section if a trigger fired
    ///
    /// Returns the number of rows written by the flush (0 when none ran).
    pub fn push_and_flush_if_ready(
        &self,
        row: MeasurementRow,
        store: &mut dyn MeasurementStore,
    ) -> Result<usize, FlushError> {
        let mut cache = self.lock();
        cache.push_back(row.timestamp, row.value, row.topic_id);
        if cache.is_ready_for_flush() {
            return drain_into(&mut cache, store);
        }
        Ok(0)
    }

    pub fn flush_if_ready(&self, store: &mut dyn MeasurementStore) -> Result<usize, FlushError> {
        let mut cache = self.lock();
        if !cache.is_ready_for_flush() {
            return Ok(0);
        }
        drain_into(&mut cache, store)
    }

    /// Unconditional flush, used at shutdown
    pub fn flush(&self, store: &mut dyn MeasurementStore) -> Result<usize, FlushError> {
        let mut cache = self.lock();
        drain_into(&mut cache, store)
    }

    pub fn discard_topics(&self, topic_ids: &[u16]) -> usize {
        if topic_ids.is_empty() {
            return 0;
        }
        self.lock().discard_topics(topic_ids)
    }

    pub fn is_ready_for_flush(&self) -> bool {
        self.lock().is_ready_for_flush()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Drain and insert; a failed insert drops the batch
fn drain_into(
    cache: &mut WriteBackCache,
    store: &mut dyn MeasurementStore,
) -> Result<usize, FlushError> {
    let batch = cache.drain_as_upsert_batch();
    if batch.is_empty() {
        return Ok(0);
    }

    match store.insert_batch(&batch) {
        Ok(written) => {
            log::debug!("📊 Flushed {} cached rows ({} affected)", batch.len(), written);
            Ok(batch.len())
        }
        Err(e) => {
            log::error!("❌ Bulk insert failed, dropping {} rows: {}", batch.len(), e);
            Err(FlushError {
                dropped: batch.len(),
                source: e,
            })
        }
    }
}
