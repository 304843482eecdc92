//! Periodic shared-memory scrape
//!
//! Every polling interval the whole shared-memory snapshot is read and each
//! computed, not yet stored metric is cached for the store. Metrics whose
//! validity already ended are flagged `x-ms-flag` and written back so the
//! next cycle skips them.

use super::cache::MeasurementRow;
use super::shared::SharedCache;
use crate::codec::{normalize_value, DecimalCodec};
use crate::proto::STORED_FLAG;
use crate::shm::MetricSnapshotSource;
use crate::store::{MeasurementStore, StoreConnector};
use crate::throttle::LogThrottle;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScrapeReport {
    /// Metrics in the snapshot
    pub seen: usize,
    /// Not computed, or already flagged
    pub skipped: usize,
    /// Value rejected by the codec
    pub invalid: usize,
    /// Rows pushed into the cache
    pub cached: usize,
    /// Metrics flagged and written back
    pub flagged: usize,
    /// Topic id could not be resolved
    pub unresolved: usize,
    /// Rows lost to a failed size-triggered flush
    pub dropped: usize,
    /// The store could not be reached this cycle
    pub store_unavailable: bool,
    /// The snapshot itself could not be read
    pub read_failed: bool,
}

enum StoreSession {
    NotTried,
    Open(Box<dyn MeasurementStore>),
    Failed,
}

/// One scrape cycle at wall-clock second `now`
///
/// `store_errors` outlives the cycle so a store outage logs once per interval.
pub fn scrape_once(
    shm: &dyn MetricSnapshotSource,
    connector: &dyn StoreConnector,
    cache: &SharedCache,
    codec: DecimalCodec,
    now: i64,
    store_errors: &mut LogThrottle,
) -> ScrapeReport {
    let mut report = ScrapeReport::default();

    log::debug!("read metrics from shm");
    let metrics = match shm.read_snapshot(".*", ".*") {
        Ok(metrics) => metrics,
        Err(e) => {
            log::error!("❌ Failed to read shared-memory metrics, skipping cycle: {}", e);
            report.read_failed = true;
            return report;
        }
    };
    report.seen = metrics.len();
    log::debug!("metric reads : {}", metrics.len());

    let mut session = StoreSession::NotTried;

    for mut metric in metrics {
        if !metric.is_computed() || metric.is_stored() {
            report.skipped += 1;
            continue;
        }

        let topic = metric.topic();
        let value = match normalize_value(&metric.value, codec) {
            Ok(value) => value,
            Err(e) => {
                log::warn!("⚠️  Dropping {}: value '{}' rejected ({})", topic, metric.value, e);
                report.invalid += 1;
                continue;
            }
        };

        if let StoreSession::NotTried = session {
            session = match connector.connect() {
                Ok(store) => StoreSession::Open(store),
                Err(e) => {
                    log::error!("❌ Can't connect to the database, skipping store work this cycle: {}", e);
                    report.store_unavailable = true;
                    StoreSession::Failed
                }
            };
        }
        let StoreSession::Open(store) = &mut session else {
            continue;
        };

        let topic_id = match store.resolve_topic_id(&topic, &metric.unit, &metric.name) {
            Ok(id) => id,
            Err(e) => {
                crate::throttled_error!(store_errors, "❌ Can't resolve topic {}: {}", topic, e);
                report.unresolved += 1;
                continue;
            }
        };

        let row = MeasurementRow {
            timestamp: metric.time,
            value,
            topic_id,
        };
        match cache.push_and_flush_if_ready(row, &mut **store) {
            Ok(_) => report.cached += 1,
            // Logged by the cache; this row went down with the batch
            Err(e) => report.dropped += e.dropped,
        }

        if metric.is_expired_at(now) {
            let elapsed = now.saturating_sub(metric.time);
            let remaining = i64::from(metric.ttl).saturating_sub(elapsed).max(0);
            metric.ttl = u32::try_from(remaining).unwrap_or(0);
            metric.aux.insert(STORED_FLAG.to_string(), "1".to_string());

            match shm.write_metric(&metric) {
                Ok(()) => report.flagged += 1,
                Err(e) => log::warn!("⚠️  Failed to flag {} in shared memory: {}", topic, e),
            }
        }
    }

    report
}

/// Scrape every `period` until `shutdown` turns true
///
/// The first cycle runs one full period after start.
pub async fn run_scrape_loop(
    shm: Arc<dyn MetricSnapshotSource>,
    connector: Arc<dyn StoreConnector>,
    cache: SharedCache,
    codec: DecimalCodec,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    log::info!("🚀 Starting shared-memory scrape");
    log::info!("   └─ Polling interval: {}s", period.as_secs());

    let store_errors = Arc::new(Mutex::new(LogThrottle::default()));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }

            _ = ticker.tick() => {
                let shm = shm.clone();
                let connector = connector.clone();
                let cache = cache.clone();
                let store_errors = store_errors.clone();
                let now = chrono::Utc::now().timestamp();

                let cycle = tokio::task::spawn_blocking(move || {
                    let mut throttle = store_errors
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    scrape_once(
                        shm.as_ref(),
                        connector.as_ref(),
                        &cache,
                        codec,
                        now,
                        &mut throttle,
                    )
                })
                .await;

                match cycle {
                    Ok(report) => log::debug!(
                        "📊 Scrape: {} seen, {} cached, {} flagged, {} skipped, {} invalid, {} unresolved, {} dropped",
                        report.seen,
                        report.cached,
                        report.flagged,
                        report.skipped,
                        report.invalid,
                        report.unresolved,
                        report.dropped
                    ),
                    Err(e) => log::error!("❌ Scrape cycle aborted: {}", e),
                }
            }
        }
    }

    log::info!("✅ Shared-memory scrape stopped");
}
