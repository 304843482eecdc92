//! Dispatch loop of the agent
//!
//! One task polls, in a single `select!`:
//! - the shutdown flag
//! - control commands (`$TERM`, `CONNECT`, `PRODUCER`, `CONSUMER`)
//! - bus deliveries (stream metrics/assets, mailbox queries)
//! - the flush timer
//!
//! Handlers run to completion between polls. Leaving the loop always runs a
//! final unconditional flush.

pub mod bus;
pub mod control;

pub use bus::{BusClient, BusError, BusEvent, BusSession, ChannelBus, OutboundMessage};
pub use control::{ControlCommand, ControlError};

use crate::config::MetricStoreConfig;
use crate::pipeline::flush::flush_pending;
use crate::pipeline::ingestion::Ingestor;
use crate::pipeline::shared::SharedCache;
use crate::proto::StreamMessage;
use crate::query::QueryHandler;
use crate::store::StoreConnector;
use crate::throttle::LogThrottle;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};

/// Event counters reported when the loop stops
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub stream_messages: u64,
    pub mailbox_messages: u64,
    pub control_commands: u64,
    pub rows_flushed: u64,
}

pub struct MetricStoreServer {
    bus: Box<dyn BusClient>,
    connector: Arc<dyn StoreConnector>,
    cache: SharedCache,
    ingestor: Ingestor,
    queries: QueryHandler,
    flush_interval: Duration,
    flush_errors: LogThrottle,
    stats: ServerStats,
}

impl MetricStoreServer {
    pub fn new(
        bus: Box<dyn BusClient>,
        connector: Arc<dyn StoreConnector>,
        cache: SharedCache,
        config: &MetricStoreConfig,
    ) -> Self {
        Self {
            bus,
            ingestor: Ingestor::new(connector.clone(), cache.clone(), config.decimal_codec),
            queries: QueryHandler::new(connector.clone(), config.unknown_topic),
            connector,
            cache,
            flush_interval: config.flush_interval,
            flush_errors: LogThrottle::default(),
            stats: ServerStats::default(),
        }
    }

    /// Run until `$TERM`, a closed control channel or the shutdown flag
    pub async fn run(
        mut self,
        mut control_rx: mpsc::Receiver<Vec<String>>,
        mut bus_rx: mpsc::Receiver<BusEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> ServerStats {
        log::info!("🚀 Metric store server started ({} bus)", self.bus.backend_type());
        log::info!("   ├─ Store: {}", self.connector.describe());
        log::info!("   └─ Flush interval: {}ms", self.flush_interval.as_millis());

        let mut flush_timer = interval(self.flush_interval);
        flush_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // Control before deliveries: a CONNECT queued ahead of a query is applied first
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        log::info!("Shutdown requested");
                        break;
                    }
                }

                command = control_rx.recv() => {
                    let Some(frames) = command else {
                        log::warn!("⚠️  Control channel closed, stopping server");
                        break;
                    };
                    if self.handle_control(&frames).await {
                        break;
                    }
                }

                Some(event) = bus_rx.recv() => {
                    self.handle_bus_event(event).await;
                }

                _ = flush_timer.tick() => {
                    self.flush(false);
                }
            }
        }

        log::info!("🔄 Performing final flush...");
        self.flush(true);

        log::info!(
            "✅ Metric store server stopped ({} stream, {} mailbox, {} rows flushed)",
            self.stats.stream_messages,
            self.stats.mailbox_messages,
            self.stats.rows_flushed
        );
        self.stats
    }

    /// Returns `true` on `$TERM`
    async fn handle_control(&mut self, frames: &[String]) -> bool {
        self.stats.control_commands += 1;

        let command = match ControlCommand::parse(frames) {
            Ok(command) => command,
            Err(ControlError::Unknown(cmd)) => {
                log::warn!("⚠️  Command '{}' is unknown or not implemented", cmd);
                return false;
            }
            Err(e) => {
                log::error!("❌ {}", e);
                return false;
            }
        };
        log::debug!("actor command = {:?}", command);

        let result = match &command {
            ControlCommand::Term => {
                log::info!("Got $TERM");
                return true;
            }
            ControlCommand::Connect { endpoint, name } => self.bus.connect(endpoint, name).await,
            ControlCommand::Producer { stream } => self.bus.set_producer(stream).await,
            ControlCommand::Consumer { stream, pattern } => {
                self.bus.set_consumer(stream, pattern).await
            }
            ControlCommand::Configure { path } => {
                log::warn!("⚠️  Config file '{}' ignored, configuration comes from the environment", path);
                Ok(())
            }
        };

        if let Err(e) = result {
            log::error!("❌ {:?} failed: {}", command, e);
        }
        false
    }

    async fn handle_bus_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::StreamDeliver {
                stream,
                subject,
                payload,
            } => {
                self.stats.stream_messages += 1;
                log::trace!("stream deliver on {} ({})", stream, subject);

                match StreamMessage::decode(&payload) {
                    Ok(StreamMessage::Metric(metric)) => {
                        if let Err(e) = self.ingestor.ingest_metric(&metric) {
                            log::debug!("metric {} not stored: {}", metric.topic(), e);
                        }
                    }
                    Ok(StreamMessage::Asset(asset)) => {
                        if let Err(e) = self.ingestor.handle_asset(&asset) {
                            log::debug!("asset {} not processed: {}", asset.name, e);
                        }
                    }
                    Err(e) => {
                        log::error!("❌ Can't decode message from stream {}, ignore it: {}", stream, e);
                    }
                }
            }

            BusEvent::MailboxDeliver {
                sender,
                subject,
                frames,
            } => {
                self.stats.mailbox_messages += 1;
                log::trace!("mailbox deliver (subject {} from {})", subject, sender);

                let Some(reply) = self.queries.handle(&subject, &frames) else {
                    return;
                };
                if let Err(e) = self.bus.send_to(&sender, &subject, reply).await {
                    log::error!("❌ Failed to reply to {}: {}", sender, e);
                }
            }
        }
    }

    fn flush(&mut self, force: bool) {
        match flush_pending(&self.cache, self.connector.as_ref(), force, &mut self.flush_errors) {
            Ok(rows) => self.stats.rows_flushed += rows as u64,
            // Connection failures are logged by flush_pending, insert failures by the cache
            Err(e) => log::debug!("flush skipped: {}", e),
        }
    }
}
