//! Agent runtime wiring
//!
//! `spawn_agent` opens the store and starts the dispatch loop and the
//! shared-memory scrape. The bus itself is not part of the agent: a transport
//! pushes deliveries into `bus_tx` and sends what comes out of the outbound
//! receiver. Without one attached only the shared-memory feed is active.

use crate::config::MetricStoreConfig;
use crate::pipeline::{run_scrape_loop, SharedCache};
use crate::server::{BusEvent, ChannelBus, ControlCommand, MetricStoreServer, OutboundMessage, ServerStats};
use crate::shm::{DirectoryShm, MetricSnapshotSource};
use crate::store::{SqliteConnector, StoreConnector, StoreError};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};

pub struct AgentHandle {
    /// Control commands (`$TERM`, `CONNECT`, ...)
    pub control_tx: mpsc::Sender<Vec<String>>,
    /// Transport side: stream and mailbox deliveries for the agent
    pub bus_tx: mpsc::Sender<BusEvent>,
    outbound: Option<mpsc::Receiver<OutboundMessage>>,
    shutdown_tx: watch::Sender<bool>,
    server_task: JoinHandle<ServerStats>,
    scrape_task: JoinHandle<()>,
}

/// Open the SQLite store and start both agent tasks
pub fn spawn_agent(config: &MetricStoreConfig) -> Result<AgentHandle, StoreError> {
    let connector: Arc<dyn StoreConnector> = Arc::new(SqliteConnector::new(&config.db_path)?);
    let shm: Arc<dyn MetricSnapshotSource> = Arc::new(DirectoryShm::new(&config.shm_dir));
    let cache = SharedCache::new(config.cache.clone());

    let (bus, outbound) = ChannelBus::new(config.channel_buffer);
    let (control_tx, control_rx) = mpsc::channel(config.channel_buffer);
    let (bus_tx, bus_rx) = mpsc::channel(config.channel_buffer);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = MetricStoreServer::new(Box::new(bus), connector.clone(), cache.clone(), config);
    let server_task = tokio::spawn(server.run(control_rx, bus_rx, shutdown_rx.clone()));

    let scrape_task = tokio::spawn(run_scrape_loop(
        shm,
        connector,
        cache,
        config.decimal_codec,
        config.polling_interval,
        shutdown_rx,
    ));

    Ok(AgentHandle {
        control_tx,
        bus_tx,
        outbound: Some(outbound),
        shutdown_tx,
        server_task,
        scrape_task,
    })
}

impl AgentHandle {
    /// Connect to the bus and consume the asset stream
    pub async fn start(&self, endpoint: &str, name: &str) -> bool {
        let startup = [
            ControlCommand::Connect {
                endpoint: endpoint.to_string(),
                name: name.to_string(),
            },
            ControlCommand::Consumer {
                stream: "ASSETS".to_string(),
                pattern: ".*".to_string(),
            },
        ];
        for command in startup {
            if self.control_tx.send(command.to_frames()).await.is_err() {
                log::error!("❌ Dispatch loop is gone, can't send {:?}", command);
                return false;
            }
        }
        true
    }

    /// Replies and other mailbox messages for the transport to deliver
    ///
    /// Available once; `None` after the first call.
    pub fn take_outbound(&mut self) -> Option<mpsc::Receiver<OutboundMessage>> {
        self.outbound.take()
    }

    /// `$TERM` the dispatch loop (which flushes), stop the scrape, wait for both
    pub async fn shutdown(self) -> Result<ServerStats, JoinError> {
        if self.control_tx.send(ControlCommand::Term.to_frames()).await.is_err() {
            log::warn!("⚠️  Dispatch loop already stopped");
        }
        self.shutdown_tx.send(true).ok();

        let stats = self.server_task.await?;
        if let Err(e) = self.scrape_task.await {
            log::error!("❌ Scrape task panicked: {}", e);
        }
        Ok(stats)
    }
}
