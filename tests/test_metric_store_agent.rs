//! End-to-end tests for the metric store agent
//!
//! Each test wires the dispatch loop (or the scrape) to a temporary SQLite
//! store and checks what a bus client would see:
//! - stream metrics become queryable after the shutdown flush
//! - asset deletion removes stored series
//! - shared-memory metrics are stored and flagged once expired
//! - a transport attached to the spawned agent drives it end to end

#[cfg(test)]
mod metric_store_agent_tests {
    use metric_store::pipeline::{scrape_once, CacheConfig};
    use metric_store::proto::{AssetMessage, MetricMessage, StreamMessage, COMPUTED_MARKER, STORED_FLAG};
    use metric_store::server::{BusEvent, ChannelBus, OutboundMessage, ServerStats};
    use metric_store::shm::{DirectoryShm, MetricSnapshotSource};
    use metric_store::throttle::LogThrottle;
    use metric_store::{
        spawn_agent, DecimalCodec, MetricStoreConfig, MetricStoreServer, QueryHandler,
        SharedCache, SqliteConnector, StoreConnector, UnknownTopicPolicy, AGGREGATE_SUBJECT,
    };
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};
    use tokio::sync::{mpsc, watch};

    struct Agent {
        _dir: TempDir,
        connector: Arc<dyn StoreConnector>,
        control_tx: mpsc::Sender<Vec<String>>,
        bus_tx: mpsc::Sender<BusEvent>,
        outbound: mpsc::Receiver<OutboundMessage>,
        _shutdown: watch::Sender<bool>,
        handle: tokio::task::JoinHandle<ServerStats>,
    }

    fn frames(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn computed_metric(metric_type: &str, asset: &str, value: &str, time: i64) -> MetricMessage {
        let mut aux = BTreeMap::new();
        aux.insert(COMPUTED_MARKER.to_string(), "min".to_string());
        MetricMessage {
            metric_type: metric_type.to_string(),
            name: asset.to_string(),
            value: value.to_string(),
            unit: "W".to_string(),
            time,
            ttl: 900,
            aux,
        }
    }

    async fn start_agent(cache: CacheConfig) -> Agent {
        let dir = tempdir().unwrap();
        let connector: Arc<dyn StoreConnector> =
            Arc::new(SqliteConnector::new(dir.path().join("metrics.db")).unwrap());
        let config = MetricStoreConfig {
            cache: cache.clone(),
            ..MetricStoreConfig::default()
        };

        let (bus, outbound) = ChannelBus::new(64);
        let server = MetricStoreServer::new(
            Box::new(bus),
            connector.clone(),
            SharedCache::new(cache),
            &config,
        );

        let (control_tx, control_rx) = mpsc::channel(64);
        let (bus_tx, bus_rx) = mpsc::channel(64);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(server.run(control_rx, bus_rx, shutdown_rx));

        control_tx
            .send(frames(&["CONNECT", "ipc://@/malamute", "fty-metric-store"]))
            .await
            .unwrap();
        control_tx.send(frames(&["CONSUMER", "ASSETS", ".*"])).await.unwrap();

        Agent {
            _dir: dir,
            connector,
            control_tx,
            bus_tx,
            outbound,
            _shutdown: shutdown,
            handle,
        }
    }

    impl Agent {
        async fn publish(&self, message: StreamMessage) {
            self.bus_tx
                .send(BusEvent::StreamDeliver {
                    stream: "METRICS".to_string(),
                    subject: "metric".to_string(),
                    payload: message.encode().unwrap(),
                })
                .await
                .unwrap();
        }

        async fn ask(&mut self, request: &[&str]) -> Vec<String> {
            self.bus_tx
                .send(BusEvent::MailboxDeliver {
                    sender: "rest".to_string(),
                    subject: AGGREGATE_SUBJECT.to_string(),
                    frames: frames(request),
                })
                .await
                .unwrap();
            let reply = self.outbound.recv().await.unwrap();
            assert_eq!(reply.recipient, "rest");
            assert_eq!(reply.subject, AGGREGATE_SUBJECT);
            reply.frames
        }

        async fn stop(self) -> (Arc<dyn StoreConnector>, ServerStats, TempDir) {
            self.control_tx.send(frames(&["$TERM"])).await.unwrap();
            let stats = self.handle.await.unwrap();
            (self.connector, stats, self._dir)
        }
    }

    #[tokio::test]
    async fn test_stream_metrics_stored_on_shutdown_flush() {
        // Thresholds high enough that only the final flush writes
        let mut agent = start_agent(CacheConfig {
            max_rows: 1000,
            max_delay: Duration::from_secs(3600),
        })
        .await;

        for (time, value) in [(300, "99.8"), (100, "88"), (200, "-0.5")] {
            agent
                .publish(StreamMessage::Metric(computed_metric(
                    "realpower.default_min_24h",
                    "asset_test",
                    value,
                    time,
                )))
                .await;
        }
        // Not computed: never stored
        let mut raw = computed_metric("realpower.default", "asset_test", "1", 100);
        raw.aux.clear();
        agent.publish(StreamMessage::Metric(raw)).await;

        // Deliveries are handled in order; the echo proves the metrics went through
        let echo = agent
            .ask(&["1", "GET_TEST", "asset_test", "realpower.default", "24h", "min", "0", "1000", "1"])
            .await;
        assert_eq!(echo[1], "OK");

        let (connector, stats, _dir) = agent.stop().await;
        assert_eq!(stats.stream_messages, 4);
        assert_eq!(stats.rows_flushed, 3);

        let handler = QueryHandler::new(connector, UnknownTopicPolicy::Reject);
        let reply = handler
            .handle(
                AGGREGATE_SUBJECT,
                &frames(&["2", "GET", "asset_test", "realpower.default", "24h", "min", "0", "1000", "1"]),
            )
            .unwrap();
        assert_eq!(
            reply,
            frames(&[
                "2", "OK", "asset_test", "realpower.default", "24h", "min", "0", "1000", "1", "W",
                "100", "88", "200", "-0.5", "300", "99.8",
            ])
        );
    }

    #[tokio::test]
    async fn test_asset_delete_removes_series() {
        // Every row is flushed as soon as it is cached
        let mut agent = start_agent(CacheConfig {
            max_rows: 1,
            max_delay: Duration::from_secs(3600),
        })
        .await;

        agent
            .publish(StreamMessage::Metric(computed_metric("temperature_avg_15m", "rack-1", "21.5", 900)))
            .await;
        agent
            .publish(StreamMessage::Metric(computed_metric("temperature_avg_15m", "rack-2", "19", 900)))
            .await;

        let before = agent
            .ask(&["1", "GET", "rack-1", "temperature", "15m", "avg", "0", "1000", "1"])
            .await;
        assert_eq!(&before[9..], &frames(&["W", "900", "21.5"])[..]);

        agent
            .publish(StreamMessage::Asset(AssetMessage {
                name: "rack-1".to_string(),
                operation: "delete".to_string(),
                aux: BTreeMap::new(),
            }))
            .await;

        let after = agent
            .ask(&["2", "GET", "rack-1", "temperature", "15m", "avg", "0", "1000", "1"])
            .await;
        assert_eq!(after, frames(&["2", "ERROR", "BAD_REQUEST"]));

        let untouched = agent
            .ask(&["3", "GET", "rack-2", "temperature", "15m", "avg", "0", "1000", "1"])
            .await;
        assert_eq!(&untouched[9..], &frames(&["W", "900", "19"])[..]);

        agent.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_topic_with_empty_policy() {
        let dir = tempdir().unwrap();
        let connector = Arc::new(SqliteConnector::new(dir.path().join("metrics.db")).unwrap());
        let handler = QueryHandler::new(connector, UnknownTopicPolicy::Empty);

        let reply = handler
            .handle(
                AGGREGATE_SUBJECT,
                &frames(&["7", "GET", "ghost", "voltage", "1h", "max", "0", "10", "0"]),
            )
            .unwrap();
        assert_eq!(
            reply,
            frames(&["7", "OK", "ghost", "voltage", "1h", "max", "0", "10", "0", ""])
        );
    }

    #[test]
    fn test_shm_scrape_stores_and_flags_expired() {
        let dir = tempdir().unwrap();
        let shm = DirectoryShm::new(dir.path().join("shm"));
        let connector = SqliteConnector::new(dir.path().join("metrics.db")).unwrap();
        let cache = SharedCache::new(CacheConfig::default());

        let now = 10_000;
        // Expired: time + ttl < now
        shm.write_metric(&computed_metric("load_max_1h", "ups-1", "0.75", 1_000))
            .unwrap();
        // Still valid
        shm.write_metric(&computed_metric("load_max_1h", "ups-2", "0.5", 9_500))
            .unwrap();

        let mut store_errors = LogThrottle::default();
        let report = scrape_once(&shm, &connector, &cache, DecimalCodec::Exact, now, &mut store_errors);
        assert_eq!(report.seen, 2);
        assert_eq!(report.cached, 2);
        assert_eq!(report.flagged, 1);

        let mut store = connector.connect().unwrap();
        assert_eq!(cache.flush(store.as_mut()).unwrap(), 2);

        // The flagged copy is skipped on the next cycle, the valid one is re-read
        let report = scrape_once(&shm, &connector, &cache, DecimalCodec::Exact, now, &mut store_errors);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.cached, 1);

        let snapshot = shm.read_snapshot("ups-1", ".*").unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot[0].aux.contains_key(STORED_FLAG));
        assert_eq!(snapshot[0].ttl, 0);

        let handler = QueryHandler::new(Arc::new(connector), UnknownTopicPolicy::Reject);
        let reply = handler
            .handle(
                AGGREGATE_SUBJECT,
                &frames(&["9", "GET", "ups-1", "load", "1h", "max", "0", "2000", "1"]),
            )
            .unwrap();
        assert_eq!(&reply[9..], &frames(&["W", "1000", "0.75"])[..]);
    }

    #[tokio::test]
    async fn test_spawned_agent_serves_attached_transport() {
        let dir = tempdir().unwrap();
        let config = MetricStoreConfig {
            db_path: dir.path().join("metrics.db"),
            shm_dir: dir.path().join("shm"),
            polling_interval: Duration::from_secs(3600),
            ..MetricStoreConfig::default()
        };

        let mut agent = spawn_agent(&config).unwrap();
        let mut outbound = agent.take_outbound().unwrap();
        assert!(agent.take_outbound().is_none());
        assert!(agent.start(&config.endpoint, &config.agent_name).await);

        let metric = computed_metric("realpower.default_min_24h", "ups-9", "42.5", 500);
        agent
            .bus_tx
            .send(BusEvent::StreamDeliver {
                stream: "METRICS".to_string(),
                subject: "metric".to_string(),
                payload: StreamMessage::Metric(metric).encode().unwrap(),
            })
            .await
            .unwrap();
        agent
            .bus_tx
            .send(BusEvent::MailboxDeliver {
                sender: "rest".to_string(),
                subject: AGGREGATE_SUBJECT.to_string(),
                frames: frames(&["u1", "GET_TEST", "ups-9", "realpower.default", "24h", "min", "0", "1000", "1"]),
            })
            .await
            .unwrap();

        let reply = outbound.recv().await.unwrap();
        assert_eq!(reply.recipient, "rest");
        assert_eq!(reply.frames[..2], frames(&["u1", "OK"])[..]);

        let stats = agent.shutdown().await.unwrap();
        assert_eq!(stats.stream_messages, 1);
        assert_eq!(stats.rows_flushed, 1);

        let handler = QueryHandler::new(
            Arc::new(SqliteConnector::new(&config.db_path).unwrap()),
            UnknownTopicPolicy::Reject,
        );
        let reply = handler
            .handle(
                AGGREGATE_SUBJECT,
                &frames(&["u2", "GET", "ups-9", "realpower.default", "24h", "min", "0", "1000", "1"]),
            )
            .unwrap();
        assert_eq!(&reply[9..], &frames(&["W", "500", "42.5"])[..]);
    }
}
