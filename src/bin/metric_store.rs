//! Metric store agent runtime
//!
//! - Opens (and initializes) the SQLite measurement store
//! - Spawns the dispatch loop and the shared-memory scrape
//! - Sends CONNECT and CONSUMER ASSETS to the dispatch loop
//! - On CTRL+C sends $TERM; the dispatch loop performs its final flush
//!
//! No bus transport ships with this binary. A transport plugs in through
//! `AgentHandle::bus_tx` (deliveries in) and `AgentHandle::take_outbound`
//! (replies out); until then only the shared-memory feed stores metrics and
//! outbound messages are logged at debug level.
//!
//! Usage:
//!   metric_store [--verbose|-v] [--config-file|-c <file>] [--help|-h]
//!
//! Environment variables: see `MetricStoreConfig::from_env`.

use dotenv::dotenv;
use log::{debug, error, info, warn};
use metric_store::{spawn_agent, MetricStoreConfig};
use std::env;

const USAGE: &str = "metric_store [options] ...
  --verbose / -v         verbose mode
  --config-file / -c     ignored, configuration comes from the environment
  --help / -h            this information";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let mut verbose = false;
    let mut config_file = None;
    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--verbose" | "-v" => verbose = true,
            "--config-file" | "-c" => config_file = args.next(),
            _ => {
                println!("{}", USAGE);
                std::process::exit(1);
            }
        }
    }

    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    if let Some(path) = config_file {
        warn!("⚠️  --config-file ignored ({})", path);
    }

    let config = MetricStoreConfig::from_env()?;
    info!("🚀 {} starting", config.agent_name);
    config.log_summary();

    let mut agent = spawn_agent(&config)?;
    warn!("⚠️  No bus transport attached, only the shared-memory feed is active");

    let outbound_task = agent.take_outbound().map(|mut outbound| {
        tokio::spawn(async move {
            while let Some(message) = outbound.recv().await {
                debug!(
                    "reply to {} ({}): {} frames",
                    message.recipient,
                    message.subject,
                    message.frames.len()
                );
            }
        })
    });

    if !agent.start(&config.endpoint, &config.agent_name).await {
        return Err("dispatch loop stopped during startup".into());
    }

    info!("✅ {} started", config.agent_name);
    info!("🔄 Press CTRL+C to shutdown gracefully");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("⚠️  Received CTRL+C, shutting down..."),
        Err(err) => error!("❌ Failed to listen for CTRL+C: {}", err),
    }

    match agent.shutdown().await {
        Ok(stats) => info!(
            "📊 Handled {} stream and {} mailbox messages, flushed {} rows",
            stats.stream_messages, stats.mailbox_messages, stats.rows_flushed
        ),
        Err(e) => error!("❌ Dispatch loop panicked: {}", e),
    }
    if let Some(task) = outbound_task {
        task.abort();
    }

    info!("✅ {} ended", config.agent_name);
    Ok(())
}
