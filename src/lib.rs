//! Metric store agent
//!
//! Stores computed metrics from the message bus and shared memory into a
//! relational store, and answers aggregate range queries over the bus.

pub mod agent;
pub mod codec;
pub mod config;
pub mod pipeline;
pub mod proto;
pub mod query;
pub mod server;
pub mod shm;
pub mod store;
pub mod throttle;

pub use agent::{spawn_agent, AgentHandle};
pub use codec::{DecimalCodec, Number};
pub use config::MetricStoreConfig;
pub use pipeline::SharedCache;
pub use query::{QueryHandler, UnknownTopicPolicy, AGGREGATE_SUBJECT};
pub use server::MetricStoreServer;
pub use store::{SqliteConnector, StoreConnector};
