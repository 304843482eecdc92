//! Messages carried by the bus streams and the shared-memory feed
//!
//! Stream payloads are JSON objects tagged by `kind`:
//!
//! ```json
//! {"kind":"metric","type":"realpower.default_max_15m","name":"ups-1",
//!  "value":"12.5","unit":"W","time":1700000000,"ttl":900,
//!  "aux":{"x-cm-type":"max"}}
//! {"kind":"asset","name":"ups-1","operation":"delete"}
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Aux key marking a metric produced by the computation agent
pub const COMPUTED_MARKER: &str = "x-cm-type";

/// Aux key set once a shared-memory metric has been stored
pub const STORED_FLAG: &str = "x-ms-flag";

pub const ASSET_OP_DELETE: &str = "delete";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricMessage {
    /// `<quantity>_<aggregation>_<step>`
    #[serde(rename = "type")]
    pub metric_type: String,
    /// Asset name
    pub name: String,
    /// Textual value, normalized by the codec before storage
    pub value: String,
    #[serde(default)]
    pub unit: String,
    /// Epoch seconds
    pub time: i64,
    /// Seconds the value stays valid after `time`
    #[serde(default)]
    pub ttl: u32,
    #[serde(default)]
    pub aux: BTreeMap<String, String>,
}

impl MetricMessage {
    /// Store topic: `"<type>@<name>"`
    pub fn topic(&self) -> String {
        format!("{}@{}", self.metric_type, self.name)
    }

    pub fn is_computed(&self) -> bool {
        self.aux.contains_key(COMPUTED_MARKER)
    }

    pub fn is_stored(&self) -> bool {
        self.aux.contains_key(STORED_FLAG)
    }

    /// Expired when `time + ttl` lies strictly before `now`
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.time.saturating_add(i64::from(self.ttl)) < now
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetMessage {
    pub name: String,
    pub operation: String,
    #[serde(default)]
    pub aux: BTreeMap<String, String>,
}

impl AssetMessage {
    pub fn is_delete(&self) -> bool {
        self.operation == ASSET_OP_DELETE
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StreamMessage {
    Metric(MetricMessage),
    Asset(AssetMessage),
}

impl StreamMessage {
    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
