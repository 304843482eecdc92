//! # Ingestion pipeline
//!
//! Two feeds bring measurements in, one cache takes them out:
//!
//! 1. Stream feed (`ingestion`) - metrics and asset deletions from the bus
//! 2. Shared-memory feed (`scrape`) - periodic snapshot of published metrics
//! 3. Write-back cache (`cache`, `shared`) - rows batched into one bulk upsert
//! 4. Flush (`flush`) - timer-driven, plus one unconditional flush at shutdown
//!
//! Only computed metrics (aux `x-cm-type`) are stored. Store failures never
//! stop a feed; the affected event, cycle or batch is dropped and logged.

pub mod cache;
pub mod flush;
pub mod ingestion;
pub mod scrape;
pub mod shared;

pub use cache::{CacheConfig, MeasurementRow, UpsertBatch, WriteBackCache};
pub use flush::flush_pending;
pub use ingestion::{IngestError, IngestOutcome, Ingestor};
pub use scrape::{run_scrape_loop, scrape_once, ScrapeReport};
pub use shared::{FlushError, SharedCache};
