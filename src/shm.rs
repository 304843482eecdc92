//! Shared-memory metric feed
//!
//! Other agents publish their latest metric values into a shared directory,
//! one JSON file per `type@name`. The scrape loop reads a filtered snapshot
//! and writes flagged metrics back.

use crate::proto::MetricMessage;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub enum ShmError {
    Io(std::io::Error),
    Pattern(regex::Error),
    Serialization(serde_json::Error),
}

impl From<std::io::Error> for ShmError {
    fn from(err: std::io::Error) -> Self {
        ShmError::Io(err)
    }
}

impl From<regex::Error> for ShmError {
    fn from(err: regex::Error) -> Self {
        ShmError::Pattern(err)
    }
}

impl From<serde_json::Error> for ShmError {
    fn from(err: serde_json::Error) -> Self {
        ShmError::Serialization(err)
    }
}

impl std::fmt::Display for ShmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShmError::Io(e) => write!(f, "IO error: {}", e),
            ShmError::Pattern(e) => write!(f, "Invalid pattern: {}", e),
            ShmError::Serialization(e) => write!(f, "Serialization error: {}", e),
        }
    }
}

impl std::error::Error for ShmError {}

/// Source of shared-memory metric snapshots
pub trait MetricSnapshotSource: Send + Sync {
    /// Every metric whose asset name and type fully match the patterns
    fn read_snapshot(&self, name_pattern: &str, type_pattern: &str)
        -> Result<Vec<MetricMessage>, ShmError>;

    /// Replace the published copy of `metric`
    fn write_metric(&self, metric: &MetricMessage) -> Result<(), ShmError>;
}

fn anchored(pattern: &str) -> Result<Regex, regex::Error> {
    Regex::new(&format!("^(?:{})$", pattern))
}

/// Keep names portable and free of path separators
fn file_stem(metric: &MetricMessage) -> String {
    metric
        .topic()
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' | '@' => c,
            _ => '_',
        })
        .collect()
}

/// Directory-backed shared memory, one `<type>@<name>.json` file per metric
pub struct DirectoryShm {
    dir: PathBuf,
}

impl DirectoryShm {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, metric: &MetricMessage) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(metric)))
    }
}

impl MetricSnapshotSource for DirectoryShm {
    fn read_snapshot(
        &self,
        name_pattern: &str,
        type_pattern: &str,
    ) -> Result<Vec<MetricMessage>, ShmError> {
        let name_re = anchored(name_pattern)?;
        let type_re = anchored(type_pattern)?;

        let mut metrics = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }

            // A writer may be mid-rename; skip anything unreadable
            let metric: MetricMessage = match fs::read(&path)
                .map_err(ShmError::from)
                .and_then(|bytes| serde_json::from_slice(&bytes).map_err(ShmError::from))
            {
                Ok(metric) => metric,
                Err(e) => {
                    log::warn!("⚠️  Skipping shared metric {}: {}", path.display(), e);
                    continue;
                }
            };

            if name_re.is_match(&metric.name) && type_re.is_match(&metric.metric_type) {
                metrics.push(metric);
            }
        }

        // Directory order is unspecified
        metrics.sort_by(|a, b| (&a.metric_type, &a.name).cmp(&(&b.metric_type, &b.name)));
        Ok(metrics)
    }

    fn write_metric(&self, metric: &MetricMessage) -> Result<(), ShmError> {
        fs::create_dir_all(&self.dir)?;

        let target = self.path_for(metric);
        let tmp = target.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(metric)?)?;
        fs::rename(&tmp, &target)?;
        Ok(())
    }
}
