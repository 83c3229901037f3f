//! Metrics sink: a fire-and-forget stream of flat records of scalars and a
//! few string tags.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::Serialize;
use tracing::warn;

/// File name of the JSONL metrics stream inside the output directory.
pub const METRICS_FILE: &str = "metrics.jsonl";

/// A named set of scalar values, plus string tags such as model paths.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsRecord {
    pub event: String,
    #[serde(flatten)]
    pub values: BTreeMap<String, f64>,
    #[serde(flatten)]
    pub tags: BTreeMap<String, String>,
}

impl MetricsRecord {
    pub fn new(event: impl Into<String>) -> Self {
        Self { event: event.into(), values: BTreeMap::new(), tags: BTreeMap::new() }
    }

    pub fn with(mut self, key: &str, value: f64) -> Self {
        self.values.insert(key.to_string(), value);
        self
    }

    pub fn with_tag(mut self, key: &str, value: impl Into<String>) -> Self {
        self.tags.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

/// Receives metrics records.  Implementations must never fail the run.
pub trait MetricsSink: Send + Sync {
    fn emit(&self, record: &MetricsRecord);
}

#[derive(Debug, Default)]
pub struct NoopSink;

impl MetricsSink for NoopSink {
    fn emit(&self, _record: &MetricsRecord) {}
}

/// Appends one JSON object per record to a file.
///
/// The file is opened lazily on the first record.  After the first I/O
/// failure a single warning is logged and further records are dropped.
pub struct JsonlSink {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
    failed: AtomicBool,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), writer: Mutex::new(None), failed: AtomicBool::new(false) }
    }

    /// Sink writing to `output_dir/metrics.jsonl`.
    pub fn in_dir(output_dir: &Path) -> Self {
        Self::new(output_dir.join(METRICS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> std::io::Result<BufWriter<File>> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        Ok(BufWriter::new(file))
    }

    fn write(&self, record: &MetricsRecord) -> std::io::Result<()> {
        let line = serde_json::to_string(record)?;
        let mut guard = self
            .writer
            .lock()
            .map_err(|_| std::io::Error::other("metrics writer lock poisoned"))?;
        if guard.is_none() {
            *guard = Some(self.open()?);
        }
        if let Some(w) = guard.as_mut() {
            writeln!(w, "{line}")?;
            w.flush()?;
        }
        Ok(())
    }
}

impl MetricsSink for JsonlSink {
    fn emit(&self, record: &MetricsRecord) {
        if self.failed.load(Ordering::Relaxed) {
            return;
        }
        if let Err(e) = self.write(record) {
            self.failed.store(true, Ordering::Relaxed);
            warn!(path = %self.path.display(), error = %e, "Metrics sink disabled after write failure");
        }
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    records: Mutex<Vec<MetricsRecord>>,
}

impl RecordingSink {
    pub fn records(&self) -> Vec<MetricsRecord> {
        match self.records.lock() {
            Ok(r) => r.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Records whose event name is `event`.
    pub fn events(&self, event: &str) -> Vec<MetricsRecord> {
        self.records().into_iter().filter(|r| r.event == event).collect()
    }
}

impl MetricsSink for RecordingSink {
    fn emit(&self, record: &MetricsRecord) {
        match self.records.lock() {
            Ok(mut r) => r.push(record.clone()),
            Err(poisoned) => poisoned.into_inner().push(record.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_serializes_flat() {
        let r = MetricsRecord::new("step").with("loss", 1.5).with("step", 50.0);
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["event"], "step");
        assert_eq!(json["loss"], 1.5);
        assert_eq!(json["step"], 50.0);
    }

    #[test]
    fn tags_serialize_next_to_values() {
        let r = MetricsRecord::new("run_config").with("alpha", 0.5).with_tag("teacher", "/m/t");
        let json = serde_json::to_value(&r).unwrap();
        assert_eq!(json["alpha"], 0.5);
        assert_eq!(json["teacher"], "/m/t");
        assert_eq!(r.tag("teacher"), Some("/m/t"));
    }

    #[test]
    fn jsonl_sink_appends_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let sink = JsonlSink::in_dir(&dir.path().join("run"));
        sink.emit(&MetricsRecord::new("step").with("loss", 2.0));
        sink.emit(&MetricsRecord::new("epoch").with("avg_loss", 1.0));

        let text = fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["event"], "epoch");
    }

    #[test]
    fn jsonl_sink_failure_is_swallowed() {
        let dir = tempfile::TempDir::new().unwrap();
        // A directory cannot be opened as a file.
        let sink = JsonlSink::new(dir.path());
        sink.emit(&MetricsRecord::new("step"));
        sink.emit(&MetricsRecord::new("step"));
        assert!(sink.failed.load(Ordering::Relaxed));
    }

    #[test]
    fn recording_sink_filters_by_event() {
        let sink = RecordingSink::default();
        sink.emit(&MetricsRecord::new("step").with("loss", 1.0));
        sink.emit(&MetricsRecord::new("epoch").with("avg_loss", 1.0));
        assert_eq!(sink.records().len(), 2);
        assert_eq!(sink.events("epoch").len(), 1);
        assert_eq!(sink.events("epoch")[0].get("avg_loss"), Some(1.0));
    }
}
