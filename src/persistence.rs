// src/persistence.rs - Sample sinks: bounded in-memory history and CSV export
//
// Recording is fire-and-forget. A sink must never block or fail the tick.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Source name used for the aggregate temperature.
pub const AGGREGATE_SOURCE: &str = "aggregate";

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: DateTime<Utc>, source: &str, value: f64) -> Self {
        Self {
            timestamp,
            source: source.to_string(),
            value,
        }
    }
}

pub trait SampleSink: Send + Sync {
    fn record_sample(&self, sample: Sample);
}

/// Ring buffer of recent samples, queried for charts and the console.
#[derive(Debug)]
pub struct SampleHistory {
    capacity: usize,
    samples: Mutex<VecDeque<Sample>>,
}

impl SampleHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: Mutex::new(VecDeque::new()),
        }
    }

    /// All samples at or after `since`, oldest first.
    pub fn since(&self, since: DateTime<Utc>) -> Vec<Sample> {
        let samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        samples.iter().filter(|s| s.timestamp >= since).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.samples.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SampleSink for SampleHistory {
    fn record_sample(&self, sample: Sample) {
        let mut samples = self.samples.lock().unwrap_or_else(|e| e.into_inner());
        samples.push_back(sample);
        while samples.len() > self.capacity {
            samples.pop_front();
        }
    }
}

/// Appends samples to a CSV file from a blocking writer task.
#[derive(Debug)]
pub struct CsvSampleSink {
    tx: mpsc::Sender<Sample>,
    dropped: AtomicU64,
}

impl CsvSampleSink {
    /// Open (or create) `path` and start the writer. The handle resolves to the
    /// number of rows written once every sender is dropped.
    pub fn spawn(
        path: impl AsRef<Path>,
        capacity: usize,
    ) -> Result<(Self, JoinHandle<Result<u64, PersistenceError>>), PersistenceError> {
        let path = path.as_ref();
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let needs_header = file.metadata()?.len() == 0;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(file);
        tracing::info!("Recording samples to {}", path.display());

        let (tx, mut rx) = mpsc::channel::<Sample>(capacity.max(1));
        let handle = tokio::task::spawn_blocking(move || {
            let mut written = 0u64;
            while let Some(sample) = rx.blocking_recv() {
                let result = writer
                    .serialize(&sample)
                    .map_err(PersistenceError::from)
                    .and_then(|()| writer.flush().map_err(PersistenceError::from));
                if let Err(e) = result {
                    tracing::error!("CSV sample writer stopped: {}", e);
                    return Err(e);
                }
                written += 1;
            }
            Ok(written)
        });

        Ok((
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            handle,
        ))
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl SampleSink for CsvSampleSink {
    fn record_sample(&self, sample: Sample) {
        if self.tx.try_send(sample).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            // Log sparsely; a dead disk would otherwise flood the log every tick.
            if dropped.is_power_of_two() {
                tracing::warn!("CSV sink dropped {} samples", dropped);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_history_is_bounded() {
        let history = SampleHistory::new(3);
        let start = Utc::now();
        for i in 0..5 {
            history.record_sample(Sample::new(start + chrono::TimeDelta::seconds(i), "pit", i as f64));
        }
        assert_eq!(history.len(), 3);
        let recent = history.since(start + chrono::TimeDelta::seconds(3));
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].value, 3.0);
        assert_eq!(recent[1].value, 4.0);
    }

    #[tokio::test]
    async fn test_csv_sink_writes_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("samples.csv");
        let (sink, handle) = CsvSampleSink::spawn(&path, 16).unwrap();
        let now = Utc::now();
        sink.record_sample(Sample::new(now, "pit", 101.5));
        sink.record_sample(Sample::new(now, AGGREGATE_SOURCE, 100.25));
        assert_eq!(sink.dropped(), 0);
        drop(sink);
        assert_eq!(handle.await.unwrap().unwrap(), 2);

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let rows: Vec<Sample> = reader.deserialize().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].source, "pit");
        assert_eq!(rows[1].value, 100.25);

        // Reopening appends without repeating the header.
        let (sink, handle) = CsvSampleSink::spawn(&path, 16).unwrap();
        sink.record_sample(Sample::new(now, "meat", 60.0));
        drop(sink);
        assert_eq!(handle.await.unwrap().unwrap(), 1);
        let mut reader = csv::Reader::from_path(&path).unwrap();
        assert_eq!(reader.deserialize::<Sample>().count(), 3);
    }

    #[tokio::test]
    async fn test_csv_sink_counts_dropped_samples() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("samples.csv");
        let (sink, handle) = CsvSampleSink::spawn(&path, 1).unwrap();
        let now = Utc::now();
        for i in 0..100 {
            sink.record_sample(Sample::new(now, "pit", i as f64));
        }
        let dropped = sink.dropped();
        drop(sink);
        let written = handle.await.unwrap().unwrap();
        assert!(written >= 1);
        assert_eq!(written + dropped, 100);
    }
}
