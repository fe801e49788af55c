use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ioforge_common::model::{Emitter, ExecutionId, MetricSample};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum MetricsStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Csv,
}

/// Append-only newline-delimited JSON time-series, one stream per
/// (execution, worker) plus one aggregate stream per execution. Appends to a
/// stream are serialized; different streams append concurrently.
pub struct MetricsStore {
    base_path: PathBuf,
    stream_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl MetricsStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        MetricsStore {
            base_path: base_path.into(),
            stream_locks: Mutex::new(HashMap::new()),
        }
    }

    fn stream_path(&self, execution_id: &ExecutionId, emitter: &Emitter) -> PathBuf {
        let metrics_dir = self
            .base_path
            .join("executions")
            .join(&execution_id.0)
            .join("metrics");
        match emitter {
            Emitter::Aggregate => metrics_dir.join("aggregate.jsonl"),
            Emitter::Worker(worker_id) => metrics_dir
                .join("workers")
                .join(format!("{worker_id}.jsonl")),
        }
    }

    async fn stream_lock(&self, path: &PathBuf) -> Arc<Mutex<()>> {
        let mut locks = self.stream_locks.lock().await;
        locks.entry(path.clone()).or_default().clone()
    }

    pub async fn append(&self, sample: &MetricSample) -> Result<(), MetricsStoreError> {
        let path = self.stream_path(&sample.execution_id, &sample.emitter);
        let lock = self.stream_lock(&path).await;
        let _guard = lock.lock().await;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(sample)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// Chronologically ordered slice of a stream. Readers tolerate a partial
    /// trailing line (crash mid-append). When the selected range holds more
    /// than `limit` samples, an evenly-strided subsample is returned with the
    /// first and last samples of the window preserved.
    pub async fn read(
        &self,
        execution_id: &ExecutionId,
        emitter: &Emitter,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
        limit: Option<usize>,
    ) -> Result<Vec<MetricSample>, MetricsStoreError> {
        let path = self.stream_path(execution_id, emitter);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = tokio::fs::read_to_string(&path).await?;
        let mut samples = Vec::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<MetricSample>(line) {
                Ok(sample) => {
                    if let Some((lo, hi)) = range {
                        if sample.timestamp < lo || sample.timestamp > hi {
                            continue;
                        }
                    }
                    samples.push(sample);
                }
                Err(_) => {
                    // Torn trailing record from an interrupted append.
                    warn!("skipping unparsable metric line in {}", path.display());
                }
            }
        }
        if let Some(limit) = limit {
            samples = Self::stride_subsample(samples, limit);
        }
        Ok(samples)
    }

    fn stride_subsample(samples: Vec<MetricSample>, limit: usize) -> Vec<MetricSample> {
        if limit == 0 || samples.len() <= limit {
            return samples;
        }
        if limit == 1 {
            return vec![samples.into_iter().next_back().unwrap()];
        }
        let last_index = samples.len() - 1;
        let mut picked = Vec::with_capacity(limit);
        for i in 0..limit {
            let index = i * last_index / (limit - 1);
            picked.push(samples[index].clone());
        }
        picked
    }

    pub async fn export(
        &self,
        execution_id: &ExecutionId,
        emitter: &Emitter,
        format: ExportFormat,
    ) -> Result<String, MetricsStoreError> {
        let samples = self.read(execution_id, emitter, None, None).await?;
        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(&samples)?),
            ExportFormat::Csv => {
                let mut out = String::from(
                    "ts,emitter,read_iops,write_iops,read_bps,write_bps,avg_latency_us,p99_latency_us,errors\n",
                );
                for s in &samples {
                    out.push_str(&format!(
                        "{},{},{},{},{},{},{},{},{}\n",
                        s.timestamp.to_rfc3339(),
                        s.emitter,
                        s.iops.read,
                        s.iops.write,
                        s.bandwidth.read_bps,
                        s.bandwidth.write_bps,
                        s.latency_us.avg,
                        s.latency_us.p99,
                        s.errors,
                    ));
                }
                Ok(out)
            }
        }
    }

    /// Crash recovery: truncate a stream at the last newline-terminated
    /// record boundary.
    pub async fn repair(
        &self,
        execution_id: &ExecutionId,
        emitter: &Emitter,
    ) -> Result<(), MetricsStoreError> {
        let path = self.stream_path(execution_id, emitter);
        if !path.exists() {
            return Ok(());
        }
        let lock = self.stream_lock(&path).await;
        let _guard = lock.lock().await;

        let raw = tokio::fs::read(&path).await?;
        if raw.last() == Some(&b'\n') {
            return Ok(());
        }
        let keep = raw.iter().rposition(|b| *b == b'\n').map_or(0, |p| p + 1);
        warn!(
            "truncating {} at byte {keep} (partial trailing record)",
            path.display()
        );
        tokio::fs::write(&path, &raw[..keep]).await?;
        Ok(())
    }
}
