use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ExecutionId, WorkerId};

const MIB: f64 = 1024.0 * 1024.0;

/// Who produced a sample: a single worker, or the engine-side fusion of all
/// contemporaneous worker samples.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum Emitter {
    Aggregate,
    Worker(WorkerId),
}

impl From<Emitter> for String {
    fn from(value: Emitter) -> Self {
        match value {
            Emitter::Aggregate => "aggregate".to_string(),
            Emitter::Worker(id) => id.0,
        }
    }
}

impl From<String> for Emitter {
    fn from(value: String) -> Self {
        if value == "aggregate" {
            Emitter::Aggregate
        } else {
            Emitter::Worker(WorkerId(value))
        }
    }
}

impl Display for Emitter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Emitter::Aggregate => write!(f, "aggregate"),
            Emitter::Worker(id) => write!(f, "{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IopsStats {
    pub read: f64,
    pub write: f64,
}

impl IopsStats {
    pub fn total(&self) -> f64 {
        self.read + self.write
    }
}

/// Bandwidth counters in bytes per second.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthStats {
    pub read_bps: f64,
    pub write_bps: f64,
}

impl BandwidthStats {
    pub fn total_bps(&self) -> f64 {
        self.read_bps + self.write_bps
    }

    pub fn total_mbps(&self) -> f64 {
        self.total_bps() / MIB
    }
}

/// Latency summary in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyStats {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p90: f64,
    pub p99: f64,
    pub p999: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    pub execution_id: ExecutionId,
    pub emitter: Emitter,
    #[serde(default)]
    pub iops: IopsStats,
    #[serde(default)]
    pub bandwidth: BandwidthStats,
    #[serde(default)]
    pub latency_us: LatencyStats,
    #[serde(default)]
    pub cpu_percent: Option<f64>,
    #[serde(default)]
    pub memory_percent: Option<f64>,
    #[serde(default)]
    pub errors: u64,
}

impl MetricSample {
    pub fn empty(execution_id: ExecutionId, emitter: Emitter, timestamp: DateTime<Utc>) -> Self {
        MetricSample {
            timestamp,
            execution_id,
            emitter,
            iops: IopsStats::default(),
            bandwidth: BandwidthStats::default(),
            latency_us: LatencyStats::default(),
            cpu_percent: None,
            memory_percent: None,
            errors: 0,
        }
    }
}

/// Final roll-up written to `summary.json` when an execution finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_id: ExecutionId,
    pub completed_at: DateTime<Utc>,
    pub total_samples: usize,
    pub workers: Vec<WorkerId>,
    pub worker_count: usize,
    pub peak_iops: f64,
    pub peak_throughput_mbps: f64,
    pub avg_latency_us: f64,
}
