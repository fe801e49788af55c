use chrono::{DateTime, Utc};
use ioforge_common::model::{
    BandwidthStats, Emitter, ExecutionId, IoPattern, IopsStats, LatencyStats, MetricSample,
    WorkerId, WorkloadConfig,
};
use serde::Deserialize;

use super::DriverError;

/// fio's `--rw` mode from the pattern and read share. The mix flag is only
/// meaningful for the mixed modes.
pub fn rw_mode(pattern: IoPattern, read_percent: u8) -> &'static str {
    let random = matches!(pattern, IoPattern::Random | IoPattern::Mixed);
    match read_percent {
        100 => {
            if random {
                "randread"
            } else {
                "read"
            }
        }
        0 => {
            if random {
                "randwrite"
            } else {
                "write"
            }
        }
        _ => {
            if random {
                "randrw"
            } else {
                "rw"
            }
        }
    }
}

/// Build the benchmark invocation for one worker.
pub fn build_fio_command(
    workload: &WorkloadConfig,
    directory: &str,
    tag: &str,
) -> String {
    let io = &workload.io;
    let test = &workload.test;
    let rw = rw_mode(io.pattern, io.read_percent);

    let mut args = vec![
        "fio".to_string(),
        format!("--name={tag}"),
        format!("--directory={directory}"),
        format!("--rw={rw}"),
        format!("--bs={}", io.block_size),
        format!("--size={}", test.file_size),
        format!("--numjobs={}", io.num_jobs),
        format!("--iodepth={}", io.io_depth),
        format!("--runtime={}", test.duration.as_secs()),
        "--time_based".to_string(),
        "--group_reporting".to_string(),
        "--output-format=json".to_string(),
    ];

    if matches!(rw, "randrw" | "rw") {
        args.push(format!("--rwmixread={}", io.read_percent));
    }
    if io.direct_io {
        args.push("--direct=1".to_string());
    }
    if io.sync_io {
        args.push("--sync=1".to_string());
    }
    if !test.ramp_time.is_zero() {
        args.push(format!("--ramp_time={}", test.ramp_time.as_secs()));
    }
    args.push("--ioengine=libaio".to_string());
    args.push("--end_fsync=1".to_string());

    args.join(" ")
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FioOutput {
    #[serde(default)]
    pub jobs: Vec<FioJob>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FioJob {
    #[serde(default)]
    pub read: FioSide,
    #[serde(default)]
    pub write: FioSide,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FioSide {
    #[serde(default)]
    pub iops: f64,
    /// Bandwidth in KiB/s, as fio reports it.
    #[serde(default)]
    pub bw: f64,
    #[serde(default)]
    pub io_bytes: u64,
    #[serde(default)]
    pub lat_ns: FioLatency,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FioLatency {
    #[serde(default)]
    pub mean: f64,
    #[serde(default)]
    pub min: f64,
    #[serde(default)]
    pub max: f64,
}

/// fio prints human-readable noise before the JSON document; everything from
/// the first `{` onwards is parsed.
pub fn extract_json(stdout: &str) -> Option<&str> {
    stdout.find('{').map(|start| &stdout[start..])
}

pub fn parse_fio_output(stdout: &str) -> Result<FioOutput, DriverError> {
    let json = extract_json(stdout)
        .ok_or_else(|| DriverError::Benchmark("no JSON document in fio output".to_string()))?;
    serde_json::from_str(json)
        .map_err(|e| DriverError::Benchmark(format!("failed to parse fio output: {e}")))
}

/// Sum the per-job counters into one normalized sample. Latencies are
/// averaged over the jobs that actually moved I/O and converted to
/// microseconds.
pub fn sample_from_fio(
    output: &FioOutput,
    execution_id: &ExecutionId,
    worker_id: &WorkerId,
    timestamp: DateTime<Utc>,
) -> MetricSample {
    let mut read_iops = 0.0;
    let mut write_iops = 0.0;
    let mut read_bw_kib = 0.0;
    let mut write_bw_kib = 0.0;
    let mut read_lat_ns = 0.0;
    let mut write_lat_ns = 0.0;
    let mut read_jobs = 0u32;
    let mut write_jobs = 0u32;
    let mut min_lat_ns = f64::MAX;
    let mut max_lat_ns: f64 = 0.0;

    for job in &output.jobs {
        if job.read.iops > 0.0 {
            read_iops += job.read.iops;
            read_bw_kib += job.read.bw;
            read_lat_ns += job.read.lat_ns.mean;
            read_jobs += 1;
            min_lat_ns = min_lat_ns.min(job.read.lat_ns.min);
            max_lat_ns = max_lat_ns.max(job.read.lat_ns.max);
        }
        if job.write.iops > 0.0 {
            write_iops += job.write.iops;
            write_bw_kib += job.write.bw;
            write_lat_ns += job.write.lat_ns.mean;
            write_jobs += 1;
            min_lat_ns = min_lat_ns.min(job.write.lat_ns.min);
            max_lat_ns = max_lat_ns.max(job.write.lat_ns.max);
        }
    }

    let read_lat_us = if read_jobs > 0 {
        read_lat_ns / read_jobs as f64 / 1000.0
    } else {
        0.0
    };
    let write_lat_us = if write_jobs > 0 {
        write_lat_ns / write_jobs as f64 / 1000.0
    } else {
        0.0
    };
    let avg = match (read_jobs > 0, write_jobs > 0) {
        (true, true) => (read_lat_us + write_lat_us) / 2.0,
        (true, false) => read_lat_us,
        (false, true) => write_lat_us,
        (false, false) => 0.0,
    };

    let mut sample = MetricSample::empty(
        execution_id.clone(),
        Emitter::Worker(worker_id.clone()),
        timestamp,
    );
    sample.iops = IopsStats {
        read: read_iops,
        write: write_iops,
    };
    sample.bandwidth = BandwidthStats {
        read_bps: read_bw_kib * 1024.0,
        write_bps: write_bw_kib * 1024.0,
    };
    sample.latency_us = LatencyStats {
        avg,
        min: if min_lat_ns == f64::MAX {
            0.0
        } else {
            min_lat_ns / 1000.0
        },
        max: max_lat_ns / 1000.0,
        ..LatencyStats::default()
    };
    sample
}

/// Raw bytes written across all jobs; fill accounting multiplies this by the
/// pool replication factor.
pub fn bytes_written(output: &FioOutput) -> u64 {
    output.jobs.iter().map(|job| job.write.io_bytes).sum()
}
