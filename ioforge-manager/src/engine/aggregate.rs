use chrono::{DateTime, Utc};
use ioforge_common::model::{
    BandwidthStats, Emitter, ExecutionId, ExecutionSummary, IopsStats, LatencyStats, MetricSample,
    WorkerId,
};

/// Fuse contemporaneous per-worker samples into one aggregate sample: IOPS
/// and bandwidth are summed, latency is averaged weighted by each worker's
/// IOPS share. The result is a pure function of the input slice, so replaying
/// stored per-worker samples reproduces the aggregate bit for bit.
pub fn aggregate_samples(
    execution_id: &ExecutionId,
    timestamp: DateTime<Utc>,
    samples: &[MetricSample],
) -> MetricSample {
    let mut iops = IopsStats::default();
    let mut bandwidth = BandwidthStats::default();
    let mut errors = 0u64;

    let mut weight_total = 0.0;
    let mut avg_weighted = 0.0;
    let mut p50_weighted = 0.0;
    let mut p90_weighted = 0.0;
    let mut p99_weighted = 0.0;
    let mut p999_weighted = 0.0;
    let mut avg_sum = 0.0;
    let mut avg_count = 0u32;
    let mut min = f64::MAX;
    let mut max: f64 = 0.0;

    for sample in samples {
        iops.read += sample.iops.read;
        iops.write += sample.iops.write;
        bandwidth.read_bps += sample.bandwidth.read_bps;
        bandwidth.write_bps += sample.bandwidth.write_bps;
        errors += sample.errors;

        let weight = sample.iops.total();
        weight_total += weight;
        avg_weighted += sample.latency_us.avg * weight;
        p50_weighted += sample.latency_us.p50 * weight;
        p90_weighted += sample.latency_us.p90 * weight;
        p99_weighted += sample.latency_us.p99 * weight;
        p999_weighted += sample.latency_us.p999 * weight;
        if sample.latency_us.avg > 0.0 {
            avg_sum += sample.latency_us.avg;
            avg_count += 1;
        }
        if sample.latency_us.min > 0.0 {
            min = min.min(sample.latency_us.min);
        }
        max = max.max(sample.latency_us.max);
    }

    let latency_us = if weight_total > 0.0 {
        LatencyStats {
            avg: avg_weighted / weight_total,
            min: if min == f64::MAX { 0.0 } else { min },
            max,
            p50: p50_weighted / weight_total,
            p90: p90_weighted / weight_total,
            p99: p99_weighted / weight_total,
            p999: p999_weighted / weight_total,
        }
    } else {
        LatencyStats {
            avg: if avg_count > 0 {
                avg_sum / avg_count as f64
            } else {
                0.0
            },
            min: if min == f64::MAX { 0.0 } else { min },
            max,
            ..LatencyStats::default()
        }
    };

    let mut aggregate = MetricSample::empty(execution_id.clone(), Emitter::Aggregate, timestamp);
    aggregate.iops = iops;
    aggregate.bandwidth = bandwidth;
    aggregate.latency_us = latency_us;
    aggregate.errors = errors;
    aggregate
}

/// Final roll-up over the aggregate stream: peak IOPS, peak throughput,
/// average latency, sample count and the worker roster.
pub fn summarize(
    execution_id: &ExecutionId,
    completed_at: DateTime<Utc>,
    aggregate_samples: &[MetricSample],
    workers: Vec<WorkerId>,
) -> ExecutionSummary {
    let mut peak_iops: f64 = 0.0;
    let mut peak_throughput_mbps: f64 = 0.0;
    let mut latency_sum = 0.0;
    let mut latency_count = 0u32;

    for sample in aggregate_samples {
        peak_iops = peak_iops.max(sample.iops.total());
        peak_throughput_mbps = peak_throughput_mbps.max(sample.bandwidth.total_mbps());
        if sample.latency_us.avg > 0.0 {
            latency_sum += sample.latency_us.avg;
            latency_count += 1;
        }
    }

    let worker_count = workers.len();
    ExecutionSummary {
        execution_id: execution_id.clone(),
        completed_at,
        total_samples: aggregate_samples.len(),
        workers,
        worker_count,
        peak_iops,
        peak_throughput_mbps,
        avg_latency_us: if latency_count > 0 {
            latency_sum / latency_count as f64
        } else {
            0.0
        },
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn worker_sample(worker: &str, read_iops: f64, avg_latency: f64) -> MetricSample {
        let mut sample = MetricSample::empty(
            ExecutionId::from("exec_a"),
            Emitter::Worker(WorkerId::new(worker)),
            Utc::now(),
        );
        sample.iops = IopsStats {
            read: read_iops,
            write: 0.0,
        };
        sample.bandwidth = BandwidthStats {
            read_bps: read_iops * 4096.0,
            write_bps: 0.0,
        };
        sample.latency_us = LatencyStats {
            avg: avg_latency,
            min: avg_latency / 2.0,
            max: avg_latency * 2.0,
            ..LatencyStats::default()
        };
        sample
    }

    #[test]
    fn sums_iops_and_weights_latency() {
        let execution = ExecutionId::from("exec_a");
        let samples = vec![
            worker_sample("w1", 3000.0, 100.0),
            worker_sample("w2", 1000.0, 300.0),
        ];
        let timestamp = Utc::now();
        let aggregate = aggregate_samples(&execution, timestamp, &samples);

        assert_eq!(aggregate.emitter, Emitter::Aggregate);
        assert_eq!(aggregate.iops.total(), 4000.0);
        assert_eq!(aggregate.bandwidth.read_bps, 4000.0 * 4096.0);
        // (100 * 3000 + 300 * 1000) / 4000 = 150
        assert_eq!(aggregate.latency_us.avg, 150.0);
        assert_eq!(aggregate.latency_us.min, 50.0);
        assert_eq!(aggregate.latency_us.max, 600.0);
    }

    #[test]
    fn replaying_the_same_samples_is_bit_identical() {
        let execution = ExecutionId::from("exec_a");
        let samples = vec![
            worker_sample("w1", 1234.5, 87.3),
            worker_sample("w2", 987.1, 142.9),
            worker_sample("w3", 55.5, 901.7),
        ];
        let timestamp = Utc::now();
        let first = aggregate_samples(&execution, timestamp, &samples);
        let second = aggregate_samples(&execution, timestamp, &samples);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn zero_weight_falls_back_to_plain_mean() {
        let execution = ExecutionId::from("exec_a");
        let mut idle = worker_sample("w1", 0.0, 40.0);
        idle.bandwidth = BandwidthStats::default();
        let aggregate = aggregate_samples(&execution, Utc::now(), &[idle]);
        assert_eq!(aggregate.latency_us.avg, 40.0);
    }

    #[test]
    fn summary_reports_peaks_over_the_stream() {
        let execution = ExecutionId::from("exec_a");
        let mut a = worker_sample("w1", 1000.0, 100.0);
        a.emitter = Emitter::Aggregate;
        let mut b = worker_sample("w1", 4000.0, 50.0);
        b.emitter = Emitter::Aggregate;
        let mut c = worker_sample("w1", 2000.0, 150.0);
        c.emitter = Emitter::Aggregate;

        let summary = summarize(
            &execution,
            Utc::now(),
            &[a, b, c],
            vec![WorkerId::new("w1"), WorkerId::new("w2")],
        );
        assert_eq!(summary.total_samples, 3);
        assert_eq!(summary.peak_iops, 4000.0);
        assert_eq!(summary.worker_count, 2);
        assert_eq!(summary.avg_latency_us, 100.0);
    }
}
