use chrono::Utc;
use ioforge_common::model::{
    ClusterConfig, ExecutionId, FillConfig, FillTarget, MetricSample, Worker,
};
use tracing::info;

use super::{fio, DriverError, WorkloadDriver};
use crate::remote::SshTarget;

/// Outcome of one fill round on one worker.
#[derive(Debug, Clone)]
pub struct FillRound {
    pub bytes_written: u64,
    pub sample: Option<MetricSample>,
}

impl WorkloadDriver {
    /// One round of a CephFS fill: write `file_size` per parallel job into a
    /// per-execution directory on the mounted filesystem. The engine sums
    /// bytes across workers and rounds until the capacity target is reached.
    pub async fn fill_round_cephfs(
        &self,
        worker: &Worker,
        fill: &FillConfig,
        execution_id: &ExecutionId,
        round: u32,
    ) -> Result<FillRound, DriverError> {
        let worker_id = worker.id.0.clone();
        let fill_dir = format!(
            "{}/fill_{}/round_{round}_{}",
            fill.mount_point, execution_id, worker.id
        );

        let mkdir = format!("mkdir -p {fill_dir}");
        self.log_command(&worker_id, &mkdir, "Create fill directory");
        let created = self
            .remote()
            .run(&SshTarget::from_worker(worker), &mkdir, self.timeouts().command)
            .await;
        if !created.success() {
            return Err(DriverError::Benchmark(format!(
                "failed to create fill directory: {}",
                created.describe_failure()
            )));
        }

        let command = format!(
            "fio --name=fill_{execution_id} --directory={fill_dir} --rw=write --bs=1m \
             --size={} --numjobs={} --direct=1 --ioengine=libaio --group_reporting \
             --output-format=json --time_based=0 --end_fsync=1",
            fill.file_size, fill.parallel_writes
        );
        self.log_command(
            &worker_id,
            &command,
            &format!("Fill round {round} (target: {}%)", fill.target_fill_percent),
        );
        let output = self
            .remote()
            .run(
                &SshTarget::from_worker(worker),
                &command,
                std::time::Duration::from_secs(3600),
            )
            .await;
        if !output.success() {
            let message = output.describe_failure();
            self.log_command(&worker_id, &format!("# FAILED: {message}"), "Fill result");
            return Err(DriverError::Benchmark(message));
        }

        let parsed = fio::parse_fio_output(&output.stdout)?;
        let bytes = fio::bytes_written(&parsed);
        let sample = fio::sample_from_fio(&parsed, execution_id, &worker.id, Utc::now());
        self.log_command(
            &worker_id,
            &format!(
                "# SUCCESS: wrote {} raw this round",
                ioforge_common::util::format_size(bytes)
            ),
            "Fill result",
        );
        Ok(FillRound {
            bytes_written: bytes,
            sample: Some(sample),
        })
    }

    /// RBD fill: create and map an image, stream zeros into the block device
    /// with dd, then unmap.
    pub async fn fill_rbd(
        &self,
        worker: &Worker,
        fill: &FillConfig,
        execution_id: &ExecutionId,
    ) -> Result<FillRound, DriverError> {
        let worker_id = worker.id.0.clone();
        let target = SshTarget::from_worker(worker);
        let pool = fill.pool_name.as_deref().unwrap_or("rbd");
        let image = format!("{}/{}_{}_{}", pool, fill.image_prefix, worker.id, execution_id);

        let create = format!("rbd create {image} --size {}", fill.file_size);
        self.log_command(&worker_id, &create, "Create RBD image");
        let created = self.remote().run(&target, &create, self.timeouts().command).await;
        if !created.success() {
            return Err(DriverError::Benchmark(format!(
                "failed to create RBD image: {}",
                created.describe_failure()
            )));
        }

        let map = format!("rbd map {image}");
        self.log_command(&worker_id, &map, "Map RBD device");
        let mapped = self.remote().run(&target, &map, self.timeouts().command).await;
        if !mapped.success() {
            return Err(DriverError::Benchmark(format!(
                "failed to map RBD device: {}",
                mapped.describe_failure()
            )));
        }
        let device = mapped.stdout.trim().to_string();

        let dd = format!("dd if=/dev/zero of={device} bs=1M oflag=direct 2>&1");
        self.log_command(&worker_id, &dd, &format!("Fill RBD device {device}"));
        let filled = self
            .remote()
            .run(&target, &dd, std::time::Duration::from_secs(3600))
            .await;
        // dd exits non-zero when it hits the end of the device; bytes written
        // are reported on stderr/stdout either way.
        let bytes = parse_dd_bytes(&filled.stdout).unwrap_or(0);

        let unmap = format!("rbd unmap {device}");
        self.log_command(&worker_id, &unmap, "Unmap RBD device");
        self.remote().run(&target, &unmap, self.timeouts().command).await;

        info!("rbd fill on {} wrote {bytes} bytes", worker.hostname);
        Ok(FillRound {
            bytes_written: bytes,
            sample: None,
        })
    }

    /// Object fill: parallel piped uploads into the target bucket.
    pub async fn fill_s3(
        &self,
        worker: &Worker,
        fill: &FillConfig,
        cluster: &ClusterConfig,
        execution_id: &ExecutionId,
    ) -> Result<FillRound, DriverError> {
        let worker_id = worker.id.0.clone();
        let s3 = cluster.s3.as_ref().ok_or_else(|| {
            DriverError::Benchmark("cluster has no s3 connection for object fill".to_string())
        })?;
        let bucket = fill.bucket.as_deref().unwrap_or(&s3.bucket);
        let object_mb: u64 = 1024;

        let command = format!(
            "for i in $(seq 1 {jobs}); do \
             dd if=/dev/urandom bs=1M count={object_mb} 2>/dev/null | \
             AWS_ACCESS_KEY_ID={access} AWS_SECRET_ACCESS_KEY={secret} \
             aws s3 cp - s3://{bucket}/fill_${{i}}_{execution_id}_{worker} \
             --endpoint-url {endpoint} & done; wait",
            jobs = fill.parallel_writes,
            access = s3.access_key,
            secret = s3.secret_key,
            endpoint = s3.endpoint,
            worker = worker.id,
        );
        self.log_command(&worker_id, &command, &format!("Fill bucket {bucket}"));
        let output = self
            .remote()
            .run(
                &SshTarget::from_worker(worker),
                &command,
                std::time::Duration::from_secs(3600),
            )
            .await;
        if !output.success() {
            return Err(DriverError::Benchmark(format!(
                "object fill failed: {}",
                output.describe_failure()
            )));
        }
        Ok(FillRound {
            bytes_written: fill.parallel_writes as u64 * object_mb * 1024 * 1024,
            sample: None,
        })
    }

    /// Dispatch one fill round by target backend.
    pub async fn fill_round(
        &self,
        worker: &Worker,
        fill: &FillConfig,
        cluster: &ClusterConfig,
        execution_id: &ExecutionId,
        round: u32,
    ) -> Result<FillRound, DriverError> {
        match fill.target {
            FillTarget::Cephfs => {
                self.fill_round_cephfs(worker, fill, execution_id, round).await
            }
            FillTarget::Rbd => self.fill_rbd(worker, fill, execution_id).await,
            FillTarget::S3 => self.fill_s3(worker, fill, cluster, execution_id).await,
        }
    }
}

/// Parse the `N bytes (...) copied` line dd prints on completion.
fn parse_dd_bytes(output: &str) -> Option<u64> {
    output
        .lines()
        .rev()
        .find(|line| line.contains("bytes"))
        .and_then(|line| line.split_whitespace().next())
        .and_then(|first| first.parse().ok())
}
